//! Canonical artifact selection.
//!
//! Each platform has an ordered rule table. Rules are evaluated once each, in
//! tier order, against the build's outputs; within a rule the first matching
//! output in list order wins. The first rule that matches supplies the selected
//! artifact, and every matching rule contributes its capability (publish or
//! public install). Android falls back to the batch of split APKs when no rule
//! matches.
use thiserror::Error;
use crate::build_output::{AppInfo, ArtifactKind, BuildOutput, ProvisioningInfo};
use crate::models::Platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionRule { pub tier: u8, pub kind: ArtifactKind, pub publish: bool, pub public_install: bool }

pub const ANDROID_RULES: &[SelectionRule] = &[
    SelectionRule { tier: 1, kind: ArtifactKind::AppBundle, publish: true, public_install: false },
    SelectionRule { tier: 2, kind: ArtifactKind::UniversalApk, publish: false, public_install: true },
];

pub const IOS_RULES: &[SelectionRule] = &[
    SelectionRule { tier: 1, kind: ArtifactKind::IpaAppStore, publish: true, public_install: false },
    SelectionRule { tier: 2, kind: ArtifactKind::IpaDebug, publish: false, public_install: true },
    SelectionRule { tier: 3, kind: ArtifactKind::XcodeArchive, publish: true, public_install: false },
];

pub fn rules_for(platform: Platform) -> &'static [SelectionRule] {
    match platform { Platform::Ios => IOS_RULES, Platform::Android => ANDROID_RULES }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SelectionError {
    #[error("artifact {0} carries no metadata")]
    MetadataMissing(String),
    #[error("artifact {0} carries no app info")]
    AppInfoMissing(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectedArtifact {
    Single(BuildOutput),
    /// Split APKs, resolved as a batch: every one needs its own download link.
    SplitApks(Vec<BuildOutput>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub platform: Platform,
    pub artifact: SelectedArtifact,
    pub app_info: AppInfo,
    pub provisioning_info: ProvisioningInfo,
    pub publish_enabled: bool,
    pub public_install_enabled: bool,
    pub public_install_slug: Option<String>,
}

impl Selection {
    pub fn primary(&self) -> &BuildOutput {
        match &self.artifact {
            SelectedArtifact::Single(o) => o,
            // never empty: select() only builds this variant from a non-empty list
            SelectedArtifact::SplitApks(list) => &list[0],
        }
    }

    pub fn artifact_slugs(&self) -> Vec<String> {
        match &self.artifact {
            SelectedArtifact::Single(o) => vec![o.slug.clone()],
            SelectedArtifact::SplitApks(list) => list.iter().map(|o| o.slug.clone()).collect(),
        }
    }
}

/// Picks the canonical artifact for `platform`. `Ok(None)` means nothing qualifies
/// and the platform should be skipped.
pub fn select(outputs: &[BuildOutput], platform: Platform) -> Result<Option<Selection>, SelectionError> {
    let mut selected: Option<&BuildOutput> = None;
    let mut publish_enabled = false;
    let mut public_install_enabled = false;
    let mut public_install_slug = None;
    for rule in rules_for(platform) {
        let Some(hit) = outputs.iter().find(|o| o.kind() == rule.kind) else { continue };
        if selected.is_none() { selected = Some(hit); }
        publish_enabled |= rule.publish;
        if rule.public_install && !public_install_enabled {
            public_install_enabled = true;
            public_install_slug = Some(hit.slug.clone()).filter(|s| !s.trim().is_empty());
        }
    }
    let artifact = match selected {
        Some(o) => SelectedArtifact::Single(o.clone()),
        None if platform == Platform::Android => {
            let splits: Vec<BuildOutput> = outputs.iter().filter(|o| o.kind() == ArtifactKind::SplitApk).cloned().collect();
            if splits.is_empty() { return Ok(None); }
            SelectedArtifact::SplitApks(splits)
        }
        None => return Ok(None),
    };
    let primary = match &artifact { SelectedArtifact::Single(o) => o, SelectedArtifact::SplitApks(list) => &list[0] };
    let meta = primary.metadata.as_ref().ok_or_else(|| SelectionError::MetadataMissing(primary.title.clone()))?;
    if meta.app_info.is_empty() { return Err(SelectionError::AppInfoMissing(primary.title.clone())); }
    let app_info = meta.app_info.clone();
    let provisioning_info = meta.provisioning_info.clone();
    Ok(Some(Selection { platform, artifact, app_info, provisioning_info, publish_enabled, public_install_enabled, public_install_slug }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_output::ArtifactMeta;

    fn out(title: &str, slug: &str, distribution: Option<&str>) -> BuildOutput {
        BuildOutput {
            title: title.into(),
            slug: slug.into(),
            metadata: Some(ArtifactMeta {
                app_info: AppInfo { version: Some("1.0".into()), ..AppInfo::default() },
                provisioning_info: ProvisioningInfo { distribution_type: distribution.map(str::to_string), ..ProvisioningInfo::default() },
                ..ArtifactMeta::default()
            }),
        }
    }

    #[test]
    fn rule_tables_are_tier_ordered() {
        for rules in [IOS_RULES, ANDROID_RULES] {
            assert!(rules.windows(2).all(|w| w[0].tier < w[1].tier));
        }
    }

    #[test]
    fn app_store_ipa_beats_xcode_archive_regardless_of_order() {
        let outputs = vec![out("App.xcarchive.zip", "arch", None), out("App.ipa", "ipa", Some("app-store"))];
        let sel = select(&outputs, Platform::Ios).unwrap().unwrap();
        assert_eq!(sel.primary().slug, "ipa");
        assert!(sel.publish_enabled);
        assert!(!sel.public_install_enabled);
    }

    #[test]
    fn xcode_archive_is_fallback() {
        let outputs = vec![out("App.xcarchive.zip", "arch1", None), out("Other.xcarchive.zip", "arch2", None)];
        let sel = select(&outputs, Platform::Ios).unwrap().unwrap();
        assert_eq!(sel.primary().slug, "arch1");
        assert!(sel.publish_enabled);
    }

    #[test]
    fn debug_ipa_grants_public_install() {
        let outputs = vec![out("Dev.ipa", "dev", Some("development")), out("App.ipa", "store", Some("app-store"))];
        let sel = select(&outputs, Platform::Ios).unwrap().unwrap();
        assert_eq!(sel.primary().slug, "store");
        assert!(sel.publish_enabled && sel.public_install_enabled);
        assert_eq!(sel.public_install_slug.as_deref(), Some("dev"));
    }

    #[test]
    fn first_match_wins_within_tier() {
        let outputs = vec![out("A.ipa", "first", Some("app-store")), out("B.ipa", "second", Some("app-store"))];
        assert_eq!(select(&outputs, Platform::Ios).unwrap().unwrap().primary().slug, "first");
    }

    #[test]
    fn app_bundle_preferred_with_universal_for_install() {
        let outputs = vec![out("app-universal.apk", "uni", None), out("app.aab", "aab", None), out("app-x86.apk", "split", None)];
        let sel = select(&outputs, Platform::Android).unwrap().unwrap();
        assert_eq!(sel.primary().slug, "aab");
        assert!(sel.publish_enabled);
        assert_eq!(sel.public_install_slug.as_deref(), Some("uni"));
    }

    #[test]
    fn universal_apk_selected_without_bundle() {
        let outputs = vec![out("app-x86.apk", "split", None), out("app-universal.apk", "uni", None)];
        let sel = select(&outputs, Platform::Android).unwrap().unwrap();
        assert_eq!(sel.artifact, SelectedArtifact::Single(outputs[1].clone()));
        assert!(!sel.publish_enabled);
        assert!(sel.public_install_enabled);
    }

    #[test]
    fn split_apks_form_a_batch() {
        let outputs = vec![out("app-arm64-v8a.apk", "a", None), out("App.ipa", "ipa", Some("app-store")), out("app-x86.apk", "b", None)];
        let sel = select(&outputs, Platform::Android).unwrap().unwrap();
        match &sel.artifact {
            SelectedArtifact::SplitApks(list) => assert_eq!(list.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(sel.artifact_slugs(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn nothing_qualifies() {
        let outputs = vec![out("App.ipa", "adhoc", Some("ad-hoc")), out("notes.txt", "n", None)];
        assert_eq!(select(&outputs, Platform::Ios).unwrap(), None);
        assert_eq!(select(&outputs, Platform::Android).unwrap(), None);
        assert_eq!(select(&[], Platform::Ios).unwrap(), None);
    }

    #[test]
    fn missing_metadata_and_app_info() {
        let bare = BuildOutput { title: "app.aab".into(), slug: "s".into(), metadata: None };
        assert_eq!(select(&[bare], Platform::Android), Err(SelectionError::MetadataMissing("app.aab".into())));
        let empty = BuildOutput {
            title: "App.ipa".into(),
            slug: "s".into(),
            metadata: Some(ArtifactMeta { provisioning_info: ProvisioningInfo { distribution_type: Some("app-store".into()), ..ProvisioningInfo::default() }, ..ArtifactMeta::default() }),
        };
        assert_eq!(select(&[empty], Platform::Ios), Err(SelectionError::AppInfoMissing("App.ipa".into())));
    }

    #[test]
    fn blank_install_slug_is_omitted() {
        let outputs = vec![out("app-universal.apk", " ", None)];
        let sel = select(&outputs, Platform::Android).unwrap().unwrap();
        assert!(sel.public_install_enabled);
        assert_eq!(sel.public_install_slug, None);
    }
}
