//! Build outputs as reported by the CI vendor, and their classification into
//! artifact kinds.
use serde::{Serialize, Deserialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_name: Option<String>,
    #[serde(default, alias = "version_name", skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_sdk_version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_family_list: Vec<i32>,
}

impl AppInfo {
    pub fn is_empty(&self) -> bool { self == &AppInfo::default() }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningInfo {
    #[serde(default, alias = "ipa_export_method", skip_serializing_if = "Option::is_none")]
    pub distribution_type: Option<String>,
    #[serde(default, alias = "expire_date", skip_serializing_if = "Option::is_none")]
    pub certificate_expires_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    #[serde(default)]
    pub app_info: AppInfo,
    #[serde(default)]
    pub provisioning_info: ProvisioningInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub universal: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub split: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size_bytes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOutput {
    pub title: String,
    pub slug: String,
    #[serde(default, rename = "artifact_meta")]
    pub metadata: Option<ArtifactMeta>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind { AppBundle, UniversalApk, SplitApk, IpaAppStore, IpaDebug, IpaOther, XcodeArchive, Other }

pub const DISTRIBUTION_APP_STORE: &str = "app-store";
pub const DISTRIBUTION_DEBUG: &str = "development";

impl BuildOutput {
    pub fn distribution_type(&self) -> Option<&str> {
        self.metadata.as_ref()?.provisioning_info.distribution_type.as_deref()
    }

    fn is_universal_apk(&self) -> bool {
        let flagged = self.metadata.as_ref().and_then(|m| m.universal.as_deref()).map(|u| !u.is_empty()).unwrap_or(false);
        flagged || self.title.to_ascii_lowercase().contains("universal")
    }

    pub fn kind(&self) -> ArtifactKind {
        let title = self.title.to_ascii_lowercase();
        if title.ends_with(".aab") {
            ArtifactKind::AppBundle
        } else if title.ends_with(".apk") {
            if self.is_universal_apk() { ArtifactKind::UniversalApk } else { ArtifactKind::SplitApk }
        } else if title.ends_with(".ipa") {
            match self.distribution_type() {
                Some(DISTRIBUTION_APP_STORE) => ArtifactKind::IpaAppStore,
                Some(DISTRIBUTION_DEBUG) => ArtifactKind::IpaDebug,
                _ => ArtifactKind::IpaOther,
            }
        } else if title.ends_with(".xcarchive.zip") || title.ends_with(".xcarchive") {
            ArtifactKind::XcodeArchive
        } else {
            ArtifactKind::Other
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn output(v: serde_json::Value) -> BuildOutput { serde_json::from_value(v).unwrap() }

    #[test]
    fn decodes_vendor_shape() {
        let o = output(json!({
            "title": "app.ipa",
            "slug": "a1",
            "artifact_type": "ios-ipa",
            "artifact_meta": {
                "app_info": {"bundle_id": "io.ship", "version": "1.0", "device_family_list": [1, 2]},
                "provisioning_info": {"ipa_export_method": "app-store", "expire_date": "2030-01-01T00:00:00Z"}
            }
        }));
        assert_eq!(o.kind(), ArtifactKind::IpaAppStore);
        let meta = o.metadata.unwrap();
        assert_eq!(meta.app_info.device_family_list, vec![1, 2]);
        assert_eq!(meta.provisioning_info.certificate_expires_at.as_deref(), Some("2030-01-01T00:00:00Z"));
    }

    #[test]
    fn classifies_by_extension_and_metadata() {
        assert_eq!(output(json!({"title": "app-release.aab", "slug": "s"})).kind(), ArtifactKind::AppBundle);
        assert_eq!(output(json!({"title": "app-universal.apk", "slug": "s"})).kind(), ArtifactKind::UniversalApk);
        assert_eq!(output(json!({"title": "app.apk", "slug": "s", "artifact_meta": {"universal": "/tmp/app.apk"}})).kind(), ArtifactKind::UniversalApk);
        assert_eq!(output(json!({"title": "app-arm64-v8a.apk", "slug": "s"})).kind(), ArtifactKind::SplitApk);
        assert_eq!(output(json!({"title": "App.xcarchive.zip", "slug": "s"})).kind(), ArtifactKind::XcodeArchive);
        assert_eq!(output(json!({"title": "app.ipa", "slug": "s", "artifact_meta": {"provisioning_info": {"distribution_type": "ad-hoc"}}})).kind(), ArtifactKind::IpaOther);
        assert_eq!(output(json!({"title": "report.txt", "slug": "s"})).kind(), ArtifactKind::Other);
    }

    #[test]
    fn android_version_name_alias() {
        let info: AppInfo = serde_json::from_value(json!({"package_name": "io.ship", "version_name": "2.1"})).unwrap();
        assert_eq!(info.version.as_deref(), Some("2.1"));
        assert!(!info.is_empty());
        assert!(AppInfo::default().is_empty());
    }
}
