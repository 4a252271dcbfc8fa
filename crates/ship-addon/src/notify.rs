use std::sync::Arc;
use tracing::{debug, info};
use crate::ci::CiClient;
use crate::error::PipelineError;
use crate::mailer::{Mailer, NewVersionNotice};
use crate::models::{App, AppVersion};
use crate::services::AppContactService;

pub struct NotificationDispatcher {
    contacts: Arc<dyn AppContactService>,
    ci: Arc<dyn CiClient>,
    mailer: Arc<dyn Mailer>,
}

impl NotificationDispatcher {
    pub fn new(contacts: Arc<dyn AppContactService>, ci: Arc<dyn CiClient>, mailer: Arc<dyn Mailer>) -> Self {
        Self { contacts, ci, mailer }
    }

    /// Mails the confirmed contacts that opted into new-version mail.
    /// Returns the number of recipients; zero means nothing was sent.
    pub async fn notify_new_version(&self, app: &App, version: &AppVersion) -> Result<usize, PipelineError> {
        let recipients: Vec<String> = self.contacts.find_all(app).await?
            .into_iter()
            .filter(|c| c.wants_new_version_mail())
            .map(|c| c.email)
            .collect();
        if recipients.is_empty() {
            debug!(app_slug=%app.app_slug, app_version_id=%version.id, "notify.no_recipients");
            return Ok(0);
        }
        let details = self.ci.get_app_details(&app.ci_api_token, &app.app_slug).await.map_err(PipelineError::Upstream)?;
        let platform = version.platform()
            .ok_or_else(|| PipelineError::Persistence(anyhow::anyhow!("version {} has unknown platform {}", version.id, version.platform)))?;
        // a corrupt blob only costs the install link
        let public_install_page_url = version.artifact_info().ok().and_then(|a| a.public_install_page_url);
        let notice = NewVersionNotice {
            recipients,
            app_slug: app.app_slug.clone(),
            app_title: details.title,
            app_icon_url: details.avatar_url,
            app_version_id: version.id,
            platform,
            version: version.version.clone(),
            build_number: version.build_number,
            public_install_page_url,
        };
        self.mailer.send_new_version(&notice).await.map_err(PipelineError::Notification)?;
        info!(app_slug=%app.app_slug, app_version_id=%version.id, recipients=notice.recipients.len(), "notify.new_version_sent");
        Ok(notice.recipients.len())
    }
}
