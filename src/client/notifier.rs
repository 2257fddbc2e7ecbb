//! Notification formatting and delivery
//!
//! [`Emailer`] turns orchestration outcomes into messages and hands them to a
//! [`Notifier`] sink. Delivery failures are logged and never fail the operation
//! that triggered the notification.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use super::traits::Notifier;
use crate::config::{BatchServiceConfig, NotificationConfig};
use crate::error::Result;
use crate::models::{WithHistory, WorkItem};

const SIGN_OFF: &str = "Sincerely,\nRelVal Machine";

/// Notification sink that writes messages to the log
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn send(&self, subject: &str, body: &str, recipients: &[String]) -> Result<()> {
        info!(
            subject = %subject,
            recipients = %recipients.join(","),
            body = %body,
            "📧 NOTIFY: Notification"
        );
        Ok(())
    }
}

pub struct Emailer {
    sink: Arc<dyn Notifier>,
    config: NotificationConfig,
    batch_service_url: String,
}

impl std::fmt::Debug for Emailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emailer")
            .field("development", &self.config.development)
            .field("service_url", &self.config.service_url)
            .finish()
    }
}

impl Emailer {
    pub fn new(
        sink: Arc<dyn Notifier>,
        config: NotificationConfig,
        batch_service: &BatchServiceConfig,
    ) -> Self {
        Self {
            sink,
            config,
            batch_service_url: batch_service.base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Subject with the instance prefix
    pub fn format_subject(&self, subject: &str) -> String {
        if self.config.development {
            format!("[RelVal-DEV] {subject}")
        } else {
            format!("[RelVal] {subject}")
        }
    }

    pub fn format_body(&self, body: &str) -> String {
        format!("{}\n\n{SIGN_OFF}", body.trim())
    }

    /// Everyone who touched the item plus the configured defaults
    pub fn recipients(&self, item: &WorkItem) -> Vec<String> {
        let mut recipients = item.history_users();
        for default in &self.config.default_recipients {
            if !recipients.contains(default) {
                recipients.push(default.clone());
            }
        }
        recipients
    }

    fn item_link(&self, prepid: &str) -> String {
        format!(
            "You can find this relval at {}/relvals?prepid={prepid}\n",
            self.config.service_url.trim_end_matches('/')
        )
    }

    /// Format and deliver; failures are logged only
    pub async fn send(&self, subject: &str, body: &str, recipients: &[String]) {
        let subject = self.format_subject(subject);
        let body = self.format_body(body);
        if let Err(e) = self.sink.send(&subject, &body, recipients).await {
            warn!(subject = %subject, error = %e, "📧 NOTIFY: Failed to deliver notification");
        }
    }

    pub fn submission_failed_message(&self, item: &WorkItem, error: &str) -> (String, String) {
        let prepid = &item.prepid;
        let subject = format!("RelVal {prepid} submission failed");
        let mut body = format!("Hello,\n\nUnfortunately submission of {prepid} failed.\n");
        body.push_str(&self.item_link(prepid));
        body.push_str(&format!("Error message:\n\n{error}"));
        (subject, body)
    }

    pub fn submission_succeeded_message(&self, item: &WorkItem) -> (String, String) {
        let prepid = &item.prepid;
        let subject = format!("RelVal {prepid} submission succeeded");
        let mut body = format!("Hello,\n\nSubmission of {prepid} succeeded.\n");
        body.push_str(&self.item_link(prepid));
        if let Some(workflow) = item.last_workflow() {
            body.push_str(&format!(
                "Workflow in ReqMgr2 {}/reqmgr2/fetch?rid={}",
                self.batch_service_url, workflow.name
            ));
        }
        if self.config.development {
            body.push_str(
                "\nNOTE: This was submitted from a development instance of RelVal machine \
                 and this job will never start running in computing!\n",
            );
        }
        (subject, body)
    }

    pub async fn notify_submission_failed(&self, item: &WorkItem, error: &str) {
        let (subject, body) = self.submission_failed_message(item, error);
        self.send(&subject, &body, &self.recipients(item)).await;
    }

    pub async fn notify_submission_succeeded(&self, item: &WorkItem) {
        let (subject, body) = self.submission_succeeded_message(item);
        self.send(&subject, &body, &self.recipients(item)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WorkflowSummary;

    fn emailer(development: bool) -> Emailer {
        let config = NotificationConfig {
            service_url: "https://relval.example.org/".to_string(),
            development,
            default_recipients: vec!["relval-admins@example.org".to_string()],
        };
        Emailer::new(
            Arc::new(TracingNotifier),
            config,
            &BatchServiceConfig::default(),
        )
    }

    fn item() -> WorkItem {
        let mut item = WorkItem::new("CMSSW_14_0_0", "fullsim", Vec::new());
        item.prepid = "CMSSW_14_0_0__fullsim-ZMM-00001".to_string();
        item.add_history("create", serde_json::Value::Null, Some("alice".to_string()));
        item
    }

    #[test]
    fn test_subject_prefix_depends_on_instance() {
        assert_eq!(emailer(true).format_subject("x"), "[RelVal-DEV] x");
        assert_eq!(emailer(false).format_subject("x"), "[RelVal] x");
    }

    #[test]
    fn test_body_gets_sign_off() {
        assert_eq!(
            emailer(false).format_body("Hello\n\n"),
            "Hello\n\nSincerely,\nRelVal Machine"
        );
    }

    #[test]
    fn test_failure_message_contains_error_and_link() {
        let (subject, body) = emailer(false).submission_failed_message(&item(), "upload failed");
        assert_eq!(subject, "RelVal CMSSW_14_0_0__fullsim-ZMM-00001 submission failed");
        assert!(body.contains("https://relval.example.org/relvals?prepid=CMSSW_14_0_0__fullsim-ZMM-00001"));
        assert!(body.ends_with("upload failed"));
    }

    #[test]
    fn test_success_message_links_workflow() {
        let mut item = item();
        item.workflows = vec![WorkflowSummary::named("pdmvserv_RVZMM_240101_1")];
        let (_, body) = emailer(true).submission_succeeded_message(&item);
        assert!(body.contains("reqmgr2/fetch?rid=pdmvserv_RVZMM_240101_1"));
        assert!(body.contains("development instance"));
    }

    #[test]
    fn test_recipients_merge_history_and_defaults() {
        assert_eq!(
            emailer(false).recipients(&item()),
            vec!["alice", "relval-admins@example.org"]
        );
    }
}
