//! # Submitter
//!
//! Background half of `approved → submitting → submitted`. A submission runs
//! under the item's blocking lock: prepare the remote workspace, generate and
//! upload configurations, submit the job description, then record the result.
//!
//! Any failure before the workflow is recorded is compensated: the item goes
//! back to `new` with its submission data cleared and the owners are notified.
//! Nothing is re-raised to the worker. Reconciliation runs once afterwards
//! either way.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::context::SystemContext;
use super::reconciler::Reconciler;
use super::submission_queue::SubmissionHandler;
use crate::client::RemoteSession;
use crate::constants::history;
use crate::error::{RelvalError, Result};
use crate::execution::{
    assign_config_hashes, generation_script, job_description, parse_doc_ids, upload_script,
    UPLOADER_FILE_NAME,
};
use crate::logging::{log_error, log_submission_operation};
use crate::models::{WithHistory, WorkItem, WorkflowSummary};
use crate::state_machine::WorkItemStatus;

const GENERATE_SCRIPT: &str = "config_generate.sh";
const UPLOAD_SCRIPT: &str = "config_upload.sh";

/// Result of one submission attempt
#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionOutcome {
    /// Workflow created and recorded on the item
    Submitted { workflow: String },
    /// Submission failed and the item was reset to `new`
    Compensated { reason: String },
}

#[derive(Debug)]
pub struct Submitter {
    context: Arc<SystemContext>,
    reconciler: Arc<Reconciler>,
}

impl Submitter {
    pub fn new(context: Arc<SystemContext>, reconciler: Arc<Reconciler>) -> Self {
        Self {
            context,
            reconciler,
        }
    }

    /// Submit one work item. Errors only when the item cannot be submitted at all
    /// (missing, or no longer `submitting`); those leave the item untouched.
    /// Reconciliation runs afterwards whatever the result.
    pub async fn submit(&self, prepid: &str) -> Result<SubmissionOutcome> {
        let attempt = Uuid::new_v4().to_string();
        let outcome = self.submit_locked(prepid, &attempt).await;

        if let Err(e) = self.reconciler.refresh(prepid).await {
            warn!(prepid = %prepid, error = %e, "🚀 SUBMIT: Reconciliation after submission failed");
        }
        log_submission_operation(prepid, "finished", None, Some(&attempt));
        outcome
    }

    async fn submit_locked(&self, prepid: &str, attempt: &str) -> Result<SubmissionOutcome> {
        let _guard = self.context.locker.lock(prepid).await;
        log_submission_operation(prepid, "locked", None, Some(attempt));

        let mut item = self.context.items.get_required(prepid).await?;
        if item.status != WorkItemStatus::Submitting {
            return Err(RelvalError::invalid_transition(
                prepid,
                item.status,
                "submit",
            ));
        }

        let submitted = match self.run(&mut item).await {
            Ok(workflow) => self
                .record_success(&mut item, &workflow)
                .await
                .map(|()| workflow),
            Err(e) => Err(e),
        };
        match submitted {
            Ok(workflow) => {
                self.follow_up(&item, &workflow).await;
                Ok(SubmissionOutcome::Submitted { workflow })
            }
            Err(e) => {
                let reason = e.to_string();
                log_error("submitter", "submit", &reason, Some(prepid));
                self.compensate(prepid, &reason).await?;
                Ok(SubmissionOutcome::Compensated { reason })
            }
        }
    }

    /// Remote preparation and submission; returns the new workflow name
    async fn run(&self, item: &mut WorkItem) -> Result<String> {
        let config = self.context.config();
        let directory = config.remote.workspace_for(&item.prepid);
        let session = self.context.executor.open_session().await?;

        let result = async {
            self.prepare_workspace(session.as_ref(), item, &directory)
                .await?;
            log_submission_operation(&item.prepid, "workspace_ready", None, None);

            let generated = session
                .execute(&[
                    format!("cd {directory}"),
                    format!("chmod +x {GENERATE_SCRIPT}"),
                    "voms-proxy-init -voms cms --valid 4:00 --out $(pwd)/proxy.txt".to_string(),
                    "export X509_USER_PROXY=$(pwd)/proxy.txt".to_string(),
                    format!("./{GENERATE_SCRIPT}"),
                ])
                .await?;
            if !generated.success() {
                return Err(RelvalError::RemoteExecution(format!(
                    "Error generating configs for {}.\n{}",
                    item.prepid,
                    generated.stderr.trim()
                )));
            }
            log_submission_operation(&item.prepid, "configs_generated", None, None);

            let uploaded = session
                .execute(&[
                    format!("cd {directory}"),
                    format!("chmod +x {UPLOAD_SCRIPT}"),
                    "export X509_USER_PROXY=$(pwd)/proxy.txt".to_string(),
                    format!("./{UPLOAD_SCRIPT}"),
                ])
                .await?;
            if !uploaded.success() {
                return Err(RelvalError::RemoteExecution(format!(
                    "Error uploading configs for {}.\n{}",
                    item.prepid,
                    uploaded.stderr.trim()
                )));
            }
            assign_config_hashes(item, parse_doc_ids(&uploaded.stdout))?;
            log_submission_operation(&item.prepid, "configs_uploaded", None, None);

            let job = job_description(item, &config.batch_service)?;
            self.context.batch.submit(&job).await
        }
        .await;

        if result.is_ok() {
            if let Err(e) = session.execute(&[format!("rm -rf {directory}")]).await {
                warn!(prepid = %item.prepid, error = %e, "🚀 SUBMIT: Workspace cleanup failed");
            }
        }
        if let Err(e) = session.close().await {
            warn!(prepid = %item.prepid, error = %e, "🚀 SUBMIT: Closing remote session failed");
        }
        result
    }

    async fn prepare_workspace(
        &self,
        session: &dyn RemoteSession,
        item: &WorkItem,
        directory: &str,
    ) -> Result<()> {
        let config = self.context.config();
        let prepared = session
            .execute(&[format!("rm -rf {directory}"), format!("mkdir -p {directory}")])
            .await?;
        if !prepared.success() {
            return Err(RelvalError::RemoteExecution(format!(
                "Error preparing workspace for {}.\n{}",
                item.prepid,
                prepared.stderr.trim()
            )));
        }

        session
            .upload_content(
                &generation_script(item)?,
                &format!("{directory}/{GENERATE_SCRIPT}"),
            )
            .await?;
        session
            .upload_content(
                &upload_script(item, &config.batch_service),
                &format!("{directory}/{UPLOAD_SCRIPT}"),
            )
            .await?;
        session
            .upload_file(
                Path::new(&config.remote.config_uploader_script),
                &format!("{directory}/{UPLOADER_FILE_NAME}"),
            )
            .await
    }

    async fn record_success(&self, item: &mut WorkItem, workflow: &str) -> Result<()> {
        item.workflows = vec![WorkflowSummary::named(workflow)];
        item.status = WorkItemStatus::Submitted;
        item.add_history(
            history::SUBMISSION,
            history::SUBMISSION_SUCCEEDED,
            Some(history::AUTOMATIC_ACTOR.to_string()),
        );
        self.context.items.save(item).await?;
        info!(prepid = %item.prepid, workflow = %workflow, "🚀 SUBMIT: Workflow submitted");
        Ok(())
    }

    /// Approval, tracker refresh and notification of a recorded submission.
    /// The item is submitted from here on; failures are only logged.
    async fn follow_up(&self, item: &WorkItem, workflow: &str) {
        tokio::time::sleep(self.context.config().batch_service.approve_delay()).await;
        if let Err(e) = self.context.batch.approve(workflow).await {
            warn!(workflow = %workflow, error = %e, "🚀 SUBMIT: Approving workflow failed");
        }
        if let Err(e) = self
            .context
            .tracker
            .force_refresh(&[workflow.to_string()])
            .await
        {
            warn!(workflow = %workflow, error = %e, "🚀 SUBMIT: Tracker refresh failed");
        }
        self.context.emailer.notify_submission_succeeded(item).await;
    }

    /// Reset a failed submission back to `new` from the stored item
    async fn compensate(&self, prepid: &str, reason: &str) -> Result<()> {
        let mut item = self.context.items.get_required(prepid).await?;
        item.status = WorkItemStatus::New;
        item.clear_submission_data(true);
        item.add_history(
            history::SUBMISSION,
            history::SUBMISSION_FAILED,
            Some(history::AUTOMATIC_ACTOR.to_string()),
        );
        self.context.items.save(&item).await?;
        warn!(prepid = %prepid, reason = %reason, "🚀 SUBMIT: Submission failed, item reset to new");
        self.context
            .emailer
            .notify_submission_failed(&item, reason)
            .await;
        Ok(())
    }
}

#[async_trait]
impl SubmissionHandler for Submitter {
    async fn handle(&self, key: &str) {
        match self.submit(key).await {
            Ok(SubmissionOutcome::Submitted { workflow }) => {
                log_submission_operation(key, "submitted", None, Some(&workflow));
            }
            Ok(SubmissionOutcome::Compensated { reason }) => {
                log_submission_operation(key, "compensated", None, Some(&reason));
            }
            Err(e) => log_error("submitter", "handle", &e.to_string(), Some(key)),
        }
    }
}
