//! # Orchestration Core
//!
//! Single entry point of the RelVal core. Builds the shared context, the
//! submission worker pool and every component on top of it, and exposes the
//! operations callers use.
//!
//! The worker pool is spawned on the current tokio runtime, so the core must be
//! constructed from within one. Call [`OrchestrationCore::shutdown`] before
//! dropping it to let in-flight submissions finish.

use std::sync::Arc;
use tracing::info;

use super::context::{Collaborators, SystemContext};
use super::controller::ItemController;
use super::reconciler::Reconciler;
use super::submission_queue::{QueueStatus, SubmissionQueue, WorkerStatus};
use super::submitter::Submitter;
use super::ticket_fanout::TicketFanout;
use crate::config::ConfigManager;
use crate::error::{RelvalError, Result};
use crate::locker::LockStatus;
use crate::models::{Ticket, WorkItem};
use crate::state_machine::WorkItemLifecycle;

#[derive(Debug)]
pub struct OrchestrationCore {
    context: Arc<SystemContext>,
    reconciler: Arc<Reconciler>,
    queue: Arc<SubmissionQueue>,
    lifecycle: WorkItemLifecycle,
    controller: Arc<ItemController>,
    fanout: TicketFanout,
}

impl OrchestrationCore {
    /// Load configuration for the detected environment and connect real collaborators
    pub fn load() -> Result<Self> {
        let config_manager = ConfigManager::load()
            .map_err(|e| RelvalError::Configuration(format!("Failed to load configuration: {e}")))?;
        Self::from_config(config_manager)
    }

    pub fn from_config(config_manager: Arc<ConfigManager>) -> Result<Self> {
        let collaborators = Collaborators::from_config(config_manager.config())?;
        Ok(Self::new(config_manager, collaborators))
    }

    pub fn new(config_manager: Arc<ConfigManager>, collaborators: Collaborators) -> Self {
        let context = Arc::new(SystemContext::new(config_manager, collaborators));
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&context)));
        let submitter = Arc::new(Submitter::new(
            Arc::clone(&context),
            Arc::clone(&reconciler),
        ));

        let submission = &context.config().submission;
        let queue = Arc::new(SubmissionQueue::start(
            submission.workers,
            submitter,
            submission.shutdown_timeout(),
        ));

        let lifecycle = WorkItemLifecycle::new(
            Arc::clone(&context),
            Arc::clone(&reconciler),
            Arc::clone(&queue),
        );
        let controller = Arc::new(ItemController::new(Arc::clone(&context)));
        let fanout = TicketFanout::new(Arc::clone(&context), Arc::clone(&controller));

        info!(
            workers = submission.workers,
            "✅ CORE: Orchestration core ready"
        );

        Self {
            context,
            reconciler,
            queue,
            lifecycle,
            controller,
            fanout,
        }
    }

    pub fn context(&self) -> &Arc<SystemContext> {
        &self.context
    }

    pub async fn advance(&self, prepid: &str) -> Result<WorkItem> {
        self.lifecycle.advance(prepid).await
    }

    pub async fn revert(&self, prepid: &str) -> Result<WorkItem> {
        self.lifecycle.revert(prepid).await
    }

    pub async fn create_item(&self, item: WorkItem, user: &str) -> Result<WorkItem> {
        self.controller.create_item(item, user).await
    }

    pub async fn update_item(&self, item: WorkItem, user: &str) -> Result<WorkItem> {
        self.controller.update_item(item, user).await
    }

    pub async fn delete_item(&self, prepid: &str, user: &str) -> Result<()> {
        self.controller.delete_item(prepid, user).await
    }

    pub async fn create_ticket(&self, ticket: Ticket, user: &str) -> Result<Ticket> {
        self.controller.create_ticket(ticket, user).await
    }

    pub async fn delete_ticket(&self, prepid: &str) -> Result<()> {
        self.controller.delete_ticket(prepid).await
    }

    pub async fn create_items_for_ticket(&self, ticket_prepid: &str, user: &str) -> Result<Vec<String>> {
        self.fanout.create_items_for_ticket(ticket_prepid, user).await
    }

    pub async fn workflow_names(&self, ticket_prepid: &str) -> Result<String> {
        self.controller.workflow_names(ticket_prepid).await
    }

    pub async fn run_the_matrix_command(&self, ticket_prepid: &str) -> Result<String> {
        self.controller.run_the_matrix_command(ticket_prepid).await
    }

    /// Reconcile one work item with the tracking service
    pub async fn refresh(&self, prepid: &str) -> Result<WorkItem> {
        self.reconciler.refresh(prepid).await
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.queue.queue_status()
    }

    pub fn worker_status(&self) -> Vec<WorkerStatus> {
        self.queue.worker_status()
    }

    pub fn lock_status(&self) -> Vec<LockStatus> {
        self.context.locker.status()
    }

    /// Stop accepting submissions and wait for the workers
    pub async fn shutdown(&self) {
        info!("🛑 CORE: Shutting down orchestration core");
        self.queue.shutdown().await;
    }
}
