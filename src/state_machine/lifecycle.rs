//! # Work Item Lifecycle
//!
//! Executes `advance` and `revert` for one work item under its non-blocking
//! lock. A transition is: determine the target status, check guards, apply the
//! transition's side effects, append one status history entry and persist.
//! Guard failures leave the stored item untouched.
//!
//! `approved → submitting` only queues the item; the submission itself runs in
//! the background and moves the item on to `submitted` (or back to `new`).

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::events::LifecycleEvent;
use super::guards::{
    DatasetsValidGuard, GpuParamsCompleteGuard, StateGuard, WorkflowCompletedGuard,
};
use super::states::WorkItemStatus;
use crate::constants::workflow_status;
use crate::database::SortOrder;
use crate::error::{RelvalError, Result};
use crate::logging::log_item_operation;
use crate::models::{HistoryEntry, WithHistory, WorkItem};
use crate::orchestration::context::SystemContext;
use crate::orchestration::reconciler::Reconciler;
use crate::orchestration::submission_queue::SubmissionQueue;

/// Forward and backward status transitions of work items
#[derive(Debug)]
pub struct WorkItemLifecycle {
    context: Arc<SystemContext>,
    reconciler: Arc<Reconciler>,
    queue: Arc<SubmissionQueue>,
}

impl WorkItemLifecycle {
    pub fn new(
        context: Arc<SystemContext>,
        reconciler: Arc<Reconciler>,
        queue: Arc<SubmissionQueue>,
    ) -> Self {
        Self {
            context,
            reconciler,
            queue,
        }
    }

    /// Move the item one status forward
    pub async fn advance(&self, prepid: &str) -> Result<WorkItem> {
        self.transition(prepid, LifecycleEvent::Advance).await
    }

    /// Move the item one status back
    pub async fn revert(&self, prepid: &str) -> Result<WorkItem> {
        self.transition(prepid, LifecycleEvent::Revert).await
    }

    async fn transition(&self, prepid: &str, event: LifecycleEvent) -> Result<WorkItem> {
        let _guard = self.context.locker.try_lock(prepid)?;
        let mut item = self.context.items.get_required(prepid).await?;
        let current = item.status;
        let target = event.target(prepid, current)?;
        debug!(
            prepid = %prepid,
            event = %event,
            from = %current,
            to = %target,
            "🔄 LIFECYCLE: Transition requested"
        );

        match (current, target) {
            (WorkItemStatus::New, WorkItemStatus::Approved) => self.approve(&mut item).await?,
            (WorkItemStatus::Approved, WorkItemStatus::Submitting) => {
                self.start_submission(&mut item).await?
            }
            (WorkItemStatus::Submitted, WorkItemStatus::Done) => self.complete(&mut item).await?,
            (WorkItemStatus::Approved, WorkItemStatus::New) => {
                item.clear_submission_data(true);
                self.set_status(&mut item, WorkItemStatus::New, None).await?;
            }
            (_, WorkItemStatus::Approved) => self.withdraw(&mut item).await?,
            (from, to) => {
                return Err(RelvalError::invalid_transition(
                    prepid,
                    from,
                    format!("{event} to {to}"),
                ))
            }
        }

        log_item_operation(event.event_type(), prepid, item.status.as_str(), None);
        Ok(item)
    }

    /// Append the status entry and persist
    async fn set_status(
        &self,
        item: &mut WorkItem,
        status: WorkItemStatus,
        time: Option<i64>,
    ) -> Result<()> {
        let entry = HistoryEntry::status(status);
        let entry = match time {
            Some(time) => entry.at(time),
            None => entry,
        };
        item.status = status;
        item.history_mut().push(entry);
        self.context.items.save(item).await?;
        info!(prepid = %item.prepid, status = %status, "🔄 LIFECYCLE: Status changed");
        Ok(())
    }

    /// new → approved
    async fn approve(&self, item: &mut WorkItem) -> Result<()> {
        GpuParamsCompleteGuard.check(item).await?;
        self.context.resolver.resolve_item(item).await?;
        self.set_status(item, WorkItemStatus::Approved, None).await
    }

    /// approved → submitting, then hand the item to the submission queue
    async fn start_submission(&self, item: &mut WorkItem) -> Result<()> {
        DatasetsValidGuard::new(Arc::clone(&self.context.catalog))
            .check(item)
            .await?;

        let stored = item.clone();
        item.campaign_timestamp = self.campaign_timestamp(item).await?;
        self.set_status(item, WorkItemStatus::Submitting, None)
            .await?;

        if let Err(e) = self.queue.add(&item.prepid) {
            warn!(prepid = %item.prepid, error = %e, "🔄 LIFECYCLE: Queueing failed, restoring item");
            self.context.items.save(&stored).await?;
            return Err(e);
        }
        Ok(())
    }

    /// Reuse the newest campaign timestamp of the same release and batch if recent
    async fn campaign_timestamp(&self, item: &WorkItem) -> Result<i64> {
        let now = Utc::now().timestamp();
        let window = self.context.config().campaign.reuse_window_seconds;
        let newest = self
            .context
            .items
            .query(
                &format!(
                    "cmssw_release={}&&batch_name={}",
                    item.cmssw_release, item.batch_name
                ),
                Some(&SortOrder::descending("campaign_timestamp")),
                Some(1),
            )
            .await?;

        let timestamp = match newest.first().map(|sibling| sibling.campaign_timestamp) {
            Some(previous) if previous > 0 && now - previous <= window => previous,
            _ => now,
        };
        debug!(prepid = %item.prepid, campaign_timestamp = timestamp, "🔄 LIFECYCLE: Campaign timestamp chosen");
        Ok(timestamp)
    }

    /// submitted → done
    async fn complete(&self, item: &mut WorkItem) -> Result<()> {
        self.reconciler.reconcile(item).await?;
        WorkflowCompletedGuard.check(item).await?;
        let completed_at = WorkflowCompletedGuard::completed_at(item);
        self.set_status(item, WorkItemStatus::Done, completed_at)
            .await
    }

    /// submitting, submitted or done → approved: stop every active workflow
    async fn withdraw(&self, item: &mut WorkItem) -> Result<()> {
        let active: Vec<String> = item
            .workflows
            .iter()
            .filter(|w| w.is_active())
            .map(|w| w.name.clone())
            .collect();
        if !active.is_empty() {
            self.context.tracker.force_refresh(&active).await?;
        }
        self.reconciler.reconcile(item).await?;

        let mut stopped = HashSet::new();
        for workflow in item.workflows.iter().filter(|w| w.is_active()) {
            if !stopped.insert(workflow.name.clone()) {
                continue;
            }
            let target = match workflow.last_status() {
                Some(status) if workflow_status::REJECT_FROM.contains(&status) => {
                    workflow_status::REJECTED
                }
                _ => workflow_status::ABORTED,
            };
            info!(
                prepid = %item.prepid,
                workflow = %workflow.name,
                target = target,
                "🔄 LIFECYCLE: Stopping workflow"
            );
            self.context
                .batch
                .change_status(&workflow.name, target)
                .await?;
        }

        item.workflows.clear();
        item.output_datasets.clear();
        item.clear_submission_data(false);
        self.set_status(item, WorkItemStatus::Approved, None).await
    }
}
