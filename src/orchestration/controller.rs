//! # Item and Ticket Controller
//!
//! Creation, editing and deletion of work items and tickets. Identities are
//! allocated as `{prefix}-{serial:05}` under a per-prefix blocking lock, so
//! concurrent creations with the same prefix get consecutive serials. Serials of
//! deleted documents are never handed out again.

use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

use super::context::SystemContext;
use crate::constants::{history, lock_keys};
use crate::error::{RelvalError, Result};
use crate::logging::log_item_operation;
use crate::models::{Ticket, WithHistory, WorkItem};
use crate::state_machine::{TicketStatus, WorkItemStatus};
use crate::validation::{validate_ticket, validate_work_item};

/// Fields owned by the core; user input never overwrites them
const SYSTEM_FIELDS: &[&str] = &[
    "prepid",
    "status",
    "workflows",
    "output_datasets",
    "campaign_timestamp",
    "history",
];

/// Fields fixed at creation
const IMMUTABLE_FIELDS: &[&str] = &["cmssw_release", "batch_name"];

/// Fields editable once an item left `new`
const EDITABLE_AFTER_NEW: &[&str] = &["notes", "priority"];

const NO_WORKFLOW_NAMES: &str = "# No workflow names";

#[derive(Debug)]
pub struct ItemController {
    context: Arc<SystemContext>,
}

fn identity(prefix: &str, serial: u32) -> String {
    format!("{prefix}-{serial:05}")
}

/// Top-level fields that differ between two items, system fields excluded
fn changed_fields(stored: &WorkItem, update: &WorkItem) -> Result<Vec<String>> {
    let stored = object_of(stored)?;
    let update = object_of(update)?;
    let mut changed: Vec<String> = stored
        .keys()
        .chain(update.keys())
        .filter(|key| !SYSTEM_FIELDS.contains(&key.as_str()))
        .filter(|key| stored.get(key.as_str()) != update.get(key.as_str()))
        .cloned()
        .collect();
    changed.sort();
    changed.dedup();
    Ok(changed)
}

fn object_of(item: &WorkItem) -> Result<Map<String, Value>> {
    match serde_json::to_value(item)? {
        Value::Object(map) => Ok(map),
        other => Err(RelvalError::Serialization(format!(
            "Work item serialized to {other}, expected an object"
        ))),
    }
}

impl ItemController {
    pub fn new(context: Arc<SystemContext>) -> Self {
        Self { context }
    }

    /// Validate and store a new work item with a freshly allocated identity
    pub async fn create_item(&self, mut item: WorkItem, user: &str) -> Result<WorkItem> {
        item.prepid.clear();
        validate_work_item(&item)?;

        item.status = WorkItemStatus::New;
        item.workflows.clear();
        item.output_datasets.clear();
        item.history.clear();
        item.clear_submission_data(true);

        let prefix = item.identity_prefix();
        let _guard = self
            .context
            .locker
            .lock(&lock_keys::generate_id(&prefix))
            .await;
        let serial = self
            .context
            .items
            .highest_serial_matching(&format!("{prefix}-*"))
            .await?
            + 1;
        item.prepid = identity(&prefix, serial);
        if self.context.items.exists(&item.prepid).await? {
            return Err(RelvalError::AlreadyExists(format!(
                "Work item {} already exists",
                item.prepid
            )));
        }

        item.add_history(history::CREATE, item.prepid.clone(), Some(user.to_string()));
        self.context.items.save(&item).await?;
        log_item_operation("create", &item.prepid, item.status.as_str(), None);
        Ok(item)
    }

    /// Apply user edits to a stored work item.
    ///
    /// In `new` everything but the system fields may change. Later only notes and
    /// priority may change, and the label while the item is still `approved`.
    pub async fn update_item(&self, update: WorkItem, user: &str) -> Result<WorkItem> {
        let prepid = update.prepid.clone();
        let _guard = self.context.locker.try_lock(&prepid)?;
        let stored = self.context.items.get_required(&prepid).await?;

        let changed = changed_fields(&stored, &update)?;
        if changed.is_empty() {
            debug!(prepid = %prepid, "📋 CONTROLLER: Update without changes");
            return Ok(stored);
        }
        if let Some(field) = changed
            .iter()
            .find(|field| IMMUTABLE_FIELDS.contains(&field.as_str()))
        {
            return Err(RelvalError::Validation(format!(
                "{field} of {prepid} cannot be changed"
            )));
        }

        let mut item = if stored.status == WorkItemStatus::New {
            let mut item = update;
            item.status = stored.status;
            item.workflows = stored.workflows.clone();
            item.output_datasets = stored.output_datasets.clone();
            item.campaign_timestamp = stored.campaign_timestamp;
            item.history = stored.history.clone();
            validate_work_item(&item)?;
            item
        } else {
            for field in &changed {
                let editable = EDITABLE_AFTER_NEW.contains(&field.as_str())
                    || (field == "label" && stored.status == WorkItemStatus::Approved);
                if !editable {
                    return Err(RelvalError::Validation(format!(
                        "{field} of {prepid} cannot be changed in status {}",
                        stored.status
                    )));
                }
            }
            let mut item = stored.clone();
            item.notes = update.notes;
            item.priority = update.priority;
            item.label = update.label;
            item
        };

        if item.priority != stored.priority && item.status == WorkItemStatus::Submitted {
            for workflow in item.workflows.iter().filter(|w| w.is_active()) {
                info!(
                    prepid = %prepid,
                    workflow = %workflow.name,
                    priority = item.priority,
                    "📋 CONTROLLER: Forwarding priority"
                );
                self.context
                    .batch
                    .change_priority(&workflow.name, item.priority)
                    .await?;
            }
        }

        item.add_history(history::UPDATE, changed.clone(), Some(user.to_string()));
        self.context.items.save(&item).await?;
        log_item_operation("update", &prepid, item.status.as_str(), Some(&changed.join(",")));
        Ok(item)
    }

    /// Delete a `new` work item and detach it from the tickets that created it
    pub async fn delete_item(&self, prepid: &str, user: &str) -> Result<()> {
        let _guard = self.context.locker.try_lock(prepid)?;
        let item = self.context.items.get_required(prepid).await?;
        if item.status != WorkItemStatus::New {
            return Err(RelvalError::invalid_transition(prepid, item.status, "delete"));
        }

        let owners = self
            .context
            .tickets
            .query(&format!("created_relvals={prepid}"), None, None)
            .await?;
        for owner in owners {
            let _ticket_guard = self.context.locker.lock(&owner.prepid).await;
            let mut ticket = self.context.tickets.get_required(&owner.prepid).await?;
            ticket.created_relvals.retain(|created| created != prepid);
            ticket.add_history(history::REMOVE_RELVAL, prepid, Some(user.to_string()));
            self.context.tickets.save(&ticket).await?;
            debug!(ticket = %ticket.prepid, prepid = %prepid, "📋 CONTROLLER: Detached from ticket");
        }

        self.context.items.delete(prepid).await?;
        log_item_operation("delete", prepid, item.status.as_str(), None);
        Ok(())
    }

    pub async fn create_ticket(&self, mut ticket: Ticket, user: &str) -> Result<Ticket> {
        ticket.prepid.clear();
        validate_ticket(&ticket)?;
        ticket.status = TicketStatus::New;
        ticket.created_relvals.clear();
        ticket.history.clear();

        let prefix = ticket.identity_prefix();
        let _guard = self
            .context
            .locker
            .lock(&lock_keys::generate_ticket_id(&prefix))
            .await;
        let serial = self
            .context
            .tickets
            .highest_serial_matching(&format!("{prefix}-*"))
            .await?
            + 1;
        ticket.prepid = identity(&prefix, serial);

        ticket.add_history(history::CREATE, ticket.prepid.clone(), Some(user.to_string()));
        self.context.tickets.save(&ticket).await?;
        log_item_operation("create_ticket", &ticket.prepid, &ticket.status.to_string(), None);
        Ok(ticket)
    }

    /// Tickets can only be deleted while they own no work items
    pub async fn delete_ticket(&self, prepid: &str) -> Result<()> {
        let _guard = self.context.locker.try_lock(prepid)?;
        let ticket = self.context.tickets.get_required(prepid).await?;
        if !ticket.created_relvals.is_empty() {
            return Err(RelvalError::precondition(
                prepid,
                format!(
                    "Ticket still owns {} work items, delete them first",
                    ticket.created_relvals.len()
                ),
            ));
        }
        self.context.tickets.delete(prepid).await?;
        log_item_operation("delete_ticket", prepid, &ticket.status.to_string(), None);
        Ok(())
    }

    /// Newest workflow of every work item the ticket created, one per line
    pub async fn workflow_names(&self, ticket_prepid: &str) -> Result<String> {
        let ticket = self.context.tickets.get_required(ticket_prepid).await?;
        let mut names = Vec::new();
        for prepid in &ticket.created_relvals {
            let Some(item) = self.context.items.get(prepid).await? else {
                continue;
            };
            if let Some(workflow) = item.last_workflow() {
                names.push(workflow.name.clone());
            }
        }
        if names.is_empty() {
            return Ok(NO_WORKFLOW_NAMES.to_string());
        }
        Ok(names.join("\n"))
    }

    /// Reproduction command line of the ticket's matrix workflows
    pub async fn run_the_matrix_command(&self, ticket_prepid: &str) -> Result<String> {
        let ticket = self.context.tickets.get_required(ticket_prepid).await?;
        Ok(ticket.run_the_matrix_command())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> WorkItem {
        let mut item = WorkItem::new("CMSSW_14_0_0", "fullsim", Vec::new());
        item.prepid = "CMSSW_14_0_0__fullsim-ZMM-00001".to_string();
        item
    }

    #[test]
    fn test_changed_fields_ignore_system_fields() {
        let stored = item();
        let mut update = stored.clone();
        update.status = WorkItemStatus::Done;
        update.campaign_timestamp = 42;
        assert!(changed_fields(&stored, &update).unwrap().is_empty());

        update.notes = "rerun".to_string();
        update.priority = 110_000;
        assert_eq!(
            changed_fields(&stored, &update).unwrap(),
            vec!["notes", "priority"]
        );
    }

    #[test]
    fn test_identity_is_zero_padded() {
        assert_eq!(identity("CMSSW_14_0_0__fullsim", 7), "CMSSW_14_0_0__fullsim-00007");
    }
}
