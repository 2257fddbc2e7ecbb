//! # Reconciliation Engine
//!
//! Merges what the tracking service knows about a work item's workflows back
//! into the item and recomputes its canonical output datasets.
//!
//! ## Output selection
//!
//! Only workflows that never reported aborted, rejected or failed contribute.
//! Their datasets are grouped by `(tier, name without -vN)` and the highest
//! version of each group wins. The result is ordered by tier preference with
//! analysis tiers first and DQM content last.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use super::context::SystemContext;
use crate::constants::{tier_rank, workflow_status};
use crate::error::{RelvalError, Result};
use crate::models::workflow::dataset_tier;
use crate::models::{OutputDataset, StatusEntry, WorkItem, WorkflowDocument, WorkflowSummary};

#[derive(Debug)]
pub struct Reconciler {
    context: Arc<SystemContext>,
}

impl Reconciler {
    pub fn new(context: Arc<SystemContext>) -> Self {
        Self { context }
    }

    /// Reconcile and persist one work item under its blocking lock
    pub async fn refresh(&self, prepid: &str) -> Result<WorkItem> {
        let _guard = self.context.locker.lock(prepid).await;
        let mut item = self.context.items.get_required(prepid).await?;
        self.reconcile(&mut item).await?;
        self.context.items.save(&item).await?;
        Ok(item)
    }

    /// Update `workflows` and `output_datasets` of an item the caller holds the lock for
    pub async fn reconcile(&self, item: &mut WorkItem) -> Result<()> {
        let tracker = &self.context.tracker;
        let mut documents = tracker.workflows_for(&item.prepid).await?;
        let known: HashSet<String> = documents.iter().map(|d| d.request_name.clone()).collect();

        for workflow in &item.workflows {
            if known.contains(&workflow.name) {
                continue;
            }
            let document = tracker.workflow(&workflow.name).await?.ok_or_else(|| {
                RelvalError::Reconciliation(format!(
                    "Could not find workflow {} of {} in the tracking service",
                    workflow.name, item.prepid
                ))
            })?;
            documents.push(document);
        }

        let tiers: HashSet<String> = item.output_datatiers().into_iter().collect();
        let mut workflows: Vec<WorkflowSummary> = documents
            .iter()
            .filter(|d| {
                !d.request_type
                    .eq_ignore_ascii_case(workflow_status::RESUBMISSION_TYPE)
            })
            .map(|d| summarize(d, &tiers))
            .collect();
        workflows.sort_by_key(WorkflowSummary::sort_key);

        item.output_datasets = select_output_datasets(&workflows);
        debug!(
            prepid = %item.prepid,
            workflows = workflows.len(),
            outputs = item.output_datasets.len(),
            "🔄 RECONCILE: Merged tracker state"
        );
        item.workflows = workflows;
        info!(prepid = %item.prepid, "🔄 RECONCILE: Workflows updated");
        Ok(())
    }
}

/// Summary of one tracker document, keeping only datasets of `tiers`
pub fn summarize(document: &WorkflowDocument, tiers: &HashSet<String>) -> WorkflowSummary {
    let mut history = document.event_number_history.clone();
    history.sort_by(|a, b| b.time.cmp(&a.time));

    let output_datasets = document
        .output_datasets
        .iter()
        .filter(|name| tiers.contains(dataset_tier(name)))
        .map(|name| {
            let latest = history
                .iter()
                .find_map(|entry| entry.datasets.get(name.as_str()));
            OutputDataset {
                name: name.clone(),
                access_type: latest.map(|d| d.access_type.clone()).unwrap_or_default(),
                events: latest.map(|d| d.events).unwrap_or(0),
            }
        })
        .collect();

    let status_history = document
        .request_transition
        .iter()
        .map(|transition| StatusEntry {
            time: transition.update_time,
            status: transition.status.clone(),
        })
        .collect();

    WorkflowSummary {
        name: document.request_name.clone(),
        workflow_type: document.request_type.clone(),
        output_datasets,
        status_history,
    }
}

/// `(name without version, version)` of `/primary/processed-vN/tier`
fn split_version(dataset: &str) -> (String, String) {
    let parts: Vec<&str> = dataset.split('/').collect();
    if parts.len() != 4 {
        return (dataset.to_string(), String::new());
    }
    match parts[2].rsplit_once("-v") {
        Some((processed, version)) => (
            format!("/{}/{}/{}", parts[1], processed, parts[3]),
            version.to_string(),
        ),
        None => (dataset.to_string(), String::new()),
    }
}

/// Numeric version comparison with a lexicographic fallback
fn compare_versions(left: &str, right: &str) -> Ordering {
    match (left.parse::<u64>(), right.parse::<u64>()) {
        (Ok(l), Ok(r)) => l.cmp(&r),
        _ => left.cmp(right),
    }
}

/// Canonical output datasets of a set of workflows
pub fn select_output_datasets(workflows: &[WorkflowSummary]) -> Vec<String> {
    // (tier, unversioned name) → (version, full name)
    let mut newest: BTreeMap<(String, String), (String, String)> = BTreeMap::new();
    for workflow in workflows.iter().filter(|w| w.is_active()) {
        for dataset in &workflow.output_datasets {
            let tier = dataset_tier(&dataset.name).to_string();
            let (unversioned, version) = split_version(&dataset.name);
            let key = (tier, unversioned);
            let replace = match newest.get(&key) {
                Some((current, _)) => compare_versions(&version, current) == Ordering::Greater,
                None => true,
            };
            if replace {
                newest.insert(key, (version, dataset.name.clone()));
            }
        }
    }

    let mut selected: Vec<(String, String)> = newest
        .into_iter()
        .map(|((tier, _), (_, name))| (tier, name))
        .collect();
    selected.sort_by(|(tier_a, name_a), (tier_b, name_b)| {
        tier_rank(tier_a)
            .cmp(&tier_rank(tier_b))
            .then_with(|| name_a.cmp(name_b))
    });
    selected.into_iter().map(|(_, name)| name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::workflow::{DatasetEvents, EventNumberEntry, RequestTransition};

    fn summary(name: &str, datasets: &[&str], statuses: &[&str]) -> WorkflowSummary {
        WorkflowSummary {
            name: name.to_string(),
            workflow_type: "TaskChain".to_string(),
            output_datasets: datasets
                .iter()
                .map(|d| OutputDataset {
                    name: d.to_string(),
                    access_type: "VALID".to_string(),
                    events: 0,
                })
                .collect(),
            status_history: statuses
                .iter()
                .enumerate()
                .map(|(i, s)| StatusEntry {
                    time: i as i64,
                    status: s.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_highest_version_wins_and_aod_before_raw() {
        let workflows = vec![
            summary("a_240101_1", &["/X/V1-v1/RAW", "/X/V1-v1/AOD"], &["new"]),
            summary("b_240102_1", &["/X/V1-v2/RAW"], &["new"]),
        ];
        assert_eq!(
            select_output_datasets(&workflows),
            vec!["/X/V1-v1/AOD", "/X/V1-v2/RAW"]
        );
    }

    #[test]
    fn test_inactive_workflows_do_not_contribute() {
        let workflows = vec![
            summary("a_240101_1", &["/X/V1-v1/AODSIM"], &["new"]),
            summary("b_240102_1", &["/X/V1-v2/AODSIM"], &["new", "aborted"]),
        ];
        assert_eq!(select_output_datasets(&workflows), vec!["/X/V1-v1/AODSIM"]);
    }

    #[test]
    fn test_dqm_is_ordered_last() {
        let workflows = vec![summary(
            "a_240101_1",
            &["/X/V1-v1/DQMIO", "/X/V1-v1/SOMETHING", "/X/V1-v1/MINIAODSIM"],
            &["new"],
        )];
        assert_eq!(
            select_output_datasets(&workflows),
            vec!["/X/V1-v1/MINIAODSIM", "/X/V1-v1/SOMETHING", "/X/V1-v1/DQMIO"]
        );
    }

    #[test]
    fn test_version_comparison_is_numeric() {
        let workflows = vec![summary(
            "a_240101_1",
            &["/X/V1-v9/AOD", "/X/V1-v10/AOD"],
            &["new"],
        )];
        assert_eq!(select_output_datasets(&workflows), vec!["/X/V1-v10/AOD"]);
    }

    #[test]
    fn test_summarize_filters_tiers_and_uses_latest_events() {
        let name = "/RelValZMM/CMSSW_14_0_0-v1/AODSIM";
        let document = WorkflowDocument {
            request_name: "pdmvserv_RVZMM_240101_1".to_string(),
            request_type: "TaskChain".to_string(),
            prepid: "p".to_string(),
            request_transition: vec![RequestTransition {
                status: "new".to_string(),
                update_time: 10,
            }],
            event_number_history: vec![
                EventNumberEntry {
                    time: 1,
                    datasets: BTreeMap::from([(
                        name.to_string(),
                        DatasetEvents {
                            events: 5,
                            access_type: "PRODUCTION".to_string(),
                        },
                    )]),
                },
                EventNumberEntry {
                    time: 2,
                    datasets: BTreeMap::from([(
                        name.to_string(),
                        DatasetEvents {
                            events: 9000,
                            access_type: "VALID".to_string(),
                        },
                    )]),
                },
            ],
            output_datasets: vec![
                name.to_string(),
                "/RelValZMM/CMSSW_14_0_0-v1/DQMIO".to_string(),
            ],
        };
        let tiers = HashSet::from(["AODSIM".to_string()]);
        let summary = summarize(&document, &tiers);

        assert_eq!(summary.output_datasets.len(), 1);
        assert_eq!(summary.output_datasets[0].events, 9000);
        assert_eq!(summary.output_datasets[0].access_type, "VALID");
        assert_eq!(summary.status_history[0].time, 10);
    }
}
