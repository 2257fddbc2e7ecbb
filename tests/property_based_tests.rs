use proptest::prelude::*;
use std::collections::HashSet;

use relval_core::database::{glob_to_regex, serial_of};
use relval_core::models::{OutputDataset, StatusEntry, WorkflowSummary};
use relval_core::orchestration::{scale_events, select_output_datasets};
use relval_core::state_machine::LifecycleEvent;
use relval_core::WorkItemStatus;

const TIERS: &[&str] = &["GEN-SIM", "GEN-SIM-RECO", "AODSIM", "MINIAODSIM", "DQMIO", "RAW"];
const STATUSES: &[&str] = &["new", "assignment-approved", "running-open", "completed", "aborted", "rejected", "failed"];

fn dataset_strategy() -> impl Strategy<Value = String> {
    (0..3usize, 0..TIERS.len(), 1..12u32).prop_map(|(primary, tier, version)| {
        format!("/RelValP{primary}/CMSSW_14_0_0-GT_v1-v{version}/{}", TIERS[tier])
    })
}

fn workflow_strategy() -> impl Strategy<Value = WorkflowSummary> {
    (
        prop::collection::vec(dataset_strategy(), 0..6),
        prop::collection::vec(0..STATUSES.len(), 0..4),
        0..10_000u32,
    )
        .prop_map(|(datasets, statuses, serial)| WorkflowSummary {
            name: format!("pdmvserv_wf_{serial:06}_{:04}", serial % 97),
            workflow_type: "TaskChain".to_string(),
            output_datasets: datasets
                .into_iter()
                .map(|name| OutputDataset {
                    name,
                    access_type: "VALID".to_string(),
                    events: 100,
                })
                .collect(),
            status_history: statuses
                .into_iter()
                .enumerate()
                .map(|(time, status)| StatusEntry {
                    time: time as i64,
                    status: STATUSES[status].to_string(),
                })
                .collect(),
        })
}

fn status_strategy() -> impl Strategy<Value = WorkItemStatus> {
    prop::sample::select(WorkItemStatus::ALL.to_vec())
}

fn unversioned(dataset: &str) -> String {
    dataset
        .rsplit_once("-v")
        .map(|(head, tail)| {
            let tier = tail.split_once('/').map_or("", |(_, tier)| tier);
            format!("{head}/{tier}")
        })
        .unwrap_or_else(|| dataset.to_string())
}

proptest! {
    /// Property: selected datasets come from active workflows only
    #[test]
    fn selected_datasets_come_from_active_workflows(workflows in prop::collection::vec(workflow_strategy(), 0..8)) {
        let active: HashSet<&str> = workflows
            .iter()
            .filter(|w| w.is_active())
            .flat_map(|w| w.output_datasets.iter().map(|d| d.name.as_str()))
            .collect();
        for dataset in select_output_datasets(&workflows) {
            prop_assert!(active.contains(dataset.as_str()), "{} is not produced by an active workflow", dataset);
        }
    }

    /// Property: at most one version of each dataset is selected, and it is the newest
    #[test]
    fn one_newest_version_per_dataset(workflows in prop::collection::vec(workflow_strategy(), 0..8)) {
        let selected = select_output_datasets(&workflows);
        let mut seen = HashSet::new();
        for dataset in &selected {
            prop_assert!(seen.insert(unversioned(dataset)), "duplicate versions of {}", dataset);
        }

        let version = |name: &str| -> u32 {
            name.rsplit_once("-v")
                .and_then(|(_, tail)| tail.split('/').next())
                .and_then(|v| v.parse().ok())
                .unwrap_or(0)
        };
        for workflow in workflows.iter().filter(|w| w.is_active()) {
            for candidate in &workflow.output_datasets {
                let chosen = selected
                    .iter()
                    .find(|name| unversioned(name) == unversioned(&candidate.name));
                prop_assert!(chosen.is_some());
                if let Some(chosen) = chosen {
                    prop_assert!(version(chosen) >= version(&candidate.name));
                }
            }
        }
    }

    /// Property: DQM datasets are always ordered after every other tier
    #[test]
    fn dqm_datasets_are_last(workflows in prop::collection::vec(workflow_strategy(), 0..8)) {
        let selected = select_output_datasets(&workflows);
        if let Some(first_dqm) = selected.iter().position(|d| d.ends_with("/DQMIO")) {
            prop_assert!(selected[first_dqm..].iter().all(|d| d.ends_with("/DQMIO")));
        }
    }

    /// Property: scaled event counts never drop below one
    #[test]
    fn scaled_events_are_positive(events in 0..10_000_000u64, factor in 0.0..10.0f64) {
        let scaled = scale_events(events, factor);
        prop_assert!(scaled >= 1);
        prop_assert!(scaled as f64 <= (events as f64 * factor).max(1.0));
    }

    /// Property: formatted identities parse back to their serial
    #[test]
    fn identity_serials_round_trip(name in "[A-Za-z0-9_]{1,20}", serial in 1..100_000u32) {
        let prepid = format!("CMSSW_14_0_0__fullsim-{name}-{serial:05}");
        prop_assert_eq!(serial_of(&prepid), Some(serial));
        let glob = format!("CMSSW_14_0_0__fullsim-{name}-*");
        prop_assert!(glob_to_regex(&glob).unwrap().is_match(&prepid));
    }

    /// Property: advance then revert lands on approved or back where it started
    #[test]
    fn advance_and_revert_stay_on_the_lifecycle(status in status_strategy()) {
        if let Ok(advanced) = LifecycleEvent::Advance.target("x", status) {
            prop_assert!(advanced != status);
            let reverted = LifecycleEvent::Revert.target("x", advanced).unwrap();
            prop_assert!(reverted == status || reverted == WorkItemStatus::Approved);
        } else {
            prop_assert!(matches!(status, WorkItemStatus::Submitting | WorkItemStatus::Done));
        }
        if LifecycleEvent::Revert.target("x", status).is_err() {
            prop_assert_eq!(status, WorkItemStatus::New);
        }
    }
}
