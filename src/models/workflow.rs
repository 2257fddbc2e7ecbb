//! Workflow records: the raw documents reported by the tracking service and the
//! condensed summaries stored on work items.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::constants::workflow_status;

/// Output dataset of a workflow as stored on the work item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDataset {
    pub name: String,
    /// Dataset access type, e.g. `VALID`
    #[serde(rename = "type", default)]
    pub access_type: String,
    #[serde(default)]
    pub events: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub time: i64,
    pub status: String,
}

/// Condensed view of one external workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub name: String,
    #[serde(rename = "type", default)]
    pub workflow_type: String,
    #[serde(default)]
    pub output_datasets: Vec<OutputDataset>,
    #[serde(default)]
    pub status_history: Vec<StatusEntry>,
}

impl WorkflowSummary {
    /// Summary of a freshly submitted workflow the tracker does not know yet
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            workflow_type: String::new(),
            output_datasets: Vec::new(),
            status_history: Vec::new(),
        }
    }

    /// A workflow stays active until it was aborted, rejected or failed
    pub fn is_active(&self) -> bool {
        !self
            .status_history
            .iter()
            .any(|entry| workflow_status::TERMINAL_NEGATIVE.contains(&entry.status.as_str()))
    }

    pub fn last_status(&self) -> Option<&str> {
        self.status_history.last().map(|entry| entry.status.as_str())
    }

    /// First history entry with the given status
    pub fn status_entry(&self, status: &str) -> Option<&StatusEntry> {
        self.status_history.iter().find(|entry| entry.status == status)
    }

    /// Trailing three underscore-delimited tokens of the name, used for ordering
    pub fn sort_key(&self) -> Vec<String> {
        let tokens: Vec<&str> = self.name.split('_').collect();
        let start = tokens.len().saturating_sub(3);
        tokens[start..].iter().map(|t| t.to_string()).collect()
    }
}

/// Workflow document as reported by the tracking service
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowDocument {
    #[serde(rename = "RequestName")]
    pub request_name: String,
    #[serde(rename = "RequestType")]
    pub request_type: String,
    #[serde(rename = "PrepID")]
    pub prepid: String,
    #[serde(rename = "RequestTransition")]
    pub request_transition: Vec<RequestTransition>,
    #[serde(rename = "EventNumberHistory")]
    pub event_number_history: Vec<EventNumberEntry>,
    #[serde(rename = "OutputDatasets")]
    pub output_datasets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestTransition {
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "UpdateTime")]
    pub update_time: i64,
}

/// Snapshot of per-dataset event counts at one point in time
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventNumberEntry {
    #[serde(rename = "Time")]
    pub time: i64,
    #[serde(rename = "Datasets")]
    pub datasets: BTreeMap<String, DatasetEvents>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetEvents {
    #[serde(rename = "Events")]
    pub events: u64,
    #[serde(rename = "Type")]
    pub access_type: String,
}

/// Data tier of a dataset name, the last `/`-delimited segment
pub fn dataset_tier(dataset: &str) -> &str {
    dataset.rsplit('/').next().unwrap_or_default()
}
