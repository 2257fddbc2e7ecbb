use serde::{Deserialize, Serialize};

use super::history::{HistoryEntry, WithHistory};
use super::step::GpuParams;
use crate::state_machine::TicketStatus;

/// Batch descriptor that fans out into sibling work items
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub prepid: String,
    pub batch_name: String,
    pub cmssw_release: String,
    #[serde(default)]
    pub scram_arch: String,
    /// Extra command appended to every enumerated step
    #[serde(default)]
    pub command: String,
    /// Step names the extra command applies to, empty for all
    #[serde(default)]
    pub command_steps: Vec<String>,
    #[serde(default = "default_cpu_cores")]
    pub cpu_cores: u32,
    #[serde(default = "default_memory")]
    pub memory: u32,
    #[serde(default = "default_events_factor")]
    pub events_factor: f64,
    #[serde(default)]
    pub gpu: GpuParams,
    /// Sequences that get the ticket's GPU parameters, empty for every step
    #[serde(default)]
    pub gpu_steps: Vec<String>,
    #[serde(default)]
    pub label: String,
    #[serde(default = "default_matrix")]
    pub matrix: String,
    #[serde(default)]
    pub n_streams: u32,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub recycle_gs: bool,
    /// Sequence whose input is recycled from an existing dataset
    #[serde(default)]
    pub recycle_input_of: String,
    /// Replacement for the middle segment of input and pileup dataset names
    #[serde(default)]
    pub rewrite_gt_string: String,
    #[serde(default)]
    pub sample_tag: String,
    #[serde(default)]
    pub workflow_ids: Vec<f64>,
    #[serde(default)]
    pub status: TicketStatus,
    #[serde(default)]
    pub created_relvals: Vec<String>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

fn default_cpu_cores() -> u32 {
    8
}

fn default_memory() -> u32 {
    16000
}

fn default_events_factor() -> f64 {
    1.0
}

fn default_matrix() -> String {
    "standard".to_string()
}

impl Ticket {
    pub fn new(cmssw_release: impl Into<String>, batch_name: impl Into<String>) -> Self {
        Self {
            prepid: String::new(),
            batch_name: batch_name.into(),
            cmssw_release: cmssw_release.into(),
            scram_arch: String::new(),
            command: String::new(),
            command_steps: Vec::new(),
            cpu_cores: default_cpu_cores(),
            memory: default_memory(),
            events_factor: default_events_factor(),
            gpu: GpuParams::default(),
            gpu_steps: Vec::new(),
            label: String::new(),
            matrix: default_matrix(),
            n_streams: 0,
            notes: String::new(),
            recycle_gs: false,
            recycle_input_of: String::new(),
            rewrite_gt_string: String::new(),
            sample_tag: String::new(),
            workflow_ids: Vec::new(),
            status: TicketStatus::New,
            created_relvals: Vec::new(),
            history: Vec::new(),
        }
    }

    /// Release name without any path prefix
    pub fn release(&self) -> &str {
        self.cmssw_release
            .rsplit('/')
            .next()
            .unwrap_or(&self.cmssw_release)
    }

    /// Identity prefix `{release}__{batch}`
    pub fn identity_prefix(&self) -> String {
        format!("{}__{}", self.release(), self.batch_name)
    }

    /// Workflow ids rendered the way the matrix tooling expects them
    pub fn workflow_id_list(&self) -> String {
        self.workflow_ids
            .iter()
            .map(|id| format_workflow_id(*id))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Reproduction command line for the ticket's matrix workflows
    pub fn run_the_matrix_command(&self) -> String {
        let adjusted_memory = self
            .memory
            .saturating_sub(self.cpu_cores.saturating_sub(1) * 1500)
            .max(1000);
        let mut command = format!(
            "runTheMatrix.py -w \"{}\" -b \"{}\"",
            self.matrix, self.batch_name
        );
        if !self.label.is_empty() {
            command.push_str(&format!(" --label \"{}\"", self.label));
        }
        command.push_str(&format!(
            " -t {} -m {} -l {}",
            self.cpu_cores,
            adjusted_memory,
            self.workflow_id_list()
        ));
        if self.recycle_gs {
            command.push_str(" -i all");
        }
        if !self.command.is_empty() {
            command.push_str(&format!(" --command=\"{}\"", self.command));
        }
        command.push_str(" --noCaf --wm force");
        command
    }
}

/// `11634.0` → `11634`, `11634.911` → `11634.911`
pub fn format_workflow_id(id: f64) -> String {
    if id.fract() == 0.0 {
        format!("{}", id as i64)
    } else {
        format!("{id}")
    }
}

impl WithHistory for Ticket {
    fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    fn history_mut(&mut self) -> &mut Vec<HistoryEntry> {
        &mut self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_prefix_strips_release_path() {
        let ticket = Ticket::new("cms/CMSSW_14_0_0", "fullsim");
        assert_eq!(ticket.identity_prefix(), "CMSSW_14_0_0__fullsim");
    }

    #[test]
    fn test_run_the_matrix_command() {
        let mut ticket = Ticket::new("CMSSW_14_0_0", "fullsim");
        ticket.workflow_ids = vec![11634.0, 11634.911];
        ticket.cpu_cores = 4;
        ticket.memory = 8000;
        ticket.label = "RecoOnly".to_string();
        ticket.recycle_gs = true;

        assert_eq!(
            ticket.run_the_matrix_command(),
            "runTheMatrix.py -w \"standard\" -b \"fullsim\" --label \"RecoOnly\" \
             -t 4 -m 3500 -l 11634,11634.911 -i all --noCaf --wm force"
        );
    }

    #[test]
    fn test_adjusted_memory_never_below_minimum() {
        let mut ticket = Ticket::new("CMSSW_14_0_0", "b");
        ticket.cpu_cores = 16;
        ticket.memory = 2000;
        ticket.workflow_ids = vec![1.0];
        assert!(ticket.run_the_matrix_command().contains("-m 1000"));
    }
}
