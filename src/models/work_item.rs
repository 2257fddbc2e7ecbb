//! # Work Item Model
//!
//! A work item (RelVal) is one release-validation unit made of ordered steps. It
//! owns its steps; step-level questions that need siblings or inherited values are
//! answered here, addressed by step index.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::history::{HistoryEntry, WithHistory};
use super::step::{InputDescriptor, Step, StepPayload};
use super::workflow::WorkflowSummary;
use crate::error::{RelvalError, Result};
use crate::state_machine::WorkItemStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub prepid: String,
    pub batch_name: String,
    pub cmssw_release: String,
    #[serde(default)]
    pub scram_arch: String,
    #[serde(default = "default_cpu_cores")]
    pub cpu_cores: u32,
    /// Memory in MB
    #[serde(default = "default_memory")]
    pub memory: u32,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub matrix: String,
    #[serde(default)]
    pub sample_tag: String,
    #[serde(default)]
    pub workflow_id: f64,
    #[serde(default)]
    pub workflow_name: String,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub status: WorkItemStatus,
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Workflows reported by the tracking service, oldest first
    #[serde(default)]
    pub workflows: Vec<WorkflowSummary>,
    #[serde(default)]
    pub output_datasets: Vec<String>,
    /// Campaign timestamp shared with sibling submissions, 0 when not submitted
    #[serde(default)]
    pub campaign_timestamp: i64,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

fn default_cpu_cores() -> u32 {
    8
}

fn default_memory() -> u32 {
    16000
}

/// Where a step reads its input from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepInput {
    /// The step reads nothing (generator steps)
    None,
    /// The step reads the dataset of the input step at `step_index`
    Dataset { step_index: usize },
    /// The step reads one output of the processing step at `step_index`
    StepOutput {
        step_index: usize,
        content_index: usize,
        content: String,
    },
}

impl StepInput {
    /// `--filein` argument for step outputs
    pub fn file_name(&self) -> Option<String> {
        match self {
            StepInput::StepOutput {
                step_index,
                content_index,
                content,
            } => Some(Step::output_file_name(*step_index, *content_index, content)),
            _ => None,
        }
    }
}

impl WorkItem {
    /// Skeleton work item with inherited defaults; identity is assigned on creation
    pub fn new(
        cmssw_release: impl Into<String>,
        batch_name: impl Into<String>,
        steps: Vec<Step>,
    ) -> Self {
        Self {
            prepid: String::new(),
            batch_name: batch_name.into(),
            cmssw_release: cmssw_release.into(),
            scram_arch: String::new(),
            cpu_cores: default_cpu_cores(),
            memory: default_memory(),
            label: String::new(),
            matrix: String::new(),
            sample_tag: String::new(),
            workflow_id: 0.0,
            workflow_name: String::new(),
            priority: 0,
            status: WorkItemStatus::New,
            steps,
            workflows: Vec::new(),
            output_datasets: Vec::new(),
            campaign_timestamp: 0,
            notes: String::new(),
            history: Vec::new(),
        }
    }

    /// Explicit workflow name, else the first step's short name
    pub fn name(&self) -> String {
        if !self.workflow_name.trim().is_empty() {
            return self.workflow_name.trim().to_string();
        }
        self.steps
            .first()
            .map(Step::short_name)
            .unwrap_or_default()
    }

    /// Identity prefix shared by all serials of this release, batch and name
    pub fn identity_prefix(&self) -> String {
        format!("{}__{}-{}", self.cmssw_release, self.batch_name, self.name())
    }

    /// Campaign label `{release}__{batch}-{timestamp}`
    pub fn campaign(&self) -> String {
        format!(
            "{}__{}-{}",
            self.cmssw_release, self.batch_name, self.campaign_timestamp
        )
    }

    pub fn step_release(&self, index: usize) -> &str {
        match self.steps.get(index) {
            Some(step) if !step.cmssw_release.is_empty() => &step.cmssw_release,
            _ => &self.cmssw_release,
        }
    }

    pub fn step_scram_arch(&self, index: usize) -> &str {
        match self.steps.get(index) {
            Some(step) if !step.scram_arch.is_empty() => &step.scram_arch,
            _ => &self.scram_arch,
        }
    }

    /// Name of the configuration artifact generated for a step, `None` for input steps
    pub fn config_file_name(&self, index: usize) -> Option<String> {
        let step = self.steps.get(index)?;
        if step.is_input() {
            return None;
        }
        Some(format!("{}_{}_cfg", self.prepid, index))
    }

    /// Processing string of the step at `index`: resolved tag plus label
    pub fn processing_string(&self, index: usize) -> String {
        let Some(step) = self.steps.get(index) else {
            return String::new();
        };
        if step.resolved_globaltag.is_empty() {
            return String::new();
        }
        if self.label.is_empty() {
            step.resolved_globaltag.clone()
        } else {
            format!("{}_{}", step.resolved_globaltag, self.label)
        }
    }

    /// The input file step, if any (only ever the first step)
    pub fn input_step(&self) -> Option<&InputDescriptor> {
        self.steps.first().and_then(Step::input_descriptor)
    }

    /// Data tiers declared by all processing steps
    pub fn output_datatiers(&self) -> BTreeSet<String> {
        self.steps
            .iter()
            .filter_map(Step::driver_args)
            .flat_map(|args| args.datatier.iter().cloned())
            .collect()
    }

    /// Every dataset the item reads: the input dataset and pileup inputs
    pub fn referenced_datasets(&self) -> Vec<String> {
        let mut datasets = Vec::new();
        for step in &self.steps {
            let dataset = match &step.payload {
                StepPayload::Input(input) => Some(input.dataset.trim()),
                StepPayload::Driver(args) => args.pileup_dataset(),
            };
            if let Some(dataset) = dataset.filter(|d| !d.is_empty()) {
                if !datasets.iter().any(|d: &String| d == dataset) {
                    datasets.push(dataset.to_string());
                }
            }
        }
        datasets
    }

    /// Resolve the input of the step at `index`.
    ///
    /// Harvesting and calibration-only predecessors are skipped. Harvesting steps
    /// need DQM content and calibration-only steps need RECO content; any other
    /// step takes the first non-DQM content of the nearest processing predecessor.
    pub fn input_for_step(&self, index: usize) -> Result<StepInput> {
        let step = self
            .steps
            .get(index)
            .ok_or_else(|| RelvalError::Validation(format!("{} has no step {index}", self.prepid)))?;
        if index == 0 || step.is_input() {
            return Ok(StepInput::None);
        }

        let required = if step.is_harvesting() {
            Some("DQM")
        } else if step.is_alca_only() {
            Some("RECO")
        } else {
            None
        };

        for candidate_index in (0..index).rev() {
            let candidate = &self.steps[candidate_index];
            let args = match &candidate.payload {
                StepPayload::Input(_) => {
                    return Ok(StepInput::Dataset {
                        step_index: candidate_index,
                    })
                }
                StepPayload::Driver(args) => args,
            };
            if args.is_harvesting() || args.is_alca_only() {
                continue;
            }

            let position = match required {
                Some("DQM") => args.eventcontent.iter().position(|c| c.contains("DQM")),
                Some(content) => args
                    .eventcontent
                    .iter()
                    .position(|c| c.contains(content)),
                None => args.eventcontent.iter().position(|c| !c.contains("DQM")),
            };
            if let Some(content_index) = position {
                return Ok(StepInput::StepOutput {
                    step_index: candidate_index,
                    content_index,
                    content: args.eventcontent[content_index].clone(),
                });
            }
        }

        Err(RelvalError::Validation(format!(
            "Could not find input for step {} ({}) of {}",
            index, step.name, self.prepid
        )))
    }

    /// Newest workflow known for this item
    pub fn last_workflow(&self) -> Option<&WorkflowSummary> {
        self.workflows.last()
    }

    /// Clear everything approval and submission derived
    pub fn clear_submission_data(&mut self, clear_resolved_globaltags: bool) {
        self.campaign_timestamp = 0;
        for step in &mut self.steps {
            step.config_id.clear();
            if clear_resolved_globaltags {
                step.resolved_globaltag.clear();
            }
        }
    }
}

impl WithHistory for WorkItem {
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
    use crate::models::step::DriverArgs;

    fn driver(steps: &[&str], contents: &[&str]) -> Step {
        Step::driver(
            steps.join(","),
            DriverArgs {
                step: steps.iter().map(|s| s.to_string()).collect(),
                eventcontent: contents.iter().map(|s| s.to_string()).collect(),
                datatier: contents.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
        )
    }

    fn full_chain() -> WorkItem {
        let mut item = WorkItem::new(
            "CMSSW_14_0_0",
            "fullsim",
            vec![
                Step::input(
                    "ZMM_14",
                    InputDescriptor::for_dataset("/RelValZMM_14/CMSSW_14_0_0-v1/GEN-SIM"),
                ),
                driver(&["DIGI", "L1", "DIGI2RAW", "HLT:@relval2024"], &["FEVTDEBUGHLT"]),
                driver(&["RAW2DIGI", "RECO", "DQM"], &["RECOSIM", "DQM"]),
                driver(&["ALCA:TkAlMinBias"], &["ALCARECO"]),
                driver(&["HARVESTING:@standardValidation"], &["DQM"]),
            ],
        );
        item.prepid = "CMSSW_14_0_0__fullsim-ZMM_14-00001".to_string();
        item
    }

    #[test]
    fn test_name_and_prefix() {
        let item = full_chain();
        assert_eq!(item.name(), "ZMM_14");
        assert_eq!(item.identity_prefix(), "CMSSW_14_0_0__fullsim-ZMM_14");

        let mut named = item.clone();
        named.workflow_name = "ZMuMu".to_string();
        assert_eq!(named.identity_prefix(), "CMSSW_14_0_0__fullsim-ZMuMu");
    }

    #[test]
    fn test_input_resolution_follows_content_rules() {
        let item = full_chain();
        assert_eq!(item.input_for_step(0).unwrap(), StepInput::None);
        assert_eq!(
            item.input_for_step(1).unwrap(),
            StepInput::Dataset { step_index: 0 }
        );
        assert_eq!(
            item.input_for_step(2).unwrap().file_name().unwrap(),
            "file:step2.root"
        );
        // Calibration reads RECO content of the reconstruction step
        assert_eq!(
            item.input_for_step(3).unwrap(),
            StepInput::StepOutput {
                step_index: 2,
                content_index: 0,
                content: "RECOSIM".to_string()
            }
        );
        // Harvesting skips the calibration step and reads the DQM output
        assert_eq!(
            item.input_for_step(4).unwrap().file_name().unwrap(),
            "file:step3_inDQM.root"
        );
    }

    #[test]
    fn test_missing_required_content_is_an_error() {
        let item = WorkItem::new(
            "CMSSW_14_0_0",
            "batch",
            vec![
                driver(&["GEN", "SIM"], &["RAWSIM"]),
                driver(&["HARVESTING:@standardValidation"], &["DQM"]),
            ],
        );
        assert!(item.input_for_step(1).is_err());
    }

    #[test]
    fn test_config_file_names_skip_input_steps() {
        let item = full_chain();
        assert_eq!(item.config_file_name(0), None);
        assert_eq!(
            item.config_file_name(2).unwrap(),
            "CMSSW_14_0_0__fullsim-ZMM_14-00001_2_cfg"
        );
    }

    #[test]
    fn test_step_release_inherits_from_item() {
        let mut item = full_chain();
        item.scram_arch = "el8_amd64_gcc12".to_string();
        item.steps[2].cmssw_release = "CMSSW_14_0_1".to_string();
        assert_eq!(item.step_release(1), "CMSSW_14_0_0");
        assert_eq!(item.step_release(2), "CMSSW_14_0_1");
        assert_eq!(item.step_scram_arch(2), "el8_amd64_gcc12");
    }

    #[test]
    fn test_referenced_datasets_include_pileup() {
        let mut item = full_chain();
        if let Some(args) = item.steps[1].driver_args_mut() {
            args.pileup_input = "dbs:/RelValMinBias/CMSSW_14_0_0-v1/GEN-SIM".to_string();
        }
        assert_eq!(
            item.referenced_datasets(),
            vec![
                "/RelValZMM_14/CMSSW_14_0_0-v1/GEN-SIM".to_string(),
                "/RelValMinBias/CMSSW_14_0_0-v1/GEN-SIM".to_string()
            ]
        );
    }

    #[test]
    fn test_processing_string_appends_label() {
        let mut item = full_chain();
        item.steps[1].resolved_globaltag = "140X_mcRun3_2024_realistic_v3".to_string();
        assert_eq!(item.processing_string(1), "140X_mcRun3_2024_realistic_v3");
        item.label = "PU".to_string();
        assert_eq!(item.processing_string(1), "140X_mcRun3_2024_realistic_v3_PU");
        assert_eq!(item.processing_string(2), "");
    }
}
