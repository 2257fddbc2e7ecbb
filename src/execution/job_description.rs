//! # Job Description
//!
//! Builds the task-chain request submitted to the batch service. Every processing
//! step except harvesting becomes one `TaskN` entry; a harvesting step turns on
//! harvesting for the whole request instead. Input steps produce no task: the
//! task that reads them gets `InputDataset` (plus lumi and run masks).

use serde_json::{json, Map, Value};

use crate::config::BatchServiceConfig;
use crate::error::{RelvalError, Result};
use crate::models::{GpuRequirement, Step, StepInput, StepPayload, WorkItem};

const DQM_UPLOAD_URL: &str = "https://cmsweb.cern.ch/dqm/relval";
const SIZE_PER_EVENT: u64 = 1234;
const TIME_PER_EVENT: u64 = 10;

fn gpu_requirement(requirement: GpuRequirement) -> &'static str {
    match requirement {
        GpuRequirement::Forbidden => "forbidden",
        GpuRequirement::Optional => "optional",
        GpuRequirement::Required => "required",
    }
}

/// Request string shown by the batch service, e.g. `RV1400ZMM`
pub fn request_string(item: &WorkItem) -> String {
    let release = item
        .cmssw_release
        .trim_start_matches("CMSSW_")
        .replace('_', "");
    format!("RV{release}{}", item.name())
}

fn number_or_none(value: &str) -> Option<u64> {
    value.trim().parse().ok()
}

/// Task dictionary of the processing step at `index`
fn task_description(item: &WorkItem, index: usize, step: &Step) -> Result<Map<String, Value>> {
    let StepPayload::Driver(args) = &step.payload else {
        return Err(RelvalError::Validation(format!(
            "Step {} of {} is not a processing step",
            step.name, item.prepid
        )));
    };

    let mut task = Map::new();
    task.insert("TaskName".into(), json!(step.name));
    task.insert("ConfigCacheID".into(), json!(step.config_id));
    task.insert("GlobalTag".into(), json!(step.globaltag()));
    task.insert("CMSSWVersion".into(), json!(item.step_release(index)));
    task.insert("ScramArch".into(), json!([item.step_scram_arch(index)]));
    task.insert("AcquisitionEra".into(), json!(item.step_release(index)));
    task.insert("ProcessingString".into(), json!(item.processing_string(index)));
    task.insert("Campaign".into(), json!(item.campaign()));
    task.insert("KeepOutput".into(), json!(step.keep_output));
    task.insert("Multicore".into(), json!(item.cpu_cores));
    task.insert("Memory".into(), json!(item.memory));
    if args.n_streams > 0 {
        task.insert("EventStreams".into(), json!(args.n_streams));
    }
    if let Some(lumis) = number_or_none(&step.lumis_per_job) {
        task.insert("LumisPerJob".into(), json!(lumis));
    }
    if let Some(events) = number_or_none(&step.events_per_lumi) {
        task.insert("EventsPerLumi".into(), json!(events));
    }

    task.insert("RequiresGPU".into(), json!(gpu_requirement(step.gpu.requires)));
    if step.gpu.is_requested() {
        task.insert(
            "GPUParams".into(),
            json!(serde_json::to_string(&step.gpu.to_batch_params())?),
        );
    }

    match item.input_for_step(index)? {
        StepInput::None => {
            task.insert("SplittingAlgo".into(), json!("EventBased"));
            task.insert("Seeding".into(), json!("AutomaticSeeding"));
            task.insert("PrimaryDataset".into(), json!(format!("RelVal{}", item.name())));
            if let Some((events, per_job)) = args.relval_events() {
                task.insert("RequestNumEvents".into(), json!(events));
                task.insert("EventsPerJob".into(), json!(per_job));
            }
        }
        StepInput::Dataset { step_index } => {
            let input = item.steps[step_index]
                .input_descriptor()
                .ok_or_else(|| RelvalError::Validation(format!("{} has no input step", item.prepid)))?;
            task.insert("InputDataset".into(), json!(input.dataset));
            task.insert("SplittingAlgo".into(), json!("LumiBased"));
            if input.has_lumisections() {
                task.insert("LumiList".into(), serde_json::to_value(&input.lumisection)?);
            }
            if !input.run.is_empty() {
                task.insert("RunWhitelist".into(), json!(input.run));
            }
            if input.events > 0 {
                task.insert("RequestNumEvents".into(), json!(input.events));
            }
        }
        StepInput::StepOutput {
            step_index,
            content,
            ..
        } => {
            task.insert("InputTask".into(), json!(item.steps[step_index].name));
            task.insert("InputFromOutputModule".into(), json!(format!("{content}output")));
            task.insert("SplittingAlgo".into(), json!("EventAwareLumiBased"));
        }
    }

    Ok(task)
}

/// Complete request for a work item whose steps all carry uploaded configurations
pub fn job_description(item: &WorkItem, batch_service: &BatchServiceConfig) -> Result<Value> {
    let mut job = Map::new();
    let first_processing = item
        .steps
        .iter()
        .position(|step| !step.is_input())
        .ok_or_else(|| {
            RelvalError::Validation(format!("{} has no processing steps", item.prepid))
        })?;

    job.insert("RequestType".into(), json!("TaskChain"));
    job.insert("SubRequestType".into(), json!("RelVal"));
    job.insert("RequestString".into(), json!(request_string(item)));
    job.insert("PrepID".into(), json!(item.prepid));
    job.insert("Campaign".into(), json!(item.campaign()));
    job.insert("CMSSWVersion".into(), json!(item.cmssw_release));
    job.insert("ScramArch".into(), json!([item.scram_arch]));
    job.insert(
        "GlobalTag".into(),
        json!(item.steps[first_processing].globaltag()),
    );
    job.insert("Group".into(), json!(batch_service.group));
    job.insert("Requestor".into(), json!(batch_service.requestor));
    job.insert("ConfigCacheUrl".into(), json!(batch_service.config_cache_url));
    job.insert("DbsUrl".into(), json!(batch_service.dbs_url));
    job.insert("Memory".into(), json!(item.memory));
    job.insert("Multicore".into(), json!(item.cpu_cores));
    job.insert("RequestPriority".into(), json!(item.priority));
    job.insert("SizePerEvent".into(), json!(SIZE_PER_EVENT));
    job.insert("TimePerEvent".into(), json!(TIME_PER_EVENT));
    job.insert("ProcessingVersion".into(), json!(1));

    let mut task_number = 0;
    for (index, step) in item.steps.iter().enumerate() {
        if step.is_input() {
            continue;
        }
        if step.is_harvesting() {
            job.insert("EnableHarvesting".into(), json!(true));
            job.insert("DQMUploadUrl".into(), json!(DQM_UPLOAD_URL));
            job.insert("DQMConfigCacheID".into(), json!(step.config_id));
            continue;
        }
        task_number += 1;
        let task = task_description(item, index, step)?;
        job.insert(format!("Task{task_number}"), Value::Object(task));
    }
    job.insert("TaskChain".into(), json!(task_number));

    Ok(Value::Object(job))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DriverArgs, GpuParams, InputDescriptor};
    use std::collections::BTreeMap;

    fn driver(name: &str, steps: &[&str], contents: &[&str]) -> Step {
        let mut step = Step::driver(
            name,
            DriverArgs {
                step: steps.iter().map(|s| s.to_string()).collect(),
                eventcontent: contents.iter().map(|s| s.to_string()).collect(),
                datatier: contents.iter().map(|s| s.to_string()).collect(),
                relval: "9000,100".to_string(),
                ..Default::default()
            },
        );
        step.resolved_globaltag = "140X_mcRun3_v1".to_string();
        step.config_id = format!("hash-{name}");
        step
    }

    fn item(steps: Vec<Step>) -> WorkItem {
        let mut item = WorkItem::new("CMSSW_14_0_0", "fullsim", steps);
        item.prepid = "CMSSW_14_0_0__fullsim-ZMM-00001".to_string();
        item.scram_arch = "el8_amd64_gcc12".to_string();
        item.workflow_name = "ZMM".to_string();
        item.campaign_timestamp = 1700000000;
        item.priority = 450000;
        item
    }

    #[test]
    fn test_generator_chain_with_harvesting() {
        let work_item = item(vec![
            driver("GenSim", &["GEN", "SIM"], &["FEVTDEBUG"]),
            driver("Reco", &["RAW2DIGI", "RECO", "DQM"], &["RECOSIM", "DQM"]),
            driver("Harvest", &["HARVESTING"], &[]),
        ]);
        let job = job_description(&work_item, &BatchServiceConfig::default()).unwrap();

        assert_eq!(job["TaskChain"], 2);
        assert_eq!(job["RequestString"], "RV1400ZMM");
        assert_eq!(job["Campaign"], "CMSSW_14_0_0__fullsim-1700000000");
        assert_eq!(job["EnableHarvesting"], true);
        assert_eq!(job["DQMConfigCacheID"], "hash-Harvest");
        assert_eq!(job["Task1"]["RequestNumEvents"], 9000);
        assert_eq!(job["Task1"]["EventsPerJob"], 100);
        assert_eq!(job["Task1"]["PrimaryDataset"], "RelValZMM");
        assert_eq!(job["Task2"]["InputTask"], "GenSim");
        assert_eq!(job["Task2"]["InputFromOutputModule"], "FEVTDEBUGoutput");
        assert!(job.get("Task3").is_none());
    }

    #[test]
    fn test_input_dataset_task_carries_masks() {
        let mut input = InputDescriptor::for_dataset("/MinimumBias/Run2024B-v1/RAW");
        input.lumisection = BTreeMap::from([("379456".to_string(), vec![[1, 10]])]);
        input.run = vec![379456];
        let work_item = item(vec![
            Step::input("RunMinBias", input),
            driver("Reco", &["RAW2DIGI", "RECO"], &["RECO"]),
        ]);
        let job = job_description(&work_item, &BatchServiceConfig::default()).unwrap();

        assert_eq!(job["TaskChain"], 1);
        assert_eq!(job["Task1"]["InputDataset"], "/MinimumBias/Run2024B-v1/RAW");
        assert_eq!(job["Task1"]["LumiList"]["379456"][0][1], 10);
        assert_eq!(job["Task1"]["RunWhitelist"][0], 379456);
        assert_eq!(job["Task1"]["SplittingAlgo"], "LumiBased");
    }

    #[test]
    fn test_gpu_parameters_are_forwarded() {
        let mut step = driver("GenSim", &["GEN", "SIM"], &["FEVTDEBUG"]);
        step.gpu = GpuParams {
            requires: GpuRequirement::Optional,
            gpu_memory: "8000".to_string(),
            cuda_capabilities: vec!["7.5".to_string()],
            cuda_runtime: "12.0".to_string(),
            ..Default::default()
        };
        let job = job_description(&item(vec![step]), &BatchServiceConfig::default()).unwrap();
        assert_eq!(job["Task1"]["RequiresGPU"], "optional");
        let params: Value =
            serde_json::from_str(job["Task1"]["GPUParams"].as_str().unwrap()).unwrap();
        assert_eq!(params["GPUMemoryMB"], 8000);
    }

    #[test]
    fn test_item_without_processing_steps_is_rejected() {
        let work_item = item(vec![Step::input(
            "ZMM",
            InputDescriptor::for_dataset("/RelValZMM/X-v1/GEN-SIM"),
        )]);
        assert!(job_description(&work_item, &BatchServiceConfig::default()).is_err());
    }
}
