//! # Configuration Generation Script
//!
//! Turns the ordered steps of a work item into one bash script that prepares the
//! software environment and runs the processing command of every step with its
//! input and output wired to its neighbours.
//!
//! ## Layout
//!
//! - consecutive steps that share `(release, scram arch)` share one environment
//!   setup block
//! - a custom fragment of the first step is written into the release source tree
//!   and compiled before the first command
//! - an input step with lumisections emits a lumi range file and a file list
//!   query; otherwise later steps read `dbs:<dataset>` directly
//! - every processing command ends with `|| exit $?`

use crate::error::Result;
use crate::models::{Step, StepInput, StepPayload, WorkItem};

const CMSSET_DEFAULT: &str = "/cvmfs/cms.cern.ch/cmsset_default.sh";
const FRAGMENT_DIRECTORY: &str = "Configuration/GenProduction/python";

/// Commands that create (if needed) and enter the runtime environment of a release
pub fn environment_setup(release: &str, scram_arch: &str) -> Vec<String> {
    vec![
        format!("export SCRAM_ARCH={scram_arch}"),
        format!("source {CMSSET_DEFAULT}"),
        format!("if [ -r {release}/src ] ; then"),
        format!("  echo {release} already exist"),
        "else".to_string(),
        format!("  scram p CMSSW {release}"),
        "fi".to_string(),
        format!("cd {release}/src"),
        "CMSSW_SRC=$(pwd)".to_string(),
        "eval `scram runtime -sh`".to_string(),
        "cd ../..".to_string(),
    ]
}

/// Wrap `commands` so they run inside the environment of `release`
pub fn run_in_environment(commands: &[String], release: &str, scram_arch: &str) -> String {
    let mut script = vec!["#!/bin/bash".to_string(), String::new()];
    script.extend(environment_setup(release, scram_arch));
    script.push(String::new());
    script.extend(commands.iter().cloned());
    script.join("\n") + "\n"
}

/// Python file name of the fragment written for the first step
pub fn fragment_file_name(item: &WorkItem) -> String {
    format!("{}_fragment.py", item.prepid.replace('-', "_"))
}

/// Full configuration generation script of a work item
pub fn generation_script(item: &WorkItem) -> Result<String> {
    let mut lines = vec![
        "#!/bin/bash".to_string(),
        String::new(),
        format!("# Configuration generation for {}", item.prepid),
    ];
    let mut current_environment: Option<(String, String)> = None;

    for (index, step) in item.steps.iter().enumerate() {
        let release = item.step_release(index).to_string();
        let scram_arch = item.step_scram_arch(index).to_string();

        if step.is_input() {
            // Input steps run nothing but may need the next step's environment
            continue;
        }

        let environment = (release.clone(), scram_arch.clone());
        if current_environment.as_ref() != Some(&environment) {
            lines.push(String::new());
            lines.push(format!("# Environment {release} {scram_arch}"));
            lines.extend(environment_setup(&release, &scram_arch));
            current_environment = Some(environment);
        }

        if index == 0 && !step.fragment.trim().is_empty() {
            lines.push(String::new());
            lines.extend(fragment_block(item, step));
        }

        lines.push(String::new());
        lines.push(format!("# Step {}: {}", index + 1, step.name));
        lines.extend(step_commands(item, index)?);
    }

    Ok(lines.join("\n") + "\n")
}

fn fragment_block(item: &WorkItem, step: &Step) -> Vec<String> {
    let directory = format!("$CMSSW_SRC/{FRAGMENT_DIRECTORY}");
    vec![
        format!("# Custom fragment of {}", item.prepid),
        format!("mkdir -p {directory}"),
        format!(
            "cat > {directory}/{} << 'EndOfFragment'",
            fragment_file_name(item)
        ),
        step.fragment.trim_end().to_string(),
        "EndOfFragment".to_string(),
        "cd $CMSSW_SRC".to_string(),
        "scram b".to_string(),
        "cd ../..".to_string(),
    ]
}

/// Commands of one processing step, including any input preparation
fn step_commands(item: &WorkItem, index: usize) -> Result<Vec<String>> {
    let step = &item.steps[index];
    let StepPayload::Driver(args) = &step.payload else {
        return Ok(Vec::new());
    };
    let mut commands = Vec::new();
    let mut driver = args.clone();
    driver.conditions = step.globaltag().to_string();

    let first_argument = if index == 0 && !step.fragment.trim().is_empty() {
        format!("{FRAGMENT_DIRECTORY}/{}", fragment_file_name(item))
    } else if !driver.fragment_name.is_empty() {
        driver.fragment_name.clone()
    } else {
        format!("step{}", index + 1)
    };

    let mut arguments = vec![format!("cmsDriver.py {first_argument}")];
    if let Some(config_name) = item.config_file_name(index) {
        arguments.push(format!("--python_filename {config_name}.py"));
    }
    arguments.push("--no_exec".to_string());

    if let Some(content) = driver.eventcontent.first() {
        arguments.push(format!(
            "--fileout {}",
            Step::output_file_name(index, 0, content)
        ));
    }

    match item.input_for_step(index)? {
        StepInput::None => {}
        StepInput::Dataset { step_index } => {
            if let Some(input) = item.steps[step_index].input_descriptor() {
                if input.has_lumisections() {
                    let lumi_file = format!("step{}_lumi_ranges.txt", step_index + 1);
                    let file_list = format!("step{}_files.txt", step_index + 1);
                    let lumis = serde_json::to_string(&input.lumisection)?;
                    let runs: Vec<&String> = input.lumisection.keys().collect();
                    let runs = runs
                        .iter()
                        .map(|run| run.as_str())
                        .collect::<Vec<_>>()
                        .join(",");
                    commands.push(format!("# Lumisections of {}", input.dataset));
                    commands.push(format!("echo '{lumis}' > {lumi_file}"));
                    commands.push(format!(
                        "dasgoclient --limit 0 --query \"file dataset={} run in [{runs}]\" > {file_list} || exit $?",
                        input.dataset
                    ));
                    arguments.push(format!("--filein filelist:{file_list}"));
                    arguments.push(format!("--lumiToProcess {lumi_file}"));
                } else {
                    arguments.push(format!("--filein \"dbs:{}\"", input.dataset));
                }
            }
        }
        other => {
            if let Some(file_name) = other.file_name() {
                arguments.push(format!("--filein {file_name}"));
            }
        }
    }

    arguments.extend(driver.options());
    commands.push(format!("{} || exit $?", arguments.join(" ")));
    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DriverArgs, InputDescriptor};
    use std::collections::BTreeMap;

    fn driver(name: &str, steps: &[&str], contents: &[&str]) -> Step {
        Step::driver(
            name,
            DriverArgs {
                step: steps.iter().map(|s| s.to_string()).collect(),
                eventcontent: contents.iter().map(|s| s.to_string()).collect(),
                datatier: contents.iter().map(|s| s.to_string()).collect(),
                conditions: "auto:phase1_2024_realistic".to_string(),
                ..Default::default()
            },
        )
    }

    fn item(steps: Vec<Step>) -> WorkItem {
        let mut item = WorkItem::new("CMSSW_14_0_0", "fullsim", steps);
        item.prepid = "CMSSW_14_0_0__fullsim-ZMM-00001".to_string();
        item.scram_arch = "el8_amd64_gcc12".to_string();
        item
    }

    #[test]
    fn test_shared_environment_block_for_same_release() {
        let mut work_item = item(vec![
            driver("GenSim", &["GEN", "SIM"], &["FEVTDEBUG"]),
            driver("Digi", &["DIGI", "L1", "DIGI2RAW", "HLT"], &["FEVTDEBUGHLT"]),
            driver("Reco", &["RAW2DIGI", "RECO", "DQM"], &["RECOSIM", "DQM"]),
        ]);
        work_item.steps[2].cmssw_release = "CMSSW_14_0_1".to_string();
        work_item.steps[0].resolved_globaltag = "140X_mcRun3_v1".to_string();

        let script = generation_script(&work_item).unwrap();
        assert_eq!(script.matches("scram p CMSSW CMSSW_14_0_0").count(), 1);
        assert_eq!(script.matches("scram p CMSSW CMSSW_14_0_1").count(), 1);
        assert!(script.contains("--fileout file:step1.root"));
        assert!(script.contains("--filein file:step1.root"));
        assert!(script.contains("--filein file:step2.root"));
        assert!(script.contains("--conditions 140X_mcRun3_v1"));
        assert!(script.contains("--python_filename CMSSW_14_0_0__fullsim-ZMM-00001_2_cfg.py"));
        for line in script.lines().filter(|l| l.starts_with("cmsDriver.py")) {
            assert!(line.ends_with("|| exit $?"), "{line}");
        }
    }

    #[test]
    fn test_dataset_input_without_lumis_reads_dbs() {
        let work_item = item(vec![
            Step::input(
                "ZMM",
                InputDescriptor::for_dataset("/RelValZMM/CMSSW_14_0_0-v1/GEN-SIM"),
            ),
            driver("Digi", &["DIGI", "HLT"], &["FEVTDEBUGHLT"]),
        ]);
        let script = generation_script(&work_item).unwrap();
        assert!(script.contains("--filein \"dbs:/RelValZMM/CMSSW_14_0_0-v1/GEN-SIM\""));
        assert!(!script.contains("dasgoclient"));
    }

    #[test]
    fn test_dataset_input_with_lumis_builds_file_list() {
        let mut input = InputDescriptor::for_dataset("/MinimumBias/Run2024B-v1/RAW");
        input.lumisection = BTreeMap::from([("379456".to_string(), vec![[1, 10]])]);
        let work_item = item(vec![
            Step::input("RunMinBias", input),
            driver("Reco", &["RAW2DIGI", "RECO"], &["RECO"]),
        ]);

        let script = generation_script(&work_item).unwrap();
        assert!(script.contains("echo '{\"379456\":[[1,10]]}' > step1_lumi_ranges.txt"));
        assert!(script.contains("run in [379456]"));
        assert!(script.contains("--filein filelist:step1_files.txt --lumiToProcess step1_lumi_ranges.txt"));
    }

    #[test]
    fn test_fragment_written_and_compiled_before_first_command() {
        let mut first = driver("GenSim", &["GEN", "SIM"], &["FEVTDEBUG"]);
        first.fragment = "import FWCore.ParameterSet.Config as cms\n".to_string();
        let work_item = item(vec![first]);

        let script = generation_script(&work_item).unwrap();
        let fragment_at = script.find("EndOfFragment").unwrap();
        let build_at = script.find("scram b").unwrap();
        let command_at = script.find("cmsDriver.py").unwrap();
        assert!(fragment_at < build_at && build_at < command_at);
        assert!(script.contains(
            "cmsDriver.py Configuration/GenProduction/python/CMSSW_14_0_0__fullsim_ZMM_00001_fragment.py"
        ));
    }

    #[test]
    fn test_run_in_environment_wraps_commands() {
        let script = run_in_environment(&["echo hi".to_string()], "CMSSW_14_0_0", "el8_amd64_gcc12");
        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("export SCRAM_ARCH=el8_amd64_gcc12"));
        assert!(script.trim_end().ends_with("echo hi"));
    }
}
