//! Configuration upload script and uploader output parsing

use crate::config::BatchServiceConfig;
use crate::error::{RelvalError, Result};
use crate::models::WorkItem;

use super::command_generator::environment_setup;

/// Helper uploaded next to the scripts and invoked once per artifact
pub const UPLOADER_FILE_NAME: &str = "config_uploader.py";

/// Marker of uploader output lines that carry `<name> <hash>`
const DOC_ID_MARKER: &str = "DocID";

/// Script that checks every generated artifact and uploads it to the config cache
pub fn upload_script(item: &WorkItem, batch_service: &BatchServiceConfig) -> String {
    let mut lines = vec![
        "#!/bin/bash".to_string(),
        String::new(),
        format!("# Configuration upload for {}", item.prepid),
    ];
    lines.extend(environment_setup(&item.cmssw_release, &item.scram_arch));
    lines.push(String::new());

    for index in 0..item.steps.len() {
        let Some(config_name) = item.config_file_name(index) else {
            continue;
        };
        let file = format!("{config_name}.py");
        lines.push(format!(
            "if [ ! -s \"{file}\" ]; then echo \"File {file} is missing or empty\" >&2; exit 1; fi"
        ));
        lines.push(format!(
            "python3 {UPLOADER_FILE_NAME} --file $(pwd)/{file} --label {config_name} \
             --group {} --user $(echo $USER) --db {} || exit $?",
            batch_service.group, batch_service.config_cache_url
        ));
    }

    lines.join("\n") + "\n"
}

/// `(config name, hash)` pairs from uploader output, in output order
pub fn parse_doc_ids(stdout: &str) -> Vec<(String, String)> {
    stdout
        .lines()
        .filter(|line| line.contains(DOC_ID_MARKER))
        .filter_map(|line| {
            let mut parts = line.split_whitespace().skip(1);
            let name = parts.next()?;
            let hash = parts.next()?;
            Some((name.to_string(), hash.to_string()))
        })
        .collect()
}

/// Assign uploaded hashes to steps by configuration name.
///
/// Every step with a configuration must receive exactly one hash and every
/// reported hash must be consumed.
pub fn assign_config_hashes(item: &mut WorkItem, hashes: Vec<(String, String)>) -> Result<()> {
    let mut remaining = hashes;
    for index in 0..item.steps.len() {
        let Some(config_name) = item.config_file_name(index) else {
            continue;
        };
        let position = remaining
            .iter()
            .position(|(name, _)| *name == config_name)
            .ok_or_else(|| {
                RelvalError::RemoteExecution(format!(
                    "Could not find hash for {}",
                    item.steps[index].name
                ))
            })?;
        let (_, hash) = remaining.remove(position);
        item.steps[index].config_id = hash;
    }

    if !remaining.is_empty() {
        let unused: Vec<String> = remaining
            .iter()
            .map(|(name, hash)| format!("{name} {hash}"))
            .collect();
        return Err(RelvalError::RemoteExecution(format!(
            "Unused hashes: {}",
            unused.join(", ")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DriverArgs, InputDescriptor, Step};

    fn item() -> WorkItem {
        let mut item = WorkItem::new(
            "CMSSW_14_0_0",
            "fullsim",
            vec![
                Step::input("ZMM", InputDescriptor::for_dataset("/RelValZMM/X-v1/GEN-SIM")),
                Step::driver("Digi", DriverArgs::default()),
                Step::driver("Reco", DriverArgs::default()),
            ],
        );
        item.prepid = "CMSSW_14_0_0__fullsim-ZMM-00001".to_string();
        item
    }

    #[test]
    fn test_upload_script_checks_only_generated_configs() {
        let script = upload_script(&item(), &BatchServiceConfig::default());
        assert_eq!(script.matches("if [ ! -s").count(), 2);
        assert!(script.contains("CMSSW_14_0_0__fullsim-ZMM-00001_1_cfg.py"));
        assert!(script.contains("CMSSW_14_0_0__fullsim-ZMM-00001_2_cfg.py"));
        assert!(!script.contains("_0_cfg"));
    }

    #[test]
    fn test_parse_doc_ids_ignores_other_lines() {
        let stdout = "Uploading...\nDocID a_1_cfg abc123\nnoise\nDocID b_2_cfg def456\n";
        assert_eq!(
            parse_doc_ids(stdout),
            vec![
                ("a_1_cfg".to_string(), "abc123".to_string()),
                ("b_2_cfg".to_string(), "def456".to_string()),
            ]
        );
    }

    #[test]
    fn test_assign_hashes_by_name() {
        let mut item = item();
        let hashes = vec![
            ("CMSSW_14_0_0__fullsim-ZMM-00001_2_cfg".to_string(), "h2".to_string()),
            ("CMSSW_14_0_0__fullsim-ZMM-00001_1_cfg".to_string(), "h1".to_string()),
        ];
        assign_config_hashes(&mut item, hashes).unwrap();
        assert_eq!(item.steps[0].config_id, "");
        assert_eq!(item.steps[1].config_id, "h1");
        assert_eq!(item.steps[2].config_id, "h2");
    }

    #[test]
    fn test_missing_hash_names_the_step() {
        let mut item = item();
        let hashes = vec![("CMSSW_14_0_0__fullsim-ZMM-00001_1_cfg".to_string(), "h1".to_string())];
        let err = assign_config_hashes(&mut item, hashes).unwrap_err();
        assert!(err.to_string().contains("Could not find hash for Reco"));
    }

    #[test]
    fn test_unused_hash_is_an_error() {
        let mut item = item();
        let hashes = vec![
            ("CMSSW_14_0_0__fullsim-ZMM-00001_1_cfg".to_string(), "h1".to_string()),
            ("CMSSW_14_0_0__fullsim-ZMM-00001_2_cfg".to_string(), "h2".to_string()),
            ("stray_cfg".to_string(), "h3".to_string()),
        ];
        let err = assign_config_hashes(&mut item, hashes).unwrap_err();
        assert!(err.to_string().contains("Unused hashes: stray_cfg h3"));
    }
}
