//! Remote matrix enumeration for ticket fan-out
//!
//! Runs the matrix helper inside the ticket's release environment and reads back
//! the JSON file it writes: workflow id → `{workflow_name, steps}`.

use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::command_generator::run_in_environment;
use crate::client::{EnumeratedWorkflows, RemoteExecutor, RemoteSession, WorkflowEnumerator};
use crate::config::RemoteConfig;
use crate::error::{RelvalError, Result};
use crate::models::Ticket;

const MATRIX_FILE_NAME: &str = "run_the_matrix_pdmv.py";
const PROXY_COMMANDS: [&str; 2] = [
    "voms-proxy-init -voms cms --valid 4:00 --out $(pwd)/proxy.txt",
    "export X509_USER_PROXY=$(pwd)/proxy.txt",
];

pub struct RemoteMatrixEnumerator {
    executor: Arc<dyn RemoteExecutor>,
    remote: RemoteConfig,
}

impl std::fmt::Debug for RemoteMatrixEnumerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteMatrixEnumerator")
            .field("host", &self.remote.host)
            .finish()
    }
}

impl RemoteMatrixEnumerator {
    pub fn new(executor: Arc<dyn RemoteExecutor>, remote: RemoteConfig) -> Self {
        Self { executor, remote }
    }

    async fn run(&self, session: &dyn RemoteSession, ticket: &Ticket) -> Result<EnumeratedWorkflows> {
        let directory = self.remote.workspace_for(&ticket.prepid);
        let output_file = format!("{}.json", ticket.prepid);

        let prepared = session
            .execute(&[format!("rm -rf {directory}"), format!("mkdir -p {directory}")])
            .await?;
        if !prepared.success() {
            return Err(RelvalError::RemoteExecution(format!(
                "Error code {} preparing workspace: {}",
                prepared.exit_code,
                prepared.stderr.trim()
            )));
        }
        session
            .upload_file(
                Path::new(&self.remote.matrix_script),
                &format!("{directory}/{MATRIX_FILE_NAME}"),
            )
            .await?;

        let mut commands = vec![format!("cd {directory}")];
        commands.extend(PROXY_COMMANDS.iter().map(|c| c.to_string()));
        commands.push(matrix_command(ticket, &output_file));
        let script = run_in_environment(&commands, ticket.release(), &ticket.scram_arch);
        debug!(ticket = %ticket.prepid, script = %script, "🧮 MATRIX: Enumeration script");
        session
            .upload_content(&script, &format!("{directory}/generate.sh"))
            .await?;

        let output = session
            .execute(&[
                format!("cd {directory}"),
                "chmod +x generate.sh".to_string(),
                "./generate.sh || exit $?".to_string(),
            ])
            .await?;
        if !output.success() {
            return Err(RelvalError::RemoteExecution(format!(
                "Error code {} enumerating workflows for {}: {}",
                output.exit_code,
                ticket.prepid,
                output.stderr.trim()
            )));
        }

        let raw = session
            .download_as_string(&format!("{directory}/{output_file}"))
            .await?;
        parse_enumeration(&raw)
    }
}

/// Command line of the matrix helper for a ticket
pub fn matrix_command(ticket: &Ticket, output_file: &str) -> String {
    let mut command = format!(
        "python3 {MATRIX_FILE_NAME} -l={} -w={} -o={output_file}",
        ticket.workflow_id_list(),
        ticket.matrix
    );
    let additional = ticket.command.trim();
    if !additional.is_empty() {
        command.push_str(&format!(" -c=\"{}\"", additional.replace('"', "\\\"")));
        if !ticket.command_steps.is_empty() {
            command.push_str(&format!(" -cs={}", ticket.command_steps.join(",")));
        }
    }
    if ticket.recycle_gs && ticket.recycle_input_of.is_empty() {
        command.push_str(" -r");
    }
    command
}

/// Parse the helper's output, tolerating numeric splitting values and `null`s
pub fn parse_enumeration(raw: &str) -> Result<EnumeratedWorkflows> {
    let mut value: Value = serde_json::from_str(raw)?;
    normalize(&mut value);
    Ok(serde_json::from_value(value)?)
}

fn normalize(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|_, v| !v.is_null());
            for (key, v) in map.iter_mut() {
                if matches!(key.as_str(), "lumis_per_job" | "events_per_lumi") {
                    if let Value::Number(n) = v {
                        *v = Value::String(n.to_string());
                    }
                } else {
                    normalize(v);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(normalize),
        _ => {}
    }
}

#[async_trait]
impl WorkflowEnumerator for RemoteMatrixEnumerator {
    async fn enumerate(&self, ticket: &Ticket) -> Result<EnumeratedWorkflows> {
        if ticket.scram_arch.trim().is_empty() {
            return Err(RelvalError::Validation(format!(
                "Could not find SCRAM arch of {}",
                ticket.release()
            )));
        }
        info!(
            ticket = %ticket.prepid,
            workflow_ids = %ticket.workflow_id_list(),
            "🧮 MATRIX: Enumerating workflows"
        );

        let session = self.executor.open_session().await?;
        let result = self.run(session.as_ref(), ticket).await;
        let directory = self.remote.workspace_for(&ticket.prepid);
        if let Err(e) = session.execute(&[format!("rm -rf {directory}")]).await {
            warn!(ticket = %ticket.prepid, error = %e, "🧮 MATRIX: Failed to clean up workspace");
        }
        session.close().await?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket() -> Ticket {
        let mut ticket = Ticket::new("CMSSW_14_0_0", "fullsim");
        ticket.prepid = "CMSSW_14_0_0__fullsim-00001".to_string();
        ticket.workflow_ids = vec![1.0, 11634.911];
        ticket
    }

    #[test]
    fn test_matrix_command_plain() {
        assert_eq!(
            matrix_command(&ticket(), "t.json"),
            "python3 run_the_matrix_pdmv.py -l=1,11634.911 -w=standard -o=t.json"
        );
    }

    #[test]
    fn test_matrix_command_with_custom_command_and_recycling() {
        let mut ticket = ticket();
        ticket.command = "--customise \"X.y\"".to_string();
        ticket.command_steps = vec!["DIGI".to_string(), "RECO".to_string()];
        ticket.recycle_gs = true;
        let command = matrix_command(&ticket, "t.json");
        assert!(command.contains(" -c=\"--customise \\\"X.y\\\"\" -cs=DIGI,RECO"));
        assert!(command.ends_with(" -r"));

        ticket.recycle_input_of = "HLT".to_string();
        assert!(!matrix_command(&ticket, "t.json").ends_with(" -r"));
    }

    #[test]
    fn test_parse_enumeration_normalizes_values() {
        let raw = r#"{
            "1.0": {
                "workflow_name": "ZMM_14",
                "steps": [
                    {"name": "ZMM_14INPUT", "lumis_per_job": 10,
                     "input": {"dataset": "/RelValZMM/X-v1/GEN-SIM", "lumisection": null, "label": null, "events": 0}},
                    {"name": "DIGI", "lumis_per_job": "5",
                     "arguments": {"--step": "DIGI,L1", "--mc": true}}
                ]
            }
        }"#;
        let workflows = parse_enumeration(raw).unwrap();
        let workflow = &workflows["1.0"];
        assert_eq!(workflow.workflow_name, "ZMM_14");
        assert_eq!(workflow.steps[0].lumis_per_job, "10");
        assert_eq!(
            workflow.steps[0].input.as_ref().unwrap().dataset,
            "/RelValZMM/X-v1/GEN-SIM"
        );
        assert_eq!(workflow.steps[1].arguments["--mc"], true);
    }
}
