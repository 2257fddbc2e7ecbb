//! Collaborator traits consumed by the orchestration core
//!
//! Every external system the core talks to sits behind one of these traits so
//! that the orchestration logic can run against real services or scripted fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::error::Result;
use crate::models::{InputDescriptor, Ticket, WorkflowDocument};

/// Result of running a command sequence remotely
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One open connection to the remote host
#[async_trait]
pub trait RemoteSession: Send + Sync {
    async fn upload_file(&self, local: &Path, remote: &str) -> Result<()>;

    async fn upload_content(&self, content: &str, remote: &str) -> Result<()>;

    async fn download_as_string(&self, remote: &str) -> Result<String>;

    /// Run `commands` in order in one shell
    async fn execute(&self, commands: &[String]) -> Result<CommandOutput>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn RemoteSession>>;
}

/// External batch (request management) service
#[async_trait]
pub trait BatchService: Send + Sync {
    /// Submit a job description, returning the new workflow name
    async fn submit(&self, job: &Value) -> Result<String>;

    async fn approve(&self, workflow: &str) -> Result<()>;

    async fn change_status(&self, workflow: &str, status: &str) -> Result<()>;

    async fn change_priority(&self, workflow: &str, priority: u32) -> Result<()>;
}

/// Workflow tracking service
#[async_trait]
pub trait WorkflowTracker: Send + Sync {
    /// Every workflow document associated with a work item
    async fn workflows_for(&self, prepid: &str) -> Result<Vec<WorkflowDocument>>;

    async fn workflow(&self, name: &str) -> Result<Option<WorkflowDocument>>;

    /// Ask the tracker to refresh its copy of the named workflows
    async fn force_refresh(&self, names: &[String]) -> Result<()>;
}

#[async_trait]
pub trait DatasetCatalog: Send + Sync {
    /// Access type per dataset name; unknown datasets are absent
    async fn access_types(&self, datasets: &[String]) -> Result<HashMap<String, String>>;

    /// Names of datasets matching a `*` pattern
    async fn list_datasets(&self, pattern: &str) -> Result<Vec<String>>;
}

/// One step as reported by matrix enumeration, arguments still in command line form
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnumeratedStep {
    pub name: String,
    /// `--option` → value (string, bool or list)
    pub arguments: Map<String, Value>,
    pub input: Option<InputDescriptor>,
    pub lumis_per_job: String,
    pub events_per_lumi: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnumeratedWorkflow {
    pub workflow_name: String,
    pub steps: Vec<EnumeratedStep>,
}

/// Matrix enumeration: workflow id → generated steps
pub type EnumeratedWorkflows = BTreeMap<String, EnumeratedWorkflow>;

#[async_trait]
pub trait WorkflowEnumerator: Send + Sync {
    async fn enumerate(&self, ticket: &Ticket) -> Result<EnumeratedWorkflows>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, subject: &str, body: &str, recipients: &[String]) -> Result<()>;
}
