//! # External Collaborators
//!
//! Traits for every system the orchestration core depends on, plus the real
//! implementations: `ssh` remote execution, reqwest clients for the batch,
//! tracking and catalog services, and notification formatting.

pub mod http;
pub mod notifier;
pub mod ssh;
pub mod traits;

pub use http::{HttpBatchService, HttpDatasetCatalog, HttpWorkflowTracker};
pub use notifier::{Emailer, TracingNotifier};
pub use ssh::{SshExecutor, SshSession};
pub use traits::{
    BatchService, CommandOutput, DatasetCatalog, EnumeratedStep, EnumeratedWorkflow,
    EnumeratedWorkflows, Notifier, RemoteExecutor, RemoteSession, WorkflowEnumerator,
    WorkflowTracker,
};
