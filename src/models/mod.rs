//! # Domain Models
//!
//! Documents persisted by the document store (work items and tickets) and the
//! value types they are made of.

pub mod history;
pub mod step;
pub mod ticket;
pub mod work_item;
pub mod workflow;

pub use history::{HistoryEntry, WithHistory};
pub use step::{DriverArgs, GpuParams, GpuRequirement, InputDescriptor, Step, StepPayload};
pub use ticket::Ticket;
pub use work_item::{StepInput, WorkItem};
pub use workflow::{OutputDataset, StatusEntry, WorkflowDocument, WorkflowSummary};

/// A persisted document addressed by its prepid
pub trait Document:
    serde::Serialize + serde::de::DeserializeOwned + Clone + Send + Sync + 'static
{
    /// Collection the document lives in
    const COLLECTION: &'static str;

    fn prepid(&self) -> &str;
}

impl Document for WorkItem {
    const COLLECTION: &'static str = "relvals";

    fn prepid(&self) -> &str {
        &self.prepid
    }
}

impl Document for Ticket {
    const COLLECTION: &'static str = "tickets";

    fn prepid(&self) -> &str {
        &self.prepid
    }
}
