//! # Orchestration Engine
//!
//! Lifecycle orchestration of RelVal work items on top of the shared
//! [`SystemContext`](context::SystemContext).
//!
//! ## Core Components
//!
//! - **OrchestrationCore**: facade owning every component, the public entry point
//! - **ItemController**: creation, editing and deletion of work items and tickets
//! - **TicketFanout**: enumerates a ticket's workflows and creates its work items
//! - **SubmissionQueue**: fixed tokio worker pool for background submissions
//! - **Submitter**: remote preparation and batch submission of one work item
//! - **Reconciler**: merges tracking service state and selects output datasets
//!
//! Status transitions live in [`crate::state_machine`].

pub mod context;
pub mod controller;
pub mod core;
pub mod reconciler;
pub mod submission_queue;
pub mod submitter;
pub mod ticket_fanout;

pub use self::core::OrchestrationCore;
pub use context::{Collaborators, SystemContext};
pub use controller::ItemController;
pub use reconciler::{select_output_datasets, summarize, Reconciler};
pub use submission_queue::{QueueStatus, SubmissionHandler, SubmissionQueue, WorkerStatus};
pub use submitter::{SubmissionOutcome, Submitter};
pub use ticket_fanout::{make_step, scale_events, TicketFanout};
