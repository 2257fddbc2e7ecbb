//! # Work Item State Machine
//!
//! Statuses, transition events, guards and the lifecycle executor that applies
//! transitions to stored work items.

pub mod events;
pub mod guards;
pub mod lifecycle;
pub mod states;

pub use events::LifecycleEvent;
pub use guards::{DatasetsValidGuard, GpuParamsCompleteGuard, StateGuard, WorkflowCompletedGuard};
pub use lifecycle::WorkItemLifecycle;
pub use states::{TicketStatus, WorkItemStatus};
