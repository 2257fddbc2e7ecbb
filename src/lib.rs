#![allow(clippy::doc_markdown)] // Allow technical terms like GlobalTag, cmsDriver in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # RelVal Core Rust
//!
//! Lifecycle orchestration core for release-validation (RelVal) work items.
//!
//! ## Overview
//!
//! A work item describes one multi-step physics simulation job. The core drives
//! it through `new → approved → submitting → submitted → done`: it resolves
//! conditions aliases on approval, hands submissions to a background worker pool
//! that generates and uploads configurations on a remote host and submits a job
//! description to the batch service, and reconciles the item with what the
//! tracking service reports afterwards. Tickets expand a list of matrix workflow
//! ids into many work items at once, all or nothing.
//!
//! ## Module Organization
//!
//! - [`models`] - Work items, steps, tickets, workflow summaries and history
//! - [`database`] - Document store trait and the in-memory implementation
//! - [`state_machine`] - Statuses, transition events, guards and the lifecycle executor
//! - [`orchestration`] - Controller, submission queue, submitter, reconciler, ticket fan-out
//! - [`execution`] - Generation and upload scripts, job descriptions, alias resolution
//! - [`client`] - Collaborator traits plus ssh and HTTP implementations
//! - [`locker`] - Per-key locks with blocking and fail-fast acquisition
//! - [`validation`] - Declarative field rules for user input
//! - [`config`] - YAML configuration with environment overrides
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging setup and operation helpers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use relval_core::OrchestrationCore;
//!
//! # async fn example() -> relval_core::Result<()> {
//! let core = OrchestrationCore::load()?;
//! let item = core.advance("CMSSW_14_0_0__fullsim-ZMM-00001").await?;
//! println!("{} is {}", item.prepid, item.status);
//! core.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! Every external system sits behind a trait in [`client`]; the fakes in
//! [`test_helpers`] let the whole core run in-process:
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit and integration tests
//! ```

pub mod client;
pub mod config;
pub mod constants;
pub mod database;
pub mod error;
pub mod execution;
pub mod locker;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod state_machine;
pub mod test_helpers;
pub mod validation;

pub use config::{ConfigManager, RelvalConfig};
pub use error::{RelvalError, Result};
pub use locker::{LockGuard, Locker};
pub use models::{Step, Ticket, WorkItem};
pub use orchestration::{Collaborators, OrchestrationCore};
pub use state_machine::{TicketStatus, WorkItemStatus};
