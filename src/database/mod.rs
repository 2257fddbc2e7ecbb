//! # Document Storage
//!
//! Work items and tickets are persisted through the [`DocumentStore`] trait. The
//! store is an external collaborator; [`InMemoryDocumentStore`] is the in-process
//! implementation used by tests, benchmarks and single-node deployments.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use relval_core::database::{DocumentStore, InMemoryDocumentStore, SortOrder};
//! use relval_core::models::WorkItem;
//!
//! # async fn example() -> relval_core::error::Result<()> {
//! let store = InMemoryDocumentStore::<WorkItem>::new();
//! let approved = store
//!     .query("status=approved", Some(&SortOrder::ascending("prepid")), Some(50))
//!     .await?;
//! let highest = store.highest_serial_matching("CMSSW_14_0_0__fullsim-ZMM-*").await?;
//! # Ok(())
//! # }
//! ```

pub mod document_store;
pub mod in_memory;
pub mod query;

pub use document_store::DocumentStore;
pub use in_memory::InMemoryDocumentStore;
pub use query::{glob_to_regex, serial_of, QueryExpression, SortOrder};
