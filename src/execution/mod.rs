//! # Remote Execution Pipeline
//!
//! Everything that turns a work item into remote work: the configuration
//! generation and upload scripts, the job description sent to the batch service,
//! condition alias resolution and matrix enumeration for tickets.

pub mod command_generator;
pub mod condition_resolver;
pub mod job_description;
pub mod matrix_enumerator;
pub mod upload_script;

pub use command_generator::{environment_setup, generation_script, run_in_environment};
pub use condition_resolver::{parse_resolved_tags, ConditionResolver, ResolutionCache};
pub use job_description::job_description;
pub use matrix_enumerator::{parse_enumeration, RemoteMatrixEnumerator};
pub use upload_script::{assign_config_hashes, parse_doc_ids, upload_script, UPLOADER_FILE_NAME};
