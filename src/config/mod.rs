//! # RelVal Core Configuration System
//!
//! Configuration comes from a single YAML file (`config/relval-config.yaml`) whose
//! top-level sections describe every collaborator the orchestration core talks to.
//! Environment sections (`development`, `test`, `production`) in the same file are
//! merged over the base values by [`ConfigManager`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use relval_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let workers = manager.config().submission.workers;
//! let timeout = manager.config().remote.command_timeout();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::{ConfigManager, ENVIRONMENT_SECTIONS};

/// Root configuration structure mirroring relval-config.yaml
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RelvalConfig {
    /// Remote host used to generate configs, resolve conditions and enumerate matrices
    pub remote: RemoteConfig,

    /// External batch (request manager) service
    pub batch_service: BatchServiceConfig,

    /// External workflow tracking service
    pub tracker: TrackerConfig,

    /// Dataset catalog used for validity checks and recycling lookups
    pub dataset_catalog: DatasetCatalogConfig,

    /// Background submission worker pool
    pub submission: SubmissionConfig,

    /// Campaign label grouping of sibling submissions
    pub campaign: CampaignConfig,

    /// Conditions alias resolution
    pub resolution: ResolutionConfig,

    /// Success/failure notifications
    pub notifications: NotificationConfig,

    /// Environment this configuration was loaded for
    #[serde(skip_deserializing)]
    pub environment: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub host: String,
    pub username: String,
    /// Remote directory under which per-object workspaces are created
    pub workspace_path: String,
    pub command_timeout_seconds: u64,
    /// Local path of the config uploader helper uploaded next to upload scripts
    pub config_uploader_script: String,
    /// Local path of the matrix enumeration helper used by ticket fan-out
    pub matrix_script: String,
    /// Extra ssh options, e.g. `-o StrictHostKeyChecking=no`
    pub ssh_options: Vec<String>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: "lxplus.cern.ch".to_string(),
            username: "pdmvserv".to_string(),
            workspace_path: "/tmp/relval_submission".to_string(),
            command_timeout_seconds: 1800,
            config_uploader_script: "scripts/config_uploader.py".to_string(),
            matrix_script: "scripts/run_the_matrix_pdmv.py".to_string(),
            ssh_options: vec!["-o".to_string(), "BatchMode=yes".to_string()],
        }
    }
}

impl RemoteConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    /// Workspace directory for a single work item or ticket
    pub fn workspace_for(&self, prepid: &str) -> String {
        format!("{}/{}", self.workspace_path.trim_end_matches('/'), prepid)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchServiceConfig {
    pub base_url: String,
    pub timeout_ms: u64,
    /// Delay between a successful submission and the approve call
    pub approve_delay_ms: u64,
    pub requestor: String,
    pub group: String,
    /// Configuration cache URL the uploaded artifacts live in
    pub config_cache_url: String,
    pub dbs_url: String,
}

impl Default for BatchServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://cmsweb.cern.ch".to_string(),
            timeout_ms: 60_000,
            approve_delay_ms: 3_000,
            requestor: "pdmvserv".to_string(),
            group: "PPD".to_string(),
            config_cache_url: "https://cmsweb.cern.ch/couchdb".to_string(),
            dbs_url: "https://cmsweb.cern.ch/dbs/prod/global/DBSReader".to_string(),
        }
    }
}

impl BatchServiceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn approve_delay(&self) -> Duration {
        Duration::from_millis(self.approve_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://vocms074.cern.ch:5984".to_string(),
            timeout_ms: 30_000,
        }
    }
}

impl TrackerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatasetCatalogConfig {
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for DatasetCatalogConfig {
    fn default() -> Self {
        Self {
            base_url: "https://cmsweb.cern.ch/dbs/prod/global/DBSReader".to_string(),
            timeout_ms: 30_000,
        }
    }
}

impl DatasetCatalogConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SubmissionConfig {
    /// Number of background submission workers
    pub workers: usize,
    pub shutdown_timeout_seconds: u64,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            workers: 15,
            shutdown_timeout_seconds: 60,
        }
    }
}

impl SubmissionConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CampaignConfig {
    /// Window in which sibling submissions reuse the same campaign timestamp
    pub reuse_window_seconds: i64,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            reuse_window_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResolutionConfig {
    pub cache_ttl_seconds: u64,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: 3600,
        }
    }
}

impl ResolutionConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Public URL of the service, used for links in notifications
    pub service_url: String,
    /// Development instances prefix subjects and warn that jobs never run
    pub development: bool,
    pub default_recipients: Vec<String>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            service_url: "https://cms-pdmv.cern.ch/relval".to_string(),
            development: true,
            default_recipients: Vec::new(),
        }
    }
}

impl RelvalConfig {
    /// Validate cross-field constraints that serde cannot express
    pub fn validate(&self) -> ConfigResult<()> {
        if self.submission.workers == 0 {
            return Err(ConfigurationError::invalid_value(
                "submission.workers",
                "0",
                "at least one submission worker is required",
            ));
        }

        if self.remote.host.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "host",
                "remote",
            ));
        }

        if self.remote.command_timeout_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "remote.command_timeout_seconds",
                "0",
                "remote commands must have a bounded, non-zero timeout",
            ));
        }

        for (field, url) in [
            ("batch_service.base_url", &self.batch_service.base_url),
            ("tracker.base_url", &self.tracker.base_url),
            ("dataset_catalog.base_url", &self.dataset_catalog.base_url),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigurationError::invalid_value(
                    field,
                    url.clone(),
                    "expected an http(s) URL",
                ));
            }
        }

        if self.campaign.reuse_window_seconds < 0 {
            return Err(ConfigurationError::invalid_value(
                "campaign.reuse_window_seconds",
                self.campaign.reuse_window_seconds.to_string(),
                "window cannot be negative",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RelvalConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.campaign.reuse_window_seconds, 3600);
        assert_eq!(config.submission.workers, 15);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = RelvalConfig::default();
        config.submission.workers = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("submission.workers"));
    }

    #[test]
    fn test_workspace_path_joins_prepid() {
        let mut remote = RemoteConfig::default();
        remote.workspace_path = "/afs/work/relval/".to_string();
        assert_eq!(
            remote.workspace_for("CMSSW_14_0_0__fullsim-TTbar-00001"),
            "/afs/work/relval/CMSSW_14_0_0__fullsim-TTbar-00001"
        );
    }
}
