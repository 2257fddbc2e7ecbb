//! # HTTP Collaborator Clients
//!
//! reqwest-based clients for the batch service, the workflow tracking service and
//! the dataset catalog. All clients are built with the timeout from their config
//! section; a request that exceeds it surfaces as [`RelvalError::Timeout`].

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info};

use super::traits::{BatchService, DatasetCatalog, WorkflowTracker};
use crate::config::{BatchServiceConfig, DatasetCatalogConfig, TrackerConfig};
use crate::error::{RelvalError, Result};
use crate::models::WorkflowDocument;

fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(format!("relval-core/{}", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| RelvalError::Configuration(format!("Failed to create HTTP client: {e}")))
}

fn parse_base_url(base_url: &str) -> Result<Url> {
    // A trailing slash keeps the last path segment when joining relative paths
    let normalized = format!("{}/", base_url.trim_end_matches('/'));
    Url::parse(&normalized)
        .map_err(|e| RelvalError::Configuration(format!("Invalid base URL {base_url}: {e}")))
}

fn join(base_url: &Url, path: &str) -> Result<Url> {
    base_url
        .join(path.trim_start_matches('/'))
        .map_err(|e| RelvalError::Configuration(format!("Failed to construct URL: {e}")))
}

async fn handle_response<T>(response: reqwest::Response, operation: &str) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    if response.status().is_success() {
        let result = response.json::<T>().await.map_err(|e| {
            RelvalError::Http(format!("Failed to parse {operation} response: {e}"))
        })?;
        debug!("Successfully completed operation: {}", operation);
        Ok(result)
    } else {
        let status = response.status();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        error!(status = %status, error = %error_text, "Failed operation: {}", operation);
        Err(RelvalError::Http(format!("HTTP {status}: {error_text}")))
    }
}

/// Request manager client
#[derive(Debug, Clone)]
pub struct HttpBatchService {
    client: Client,
    base_url: Url,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    result: Vec<SubmitResult>,
}

#[derive(Debug, Deserialize)]
struct SubmitResult {
    request: String,
}

impl HttpBatchService {
    pub fn new(config: &BatchServiceConfig) -> Result<Self> {
        let service = Self {
            client: build_client(config.timeout())?,
            base_url: parse_base_url(&config.base_url)?,
        };
        info!(
            base_url = %config.base_url,
            timeout_ms = config.timeout_ms,
            "🌐 BATCH: Created batch service client"
        );
        Ok(service)
    }

    async fn update_request(&self, workflow: &str, body: Value, operation: &str) -> Result<()> {
        let url = join(&self.base_url, &format!("reqmgr2/data/request/{workflow}"))?;
        let response = self.client.put(url).json(&body).send().await?;
        handle_response::<Value>(response, operation).await?;
        Ok(())
    }
}

#[async_trait]
impl BatchService for HttpBatchService {
    async fn submit(&self, job: &Value) -> Result<String> {
        let url = join(&self.base_url, "reqmgr2/data/request")?;
        let response = self.client.post(url).json(job).send().await?;
        let parsed: SubmitResponse = handle_response(response, "submit workflow").await?;
        let workflow = parsed
            .result
            .into_iter()
            .next()
            .map(|r| r.request)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                RelvalError::Http("Batch service accepted the job but returned no workflow name".to_string())
            })?;
        info!(workflow = %workflow, "🌐 BATCH: Submitted workflow");
        Ok(workflow)
    }

    async fn approve(&self, workflow: &str) -> Result<()> {
        self.change_status(workflow, crate::constants::workflow_status::ASSIGNMENT_APPROVED)
            .await
    }

    async fn change_status(&self, workflow: &str, status: &str) -> Result<()> {
        debug!(workflow = %workflow, status = %status, "🌐 BATCH: Changing workflow status");
        self.update_request(workflow, json!({ "RequestStatus": status }), "change status")
            .await
    }

    async fn change_priority(&self, workflow: &str, priority: u32) -> Result<()> {
        debug!(workflow = %workflow, priority = priority, "🌐 BATCH: Changing workflow priority");
        self.update_request(
            workflow,
            json!({ "RequestPriority": priority }),
            "change priority",
        )
        .await
    }
}

/// Workflow tracking (statistics) service client
#[derive(Debug, Clone)]
pub struct HttpWorkflowTracker {
    client: Client,
    base_url: Url,
}

#[derive(Debug, Deserialize)]
struct ViewResponse {
    #[serde(default)]
    rows: Vec<ViewRow>,
}

#[derive(Debug, Deserialize)]
struct ViewRow {
    doc: Option<WorkflowDocument>,
}

impl HttpWorkflowTracker {
    pub fn new(config: &TrackerConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.timeout())?,
            base_url: parse_base_url(&config.base_url)?,
        })
    }
}

#[async_trait]
impl WorkflowTracker for HttpWorkflowTracker {
    async fn workflows_for(&self, prepid: &str) -> Result<Vec<WorkflowDocument>> {
        let mut url = join(&self.base_url, "requests/_design/_designDoc/_view/prepids")?;
        url.query_pairs_mut()
            .append_pair("key", &format!("\"{prepid}\""))
            .append_pair("include_docs", "true");
        let response = self.client.get(url).send().await?;
        let view: ViewResponse = handle_response(response, "workflows by prepid").await?;
        Ok(view.rows.into_iter().filter_map(|row| row.doc).collect())
    }

    async fn workflow(&self, name: &str) -> Result<Option<WorkflowDocument>> {
        let url = join(&self.base_url, &format!("requests/{name}"))?;
        let response = self.client.get(url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        handle_response(response, "workflow by name").await.map(Some)
    }

    async fn force_refresh(&self, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        let url = join(&self.base_url, "update")?;
        let response = self
            .client
            .post(url)
            .json(&json!({ "workflows": names }))
            .send()
            .await?;
        handle_response::<Value>(response, "force refresh").await?;
        Ok(())
    }
}

/// Dataset bookkeeping catalog client
#[derive(Debug, Clone)]
pub struct HttpDatasetCatalog {
    client: Client,
    base_url: Url,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    dataset: String,
    #[serde(default)]
    dataset_access_type: String,
}

impl HttpDatasetCatalog {
    pub fn new(config: &DatasetCatalogConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.timeout())?,
            base_url: parse_base_url(&config.base_url)?,
        })
    }

    async fn dataset_list(&self, datasets: &[String], access_type: &str) -> Result<Vec<CatalogEntry>> {
        let url = join(&self.base_url, "datasetlist")?;
        let body = json!({
            "dataset": datasets,
            "detail": 1,
            "dataset_access_type": access_type,
        });
        let response = self.client.post(url).json(&body).send().await?;
        handle_response(response, "dataset list").await
    }
}

#[async_trait]
impl DatasetCatalog for HttpDatasetCatalog {
    async fn access_types(&self, datasets: &[String]) -> Result<HashMap<String, String>> {
        if datasets.is_empty() {
            return Ok(HashMap::new());
        }
        let entries = self.dataset_list(datasets, "*").await?;
        Ok(entries
            .into_iter()
            .map(|entry| (entry.dataset, entry.dataset_access_type))
            .collect())
    }

    async fn list_datasets(&self, pattern: &str) -> Result<Vec<String>> {
        let entries = self.dataset_list(&[pattern.to_string()], "VALID").await?;
        Ok(entries.into_iter().map(|entry| entry.dataset).collect())
    }
}
