use async_trait::async_trait;
use std::sync::Arc;

use crate::client::DatasetCatalog;
use crate::constants::{workflow_status, VALID_DATASET_ACCESS_TYPE};
use crate::error::{RelvalError, Result};
use crate::models::WorkItem;

/// Trait for implementing state transition guards
#[async_trait]
pub trait StateGuard<T: Sync>: Send + Sync {
    /// Fail with a precondition error if the transition is not allowed
    async fn check(&self, entity: &T) -> Result<()>;

    /// Get a description of this guard for logging
    fn description(&self) -> &'static str;
}

/// Guard to check that GPU-using steps carry every mandatory GPU parameter
pub struct GpuParamsCompleteGuard;

#[async_trait]
impl StateGuard<WorkItem> for GpuParamsCompleteGuard {
    async fn check(&self, item: &WorkItem) -> Result<()> {
        for step in &item.steps {
            if !step.gpu.is_requested() {
                continue;
            }
            let missing = step.gpu.missing_parameters();
            if !missing.is_empty() {
                return Err(RelvalError::precondition(
                    &item.prepid,
                    format!(
                        "Step {} uses GPU but is missing {}",
                        step.name,
                        missing.join(", ")
                    ),
                ));
            }
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "GPU steps must have complete GPU parameters"
    }
}

/// Guard to check every referenced dataset is valid in the catalog
pub struct DatasetsValidGuard {
    catalog: Arc<dyn DatasetCatalog>,
}

impl DatasetsValidGuard {
    pub fn new(catalog: Arc<dyn DatasetCatalog>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl StateGuard<WorkItem> for DatasetsValidGuard {
    async fn check(&self, item: &WorkItem) -> Result<()> {
        let datasets = item.referenced_datasets();
        if datasets.is_empty() {
            return Ok(());
        }

        let access_types = self.catalog.access_types(&datasets).await?;
        for dataset in &datasets {
            let access_type = access_types
                .get(dataset)
                .map(String::as_str)
                .unwrap_or("<missing>");
            if !access_type.eq_ignore_ascii_case(VALID_DATASET_ACCESS_TYPE) {
                return Err(RelvalError::precondition(
                    &item.prepid,
                    format!("{dataset} type is {access_type}, it must be VALID"),
                ));
            }
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "Input and pileup datasets must be valid"
    }
}

/// Guard to check the newest workflow completed with valid outputs.
///
/// Runs on an item whose workflows were just reconciled.
pub struct WorkflowCompletedGuard;

impl WorkflowCompletedGuard {
    /// Time the newest workflow reported `completed`
    pub fn completed_at(item: &WorkItem) -> Option<i64> {
        item.last_workflow()?
            .status_entry(workflow_status::COMPLETED)
            .map(|entry| entry.time)
    }
}

#[async_trait]
impl StateGuard<WorkItem> for WorkflowCompletedGuard {
    async fn check(&self, item: &WorkItem) -> Result<()> {
        let workflow = item.last_workflow().ok_or_else(|| {
            RelvalError::precondition(&item.prepid, "Item does not have any workflows")
        })?;

        for dataset in &workflow.output_datasets {
            if !dataset
                .access_type
                .eq_ignore_ascii_case(VALID_DATASET_ACCESS_TYPE)
            {
                return Err(RelvalError::precondition(
                    &item.prepid,
                    format!(
                        "Output dataset {} of {} is {}, it must be VALID",
                        dataset.name, workflow.name, dataset.access_type
                    ),
                ));
            }
        }

        if workflow.status_entry(workflow_status::COMPLETED).is_none() {
            return Err(RelvalError::precondition(
                &item.prepid,
                format!("{} is not completed", workflow.name),
            ));
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "Newest workflow must be completed with valid outputs"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        DriverArgs, GpuRequirement, OutputDataset, StatusEntry, Step, WorkflowSummary,
    };
    use std::collections::HashMap;

    struct StaticCatalog(HashMap<String, String>);

    #[async_trait]
    impl DatasetCatalog for StaticCatalog {
        async fn access_types(&self, _datasets: &[String]) -> Result<HashMap<String, String>> {
            Ok(self.0.clone())
        }

        async fn list_datasets(&self, _pattern: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    fn item_with_pileup(pileup: &str) -> WorkItem {
        let mut item = WorkItem::new(
            "CMSSW_14_0_0",
            "fullsim",
            vec![Step::driver(
                "Digi",
                DriverArgs {
                    pileup_input: pileup.to_string(),
                    ..Default::default()
                },
            )],
        );
        item.prepid = "CMSSW_14_0_0__fullsim-ZMM-00001".to_string();
        item
    }

    #[tokio::test]
    async fn test_gpu_guard_reports_missing_parameters() {
        let mut item = item_with_pileup("");
        item.steps[0].gpu.requires = GpuRequirement::Required;
        let err = GpuParamsCompleteGuard.check(&item).await.unwrap_err();
        assert!(err.is_precondition());
        assert!(err.to_string().contains("gpu_memory, cuda_capabilities, cuda_runtime"));

        item.steps[0].gpu.requires = GpuRequirement::Forbidden;
        assert!(GpuParamsCompleteGuard.check(&item).await.is_ok());
    }

    #[tokio::test]
    async fn test_dataset_guard_is_case_insensitive() {
        let pileup = "/RelValMinBias/CMSSW_14_0_0-v1/GEN-SIM";
        let item = item_with_pileup(&format!("dbs:{pileup}"));
        let guard = DatasetsValidGuard::new(Arc::new(StaticCatalog(HashMap::from([(
            pileup.to_string(),
            "VALID".to_string(),
        )]))));
        assert!(guard.check(&item).await.is_ok());

        let guard = DatasetsValidGuard::new(Arc::new(StaticCatalog(HashMap::from([(
            pileup.to_string(),
            "INVALID".to_string(),
        )]))));
        assert!(guard.check(&item).await.unwrap_err().is_precondition());
    }

    #[tokio::test]
    async fn test_dataset_guard_rejects_unknown_dataset() {
        let item = item_with_pileup("/RelValMinBias/CMSSW_14_0_0-v1/GEN-SIM");
        let guard = DatasetsValidGuard::new(Arc::new(StaticCatalog(HashMap::new())));
        assert!(guard.check(&item).await.is_err());
    }

    #[tokio::test]
    async fn test_completed_guard() {
        let mut item = item_with_pileup("");
        assert!(WorkflowCompletedGuard.check(&item).await.is_err());

        let mut workflow = WorkflowSummary::named("pdmvserv_RVZMM_240101_1");
        workflow.output_datasets = vec![OutputDataset {
            name: "/RelValZMM/CMSSW_14_0_0-v1/AODSIM".to_string(),
            access_type: "valid".to_string(),
            events: 9000,
        }];
        workflow.status_history = vec![StatusEntry {
            time: 100,
            status: "running-open".to_string(),
        }];
        item.workflows = vec![workflow];
        let err = WorkflowCompletedGuard.check(&item).await.unwrap_err();
        assert!(err.to_string().contains("pdmvserv_RVZMM_240101_1 is not completed"));

        item.workflows[0].status_history.push(StatusEntry {
            time: 200,
            status: "completed".to_string(),
        });
        assert!(WorkflowCompletedGuard.check(&item).await.is_ok());
        assert_eq!(WorkflowCompletedGuard::completed_at(&item), Some(200));
    }
}
