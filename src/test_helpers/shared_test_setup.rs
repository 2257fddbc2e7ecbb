//! # Shared Test Setup
//!
//! A [`TestHarness`] wires every collaborator fake into an [`OrchestrationCore`]
//! with a configuration tuned for tests: no approve delay, two submission
//! workers and a short shutdown timeout. Fixture builders produce work items and
//! enumerated workflows that pass validation.

use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

use super::fakes::{
    FakeCatalog, FakeEnumerator, FaultyDocumentStore, FakeTracker, RecordingBatchService, RecordingNotifier,
    ScriptedExecutor,
};
use crate::client::{CommandOutput, EnumeratedStep, EnumeratedWorkflow, EnumeratedWorkflows};
use crate::config::{ConfigManager, RelvalConfig};
use crate::database::{DocumentStore, InMemoryDocumentStore};
use crate::error::Result;
use crate::models::{DriverArgs, Step, Ticket, WorkItem};
use crate::orchestration::{Collaborators, OrchestrationCore};
use crate::state_machine::WorkItemStatus;

pub const TEST_RELEASE: &str = "CMSSW_14_0_0";
pub const TEST_SCRAM_ARCH: &str = "el8_amd64_gcc12";
pub const TEST_BATCH: &str = "fullsim";
pub const TEST_ALIAS: &str = "auto:phase1_2024_realistic";
pub const TEST_GLOBALTAG: &str = "140X_mcRun3_2024_realistic_v1";
pub const TEST_USER: &str = "tester";

/// Configuration used by every harness
pub fn test_config() -> RelvalConfig {
    let mut config = RelvalConfig::default();
    config.environment = "test".to_string();
    config.batch_service.approve_delay_ms = 0;
    config.submission.workers = 2;
    config.submission.shutdown_timeout_seconds = 5;
    config.remote.workspace_path = "/tmp/relval_test".to_string();
    config.notifications.development = true;
    config.notifications.default_recipients = vec!["relval-ops@example.org".to_string()];
    config
}

/// Every fake plus the stores, shared with the core built from them
#[derive(Debug, Clone)]
pub struct TestHarness {
    pub config: RelvalConfig,
    pub items: Arc<InMemoryDocumentStore<WorkItem>>,
    /// Store the core writes work items through; wraps `items`
    pub item_store: Arc<FaultyDocumentStore<WorkItem>>,
    pub tickets: Arc<InMemoryDocumentStore<Ticket>>,
    pub executor: ScriptedExecutor,
    pub tracker: Arc<FakeTracker>,
    pub batch: Arc<RecordingBatchService>,
    pub catalog: Arc<FakeCatalog>,
    pub enumerator: Arc<FakeEnumerator>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    /// Fakes with the test alias resolvable on the remote host
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: RelvalConfig) -> Self {
        let tracker = Arc::new(FakeTracker::new());
        let executor = ScriptedExecutor::new();
        executor.respond_to(
            "resolve_auto_global_tag.py",
            CommandOutput::ok(format!("GlobalTag: {TEST_ALIAS} {TEST_GLOBALTAG}")),
        );
        let items = Arc::new(InMemoryDocumentStore::new());
        Self {
            config,
            item_store: Arc::new(FaultyDocumentStore::new(Arc::clone(&items))),
            items,
            tickets: Arc::new(InMemoryDocumentStore::new()),
            executor,
            batch: Arc::new(RecordingBatchService::new(Arc::clone(&tracker))),
            tracker,
            catalog: Arc::new(FakeCatalog::new()),
            enumerator: Arc::new(FakeEnumerator::default()),
            notifier: Arc::new(RecordingNotifier::new()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            items: self.item_store.clone(),
            tickets: self.tickets.clone(),
            executor: Arc::new(self.executor.clone()),
            batch: self.batch.clone(),
            tracker: self.tracker.clone(),
            catalog: self.catalog.clone(),
            enumerator: self.enumerator.clone(),
            notifier: self.notifier.clone(),
        }
    }

    /// Core on top of this harness; must be called inside a tokio runtime
    pub fn core(&self) -> OrchestrationCore {
        OrchestrationCore::new(
            ConfigManager::from_config(self.config.clone()),
            self.collaborators(),
        )
    }
}

/// Two-step GEN-SIM → DIGI work item using the test alias
pub fn sample_item(name: &str) -> WorkItem {
    let mut item = WorkItem::new(
        TEST_RELEASE,
        TEST_BATCH,
        vec![gen_sim_step(name), digi_step(name)],
    );
    item.scram_arch = TEST_SCRAM_ARCH.to_string();
    item.workflow_name = name.to_string();
    item.workflow_id = 12_834.0;
    item.priority = 450_000;
    item
}

pub fn gen_sim_step(name: &str) -> Step {
    let args = DriverArgs {
        conditions: TEST_ALIAS.to_string(),
        step: vec!["GEN".to_string(), "SIM".to_string()],
        eventcontent: vec!["FEVTDEBUG".to_string()],
        datatier: vec!["GEN-SIM".to_string()],
        era: "Run3_2024".to_string(),
        beamspot: "DBrealistic".to_string(),
        relval: "9000,100".to_string(),
        fragment_name: format!("{name}_14TeV_TuneCP5_cfi"),
        ..DriverArgs::default()
    };
    Step::driver(format!("{name}_14"), args)
}

pub fn digi_step(name: &str) -> Step {
    let args = DriverArgs {
        conditions: TEST_ALIAS.to_string(),
        step: vec!["DIGI:pdigi_valid".to_string(), "L1".to_string(), "HLT:@relval2024".to_string()],
        eventcontent: vec!["FEVTDEBUGHLT".to_string()],
        datatier: vec!["GEN-SIM-DIGI-RAW".to_string()],
        era: "Run3_2024".to_string(),
        ..DriverArgs::default()
    };
    let mut step = Step::driver(format!("DIGIUP24_{name}"), args);
    step.keep_output = true;
    step
}

/// Store `item` directly with the given status, bypassing the controller
pub async fn store_item(
    harness: &TestHarness,
    mut item: WorkItem,
    prepid: &str,
    status: WorkItemStatus,
) -> Result<WorkItem> {
    item.prepid = prepid.to_string();
    item.status = status;
    harness.items.save(&item).await?;
    Ok(item)
}

/// Ticket asking for the given matrix workflow ids
pub fn sample_ticket(workflow_ids: &[f64]) -> Ticket {
    let mut ticket = Ticket::new(TEST_RELEASE, TEST_BATCH);
    ticket.scram_arch = TEST_SCRAM_ARCH.to_string();
    ticket.workflow_ids = workflow_ids.to_vec();
    ticket.label = "RV".to_string();
    ticket
}

fn arguments(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

/// Enumerated GEN-SIM plus DIGI workflow as the matrix helper reports it
pub fn enumerated_workflow(name: &str) -> EnumeratedWorkflow {
    EnumeratedWorkflow {
        workflow_name: name.to_string(),
        steps: vec![
            EnumeratedStep {
                name: format!("{name}_14"),
                arguments: arguments(&[
                    ("fragment_name", json!(format!("{name}_14TeV_TuneCP5_cfi"))),
                    ("conditions", json!(TEST_ALIAS)),
                    ("step", json!("GEN,SIM")),
                    ("eventcontent", json!("FEVTDEBUG")),
                    ("datatier", json!("GEN-SIM")),
                    ("relval", json!("9000,100")),
                    ("fileout", json!("file:step1.root")),
                ]),
                ..EnumeratedStep::default()
            },
            EnumeratedStep {
                name: format!("DIGIUP24_{name}INPUT"),
                arguments: arguments(&[
                    ("conditions", json!(TEST_ALIAS)),
                    ("step", json!("DIGI:pdigi_valid,L1,HLT:@relval2024")),
                    ("eventcontent", json!("FEVTDEBUGHLT")),
                    ("datatier", json!("GEN-SIM-DIGI-RAW")),
                    ("filein", json!("file:step1.root")),
                ]),
                ..EnumeratedStep::default()
            },
        ],
    }
}

/// Enumeration result keyed by workflow id
pub fn enumeration(workflows: &[(&str, EnumeratedWorkflow)]) -> EnumeratedWorkflows {
    workflows
        .iter()
        .map(|(id, workflow)| (id.to_string(), workflow.clone()))
        .collect()
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
