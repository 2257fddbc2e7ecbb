//! # System Context
//!
//! Shared handles every orchestration component works with: configuration, the
//! two document collections, the lock registry and the external collaborators.
//! Built once and passed around as `Arc<SystemContext>`.

use std::sync::Arc;
use tracing::info;

use crate::client::{
    BatchService, DatasetCatalog, Emailer, HttpBatchService, HttpDatasetCatalog,
    HttpWorkflowTracker, Notifier, RemoteExecutor, SshExecutor, TracingNotifier,
    WorkflowEnumerator, WorkflowTracker,
};
use crate::config::{ConfigManager, RelvalConfig};
use crate::database::{DocumentStore, InMemoryDocumentStore};
use crate::error::Result;
use crate::execution::{ConditionResolver, RemoteMatrixEnumerator, ResolutionCache};
use crate::locker::Locker;
use crate::models::{Ticket, WorkItem};

/// External systems the core depends on
#[derive(Clone)]
pub struct Collaborators {
    pub items: Arc<dyn DocumentStore<WorkItem>>,
    pub tickets: Arc<dyn DocumentStore<Ticket>>,
    pub executor: Arc<dyn RemoteExecutor>,
    pub batch: Arc<dyn BatchService>,
    pub tracker: Arc<dyn WorkflowTracker>,
    pub catalog: Arc<dyn DatasetCatalog>,
    pub enumerator: Arc<dyn WorkflowEnumerator>,
    pub notifier: Arc<dyn Notifier>,
}

impl Collaborators {
    /// Real service clients from configuration, with in-memory document storage
    pub fn from_config(config: &RelvalConfig) -> Result<Self> {
        let executor: Arc<dyn RemoteExecutor> = Arc::new(SshExecutor::new(config.remote.clone()));
        Ok(Self {
            items: Arc::new(InMemoryDocumentStore::<WorkItem>::new()),
            tickets: Arc::new(InMemoryDocumentStore::<Ticket>::new()),
            enumerator: Arc::new(RemoteMatrixEnumerator::new(
                Arc::clone(&executor),
                config.remote.clone(),
            )),
            executor,
            batch: Arc::new(HttpBatchService::new(&config.batch_service)?),
            tracker: Arc::new(HttpWorkflowTracker::new(&config.tracker)?),
            catalog: Arc::new(HttpDatasetCatalog::new(&config.dataset_catalog)?),
            notifier: Arc::new(TracingNotifier),
        })
    }
}

pub struct SystemContext {
    pub config_manager: Arc<ConfigManager>,
    pub items: Arc<dyn DocumentStore<WorkItem>>,
    pub tickets: Arc<dyn DocumentStore<Ticket>>,
    pub locker: Arc<Locker>,
    pub executor: Arc<dyn RemoteExecutor>,
    pub batch: Arc<dyn BatchService>,
    pub tracker: Arc<dyn WorkflowTracker>,
    pub catalog: Arc<dyn DatasetCatalog>,
    pub enumerator: Arc<dyn WorkflowEnumerator>,
    pub resolver: Arc<ConditionResolver>,
    pub emailer: Arc<Emailer>,
}

impl std::fmt::Debug for SystemContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemContext")
            .field("environment", &self.config_manager.environment())
            .field("locks", &self.locker.status().len())
            .field("resolver", &self.resolver)
            .finish()
    }
}

impl SystemContext {
    pub fn new(config_manager: Arc<ConfigManager>, collaborators: Collaborators) -> Self {
        let config = config_manager.config();
        let locker = Arc::new(Locker::new());
        let cache = Arc::new(ResolutionCache::new(config.resolution.cache_ttl()));
        let resolver = Arc::new(ConditionResolver::new(
            Arc::clone(&collaborators.executor),
            cache,
            Arc::clone(&locker),
            config.remote.clone(),
        ));
        let emailer = Arc::new(Emailer::new(
            Arc::clone(&collaborators.notifier),
            config.notifications.clone(),
            &config.batch_service,
        ));

        info!(
            environment = %config_manager.environment(),
            remote_host = %config.remote.host,
            workers = config.submission.workers,
            "🏗️ CONTEXT: System context created"
        );

        Self {
            items: collaborators.items,
            tickets: collaborators.tickets,
            locker,
            executor: collaborators.executor,
            batch: collaborators.batch,
            tracker: collaborators.tracker,
            catalog: collaborators.catalog,
            enumerator: collaborators.enumerator,
            resolver,
            emailer,
            config_manager,
        }
    }

    pub fn config(&self) -> &RelvalConfig {
        self.config_manager.config()
    }
}
