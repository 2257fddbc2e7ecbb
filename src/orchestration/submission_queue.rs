//! # Submission Queue
//!
//! Fixed pool of tokio worker tasks consuming named jobs. The job name is the
//! work item id; a name can be queued or in flight at most once. The pool is
//! created explicitly, introspectable while running, and stopped with
//! [`SubmissionQueue::shutdown`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{RelvalError, Result};

/// Work performed for one queued name
#[async_trait]
pub trait SubmissionHandler: Send + Sync {
    async fn handle(&self, key: &str);
}

/// Snapshot of queued and running jobs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    /// Waiting for a worker, oldest first
    pub queued: Vec<String>,
    /// Currently processed by a worker
    pub in_flight: Vec<String>,
}

impl QueueStatus {
    pub fn contains(&self, key: &str) -> bool {
        self.queued.iter().chain(&self.in_flight).any(|k| k == key)
    }

    pub fn len(&self) -> usize {
        self.queued.len() + self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub worker: String,
    pub busy: bool,
    pub job: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct RegistryState {
    queued: VecDeque<String>,
    workers: Vec<Option<(String, DateTime<Utc>)>>,
}

impl RegistryState {
    fn contains(&self, key: &str) -> bool {
        self.queued.iter().any(|k| k == key)
            || self
                .workers
                .iter()
                .flatten()
                .any(|(job, _)| job == key)
    }
}

pub struct SubmissionQueue {
    sender: Mutex<Option<mpsc::UnboundedSender<String>>>,
    registry: Arc<Mutex<RegistryState>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl std::fmt::Debug for SubmissionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionQueue")
            .field("status", &self.queue_status())
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}

fn worker_name(index: usize) -> String {
    format!("submission-worker-{index}")
}

impl SubmissionQueue {
    /// Spawn `workers` worker tasks on the current tokio runtime
    pub fn start(
        workers: usize,
        handler: Arc<dyn SubmissionHandler>,
        shutdown_timeout: Duration,
    ) -> Self {
        let workers = workers.max(1);
        let (sender, receiver) = mpsc::unbounded_channel::<String>();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let registry = Arc::new(Mutex::new(RegistryState {
            queued: VecDeque::new(),
            workers: vec![None; workers],
        }));

        let handles = (0..workers)
            .map(|index| {
                tokio::spawn(worker_loop(
                    index,
                    Arc::clone(&receiver),
                    Arc::clone(&registry),
                    Arc::clone(&handler),
                ))
            })
            .collect();

        info!(workers = workers, "🚀 QUEUE: Submission workers started");
        Self {
            sender: Mutex::new(Some(sender)),
            registry,
            handles: Mutex::new(handles),
            shutdown_timeout,
        }
    }

    /// Queue `key`; fails if it is already queued or in flight, or after shutdown
    pub fn add(&self, key: &str) -> Result<()> {
        let sender_guard = self.sender.lock();
        let sender = sender_guard
            .as_ref()
            .ok_or_else(|| RelvalError::Queue("Submission queue is shut down".to_string()))?;

        let mut registry = self.registry.lock();
        if registry.contains(key) {
            return Err(RelvalError::Queue(format!("{key} is already in the submission queue")));
        }
        sender
            .send(key.to_string())
            .map_err(|_| RelvalError::Queue("Submission workers are gone".to_string()))?;
        registry.queued.push_back(key.to_string());
        debug!(key = %key, queued = registry.queued.len(), "🚀 QUEUE: Job added");
        Ok(())
    }

    pub fn queue_status(&self) -> QueueStatus {
        let registry = self.registry.lock();
        QueueStatus {
            queued: registry.queued.iter().cloned().collect(),
            in_flight: registry
                .workers
                .iter()
                .flatten()
                .map(|(job, _)| job.clone())
                .collect(),
        }
    }

    pub fn worker_status(&self) -> Vec<WorkerStatus> {
        let registry = self.registry.lock();
        registry
            .workers
            .iter()
            .enumerate()
            .map(|(index, slot)| WorkerStatus {
                worker: worker_name(index),
                busy: slot.is_some(),
                job: slot.as_ref().map(|(job, _)| job.clone()),
                started_at: slot.as_ref().map(|(_, started)| *started),
            })
            .collect()
    }

    /// Stop accepting jobs, let workers drain the queue, abort stragglers after the timeout
    pub async fn shutdown(&self) {
        if self.sender.lock().take().is_none() {
            return;
        }
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        info!(
            workers = handles.len(),
            pending = self.queue_status().len(),
            "🛑 QUEUE: Shutting down submission workers"
        );

        let aborters: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let joined = tokio::time::timeout(
            self.shutdown_timeout,
            futures::future::join_all(handles),
        )
        .await;
        if joined.is_err() {
            warn!(
                timeout_seconds = self.shutdown_timeout.as_secs(),
                "🛑 QUEUE: Workers did not finish in time, aborting"
            );
            aborters.iter().for_each(|handle| handle.abort());
        }
        info!("🛑 QUEUE: Submission workers stopped");
    }
}

async fn worker_loop(
    index: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
    registry: Arc<Mutex<RegistryState>>,
    handler: Arc<dyn SubmissionHandler>,
) {
    let name = worker_name(index);
    debug!(worker = %name, "🚀 QUEUE: Worker ready");
    loop {
        let next = receiver.lock().await.recv().await;
        let Some(key) = next else {
            break;
        };

        {
            let mut registry = registry.lock();
            if let Some(position) = registry.queued.iter().position(|k| *k == key) {
                registry.queued.remove(position);
            }
            registry.workers[index] = Some((key.clone(), Utc::now()));
        }

        info!(worker = %name, key = %key, "🚀 QUEUE: Processing job");
        let outcome = AssertUnwindSafe(handler.handle(&key)).catch_unwind().await;
        if outcome.is_err() {
            error!(worker = %name, key = %key, "🚀 QUEUE: Job panicked");
        }

        registry.lock().workers[index] = None;
        debug!(worker = %name, key = %key, "🚀 QUEUE: Job finished");
    }
    debug!(worker = %name, "🚀 QUEUE: Worker exiting");
}
