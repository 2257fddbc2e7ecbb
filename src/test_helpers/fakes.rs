//! # Collaborator Fakes
//!
//! In-process stand-ins for the remote host and the external services. They
//! record every interaction so tests can assert on what the core asked for, and
//! the batch service and tracker share state so a submitted workflow becomes
//! visible to reconciliation just like against the real services.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};

use crate::client::{
    BatchService, CommandOutput, DatasetCatalog, EnumeratedWorkflows, Notifier, RemoteExecutor,
    RemoteSession, WorkflowEnumerator, WorkflowTracker,
};
use crate::database::{glob_to_regex, DocumentStore, InMemoryDocumentStore, SortOrder};
use crate::error::{RelvalError, Result};
use crate::models::workflow::{DatasetEvents, EventNumberEntry, RequestTransition};
use crate::models::{Document, Ticket, WorkflowDocument};

/// Canned response for command sequences containing a marker
#[derive(Debug, Clone)]
struct ScriptedResponse {
    marker: String,
    output: CommandOutput,
}

#[derive(Debug, Default)]
struct RemoteState {
    commands: Vec<Vec<String>>,
    uploads: BTreeMap<String, String>,
    files: BTreeMap<String, String>,
    responses: Vec<ScriptedResponse>,
    sessions_opened: usize,
    sessions_closed: usize,
}

/// Remote host fake.
///
/// Every command sequence succeeds with empty output unless a scripted response
/// matches it. Running an uploaded `config_upload.sh` answers with one `DocID`
/// line per `--label` the script uploads, so submissions go through without
/// any scripting.
#[derive(Debug, Clone, Default)]
pub struct ScriptedExecutor {
    state: Arc<Mutex<RemoteState>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every command sequence containing `marker` with `output`
    pub fn respond_to(&self, marker: impl Into<String>, output: CommandOutput) {
        self.state.lock().responses.push(ScriptedResponse {
            marker: marker.into(),
            output,
        });
    }

    /// Make `remote` downloadable
    pub fn put_file(&self, remote: impl Into<String>, content: impl Into<String>) {
        self.state.lock().files.insert(remote.into(), content.into());
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        self.state.lock().commands.clone()
    }

    /// Whether any executed command contains `fragment`
    pub fn ran(&self, fragment: &str) -> bool {
        self.state
            .lock()
            .commands
            .iter()
            .flatten()
            .any(|command| command.contains(fragment))
    }

    pub fn uploaded(&self, remote: &str) -> Option<String> {
        self.state.lock().uploads.get(remote).cloned()
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.lock().sessions_opened
    }

    pub fn sessions_closed(&self) -> usize {
        self.state.lock().sessions_closed
    }
}

fn doc_id_output(upload_script: &str) -> CommandOutput {
    let stdout = upload_script
        .lines()
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            words.find(|word| *word == "--label")?;
            words.next()
        })
        .map(|label| format!("DocID {label} hash_{label}"))
        .collect::<Vec<_>>()
        .join("\n");
    CommandOutput::ok(stdout)
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn open_session(&self) -> Result<Box<dyn RemoteSession>> {
        self.state.lock().sessions_opened += 1;
        Ok(Box::new(ScriptedSession {
            state: Arc::clone(&self.state),
            directory: Mutex::new(String::new()),
        }))
    }
}

/// Session handed out by [`ScriptedExecutor`]
#[derive(Debug)]
pub struct ScriptedSession {
    state: Arc<Mutex<RemoteState>>,
    /// Last `cd` target, used to find uploaded scripts
    directory: Mutex<String>,
}

#[async_trait]
impl RemoteSession for ScriptedSession {
    async fn upload_file(&self, local: &Path, remote: &str) -> Result<()> {
        self.state
            .lock()
            .uploads
            .insert(remote.to_string(), format!("<file {}>", local.display()));
        Ok(())
    }

    async fn upload_content(&self, content: &str, remote: &str) -> Result<()> {
        self.state
            .lock()
            .uploads
            .insert(remote.to_string(), content.to_string());
        Ok(())
    }

    async fn download_as_string(&self, remote: &str) -> Result<String> {
        self.state
            .lock()
            .files
            .get(remote)
            .cloned()
            .ok_or_else(|| RelvalError::RemoteExecution(format!("No such remote file {remote}")))
    }

    async fn execute(&self, commands: &[String]) -> Result<CommandOutput> {
        if let Some(directory) = commands.iter().find_map(|c| c.strip_prefix("cd ")) {
            *self.directory.lock() = directory.trim().to_string();
        }

        let mut state = self.state.lock();
        state.commands.push(commands.to_vec());
        let joined = commands.join("\n");
        if let Some(response) = state
            .responses
            .iter()
            .find(|response| joined.contains(&response.marker))
        {
            return Ok(response.output.clone());
        }

        if commands.iter().any(|c| c.trim() == "./config_upload.sh") {
            let script = format!("{}/config_upload.sh", self.directory.lock());
            if let Some(content) = state.uploads.get(&script) {
                return Ok(doc_id_output(content));
            }
        }
        Ok(CommandOutput::ok(""))
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().sessions_closed += 1;
        Ok(())
    }
}

type SavePredicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// Document store delegating to an [`InMemoryDocumentStore`] whose saves can be
/// made to fail for documents matching a predicate
pub struct FaultyDocumentStore<T: Document> {
    inner: Arc<InMemoryDocumentStore<T>>,
    failing: Mutex<Option<SavePredicate<T>>>,
    failed_saves: AtomicUsize,
}

impl<T: Document> FaultyDocumentStore<T> {
    pub fn new(inner: Arc<InMemoryDocumentStore<T>>) -> Self {
        Self {
            inner,
            failing: Mutex::new(None),
            failed_saves: AtomicUsize::new(0),
        }
    }

    /// Fail every save of a document matching `predicate` from now on
    pub fn fail_saves_where(&self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) {
        *self.failing.lock() = Some(Box::new(predicate));
    }

    pub fn heal(&self) {
        *self.failing.lock() = None;
    }

    pub fn failed_saves(&self) -> usize {
        self.failed_saves.load(Ordering::SeqCst)
    }
}

impl<T: Document> std::fmt::Debug for FaultyDocumentStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultyDocumentStore")
            .field("inner", &self.inner)
            .field("failing", &self.failing.lock().is_some())
            .field("failed_saves", &self.failed_saves())
            .finish()
    }
}

#[async_trait]
impl<T: Document> DocumentStore<T> for FaultyDocumentStore<T> {
    async fn get(&self, prepid: &str) -> Result<Option<T>> {
        self.inner.get(prepid).await
    }

    async fn save(&self, document: &T) -> Result<()> {
        let fails = self
            .failing
            .lock()
            .as_ref()
            .is_some_and(|predicate| predicate(document));
        if fails {
            self.failed_saves.fetch_add(1, Ordering::SeqCst);
            return Err(RelvalError::Storage(format!(
                "{} {} could not be written",
                T::COLLECTION,
                document.prepid()
            )));
        }
        self.inner.save(document).await
    }

    async fn delete(&self, prepid: &str) -> Result<bool> {
        self.inner.delete(prepid).await
    }

    async fn query(
        &self,
        expression: &str,
        sort: Option<&SortOrder>,
        limit: Option<usize>,
    ) -> Result<Vec<T>> {
        self.inner.query(expression, sort, limit).await
    }

    async fn exists(&self, prepid: &str) -> Result<bool> {
        self.inner.exists(prepid).await
    }

    async fn highest_serial_matching(&self, prefix_glob: &str) -> Result<u32> {
        self.inner.highest_serial_matching(prefix_glob).await
    }
}

/// Tracking service fake holding documents by workflow name
#[derive(Debug, Default)]
pub struct FakeTracker {
    documents: Mutex<BTreeMap<String, WorkflowDocument>>,
    refreshed: Mutex<Vec<String>>,
}

impl FakeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, document: WorkflowDocument) {
        self.documents
            .lock()
            .insert(document.request_name.clone(), document);
    }

    pub fn document(&self, name: &str) -> Option<WorkflowDocument> {
        self.documents.lock().get(name).cloned()
    }

    /// Append a status transition to a known workflow
    pub fn transition(&self, name: &str, status: &str) {
        if let Some(document) = self.documents.lock().get_mut(name) {
            let update_time = document
                .request_transition
                .last()
                .map_or(Utc::now().timestamp(), |last| last.update_time + 1);
            document.request_transition.push(RequestTransition {
                status: status.to_string(),
                update_time,
            });
        }
    }

    /// Mark a workflow completed with `(dataset, events)` outputs of access type VALID
    pub fn complete(&self, name: &str, outputs: &[(&str, u64)]) {
        self.transition(name, "completed");
        if let Some(document) = self.documents.lock().get_mut(name) {
            document.output_datasets = outputs.iter().map(|(d, _)| d.to_string()).collect();
            let datasets = outputs
                .iter()
                .map(|(dataset, events)| {
                    (
                        dataset.to_string(),
                        DatasetEvents {
                            events: *events,
                            access_type: "VALID".to_string(),
                        },
                    )
                })
                .collect();
            document.event_number_history.push(EventNumberEntry {
                time: Utc::now().timestamp(),
                datasets,
            });
        }
    }

    pub fn refreshed(&self) -> Vec<String> {
        self.refreshed.lock().clone()
    }
}

#[async_trait]
impl WorkflowTracker for FakeTracker {
    async fn workflows_for(&self, prepid: &str) -> Result<Vec<WorkflowDocument>> {
        Ok(self
            .documents
            .lock()
            .values()
            .filter(|document| document.prepid == prepid)
            .cloned()
            .collect())
    }

    async fn workflow(&self, name: &str) -> Result<Option<WorkflowDocument>> {
        Ok(self.document(name))
    }

    async fn force_refresh(&self, names: &[String]) -> Result<()> {
        self.refreshed.lock().extend(names.iter().cloned());
        Ok(())
    }
}

/// Batch service fake; submitted workflows are registered with the shared tracker
#[derive(Debug)]
pub struct RecordingBatchService {
    tracker: Arc<FakeTracker>,
    counter: AtomicUsize,
    fail_submissions: Mutex<Option<String>>,
    submitted: Mutex<Vec<Value>>,
    approved: Mutex<Vec<String>>,
    status_changes: Mutex<Vec<(String, String)>>,
    priority_changes: Mutex<Vec<(String, u32)>>,
}

impl RecordingBatchService {
    pub fn new(tracker: Arc<FakeTracker>) -> Self {
        Self {
            tracker,
            counter: AtomicUsize::new(0),
            fail_submissions: Mutex::new(None),
            submitted: Mutex::new(Vec::new()),
            approved: Mutex::new(Vec::new()),
            status_changes: Mutex::new(Vec::new()),
            priority_changes: Mutex::new(Vec::new()),
        }
    }

    /// Reject every following submission with `message`
    pub fn fail_submissions(&self, message: impl Into<String>) {
        *self.fail_submissions.lock() = Some(message.into());
    }

    pub fn submitted(&self) -> Vec<Value> {
        self.submitted.lock().clone()
    }

    pub fn approved(&self) -> Vec<String> {
        self.approved.lock().clone()
    }

    pub fn status_changes(&self) -> Vec<(String, String)> {
        self.status_changes.lock().clone()
    }

    pub fn priority_changes(&self) -> Vec<(String, u32)> {
        self.priority_changes.lock().clone()
    }
}

#[async_trait]
impl BatchService for RecordingBatchService {
    async fn submit(&self, job: &Value) -> Result<String> {
        if let Some(message) = self.fail_submissions.lock().clone() {
            return Err(RelvalError::Http(message));
        }
        self.submitted.lock().push(job.clone());

        let prepid = job
            .get("PrepID")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let serial = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let name = format!("pdmvserv_{prepid}_{serial:06}_{:04}", serial % 10_000);
        self.tracker.insert(WorkflowDocument {
            request_name: name.clone(),
            request_type: "TaskChain".to_string(),
            prepid,
            request_transition: vec![RequestTransition {
                status: "new".to_string(),
                update_time: Utc::now().timestamp(),
            }],
            event_number_history: Vec::new(),
            output_datasets: Vec::new(),
        });
        Ok(name)
    }

    async fn approve(&self, workflow: &str) -> Result<()> {
        self.approved.lock().push(workflow.to_string());
        self.tracker.transition(workflow, "assignment-approved");
        Ok(())
    }

    async fn change_status(&self, workflow: &str, status: &str) -> Result<()> {
        self.status_changes
            .lock()
            .push((workflow.to_string(), status.to_string()));
        self.tracker.transition(workflow, status);
        Ok(())
    }

    async fn change_priority(&self, workflow: &str, priority: u32) -> Result<()> {
        self.priority_changes
            .lock()
            .push((workflow.to_string(), priority));
        Ok(())
    }
}

/// Dataset catalog fake with explicit access types.
///
/// Access type lookups can be held open with [`hold_lookups`](Self::hold_lookups)
/// to keep a caller inside its critical section.
#[derive(Debug, Default)]
pub struct FakeCatalog {
    datasets: Mutex<BTreeMap<String, String>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    lookup_started: Notify,
}

impl FakeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, dataset: impl Into<String>, access_type: impl Into<String>) {
        self.datasets
            .lock()
            .insert(dataset.into(), access_type.into());
    }

    /// Block access type lookups until [`release_lookups`](Self::release_lookups)
    pub fn hold_lookups(&self) {
        *self.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_lookups(&self) {
        if let Some(gate) = self.gate.lock().take() {
            gate.close();
        }
    }

    /// Resolves once a lookup is waiting at the gate
    pub async fn lookup_started(&self) {
        self.lookup_started.notified().await;
    }
}

#[async_trait]
impl DatasetCatalog for FakeCatalog {
    async fn access_types(&self, datasets: &[String]) -> Result<HashMap<String, String>> {
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            self.lookup_started.notify_one();
            // Closing the gate releases every waiter
            let _ = gate.acquire().await;
        }

        let known = self.datasets.lock();
        Ok(datasets
            .iter()
            .filter_map(|name| known.get(name).map(|t| (name.clone(), t.clone())))
            .collect())
    }

    async fn list_datasets(&self, pattern: &str) -> Result<Vec<String>> {
        let matcher = glob_to_regex(pattern)?;
        Ok(self
            .datasets
            .lock()
            .keys()
            .filter(|name| matcher.is_match(name))
            .cloned()
            .collect())
    }
}

/// Matrix enumeration fake returning a fixed result
#[derive(Debug, Default)]
pub struct FakeEnumerator {
    workflows: Mutex<EnumeratedWorkflows>,
    calls: AtomicUsize,
}

impl FakeEnumerator {
    pub fn new(workflows: EnumeratedWorkflows) -> Self {
        Self {
            workflows: Mutex::new(workflows),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, workflows: EnumeratedWorkflows) {
        *self.workflows.lock() = workflows;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkflowEnumerator for FakeEnumerator {
    async fn enumerate(&self, _ticket: &Ticket) -> Result<EnumeratedWorkflows> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.workflows.lock().clone())
    }
}

/// One delivered notification
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub subject: String,
    pub body: String,
    pub recipients: Vec<String>,
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentMessage>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    /// Subjects of every notification containing `needle`
    pub fn subjects_containing(&self, needle: &str) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .map(|message| message.subject.clone())
            .filter(|subject| subject.contains(needle))
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, subject: &str, body: &str, recipients: &[String]) -> Result<()> {
        self.sent.lock().push(SentMessage {
            subject: subject.to_string(),
            body: body.to_string(),
            recipients: recipients.to_vec(),
        });
        Ok(())
    }
}

/// Distinct values of a field across recorded jobs
pub fn job_field_values(jobs: &[Value], field: &str) -> HashSet<String> {
    jobs.iter()
        .filter_map(|job| job.get(field))
        .map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect()
}
