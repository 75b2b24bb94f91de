//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use crate::checkpoint::ResumePoint;
use crate::error::AppError;
use crate::failed_queue::FailedTask;
use crate::models::{HttpResponse, OutboundRequest, Route};
use crate::runs::{CollectionRun, RunStatus};
use crate::traits::{CheckpointStore, FailedTaskStore, ItemLedger, RunStore, Transport};
use crate::worker::{BatchEvent, BatchReporter};

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

/// Rebuild an error for replay; mocks hand out the same scripted error many times.
fn replay(result: &Result<HttpResponse, AppError>) -> Result<HttpResponse, AppError> {
    match result {
        Ok(response) => Ok(response.clone()),
        Err(AppError::NetworkError(msg)) => Err(AppError::NetworkError(msg.clone())),
        Err(AppError::Timeout(secs)) => Err(AppError::Timeout(*secs)),
        Err(e) => Err(AppError::HttpError(e.to_string())),
    }
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Mock transport that returns scripted responses and records every call.
#[derive(Clone)]
pub struct MockTransport {
    /// Queue of responses. Each call pops the first element.
    /// If empty, returns `default`.
    responses: Arc<Mutex<VecDeque<Result<HttpResponse, AppError>>>>,
    default: Arc<Mutex<Result<HttpResponse, AppError>>>,
    /// Fixed status per URL, checked before the queue.
    statuses: Arc<Mutex<HashMap<String, u16>>>,
    latency: Option<Duration>,
    calls: Arc<Mutex<Vec<(OutboundRequest, Route)>>>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl MockTransport {
    pub fn new(responses: Vec<Result<HttpResponse, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            default: Arc::new(Mutex::new(Ok(HttpResponse::new(200, "default")))),
            statuses: Arc::new(Mutex::new(HashMap::new())),
            latency: None,
            calls: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Transport answering every call with `result`.
    pub fn always(result: Result<HttpResponse, AppError>) -> Self {
        let transport = Self::new(vec![]);
        transport.set_default(result);
        transport
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_status_for(self, url: &str, status: u16) -> Self {
        self.statuses.lock().unwrap().insert(url.to_string(), status);
        self
    }

    pub fn set_default(&self, result: Result<HttpResponse, AppError>) {
        *self.default.lock().unwrap() = result;
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.calls.lock().unwrap().iter().map(|(r, _)| r.clone()).collect()
    }

    pub fn routes(&self) -> Vec<Route> {
        self.calls.lock().unwrap().iter().map(|(_, r)| r.clone()).collect()
    }

    /// Most calls observed in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    async fn send(&self, request: &OutboundRequest, route: &Route) -> Result<HttpResponse, AppError> {
        self.calls
            .lock()
            .unwrap()
            .push((request.clone(), route.clone()));

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlight(self.in_flight.clone());

        let result = if let Some(status) = self.statuses.lock().unwrap().get(&request.url) {
            Ok(HttpResponse::new(*status, ""))
        } else {
            let next = self.responses.lock().unwrap().pop_front();
            next.unwrap_or_else(|| replay(&self.default.lock().unwrap()))
        };

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        result
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Collections {
    checkpoints: HashMap<String, ResumePoint>,
    pending: HashMap<String, FailedTask>,
    dead_letters: HashMap<String, FailedTask>,
    runs: HashMap<Uuid, CollectionRun>,
}

/// In-memory checkpoint, failed-task and run store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    collections: Arc<Mutex<Collections>>,
    checkpoint_writes: Arc<AtomicUsize>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful checkpoint saves.
    pub fn checkpoint_writes(&self) -> usize {
        self.checkpoint_writes.load(Ordering::SeqCst)
    }

    /// Make every write fail with `PersistenceError` until switched off.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), AppError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(AppError::PersistenceError("disk full".to_string()))
        } else {
            Ok(())
        }
    }
}

impl CheckpointStore for MemoryStore {
    async fn load_checkpoint(&self, task_type: &str) -> Result<Option<ResumePoint>, AppError> {
        // let concurrent writers interleave like a real backend would
        tokio::task::yield_now().await;
        Ok(self.collections.lock().unwrap().checkpoints.get(task_type).cloned())
    }

    async fn save_checkpoint(&self, point: &ResumePoint) -> Result<(), AppError> {
        self.check_writable()?;
        self.collections
            .lock()
            .unwrap()
            .checkpoints
            .insert(point.task_type.clone(), point.clone());
        self.checkpoint_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_checkpoints(&self) -> Result<Vec<ResumePoint>, AppError> {
        let mut points: Vec<_> = self
            .collections
            .lock()
            .unwrap()
            .checkpoints
            .values()
            .cloned()
            .collect();
        points.sort_by(|a, b| a.task_type.cmp(&b.task_type));
        Ok(points)
    }
}

impl FailedTaskStore for MemoryStore {
    async fn get_task(&self, task_id: &str) -> Result<Option<FailedTask>, AppError> {
        Ok(self.collections.lock().unwrap().pending.get(task_id).cloned())
    }

    async fn upsert_task(&self, task: &FailedTask) -> Result<(), AppError> {
        self.check_writable()?;
        self.collections
            .lock()
            .unwrap()
            .pending
            .insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    async fn remove_task(&self, task_id: &str) -> Result<bool, AppError> {
        self.check_writable()?;
        Ok(self.collections.lock().unwrap().pending.remove(task_id).is_some())
    }

    async fn list_pending(&self) -> Result<Vec<FailedTask>, AppError> {
        let mut tasks: Vec<_> = self
            .collections
            .lock()
            .unwrap()
            .pending
            .values()
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.next_retry_time);
        Ok(tasks)
    }

    async fn dead_letter(&self, task: &FailedTask) -> Result<(), AppError> {
        self.check_writable()?;
        let mut collections = self.collections.lock().unwrap();
        collections.pending.remove(&task.task_id);
        collections
            .dead_letters
            .insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    async fn list_dead_letters(&self) -> Result<Vec<FailedTask>, AppError> {
        let mut tasks: Vec<_> = self
            .collections
            .lock()
            .unwrap()
            .dead_letters
            .values()
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(tasks)
    }
}

impl RunStore for MemoryStore {
    async fn put_run(&self, run: &CollectionRun) -> Result<(), AppError> {
        self.check_writable()?;
        self.collections
            .lock()
            .unwrap()
            .runs
            .insert(run.run_id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<CollectionRun>, AppError> {
        Ok(self.collections.lock().unwrap().runs.get(&run_id).cloned())
    }

    async fn list_runs(&self, status: Option<RunStatus>) -> Result<Vec<CollectionRun>, AppError> {
        let mut runs: Vec<_> = self
            .collections
            .lock()
            .unwrap()
            .runs
            .values()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.started_at);
        Ok(runs)
    }
}

// ---------------------------------------------------------------------------
// MockLedger
// ---------------------------------------------------------------------------

/// Mock item ledger: natural keys stored per task type, duplicates allowed.
#[derive(Clone, Default)]
pub struct MockLedger {
    items: Arc<Mutex<HashMap<String, Vec<String>>>>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store_item(&self, task_type: &str, key: &str) {
        self.items
            .lock()
            .unwrap()
            .entry(task_type.to_string())
            .or_default()
            .push(key.to_string());
    }

    pub fn contains_key(&self, task_type: &str, key: &str) -> bool {
        self.items
            .lock()
            .unwrap()
            .get(task_type)
            .is_some_and(|keys| keys.iter().any(|k| k == key))
    }
}

impl ItemLedger for MockLedger {
    async fn count(&self, task_type: &str) -> Result<Option<u64>, AppError> {
        let items = self.items.lock().unwrap();
        Ok(Some(items.get(task_type).map_or(0, |keys| keys.len() as u64)))
    }

    async fn duplicates(&self, task_type: &str) -> Result<Vec<String>, AppError> {
        let items = self.items.lock().unwrap();
        let mut seen: HashMap<&str, usize> = HashMap::new();
        for key in items.get(task_type).into_iter().flatten() {
            *seen.entry(key.as_str()).or_default() += 1;
        }
        let mut duplicates: Vec<String> = seen
            .into_iter()
            .filter(|(_, n)| *n > 1)
            .map(|(k, _)| k.to_string())
            .collect();
        duplicates.sort();
        Ok(duplicates)
    }

    async fn contains(&self, task_type: &str, target: &str) -> Result<bool, AppError> {
        Ok(self.contains_key(task_type, target))
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Mock batch reporter that records event names.
#[derive(Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BatchReporter for MockReporter {
    fn report(&self, event: BatchEvent<'_>) {
        let label = match &event {
            BatchEvent::Started { .. } => "Started",
            BatchEvent::ItemSucceeded { .. } => "ItemSucceeded",
            BatchEvent::ItemQueued { .. } => "ItemQueued",
            BatchEvent::ItemFailed { .. } => "ItemFailed",
            BatchEvent::Cancelled { .. } => "Cancelled",
            BatchEvent::Finished { .. } => "Finished",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}
