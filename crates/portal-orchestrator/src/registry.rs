//! Execution registry: canonical state of every execution on record.
//!
//! The registry owns the per-class "active" slot and the history of
//! terminal executions. Admission (check-and-create) and terminal
//! transitions (state change plus slot eviction) both happen under the
//! registry mutex, so two same-class executions can never be admitted
//! concurrently.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{watch, Mutex, OnceCell, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::graph::DiscoveryGraph;
use crate::report::Report;
use crate::types::{ExecutionConfig, ExecutionId, ExecutionStatus, JobClass, Task, TaskState};

/// Default number of terminal executions kept on record.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Mutable lifecycle and counters, guarded by one lock so every read is a
/// consistent snapshot.
#[derive(Debug, Clone)]
pub struct ExecutionState {
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub stop_requested: bool,
    /// Units known up front (bulk) or scheduled so far (discovery).
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub running: usize,
    /// Frontier layer currently being explored (discovery).
    pub depth: u32,
}

impl ExecutionState {
    /// Units that reached a terminal per-unit state.
    pub fn processed(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// Descriptor of what an execution works on. Never carries credentials.
#[derive(Debug, Clone, PartialEq)]
pub enum JobTarget {
    Bulk { target_count: usize, mode: String },
    Discovery { root_url: String },
}

/// One run of a job, from admission to its terminal state.
pub struct Execution {
    pub id: ExecutionId,
    pub job_class: JobClass,
    pub config: ExecutionConfig,
    pub target: JobTarget,
    pub created_at: DateTime<Utc>,
    state: RwLock<ExecutionState>,
    tasks: DashMap<String, Task>,
    graph: RwLock<DiscoveryGraph>,
    stop: CancellationToken,
    finished: watch::Sender<bool>,
    final_report: OnceCell<Arc<Report>>,
}

impl Execution {
    fn new(id: ExecutionId, job_class: JobClass, config: ExecutionConfig, target: JobTarget) -> Self {
        let now = Utc::now();
        let (finished, _) = watch::channel(false);
        let max_elements = config.max_elements;
        Self {
            id,
            job_class,
            config,
            target,
            created_at: now,
            state: RwLock::new(ExecutionState {
                status: ExecutionStatus::Running,
                started_at: now,
                ended_at: None,
                error: None,
                stop_requested: false,
                total: 0,
                succeeded: 0,
                failed: 0,
                running: 0,
                depth: 0,
            }),
            tasks: DashMap::new(),
            graph: RwLock::new(DiscoveryGraph::new(max_elements)),
            stop: CancellationToken::new(),
            finished,
            final_report: OnceCell::new(),
        }
    }

    pub async fn state(&self) -> ExecutionState {
        self.state.read().await.clone()
    }

    pub async fn status(&self) -> ExecutionStatus {
        self.state.read().await.status
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Flag a cooperative stop. Returns false if the execution is already terminal.
    pub async fn request_stop(&self) -> bool {
        let mut state = self.state.write().await;
        if state.status.is_terminal() {
            return false;
        }
        state.stop_requested = true;
        self.stop.cancel();
        true
    }

    /// Resolves once the execution has reached a terminal state.
    pub async fn wait_terminal(&self) {
        let mut rx = self.finished.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Move to a terminal status. Terminal states are sinks: returns false
    /// and changes nothing if the execution already left `Running`.
    async fn transition(&self, status: ExecutionStatus, error: Option<String>) -> bool {
        let mut state = self.state.write().await;
        if state.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        state.status = status;
        state.ended_at = Some(Utc::now());
        state.error = error;
        state.running = 0;
        drop(state);
        self.finished.send_replace(true);
        true
    }

    // ── Bulk task bookkeeping ─────────────────────────

    /// Create one `Pending` task per target.
    pub async fn register_tasks(&self, targets: &[String]) {
        for (seq, target) in targets.iter().enumerate() {
            self.tasks.insert(target.clone(), Task::pending(seq, target));
        }
        self.state.write().await.total = targets.len();
    }

    pub async fn task_started(&self, target: &str) {
        if let Some(mut task) = self.tasks.get_mut(target) {
            task.state = TaskState::Running;
            task.started_at = Some(Utc::now());
        }
        self.state.write().await.running += 1;
    }

    /// Record a task's terminal state. `was_running` is false when the task
    /// failed before a worker was obtained.
    pub async fn task_finished(
        &self,
        target: &str,
        result: Result<serde_json::Value, String>,
        was_running: bool,
    ) {
        let succeeded = result.is_ok();
        if let Some(mut task) = self.tasks.get_mut(target) {
            task.ended_at = Some(Utc::now());
            match result {
                Ok(value) => {
                    task.state = TaskState::Done;
                    task.result = Some(value);
                }
                Err(reason) => {
                    task.state = TaskState::Failed;
                    task.failure = Some(reason);
                }
            }
        }
        let mut state = self.state.write().await;
        if was_running {
            state.running = state.running.saturating_sub(1);
        }
        if succeeded {
            state.succeeded += 1;
        } else {
            state.failed += 1;
        }
    }

    pub fn task(&self, target: &str) -> Option<Task> {
        self.tasks.get(target).map(|t| t.clone())
    }

    /// All tasks in submission order.
    pub fn tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.iter().map(|t| t.value().clone()).collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }

    // ── Discovery bookkeeping ─────────────────────────

    pub fn graph(&self) -> &RwLock<DiscoveryGraph> {
        &self.graph
    }

    pub async fn set_depth(&self, depth: u32) {
        self.state.write().await.depth = depth;
    }

    pub async fn visits_scheduled(&self, count: usize) {
        self.state.write().await.total += count;
    }

    pub async fn visit_started(&self) {
        self.state.write().await.running += 1;
    }

    pub async fn visit_finished(&self, success: bool, was_running: bool) {
        let mut state = self.state.write().await;
        if was_running {
            state.running = state.running.saturating_sub(1);
        }
        if success {
            state.succeeded += 1;
        } else {
            state.failed += 1;
        }
    }

    pub(crate) fn final_report(&self) -> &OnceCell<Arc<Report>> {
        &self.final_report
    }
}

#[derive(Default)]
struct RegistryInner {
    executions: HashMap<ExecutionId, Arc<Execution>>,
    /// Admission order, oldest first.
    order: Vec<ExecutionId>,
    active: HashMap<JobClass, ExecutionId>,
    /// Terminal executions, oldest first.
    retired: VecDeque<ExecutionId>,
}

/// Holds every execution on record behind a single synchronization point.
pub struct ExecutionRegistry {
    inner: Mutex<RegistryInner>,
    history_limit: usize,
}

impl ExecutionRegistry {
    pub fn new(history_limit: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            history_limit: history_limit.max(1),
        }
    }

    /// Atomically check the class slot and register a new running execution.
    pub async fn admit(
        &self,
        job_class: JobClass,
        config: ExecutionConfig,
        target: JobTarget,
    ) -> OrchestratorResult<Arc<Execution>> {
        let mut inner = self.inner.lock().await;

        if let Some(active) = inner.active.get(&job_class).copied() {
            let still_running = match inner.executions.get(&active) {
                Some(execution) => !execution.status().await.is_terminal(),
                None => false,
            };
            if still_running {
                return Err(OrchestratorError::Conflict { job_class, active });
            }
            inner.active.remove(&job_class);
        }

        let id = uuid::Uuid::new_v4();
        let execution = Arc::new(Execution::new(id, job_class, config, target));
        inner.executions.insert(id, Arc::clone(&execution));
        inner.order.push(id);
        inner.active.insert(job_class, id);
        info!("admitted {job_class} execution {id}");
        Ok(execution)
    }

    /// Transition to a terminal status and free the class slot.
    pub async fn finish(
        &self,
        execution: &Execution,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> bool {
        let mut inner = self.inner.lock().await;
        if !execution.transition(status, error).await {
            return false;
        }
        if inner.active.get(&execution.job_class) == Some(&execution.id) {
            inner.active.remove(&execution.job_class);
        }
        inner.retired.push_back(execution.id);
        while inner.retired.len() > self.history_limit {
            if let Some(evicted) = inner.retired.pop_front() {
                inner.executions.remove(&evicted);
                inner.order.retain(|id| *id != evicted);
            }
        }
        info!("{} execution {} finished: {status}", execution.job_class, execution.id);
        true
    }

    pub async fn get(&self, id: &ExecutionId) -> Option<Arc<Execution>> {
        self.inner.lock().await.executions.get(id).cloned()
    }

    /// The non-terminal execution of `job_class`, if any.
    pub async fn active(&self, job_class: JobClass) -> Option<Arc<Execution>> {
        let inner = self.inner.lock().await;
        let id = inner.active.get(&job_class)?;
        inner.executions.get(id).cloned()
    }

    /// Most recently admitted execution, optionally restricted to a class.
    pub async fn latest(&self, job_class: Option<JobClass>) -> Option<Arc<Execution>> {
        let inner = self.inner.lock().await;
        inner
            .order
            .iter()
            .rev()
            .filter_map(|id| inner.executions.get(id))
            .find(|e| job_class.map_or(true, |c| e.job_class == c))
            .cloned()
    }

    /// Every execution on record, oldest first.
    pub async fn list(&self) -> Vec<Arc<Execution>> {
        let inner = self.inner.lock().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.executions.get(id).cloned())
            .collect()
    }
}

impl Default for ExecutionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}
