//! Bulk task dispatcher: runs one extraction per target under the
//! execution's concurrency bound.

use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::backend::Extractor;
use crate::events::{EventBus, ExecutionEvent};
use crate::pool::WorkerPool;
use crate::registry::{Execution, ExecutionRegistry};
use crate::types::{ExecutionStatus, TaskState, UnitOutcome};

/// Schedules bulk tasks onto a worker pool.
pub struct BulkDispatcher {
    registry: Arc<ExecutionRegistry>,
    extractor: Arc<dyn Extractor>,
    events: Arc<EventBus>,
}

impl BulkDispatcher {
    pub fn new(
        registry: Arc<ExecutionRegistry>,
        extractor: Arc<dyn Extractor>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            registry,
            extractor,
            events,
        }
    }

    /// Create a task per target, run them all, then move the execution to
    /// its terminal state.
    ///
    /// A stop is observed before each task acquires a worker; tasks that
    /// never started stay `Pending`. The execution ends `Stopped` if a stop
    /// was requested, `Error` if every task failed, `Completed` otherwise.
    pub async fn dispatch(
        &self,
        execution: Arc<Execution>,
        pool: Arc<WorkerPool>,
        targets: Vec<String>,
        mode: String,
    ) -> ExecutionStatus {
        let started = Instant::now();
        execution.register_tasks(&targets).await;
        info!(
            "dispatching {} tasks for {} (concurrency={}, mode={mode})",
            targets.len(),
            execution.id,
            execution.config.concurrency
        );

        let outcomes: Vec<UnitOutcome<()>> = stream::iter(targets)
            .map(|target| self.run_task(&execution, &pool, target, &mode))
            .buffer_unordered(execution.config.concurrency)
            .collect()
            .await;

        let skipped = outcomes
            .iter()
            .filter(|o| matches!(o, UnitOutcome::Skipped))
            .count();
        let state = execution.state().await;
        let (status, error) = if execution.stop_requested() {
            info!("{} stopped with {skipped} tasks never started", execution.id);
            (ExecutionStatus::Stopped, None)
        } else if state.total > 0 && state.failed == state.total {
            (
                ExecutionStatus::Error,
                Some(format!("all {} tasks failed", state.total)),
            )
        } else {
            (ExecutionStatus::Completed, None)
        };

        self.registry
            .finish(&execution, status, error.clone())
            .await;
        self.events.emit(ExecutionEvent::ExecutionFinished {
            execution_id: execution.id,
            job_class: execution.job_class,
            status,
            elapsed_ms: started.elapsed().as_millis() as u64,
            error,
        });
        status
    }

    async fn run_task(
        &self,
        execution: &Execution,
        pool: &WorkerPool,
        target: String,
        mode: &str,
    ) -> UnitOutcome<()> {
        if execution.stop_requested() {
            return UnitOutcome::Skipped;
        }
        let started = Instant::now();

        let mut worker = match pool.acquire(execution.config.acquire_deadline()).await {
            Ok(worker) => worker,
            Err(e) => {
                let reason = e.to_string();
                warn!("task {target} could not get a worker: {reason}");
                execution
                    .task_finished(&target, Err(reason.clone()), false)
                    .await;
                self.task_event(execution, &target, TaskState::Failed, started);
                return UnitOutcome::Failed(reason);
            }
        };

        // Stop may have landed while we waited for capacity.
        if execution.stop_requested() {
            worker.release().await;
            return UnitOutcome::Skipped;
        }

        execution.task_started(&target).await;
        debug!("task {target} running on worker {}", worker.lease_id());

        let timeout = execution.config.timeout;
        let mut timed_out = false;
        let result = match worker.session_mut() {
            Some(session) => {
                match tokio::time::timeout(timeout, self.extractor.extract(session, &target, mode))
                    .await
                {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(format!("{e:#}")),
                    Err(_) => {
                        timed_out = true;
                        Err(format!("timed out after {}ms", timeout.as_millis()))
                    }
                }
            }
            None => Err("worker has no open session".to_string()),
        };
        worker.release().await;

        let outcome = match &result {
            Ok(_) => UnitOutcome::Succeeded(()),
            Err(reason) if timed_out => UnitOutcome::TimedOut(reason.clone()),
            Err(reason) => UnitOutcome::Failed(reason.clone()),
        };
        let state = if result.is_ok() {
            TaskState::Done
        } else {
            TaskState::Failed
        };
        if let Err(reason) = &result {
            warn!("task {target} failed: {reason}");
        }
        execution.task_finished(&target, result, true).await;
        self.task_event(execution, &target, state, started);
        outcome
    }

    fn task_event(&self, execution: &Execution, target: &str, state: TaskState, started: Instant) {
        self.events.emit(ExecutionEvent::TaskFinished {
            execution_id: execution.id,
            target: target.to_string(),
            state,
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
    }
}
