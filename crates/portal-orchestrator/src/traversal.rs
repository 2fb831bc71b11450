//! Traversal engine: breadth-first, depth-bounded discovery of one target.
//!
//! The frontier is explored one layer at a time. Points within a layer are
//! visited in parallel up to the execution's concurrency; the depth counter
//! only advances once the whole layer is exhausted, so an element's level is
//! always the depth of the point where it was first seen.
//!
//! The loop stops when the frontier empties, the next layer would exceed
//! `max_depth`, the element ceiling is reached, a stop is requested, or too
//! many visits fail in a row.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{NavPoint, Observation};
use crate::classifier::WorkflowClassifier;
use crate::error::OrchestratorError;
use crate::events::{EventBus, ExecutionEvent};
use crate::graph::VisitFailure;
use crate::pool::WorkerPool;
use crate::registry::{Execution, ExecutionRegistry};
use crate::types::{ExecutionStatus, UnitOutcome};

/// Runs discovery executions.
pub struct TraversalEngine {
    registry: Arc<ExecutionRegistry>,
    classifier: Arc<dyn WorkflowClassifier>,
    events: Arc<EventBus>,
}

/// Running tallies for one traversal.
#[derive(Debug, Default)]
struct Tally {
    visited: usize,
    failed: usize,
    consecutive_failures: u32,
    abort: Option<String>,
}

impl TraversalEngine {
    pub fn new(
        registry: Arc<ExecutionRegistry>,
        classifier: Arc<dyn WorkflowClassifier>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            registry,
            classifier,
            events,
        }
    }

    /// Explore from `root_url` and move the execution to its terminal state.
    pub async fn run(
        &self,
        execution: Arc<Execution>,
        pool: Arc<WorkerPool>,
        root_url: String,
    ) -> ExecutionStatus {
        let started = Instant::now();
        let config = &execution.config;
        info!(
            "discovering {root_url} for {} (max_depth={}, max_elements={}, concurrency={})",
            execution.id, config.max_depth, config.max_elements, config.concurrency
        );

        // Cancelled on stop (as a child of the stop token) and on abort.
        let halt = execution.stop_token().child_token();
        let mut seen_points: HashSet<String> = HashSet::from([root_url.clone()]);
        let mut layer = vec![NavPoint::root(root_url)];
        let mut depth = 0u32;
        let mut tally = Tally::default();

        loop {
            if layer.is_empty() || depth > config.max_depth || halt.is_cancelled() {
                break;
            }
            if execution.graph().read().await.is_full() {
                debug!("element ceiling reached before depth {depth}");
                break;
            }

            execution.set_depth(depth).await;
            execution.visits_scheduled(layer.len()).await;
            let mut next_layer = Vec::new();

            let mut visits = stream::iter(std::mem::take(&mut layer))
                .map(|point| self.visit(&execution, &pool, &halt, point))
                .buffer_unordered(config.concurrency);

            while let Some((point, outcome)) = visits.next().await {
                match outcome {
                    UnitOutcome::Succeeded(observation) => {
                        tally.visited += 1;
                        tally.consecutive_failures = 0;
                        let new_elements = self
                            .absorb(&execution, &point, &observation, &mut seen_points, &mut next_layer)
                            .await;
                        if execution.graph().read().await.is_full() {
                            halt.cancel();
                        }
                        self.visit_event(&execution, &point, true, new_elements);
                    }
                    UnitOutcome::TimedOut(reason) => {
                        tally.failed += 1;
                        warn!("visit {} timed out: {reason}", point.url);
                        self.record_failure(&execution, &point, reason, true).await;
                        self.visit_event(&execution, &point, false, 0);
                    }
                    UnitOutcome::Failed(reason) => {
                        tally.failed += 1;
                        tally.consecutive_failures += 1;
                        warn!(
                            "visit {} failed ({} in a row): {reason}",
                            point.url, tally.consecutive_failures
                        );
                        self.record_failure(&execution, &point, reason, false).await;
                        self.visit_event(&execution, &point, false, 0);
                        if tally.consecutive_failures >= config.max_consecutive_failures
                            && tally.abort.is_none()
                        {
                            tally.abort = Some(format!(
                                "aborted after {} consecutive visit failures",
                                tally.consecutive_failures
                            ));
                            halt.cancel();
                        }
                    }
                    UnitOutcome::Skipped => {}
                }
            }
            drop(visits);

            let elements = execution.graph().read().await.element_count();
            self.events.emit(ExecutionEvent::LayerCompleted {
                execution_id: execution.id,
                depth,
                elements,
                next_layer: next_layer.len(),
            });
            debug!(
                "layer {depth} done: {elements} elements, {} points queued",
                next_layer.len()
            );

            layer = next_layer;
            depth += 1;
        }

        let (status, error) = if execution.stop_requested() {
            (ExecutionStatus::Stopped, None)
        } else if let Some(reason) = tally.abort {
            (ExecutionStatus::Error, Some(reason))
        } else if tally.visited == 0 && tally.failed > 0 {
            (
                ExecutionStatus::Error,
                Some(format!("all {} visits failed", tally.failed)),
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

    /// Visit one point on a leased worker. The worker is released before
    /// returning, whatever the outcome.
    async fn visit(
        &self,
        execution: &Execution,
        pool: &WorkerPool,
        halt: &CancellationToken,
        point: NavPoint,
    ) -> (NavPoint, UnitOutcome<Observation>) {
        if halt.is_cancelled() {
            return (point, UnitOutcome::Skipped);
        }

        let mut worker = match pool.acquire(execution.config.acquire_deadline()).await {
            Ok(worker) => worker,
            Err(e) => {
                execution.visit_finished(false, false).await;
                let outcome = match e {
                    OrchestratorError::AcquireTimeout(_) => UnitOutcome::TimedOut(e.to_string()),
                    _ => UnitOutcome::Failed(e.to_string()),
                };
                return (point, outcome);
            }
        };
        if halt.is_cancelled() {
            worker.release().await;
            return (point, UnitOutcome::Skipped);
        }

        execution.visit_started().await;
        debug!("visiting {} (depth {}) on worker {}", point.url, point.depth, worker.lease_id());

        let timeout = execution.config.timeout;
        let outcome = match worker.session_mut() {
            Some(session) => match tokio::time::timeout(timeout, session.act_within(&point)).await {
                Ok(Ok(observation)) => UnitOutcome::Succeeded(observation),
                Ok(Err(e)) => UnitOutcome::Failed(format!("{e:#}")),
                Err(_) => UnitOutcome::TimedOut(format!("timed out after {}ms", timeout.as_millis())),
            },
            None => UnitOutcome::Failed("worker has no open session".into()),
        };
        worker.release().await;

        let success = matches!(outcome, UnitOutcome::Succeeded(_));
        execution.visit_finished(success, true).await;
        (point, outcome)
    }

    /// Merge an observation, infer workflows and queue unseen points for
    /// the next layer. Returns the number of newly registered elements.
    async fn absorb(
        &self,
        execution: &Execution,
        point: &NavPoint,
        observation: &Observation,
        seen_points: &mut HashSet<String>,
        next_layer: &mut Vec<NavPoint>,
    ) -> usize {
        let mut graph = execution.graph().write().await;
        let outcome = graph.merge(point, observation);
        if outcome.truncated > 0 {
            debug!(
                "element ceiling dropped {} elements at {}",
                outcome.truncated, point.url
            );
        }

        let workflows = self.classifier.classify(&graph, &outcome.touched);
        let new_workflows = graph.add_workflows(workflows);
        drop(graph);

        for next in outcome.next_points {
            if seen_points.insert(next.url.clone()) {
                next_layer.push(next);
            }
        }
        if new_workflows > 0 {
            debug!("{new_workflows} workflows inferred at {}", point.url);
        }
        outcome.new_elements.len()
    }

    async fn record_failure(&self, execution: &Execution, point: &NavPoint, reason: String, timed_out: bool) {
        execution.graph().write().await.record_failure(VisitFailure {
            point: point.url.clone(),
            depth: point.depth,
            reason,
            timed_out,
        });
    }

    fn visit_event(&self, execution: &Execution, point: &NavPoint, success: bool, new_elements: usize) {
        self.events.emit(ExecutionEvent::VisitFinished {
            execution_id: execution.id,
            point: point.url.clone(),
            depth: point.depth,
            success,
            new_elements,
        });
    }
}
