//! Progress and metrics aggregation.
//!
//! Snapshots are computed on request from the execution's live state and
//! never mutate it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::registry::{Execution, ExecutionRegistry, JobTarget};
use crate::types::{ExecutionId, ExecutionStatus, JobClass};

/// Ceiling for a running discovery's estimated progress.
const RUNNING_DISCOVERY_CAP: f64 = 99.0;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressCounts {
    /// Known units (bulk: tasks; discovery: visits scheduled so far).
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub running: usize,
    pub pending: usize,
    pub elements: usize,
    pub interactions: usize,
    pub workflows: usize,
    pub routes: usize,
    pub depth: u32,
}

/// Point-in-time view of an execution's progress.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub execution_id: ExecutionId,
    pub job_class: JobClass,
    pub status: ExecutionStatus,
    pub progress_percent: f64,
    pub counts: ProgressCounts,
    /// Processed units per second since start.
    pub throughput_per_sec: f64,
    pub elapsed_ms: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub stop_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `processed / total * 100`; an empty job counts as done.
pub fn bulk_progress(processed: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    (processed as f64 / total as f64 * 100.0).min(100.0)
}

/// Estimate for discovery, where the total is unknown up front.
///
/// `min(elements / max_elements, depth / max_depth) * 100`, capped below
/// 100 until the execution is terminal. A zero limit counts as reached.
pub fn discovery_progress(
    elements: usize,
    max_elements: usize,
    depth: u32,
    max_depth: u32,
    terminal: bool,
) -> f64 {
    if terminal {
        return 100.0;
    }
    let element_ratio = if max_elements == 0 {
        1.0
    } else {
        elements as f64 / max_elements as f64
    };
    let depth_ratio = if max_depth == 0 {
        1.0
    } else {
        depth as f64 / max_depth as f64
    };
    (element_ratio.min(depth_ratio) * 100.0).min(RUNNING_DISCOVERY_CAP)
}

/// Build a snapshot of one execution.
pub async fn snapshot(execution: &Execution) -> ProgressSnapshot {
    let state = execution.state().await;
    let (elements, interactions, workflows, routes) = {
        let graph = execution.graph().read().await;
        (
            graph.element_count(),
            graph.interaction_count(),
            graph.workflow_count(),
            graph.route_count(),
        )
    };

    let processed = state.processed();
    let terminal = state.status.is_terminal();
    let progress_percent = match execution.job_class {
        JobClass::Bulk => bulk_progress(processed, state.total),
        JobClass::Discovery => discovery_progress(
            elements,
            execution.config.max_elements,
            state.depth,
            execution.config.max_depth,
            terminal,
        ),
    };

    let ended = state.ended_at.unwrap_or_else(Utc::now);
    let elapsed_ms = (ended - state.started_at).num_milliseconds().max(0) as u64;
    let throughput_per_sec = if elapsed_ms == 0 {
        0.0
    } else {
        processed as f64 / (elapsed_ms as f64 / 1000.0)
    };

    let root_url = match &execution.target {
        JobTarget::Discovery { root_url } => Some(root_url.clone()),
        JobTarget::Bulk { .. } => None,
    };

    ProgressSnapshot {
        execution_id: execution.id,
        job_class: execution.job_class,
        status: state.status,
        progress_percent,
        counts: ProgressCounts {
            total: state.total,
            processed,
            succeeded: state.succeeded,
            failed: state.failed,
            running: state.running,
            pending: state.total.saturating_sub(processed + state.running),
            elements,
            interactions,
            workflows,
            routes,
            depth: state.depth,
        },
        throughput_per_sec,
        elapsed_ms,
        started_at: state.started_at,
        ended_at: state.ended_at,
        stop_requested: state.stop_requested,
        root_url,
        error: state.error,
    }
}

/// Looks executions up and snapshots them.
pub struct ProgressAggregator {
    registry: Arc<ExecutionRegistry>,
}

impl ProgressAggregator {
    pub fn new(registry: Arc<ExecutionRegistry>) -> Self {
        Self { registry }
    }

    pub async fn snapshot(&self, id: &ExecutionId) -> OrchestratorResult<ProgressSnapshot> {
        let execution = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| OrchestratorError::unknown_execution(id))?;
        Ok(snapshot(&execution).await)
    }

    /// Snapshots of every execution on record, oldest first.
    pub async fn all(&self) -> Vec<ProgressSnapshot> {
        let mut out = Vec::new();
        for execution in self.registry.list().await {
            out.push(snapshot(&execution).await);
        }
        out
    }
}
