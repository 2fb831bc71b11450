//! Report assembly and filtered element views.
//!
//! Reports of running executions are partial and rebuilt on every read.
//! Once an execution is terminal its report is built once and frozen.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::graph::{DiscoveredElement, Route, VisitFailure, Workflow};
use crate::metrics;
use crate::registry::{Execution, ExecutionRegistry, JobTarget};
use crate::types::{ExecutionConfig, ExecutionId, ExecutionStatus, JobClass, Task};

/// Default page size for element listings.
pub const DEFAULT_ELEMENT_LIMIT: usize = 100;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportMetadata {
    pub execution_id: ExecutionId,
    pub job_class: JobClass,
    pub status: ExecutionStatus,
    /// True while the execution is still running.
    pub partial: bool,
    pub config: ExecutionConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub generated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub progress_percent: f64,
    pub elements: usize,
    pub interactions: usize,
    pub workflows: usize,
    pub routes: usize,
    pub max_level: u32,
}

/// Structured view of one execution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub metadata: ReportMetadata,
    pub summary: ReportSummary,
    pub tasks: Vec<Task>,
    pub elements: Vec<DiscoveredElement>,
    pub workflows: Vec<Workflow>,
    pub routes: Vec<Route>,
    pub failures: Vec<VisitFailure>,
}

/// Exact-match element predicates. `None` matches everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ElementFilter {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub level: Option<u32>,
}

impl ElementFilter {
    pub fn matches(&self, element: &DiscoveredElement) -> bool {
        self.kind.as_deref().map_or(true, |k| element.kind == k)
            && self.level.map_or(true, |l| element.level == l)
    }
}

/// One page of filtered elements.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementPage {
    pub execution_id: ExecutionId,
    pub elements: Vec<DiscoveredElement>,
    /// Matches before pagination.
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

async fn build(execution: &Execution) -> Report {
    let snapshot = metrics::snapshot(execution).await;
    let graph = execution.graph().read().await.clone();

    let (root_url, mode) = match &execution.target {
        JobTarget::Discovery { root_url } => (Some(root_url.clone()), None),
        JobTarget::Bulk { mode, .. } => (None, Some(mode.clone())),
    };

    Report {
        metadata: ReportMetadata {
            execution_id: execution.id,
            job_class: execution.job_class,
            status: snapshot.status,
            partial: !snapshot.status.is_terminal(),
            config: execution.config.clone(),
            root_url,
            mode,
            started_at: snapshot.started_at,
            ended_at: snapshot.ended_at,
            duration_ms: snapshot.elapsed_ms,
            generated_at: Utc::now(),
            error: snapshot.error,
        },
        summary: ReportSummary {
            total: snapshot.counts.total,
            processed: snapshot.counts.processed,
            succeeded: snapshot.counts.succeeded,
            failed: snapshot.counts.failed,
            progress_percent: snapshot.progress_percent,
            elements: graph.element_count(),
            interactions: graph.interaction_count(),
            workflows: graph.workflow_count(),
            routes: graph.route_count(),
            max_level: graph.deepest_level(),
        },
        tasks: execution.tasks(),
        routes: graph.routes(),
        elements: graph.elements().to_vec(),
        workflows: graph.workflows().to_vec(),
        failures: graph.failures().to_vec(),
    }
}

/// Serves reports and element views from the registry.
pub struct ReportBuilder {
    registry: Arc<ExecutionRegistry>,
}

impl ReportBuilder {
    pub fn new(registry: Arc<ExecutionRegistry>) -> Self {
        Self { registry }
    }

    async fn lookup(&self, id: &ExecutionId) -> OrchestratorResult<Arc<Execution>> {
        self.registry
            .get(id)
            .await
            .ok_or_else(|| OrchestratorError::unknown_execution(id))
    }

    /// Report for `id`: partial while running, frozen once terminal.
    pub async fn report(&self, id: &ExecutionId) -> OrchestratorResult<Arc<Report>> {
        let execution = self.lookup(id).await?;
        Ok(report_for(&execution).await)
    }

    /// Report for the most recently admitted execution, optionally of one class.
    pub async fn latest(&self, job_class: Option<JobClass>) -> OrchestratorResult<Arc<Report>> {
        let execution = self
            .registry
            .latest(job_class)
            .await
            .ok_or_else(|| OrchestratorError::NotFound("no execution on record".into()))?;
        Ok(report_for(&execution).await)
    }

    /// Filtered, paginated elements of `id`. An empty page is not an error.
    pub async fn elements(
        &self,
        id: &ExecutionId,
        filter: &ElementFilter,
        limit: usize,
        offset: usize,
    ) -> OrchestratorResult<ElementPage> {
        let execution = self.lookup(id).await?;
        let graph = execution.graph().read().await;
        let matching: Vec<&DiscoveredElement> =
            graph.elements().iter().filter(|e| filter.matches(e)).collect();
        let total = matching.len();
        let elements = matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        Ok(ElementPage {
            execution_id: execution.id,
            elements,
            total,
            limit,
            offset,
        })
    }
}

async fn report_for(execution: &Execution) -> Arc<Report> {
    if let Some(frozen) = execution.final_report().get() {
        return Arc::clone(frozen);
    }
    if execution.status().await.is_terminal() {
        let frozen = execution
            .final_report()
            .get_or_init(|| async { Arc::new(build(execution).await) })
            .await;
        return Arc::clone(frozen);
    }
    Arc::new(build(execution).await)
}
