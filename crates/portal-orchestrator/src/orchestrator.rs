//! The `Orchestrator` facade.
//!
//! Wires the registry, admission, worker pools, dispatcher, traversal
//! engine, aggregator, report builder and cancellation coordinator behind
//! one handle. Each admitted execution gets its own worker pool sized to
//! its concurrency, and runs on a spawned tokio task watched by a
//! supervisor that records an `ERROR` if the work panics.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::error;

use crate::admission::{AdmissionController, JobSpec};
use crate::backend::{Backend, Credentials, Extractor, ObservationExtractor};
use crate::cancel::CancellationCoordinator;
use crate::classifier::{ChainClassifier, WorkflowClassifier};
use crate::dispatcher::BulkDispatcher;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::{EventBus, ExecutionEvent};
use crate::metrics::{ProgressAggregator, ProgressSnapshot};
use crate::pool::WorkerPool;
use crate::registry::{Execution, ExecutionRegistry, DEFAULT_HISTORY_LIMIT};
use crate::report::{ElementFilter, ElementPage, Report, ReportBuilder};
use crate::traversal::TraversalEngine;
use crate::types::{ConfigOverrides, ExecutionConfig, ExecutionId, ExecutionStatus, JobClass};

/// Body of a bulk start request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BulkRequest {
    pub targets: Vec<String>,
    pub mode: Option<String>,
    /// `concurrency`, `timeoutMs` and friends, inline.
    #[serde(flatten)]
    pub config: ConfigOverrides,
}

/// Body of a discovery start request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoveryRequest {
    pub root_url: String,
    pub credentials: Option<Credentials>,
    pub config: ConfigOverrides,
}

/// Returned by a successful start.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartReceipt {
    pub execution_id: ExecutionId,
    pub job_class: JobClass,
    pub status: ExecutionStatus,
    pub config: ExecutionConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_count: Option<usize>,
}

/// Occupancy of an execution's worker pool.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub backend: String,
    pub capacity: usize,
    pub in_use: usize,
    pub available: usize,
    pub peak: usize,
}

impl PoolStats {
    fn of(pool: &WorkerPool) -> Self {
        Self {
            backend: pool.backend_name().to_string(),
            capacity: pool.capacity(),
            in_use: pool.in_use(),
            available: pool.available(),
            peak: pool.peak(),
        }
    }
}

pub struct Orchestrator {
    registry: Arc<ExecutionRegistry>,
    events: Arc<EventBus>,
    backend: Arc<dyn Backend>,
    extractor: Arc<dyn Extractor>,
    classifier: Arc<dyn WorkflowClassifier>,
    defaults: ExecutionConfig,
    pools: DashMap<ExecutionId, Arc<WorkerPool>>,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            registry: Arc::new(ExecutionRegistry::new(DEFAULT_HISTORY_LIMIT)),
            events: Arc::new(EventBus::default()),
            backend,
            extractor: Arc::new(ObservationExtractor),
            classifier: Arc::new(ChainClassifier::default()),
            defaults: ExecutionConfig::default(),
            pools: DashMap::new(),
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn WorkflowClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Replaces the registry, so call before starting anything.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.registry = Arc::new(ExecutionRegistry::new(limit));
        self
    }

    /// Baseline configuration that request overrides are layered onto.
    pub fn with_defaults(mut self, defaults: ExecutionConfig) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn defaults(&self) -> &ExecutionConfig {
        &self.defaults
    }

    pub fn registry(&self) -> &Arc<ExecutionRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    // ── Start ─────────────────────────────────────────

    pub async fn start_bulk(&self, request: BulkRequest) -> OrchestratorResult<StartReceipt> {
        let spec = JobSpec::Bulk {
            targets: request.targets,
            mode: request.mode.unwrap_or_default(),
        };
        self.start(spec, &request.config).await
    }

    pub async fn start_discovery(
        &self,
        request: DiscoveryRequest,
    ) -> OrchestratorResult<StartReceipt> {
        let spec = JobSpec::Discovery {
            root_url: request.root_url,
            credentials: request.credentials,
        };
        self.start(spec, &request.config).await
    }

    /// Admit `spec` and launch its work in the background.
    pub async fn start(
        &self,
        spec: JobSpec,
        overrides: &ConfigOverrides,
    ) -> OrchestratorResult<StartReceipt> {
        let config = overrides.resolve(&self.defaults)?;
        // Build the pool before admission claims the class slot.
        let credentials = match &spec {
            JobSpec::Discovery { credentials, .. } => credentials.clone(),
            JobSpec::Bulk { .. } => None,
        };
        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&self.backend),
            config.concurrency,
            credentials,
        ));
        let (execution, spec) = AdmissionController::new(Arc::clone(&self.registry))
            .begin(spec, config)
            .await?;
        self.prune_pools().await;

        let mut receipt = StartReceipt {
            execution_id: execution.id,
            job_class: execution.job_class,
            status: ExecutionStatus::Running,
            config: execution.config.clone(),
            root_url: None,
            target_count: None,
        };

        self.pools.insert(execution.id, Arc::clone(&pool));

        self.events.emit(ExecutionEvent::ExecutionStarted {
            execution_id: execution.id,
            job_class: execution.job_class,
            timestamp: Utc::now().to_rfc3339(),
        });

        let work: JoinHandle<ExecutionStatus> = match spec {
            JobSpec::Bulk { targets, mode } => {
                receipt.target_count = Some(targets.len());
                let dispatcher = BulkDispatcher::new(
                    Arc::clone(&self.registry),
                    Arc::clone(&self.extractor),
                    Arc::clone(&self.events),
                );
                let execution = Arc::clone(&execution);
                tokio::spawn(async move { dispatcher.dispatch(execution, pool, targets, mode).await })
            }
            JobSpec::Discovery { root_url, .. } => {
                receipt.root_url = Some(root_url.clone());
                let engine = TraversalEngine::new(
                    Arc::clone(&self.registry),
                    Arc::clone(&self.classifier),
                    Arc::clone(&self.events),
                );
                let execution = Arc::clone(&execution);
                tokio::spawn(async move { engine.run(execution, pool, root_url).await })
            }
        };
        self.supervise(execution, work);
        Ok(receipt)
    }

    /// Record `ERROR` if the execution's task dies without finishing it.
    fn supervise(&self, execution: Arc<Execution>, work: JoinHandle<ExecutionStatus>) {
        let registry = Arc::clone(&self.registry);
        let events = Arc::clone(&self.events);
        tokio::spawn(async move {
            let Err(e) = work.await else {
                return;
            };
            let reason = format!("execution task failed: {e}");
            error!("{} {reason}", execution.id);
            if registry
                .finish(&execution, ExecutionStatus::Error, Some(reason.clone()))
                .await
            {
                events.emit(ExecutionEvent::ExecutionFinished {
                    execution_id: execution.id,
                    job_class: execution.job_class,
                    status: ExecutionStatus::Error,
                    elapsed_ms: (Utc::now() - execution.created_at)
                        .num_milliseconds()
                        .max(0) as u64,
                    error: Some(reason),
                });
            }
        });
    }

    /// Drop pools whose executions fell out of history.
    async fn prune_pools(&self) {
        let live: HashSet<ExecutionId> = self.registry.list().await.iter().map(|e| e.id).collect();
        self.pools.retain(|id, _| live.contains(id));
    }

    // ── Query ─────────────────────────────────────────

    pub async fn status(&self, id: &ExecutionId) -> OrchestratorResult<ProgressSnapshot> {
        ProgressAggregator::new(Arc::clone(&self.registry))
            .snapshot(id)
            .await
    }

    /// Snapshots of every execution on record, oldest first.
    pub async fn statuses(&self) -> Vec<ProgressSnapshot> {
        ProgressAggregator::new(Arc::clone(&self.registry)).all().await
    }

    pub async fn latest(&self, job_class: Option<JobClass>) -> Option<ExecutionId> {
        self.registry.latest(job_class).await.map(|e| e.id)
    }

    pub fn pool_stats(&self, id: &ExecutionId) -> Option<PoolStats> {
        self.pools.get(id).map(|pool| PoolStats::of(&pool))
    }

    pub async fn report(&self, id: &ExecutionId) -> OrchestratorResult<Arc<Report>> {
        ReportBuilder::new(Arc::clone(&self.registry)).report(id).await
    }

    pub async fn latest_report(&self, job_class: Option<JobClass>) -> OrchestratorResult<Arc<Report>> {
        ReportBuilder::new(Arc::clone(&self.registry))
            .latest(job_class)
            .await
    }

    pub async fn elements(
        &self,
        id: &ExecutionId,
        filter: &ElementFilter,
        limit: usize,
        offset: usize,
    ) -> OrchestratorResult<ElementPage> {
        ReportBuilder::new(Arc::clone(&self.registry))
            .elements(id, filter, limit, offset)
            .await
    }

    // ── Control ───────────────────────────────────────

    pub async fn stop(&self, id: &ExecutionId) -> OrchestratorResult<()> {
        self.cancellation().stop(id).await
    }

    pub async fn stop_running(
        &self,
        job_class: Option<JobClass>,
    ) -> OrchestratorResult<Vec<ExecutionId>> {
        self.cancellation().stop_running(job_class).await
    }

    /// Resolve once `id` is terminal and return its final snapshot.
    pub async fn wait(&self, id: &ExecutionId) -> OrchestratorResult<ProgressSnapshot> {
        let execution = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| OrchestratorError::unknown_execution(id))?;
        execution.wait_terminal().await;
        Ok(crate::metrics::snapshot(&execution).await)
    }

    fn cancellation(&self) -> CancellationCoordinator {
        CancellationCoordinator::new(Arc::clone(&self.registry), Arc::clone(&self.events))
    }
}
