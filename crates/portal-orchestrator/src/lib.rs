//! Portal orchestrator — execution orchestration engine for bulk extraction and structure discovery over a pool of backend sessions.

pub mod admission;
pub mod backend;
pub mod cancel;
pub mod classifier;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod graph;
pub mod metrics;
pub mod orchestrator;
pub mod pool;
pub mod registry;
pub mod report;
pub mod traversal;
pub mod types;

pub use admission::{AdmissionController, JobSpec};
pub use backend::{
    Backend, Credentials, Extractor, NavPoint, NoopBackend, Observation, ObservationExtractor,
    ObservedElement, ObservedInteraction, Session,
};
pub use cancel::CancellationCoordinator;
pub use classifier::{ChainClassifier, WorkflowClassifier};
pub use error::{OrchestratorError, OrchestratorResult};
pub use events::{EventBus, ExecutionEvent};
pub use graph::{DiscoveredElement, DiscoveryGraph, Fingerprint, Interaction, Route, Workflow};
pub use metrics::{ProgressAggregator, ProgressSnapshot};
pub use orchestrator::{BulkRequest, DiscoveryRequest, Orchestrator, PoolStats, StartReceipt};
pub use pool::{Worker, WorkerPool};
pub use registry::{Execution, ExecutionRegistry};
pub use report::{ElementFilter, ElementPage, Report, ReportBuilder, DEFAULT_ELEMENT_LIMIT};
pub use types::*;
