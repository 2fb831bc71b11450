//! Admission control: validates a job request and registers it as the one
//! running execution of its class.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::backend::Credentials;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::registry::{Execution, ExecutionRegistry, JobTarget};
use crate::types::{ExecutionConfig, JobClass};

/// Default bulk mode label forwarded to the extractor.
pub const DEFAULT_BULK_MODE: &str = "extract";

/// What a new execution should work on.
#[derive(Debug, Clone)]
pub enum JobSpec {
    Bulk {
        targets: Vec<String>,
        mode: String,
    },
    Discovery {
        root_url: String,
        credentials: Option<Credentials>,
    },
}

impl JobSpec {
    pub fn job_class(&self) -> JobClass {
        match self {
            JobSpec::Bulk { .. } => JobClass::Bulk,
            JobSpec::Discovery { .. } => JobClass::Discovery,
        }
    }

    /// Trim and check the request. Duplicate bulk targets collapse into the
    /// first occurrence.
    fn normalize(self) -> OrchestratorResult<Self> {
        match self {
            JobSpec::Bulk { targets, mode } => {
                if targets.is_empty() {
                    return Err(OrchestratorError::Validation(
                        "targets must not be empty".into(),
                    ));
                }
                let mut seen = HashSet::new();
                let mut unique = Vec::with_capacity(targets.len());
                for (i, target) in targets.iter().enumerate() {
                    let target = target.trim();
                    if target.is_empty() {
                        return Err(OrchestratorError::Validation(format!(
                            "target at position {i} is blank"
                        )));
                    }
                    if seen.insert(target.to_string()) {
                        unique.push(target.to_string());
                    }
                }
                if unique.len() < targets.len() {
                    warn!("dropped {} duplicate targets", targets.len() - unique.len());
                }
                let mode = match mode.trim() {
                    "" => DEFAULT_BULK_MODE.to_string(),
                    m => m.to_string(),
                };
                Ok(JobSpec::Bulk {
                    targets: unique,
                    mode,
                })
            }
            JobSpec::Discovery {
                root_url,
                credentials,
            } => {
                let root_url = root_url.trim().to_string();
                if root_url.is_empty() {
                    return Err(OrchestratorError::Validation(
                        "rootUrl must not be empty".into(),
                    ));
                }
                Ok(JobSpec::Discovery {
                    root_url,
                    credentials,
                })
            }
        }
    }

    fn describe(&self) -> JobTarget {
        match self {
            JobSpec::Bulk { targets, mode } => JobTarget::Bulk {
                target_count: targets.len(),
                mode: mode.clone(),
            },
            JobSpec::Discovery { root_url, .. } => JobTarget::Discovery {
                root_url: root_url.clone(),
            },
        }
    }
}

/// Decides whether a new execution may start.
pub struct AdmissionController {
    registry: Arc<ExecutionRegistry>,
}

impl AdmissionController {
    pub fn new(registry: Arc<ExecutionRegistry>) -> Self {
        Self { registry }
    }

    /// Validate `spec` and `config`, then atomically register a running
    /// execution. Returns the execution and the normalized spec.
    ///
    /// Nothing is mutated on `Validation` or `Conflict`.
    pub async fn begin(
        &self,
        spec: JobSpec,
        config: ExecutionConfig,
    ) -> OrchestratorResult<(Arc<Execution>, JobSpec)> {
        config.validate()?;
        let spec = spec.normalize()?;
        let job_class = spec.job_class();
        let execution = self
            .registry
            .admit(job_class, config, spec.describe())
            .await
            .inspect_err(|e| {
                if let OrchestratorError::Conflict { active, .. } = e {
                    info!("rejected {job_class} start: {active} still running");
                }
            })?;
        Ok((execution, spec))
    }
}
