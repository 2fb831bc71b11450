//! Cooperative cancellation.
//!
//! A stop only flags the execution. The dispatcher and traversal engine
//! observe the flag between units of work and perform the terminal
//! transition themselves once in-flight units have released their workers.

use std::sync::Arc;

use tracing::info;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::{EventBus, ExecutionEvent};
use crate::registry::{Execution, ExecutionRegistry};
use crate::types::{ExecutionId, JobClass};

pub struct CancellationCoordinator {
    registry: Arc<ExecutionRegistry>,
    events: Arc<EventBus>,
}

impl CancellationCoordinator {
    pub fn new(registry: Arc<ExecutionRegistry>, events: Arc<EventBus>) -> Self {
        Self { registry, events }
    }

    /// Request a stop of `id`. Fails with `NotFound` unless it is running.
    pub async fn stop(&self, id: &ExecutionId) -> OrchestratorResult<()> {
        let execution = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| OrchestratorError::unknown_execution(id))?;
        self.signal(&execution).await
    }

    /// Stop every running execution, or only the one of `job_class`.
    /// Returns the ids that were signalled; `NotFound` if there were none.
    pub async fn stop_running(
        &self,
        job_class: Option<JobClass>,
    ) -> OrchestratorResult<Vec<ExecutionId>> {
        let classes = match job_class {
            Some(class) => vec![class],
            None => vec![JobClass::Bulk, JobClass::Discovery],
        };
        let mut stopped = Vec::new();
        for class in classes {
            if let Some(execution) = self.registry.active(class).await {
                if self.signal(&execution).await.is_ok() {
                    stopped.push(execution.id);
                }
            }
        }
        if stopped.is_empty() {
            return Err(OrchestratorError::NotFound(
                "no running execution to stop".into(),
            ));
        }
        Ok(stopped)
    }

    async fn signal(&self, execution: &Execution) -> OrchestratorResult<()> {
        if !execution.request_stop().await {
            return Err(OrchestratorError::NotFound(format!(
                "execution {} is not running",
                execution.id
            )));
        }
        info!("stop requested for {} execution {}", execution.job_class, execution.id);
        self.events.emit(ExecutionEvent::StopRequested {
            execution_id: execution.id,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::JobTarget;
    use crate::types::{ExecutionConfig, ExecutionStatus};

    async fn running(registry: &ExecutionRegistry) -> Arc<Execution> {
        registry
            .admit(
                JobClass::Bulk,
                ExecutionConfig::default(),
                JobTarget::Bulk {
                    target_count: 1,
                    mode: "extract".into(),
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_stop_flags_and_emits() {
        let registry = Arc::new(ExecutionRegistry::default());
        let events = Arc::new(EventBus::default());
        let mut rx = events.subscribe();
        let coordinator = CancellationCoordinator::new(Arc::clone(&registry), events);
        let exec = running(&registry).await;

        coordinator.stop(&exec.id).await.unwrap();
        assert!(exec.stop_requested());
        // The flag alone does not end the execution.
        assert_eq!(exec.status().await, ExecutionStatus::Running);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ExecutionEvent::StopRequested { execution_id } if execution_id == exec.id));
    }

    #[tokio::test]
    async fn test_stop_terminal_or_unknown_is_not_found() {
        let registry = Arc::new(ExecutionRegistry::default());
        let coordinator =
            CancellationCoordinator::new(Arc::clone(&registry), Arc::new(EventBus::default()));
        let exec = running(&registry).await;
        registry.finish(&exec, ExecutionStatus::Completed, None).await;

        assert!(matches!(
            coordinator.stop(&exec.id).await,
            Err(OrchestratorError::NotFound(_))
        ));
        assert!(matches!(
            coordinator.stop(&uuid::Uuid::new_v4()).await,
            Err(OrchestratorError::NotFound(_))
        ));
        assert!(coordinator.stop_running(None).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_running_by_class() {
        let registry = Arc::new(ExecutionRegistry::default());
        let coordinator =
            CancellationCoordinator::new(Arc::clone(&registry), Arc::new(EventBus::default()));
        let exec = running(&registry).await;

        assert!(coordinator.stop_running(Some(JobClass::Discovery)).await.is_err());
        let stopped = coordinator.stop_running(None).await.unwrap();
        assert_eq!(stopped, vec![exec.id]);
    }
}
