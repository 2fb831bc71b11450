//! Core data types shared by every orchestration component.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, OrchestratorResult};

/// Opaque execution identifier, issued at admission time.
pub type ExecutionId = uuid::Uuid;

/// Default number of consecutive visit failures tolerated before a
/// discovery traversal aborts.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Largest accepted `concurrency`. Each unit in flight holds its own
/// backend session.
pub const MAX_CONCURRENCY: usize = 1024;

/// The two workload shapes. At most one non-terminal execution per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobClass {
    /// Many independent targets, one task each.
    Bulk,
    /// One depth-bounded traversal building an element graph.
    Discovery,
}

impl fmt::Display for JobClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bulk => write!(f, "BULK"),
            Self::Discovery => write!(f, "DISCOVERY"),
        }
    }
}

impl FromStr for JobClass {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bulk" => Ok(Self::Bulk),
            "discovery" | "mapper" => Ok(Self::Discovery),
            other => Err(OrchestratorError::Validation(format!(
                "unknown job class '{other}'"
            ))),
        }
    }
}

/// Execution lifecycle. Every state except `Running` is a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Error,
    Stopped,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Error => write!(f, "ERROR"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Per-task state: `Pending -> Running -> {Done, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Running,
    Done,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Typed execution configuration, snapshotted onto each execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionConfig {
    /// Maximum units of work in flight at once.
    pub concurrency: usize,
    /// Deepest frontier layer visited (root is depth 0). Discovery only.
    pub max_depth: u32,
    /// Ceiling on recorded elements. Discovery only.
    pub max_elements: usize,
    /// Budget for a single unit of work.
    #[serde(rename = "timeoutMs", with = "duration_ms")]
    pub timeout: Duration,
    /// Deadline for obtaining a worker. Defaults to `timeout`.
    #[serde(
        rename = "acquireTimeoutMs",
        with = "opt_duration_ms",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub acquire_timeout: Option<Duration>,
    /// Consecutive non-timeout visit failures before a traversal aborts.
    pub max_consecutive_failures: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_depth: 3,
            max_elements: 500,
            timeout: Duration::from_secs(30),
            acquire_timeout: None,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
        }
    }
}

impl ExecutionConfig {
    /// Effective deadline for `WorkerPool::acquire`.
    pub fn acquire_deadline(&self) -> Duration {
        self.acquire_timeout.unwrap_or(self.timeout)
    }

    /// Check the constraints that the type system cannot express.
    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.concurrency < 1 {
            return Err(OrchestratorError::Validation(
                "concurrency must be at least 1".into(),
            ));
        }
        if self.concurrency > MAX_CONCURRENCY {
            return Err(OrchestratorError::Validation(format!(
                "concurrency must be at most {MAX_CONCURRENCY}, got {}",
                self.concurrency
            )));
        }
        if self.timeout.is_zero() {
            return Err(OrchestratorError::Validation(
                "timeout must be positive".into(),
            ));
        }
        if matches!(self.acquire_timeout, Some(d) if d.is_zero()) {
            return Err(OrchestratorError::Validation(
                "acquire timeout must be positive".into(),
            ));
        }
        if self.max_consecutive_failures < 1 {
            return Err(OrchestratorError::Validation(
                "max consecutive failures must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Caller-supplied partial configuration, layered over server defaults.
///
/// Fields are signed so that out-of-range input is reported as a
/// validation error instead of a deserialization failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigOverrides {
    pub concurrency: Option<i64>,
    pub max_depth: Option<i64>,
    pub max_elements: Option<i64>,
    pub timeout_ms: Option<i64>,
    pub acquire_timeout_ms: Option<i64>,
    pub max_consecutive_failures: Option<i64>,
}

impl ConfigOverrides {
    /// Apply these overrides on top of `base` and validate the result.
    pub fn resolve(&self, base: &ExecutionConfig) -> OrchestratorResult<ExecutionConfig> {
        let mut config = base.clone();
        if let Some(v) = self.concurrency {
            config.concurrency = non_negative("concurrency", v)? as usize;
        }
        if let Some(v) = self.max_depth {
            let depth = non_negative("maxDepth", v)?;
            config.max_depth = u32::try_from(depth).map_err(|_| {
                OrchestratorError::Validation(format!("maxDepth {depth} is out of range"))
            })?;
        }
        if let Some(v) = self.max_elements {
            config.max_elements = non_negative("maxElements", v)? as usize;
        }
        if let Some(v) = self.timeout_ms {
            config.timeout = Duration::from_millis(non_negative("timeoutMs", v)?);
        }
        if let Some(v) = self.acquire_timeout_ms {
            config.acquire_timeout = Some(Duration::from_millis(non_negative(
                "acquireTimeoutMs",
                v,
            )?));
        }
        if let Some(v) = self.max_consecutive_failures {
            let n = non_negative("maxConsecutiveFailures", v)?;
            config.max_consecutive_failures = u32::try_from(n).unwrap_or(u32::MAX);
        }
        config.validate()?;
        Ok(config)
    }
}

fn non_negative(field: &str, value: i64) -> OrchestratorResult<u64> {
    u64::try_from(value)
        .map_err(|_| OrchestratorError::Validation(format!("{field} must be non-negative, got {value}")))
}

/// One unit of bulk work bound to a single target key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Position of the target in the submitted list.
    pub seq: usize,
    pub target: String,
    pub state: TaskState,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl Task {
    pub fn pending(seq: usize, target: &str) -> Self {
        Self {
            seq,
            target: target.to_string(),
            state: TaskState::Pending,
            started_at: None,
            ended_at: None,
            result: None,
            failure: None,
        }
    }
}

/// Outcome of a single unit of work (task or visit).
#[derive(Debug, Clone)]
pub enum UnitOutcome<T> {
    Succeeded(T),
    Failed(String),
    TimedOut(String),
    /// Never started because a stop or abort was observed first.
    Skipped,
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

pub(crate) mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
