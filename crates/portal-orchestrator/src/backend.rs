//! Execution backend capability.
//!
//! Defines the `Backend` and `Session` traits that abstract over whatever
//! actually drives a portal (an HTTP client, a headless browser, a test
//! script). The engine only opens sessions, acts within them and closes
//! them; it never depends on how a backend renders or extracts content.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::graph::Fingerprint;

/// Opaque login material forwarded to `Backend::open_session`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A navigable point handed to `Session::act_within`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavPoint {
    pub url: String,
    /// Distance from the traversal root (root is 0).
    pub depth: u32,
    /// The element whose target led here. `None` for the root.
    pub via: Option<Fingerprint>,
}

impl NavPoint {
    pub fn root(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            depth: 0,
            via: None,
        }
    }
}

/// An element as reported by the backend, before fingerprinting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservedElement {
    /// Type tag, e.g. `link`, `form`, `button`, `input`.
    pub kind: String,
    /// Structural locator (CSS path, accessibility path, ...).
    pub locator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Navigable point this element leads to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

/// An action discoverable on an observed element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedInteraction {
    /// Index into `Observation::elements`.
    pub element: usize,
    /// Action verb, e.g. `navigate`, `click`, `fill`, `submit`.
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Everything a single `act_within` call observed at one point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Final URL after any redirects.
    pub url: String,
    pub elements: Vec<ObservedElement>,
    pub interactions: Vec<ObservedInteraction>,
}

/// An execution backend that can open isolated sessions.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name used in logs and the status endpoint.
    fn name(&self) -> &str;
    /// Open a new isolated session.
    async fn open_session(&self, credentials: Option<&Credentials>) -> Result<Box<dyn Session>>;
}

/// A single backend session.
#[async_trait]
pub trait Session: Send {
    /// Act within the session at `point` and report what was found.
    async fn act_within(&mut self, point: &NavPoint) -> Result<Observation>;
    /// Tear the session down.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// The per-target unit of work run by the bulk dispatcher.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        session: &mut dyn Session,
        target: &str,
        mode: &str,
    ) -> Result<serde_json::Value>;
}

/// Default extractor: visit the target and return the raw observation.
pub struct ObservationExtractor;

#[async_trait]
impl Extractor for ObservationExtractor {
    async fn extract(
        &self,
        session: &mut dyn Session,
        target: &str,
        mode: &str,
    ) -> Result<serde_json::Value> {
        let observation = session.act_within(&NavPoint::root(target)).await?;
        Ok(serde_json::json!({
            "mode": mode,
            "url": observation.url,
            "elementCount": observation.elements.len(),
            "interactionCount": observation.interactions.len(),
            "elements": observation.elements,
            "interactions": observation.interactions,
        }))
    }
}

/// A backend used when no real backend is configured.
///
/// Every session open fails, so executions still run their full
/// lifecycle and end in `ERROR` with per-unit failure reasons.
pub struct NoopBackend;

#[async_trait]
impl Backend for NoopBackend {
    fn name(&self) -> &str {
        "noop"
    }

    async fn open_session(&self, _credentials: Option<&Credentials>) -> Result<Box<dyn Session>> {
        Err(anyhow::anyhow!("no execution backend configured"))
    }
}
