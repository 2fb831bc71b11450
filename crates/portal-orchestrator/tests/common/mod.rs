//! Scripted in-memory backend shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use portal_orchestrator::{
    Backend, Credentials, NavPoint, Observation, ObservedElement, ObservedInteraction, Session,
};

/// Start or end of one `act_within` call.
#[derive(Debug, Clone, PartialEq)]
pub enum Mark {
    Start(String),
    End(String),
}

/// What the backend returns for each point.
#[derive(Default)]
pub struct Script {
    pub pages: HashMap<String, Observation>,
    pub failing: HashSet<String>,
    pub hanging: HashSet<String>,
    pub delay: Duration,
}

impl Script {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn page(mut self, observation: Observation) -> Self {
        self.pages.insert(observation.url.clone(), observation);
        self
    }

    pub fn failing(mut self, url: &str) -> Self {
        self.failing.insert(url.to_string());
        self
    }

    pub fn hanging(mut self, url: &str) -> Self {
        self.hanging.insert(url.to_string());
        self
    }
}

/// Counters observed across every session.
#[derive(Default)]
pub struct Probe {
    active: AtomicUsize,
    pub peak: AtomicUsize,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub marks: Mutex<Vec<Mark>>,
}

impl Probe {
    pub fn marks(&self) -> Vec<Mark> {
        self.marks.lock().unwrap().clone()
    }

    /// How many times `url` was visited.
    pub fn visits(&self, url: &str) -> usize {
        self.marks()
            .iter()
            .filter(|m| matches!(m, Mark::Start(u) if u == url))
            .count()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub struct ScriptedBackend {
    script: Arc<Script>,
    pub probe: Arc<Probe>,
}

impl ScriptedBackend {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Arc::new(script),
            probe: Arc::new(Probe::default()),
        })
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn open_session(&self, _credentials: Option<&Credentials>) -> anyhow::Result<Box<dyn Session>> {
        self.probe.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            script: Arc::clone(&self.script),
            probe: Arc::clone(&self.probe),
        }))
    }
}

struct ScriptedSession {
    script: Arc<Script>,
    probe: Arc<Probe>,
}

/// Keeps `Probe::active` right even when a visit is cancelled by a timeout.
struct ActiveGuard(Arc<Probe>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Session for ScriptedSession {
    async fn act_within(&mut self, point: &NavPoint) -> anyhow::Result<Observation> {
        let active = self.probe.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.peak.fetch_max(active, Ordering::SeqCst);
        let _guard = ActiveGuard(Arc::clone(&self.probe));
        self.probe
            .marks
            .lock()
            .unwrap()
            .push(Mark::Start(point.url.clone()));

        if self.script.hanging.contains(&point.url) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        tokio::time::sleep(self.script.delay).await;

        self.probe
            .marks
            .lock()
            .unwrap()
            .push(Mark::End(point.url.clone()));
        if self.script.failing.contains(&point.url) {
            anyhow::bail!("scripted failure at {}", point.url);
        }
        Ok(self
            .script
            .pages
            .get(&point.url)
            .cloned()
            .unwrap_or_else(|| Observation {
                url: point.url.clone(),
                ..Default::default()
            }))
    }

    async fn close(self: Box<Self>) -> anyhow::Result<()> {
        self.probe.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A page whose elements are plain links, each with a `navigate` interaction.
pub fn links(url: &str, targets: &[&str]) -> Observation {
    let mut observation = Observation {
        url: url.to_string(),
        ..Default::default()
    };
    for target in targets {
        push_link(&mut observation, target);
    }
    observation
}

pub fn push_link(observation: &mut Observation, target: &str) -> usize {
    observation.elements.push(ObservedElement {
        kind: "link".into(),
        locator: format!("a[href='{target}']"),
        label: Some(target.to_string()),
        target: Some(target.to_string()),
        attributes: Default::default(),
    });
    let index = observation.elements.len() - 1;
    observation.interactions.push(ObservedInteraction {
        element: index,
        action: "navigate".into(),
        label: None,
        target: Some(target.to_string()),
    });
    index
}

/// Add an element of `kind` with a single interaction and no target.
pub fn push_control(observation: &mut Observation, kind: &str, locator: &str, action: &str) -> usize {
    observation.elements.push(ObservedElement {
        kind: kind.into(),
        locator: locator.into(),
        label: None,
        target: None,
        attributes: Default::default(),
    });
    let index = observation.elements.len() - 1;
    observation.interactions.push(ObservedInteraction {
        element: index,
        action: action.into(),
        label: None,
        target: None,
    });
    index
}

pub fn url(path: &str) -> String {
    format!("https://portal.test{path}")
}
