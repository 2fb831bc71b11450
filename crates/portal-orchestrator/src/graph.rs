//! Discovery graph: deduplicated elements, their interactions, inferred
//! workflows and the routes that reach each element.
//!
//! Elements are keyed by a content-derived [`Fingerprint`] so revisiting a
//! point never creates a duplicate record. Interaction lists are append-only
//! and merged idempotently.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::hash::Hasher;

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};

use crate::backend::{NavPoint, Observation, ObservedElement, ObservedInteraction};

/// Content-derived identity, rendered as 16 hex digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash an ordered list of parts. Parts are length-prefixed so
    /// `["ab", "c"]` and `["a", "bc"]` never collide structurally.
    pub fn of(parts: &[&str]) -> Self {
        let mut hasher = FnvHasher::default();
        for part in parts {
            hasher.write_usize(part.len());
            hasher.write(part.as_bytes());
        }
        Self(format!("{:016x}", hasher.finish()))
    }

    /// Structural signature of an observed element: type, locator, target.
    pub fn of_element(element: &ObservedElement) -> Self {
        Self::of(&[
            &element.kind,
            &element.locator,
            element.target.as_deref().unwrap_or(""),
        ])
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An action discovered on an element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    pub id: Fingerprint,
    /// Owning element.
    pub element: Fingerprint,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// A deduplicated element in the discovery graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredElement {
    pub id: Fingerprint,
    #[serde(rename = "type")]
    pub kind: String,
    /// Depth of the point where the element was first seen.
    pub level: u32,
    /// Element whose target led to `found_at`. Lookup only.
    pub parent: Option<Fingerprint>,
    /// Point at which the element was first observed.
    pub found_at: String,
    pub locator: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub attributes: BTreeMap<String, String>,
    pub interactions: Vec<Interaction>,
}

impl DiscoveredElement {
    /// Append `interaction` unless an identical one is already recorded.
    fn merge_interaction(&mut self, interaction: Interaction) -> bool {
        if self.interactions.iter().any(|i| i.id == interaction.id) {
            return false;
        }
        self.interactions.push(interaction);
        true
    }
}

/// An ordered chain of interactions forming a multi-step process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: Fingerprint,
    pub name: String,
    /// Interaction ids in execution order.
    pub steps: Vec<Fingerprint>,
    /// Elements the steps act on, in the same order.
    pub elements: Vec<Fingerprint>,
}

/// Path of elements from the root to `element`, inclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub element: Fingerprint,
    pub path: Vec<Fingerprint>,
}

/// A point that could not be visited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitFailure {
    pub point: String,
    pub depth: u32,
    pub reason: String,
    pub timed_out: bool,
}

/// What a single merge changed.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// Elements registered for the first time, in observation order.
    pub new_elements: Vec<Fingerprint>,
    /// Every element seen in this observation (new or revisited).
    pub touched: Vec<Fingerprint>,
    pub new_interactions: usize,
    /// Targets of newly registered elements.
    pub next_points: Vec<NavPoint>,
    /// Elements dropped because the ceiling was reached.
    pub truncated: usize,
}

/// The live graph of one discovery execution.
#[derive(Debug, Clone)]
pub struct DiscoveryGraph {
    elements: Vec<DiscoveredElement>,
    index: HashMap<Fingerprint, usize>,
    interaction_count: usize,
    workflows: Vec<Workflow>,
    workflow_ids: HashSet<Fingerprint>,
    routes: HashMap<Fingerprint, Route>,
    failures: Vec<VisitFailure>,
    max_elements: usize,
}

impl DiscoveryGraph {
    pub fn new(max_elements: usize) -> Self {
        Self {
            elements: Vec::new(),
            index: HashMap::new(),
            interaction_count: 0,
            workflows: Vec::new(),
            workflow_ids: HashSet::new(),
            routes: HashMap::new(),
            failures: Vec::new(),
            max_elements,
        }
    }

    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    pub fn interaction_count(&self) -> usize {
        self.interaction_count
    }

    pub fn workflow_count(&self) -> usize {
        self.workflows.len()
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn is_full(&self) -> bool {
        self.elements.len() >= self.max_elements
    }

    pub fn get(&self, id: &Fingerprint) -> Option<&DiscoveredElement> {
        self.index.get(id).map(|&i| &self.elements[i])
    }

    /// Elements in discovery order.
    pub fn elements(&self) -> &[DiscoveredElement] {
        &self.elements
    }

    pub fn workflows(&self) -> &[Workflow] {
        &self.workflows
    }

    pub fn failures(&self) -> &[VisitFailure] {
        &self.failures
    }

    pub fn route(&self, id: &Fingerprint) -> Option<&Route> {
        self.routes.get(id)
    }

    /// Routes ordered like their elements.
    pub fn routes(&self) -> Vec<Route> {
        self.elements
            .iter()
            .filter_map(|e| self.routes.get(&e.id).cloned())
            .collect()
    }

    pub fn deepest_level(&self) -> u32 {
        self.elements.iter().map(|e| e.level).max().unwrap_or(0)
    }

    /// Fold one observation made at `point` into the graph.
    pub fn merge(&mut self, point: &NavPoint, observation: &Observation) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        let mut per_element: HashMap<usize, Vec<&ObservedInteraction>> = HashMap::new();
        for interaction in &observation.interactions {
            if interaction.element < observation.elements.len() {
                per_element
                    .entry(interaction.element)
                    .or_default()
                    .push(interaction);
            } else {
                tracing::warn!(
                    "dropping interaction '{}' at {}: element index {} out of range",
                    interaction.action,
                    point.url,
                    interaction.element
                );
            }
        }

        for (idx, observed) in observation.elements.iter().enumerate() {
            let id = Fingerprint::of_element(observed);

            let existing = self.index.get(&id).copied();
            let slot = match existing {
                Some(slot) => slot,
                None => {
                    if self.is_full() {
                        outcome.truncated += 1;
                        continue;
                    }
                    self.register(point, observed, &id);
                    outcome.new_elements.push(id.clone());
                    if let Some(target) = &observed.target {
                        outcome.next_points.push(NavPoint {
                            url: target.clone(),
                            depth: point.depth + 1,
                            via: Some(id.clone()),
                        });
                    }
                    self.elements.len() - 1
                }
            };

            if let Some(interactions) = per_element.get(&idx) {
                for observed_interaction in interactions {
                    let interaction = Interaction {
                        id: Fingerprint::of(&[
                            id.as_str(),
                            &observed_interaction.action,
                            observed_interaction.target.as_deref().unwrap_or(""),
                        ]),
                        element: id.clone(),
                        action: observed_interaction.action.clone(),
                        label: observed_interaction.label.clone(),
                        target: observed_interaction.target.clone(),
                    };
                    if self.elements[slot].merge_interaction(interaction) {
                        self.interaction_count += 1;
                        outcome.new_interactions += 1;
                    }
                }
            }

            if !outcome.touched.contains(&id) {
                outcome.touched.push(id);
            }
        }

        outcome
    }

    fn register(&mut self, point: &NavPoint, observed: &ObservedElement, id: &Fingerprint) {
        let parent = point.via.clone();
        let mut path = parent
            .as_ref()
            .and_then(|p| self.routes.get(p))
            .map(|r| r.path.clone())
            .unwrap_or_default();
        path.push(id.clone());
        self.routes.insert(
            id.clone(),
            Route {
                element: id.clone(),
                path,
            },
        );

        self.index.insert(id.clone(), self.elements.len());
        self.elements.push(DiscoveredElement {
            id: id.clone(),
            kind: observed.kind.clone(),
            level: point.depth,
            parent,
            found_at: point.url.clone(),
            locator: observed.locator.clone(),
            label: observed.label.clone(),
            target: observed.target.clone(),
            attributes: observed.attributes.clone(),
            interactions: Vec::new(),
        });
    }

    /// Record inferred workflows, skipping ones already known. Returns how
    /// many were new.
    pub fn add_workflows(&mut self, workflows: Vec<Workflow>) -> usize {
        let mut added = 0;
        for workflow in workflows {
            if self.workflow_ids.insert(workflow.id.clone()) {
                self.workflows.push(workflow);
                added += 1;
            }
        }
        added
    }

    pub fn record_failure(&mut self, failure: VisitFailure) {
        self.failures.push(failure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(locator: &str, target: &str) -> ObservedElement {
        ObservedElement {
            kind: "link".into(),
            locator: locator.into(),
            label: Some(locator.into()),
            target: Some(target.into()),
            attributes: BTreeMap::new(),
        }
    }

    fn observation(elements: Vec<ObservedElement>, interactions: Vec<ObservedInteraction>) -> Observation {
        Observation {
            url: "https://portal.test/".into(),
            elements,
            interactions,
        }
    }

    fn navigate(element: usize, target: &str) -> ObservedInteraction {
        ObservedInteraction {
            element,
            action: "navigate".into(),
            label: None,
            target: Some(target.into()),
        }
    }

    #[test]
    fn test_fingerprint_is_stable_and_length_prefixed() {
        assert_eq!(Fingerprint::of(&["a", "b"]), Fingerprint::of(&["a", "b"]));
        assert_ne!(Fingerprint::of(&["ab", "c"]), Fingerprint::of(&["a", "bc"]));
        assert_eq!(Fingerprint::of(&["x"]).as_str().len(), 16);
    }

    #[test]
    fn test_merge_registers_root_elements_at_level_zero() {
        let mut graph = DiscoveryGraph::new(10);
        let root = NavPoint::root("https://portal.test/");
        let outcome = graph.merge(
            &root,
            &observation(vec![link("a#1", "https://portal.test/a")], vec![]),
        );
        assert_eq!(outcome.new_elements.len(), 1);
        assert_eq!(outcome.next_points.len(), 1);
        assert_eq!(outcome.next_points[0].depth, 1);
        let element = &graph.elements()[0];
        assert_eq!(element.level, 0);
        assert!(element.parent.is_none());
        assert_eq!(graph.route(&element.id).unwrap().path, vec![element.id.clone()]);
    }

    #[test]
    fn test_revisit_merges_interactions_without_duplicates() {
        let mut graph = DiscoveryGraph::new(10);
        let root = NavPoint::root("https://portal.test/");
        let el = link("a#1", "https://portal.test/a");

        graph.merge(&root, &observation(vec![el.clone()], vec![navigate(0, "https://portal.test/a")]));
        let second = graph.merge(
            &root,
            &observation(
                vec![el.clone()],
                vec![
                    navigate(0, "https://portal.test/a"),
                    ObservedInteraction {
                        element: 0,
                        action: "click".into(),
                        label: None,
                        target: None,
                    },
                ],
            ),
        );

        assert!(second.new_elements.is_empty());
        assert!(second.next_points.is_empty());
        assert_eq!(second.new_interactions, 1);
        assert_eq!(graph.element_count(), 1);
        let actions: Vec<_> = graph.elements()[0]
            .interactions
            .iter()
            .map(|i| i.action.as_str())
            .collect();
        assert_eq!(actions, vec!["navigate", "click"]);
        assert_eq!(graph.interaction_count(), 2);
    }

    #[test]
    fn test_ceiling_truncates() {
        let mut graph = DiscoveryGraph::new(2);
        let root = NavPoint::root("https://portal.test/");
        let outcome = graph.merge(
            &root,
            &observation(
                vec![
                    link("a#1", "https://portal.test/1"),
                    link("a#2", "https://portal.test/2"),
                    link("a#3", "https://portal.test/3"),
                ],
                vec![navigate(2, "https://portal.test/3")],
            ),
        );
        assert_eq!(graph.element_count(), 2);
        assert_eq!(outcome.truncated, 1);
        assert_eq!(graph.interaction_count(), 0);
        assert!(graph.is_full());
    }

    #[test]
    fn test_child_route_extends_parent_route() {
        let mut graph = DiscoveryGraph::new(10);
        let root = NavPoint::root("https://portal.test/");
        let first = graph.merge(&root, &observation(vec![link("a#1", "https://portal.test/a")], vec![]));
        let child_point = first.next_points[0].clone();
        let second = graph.merge(
            &child_point,
            &observation(vec![link("a#2", "https://portal.test/b")], vec![]),
        );
        let parent_id = &first.new_elements[0];
        let child_id = &second.new_elements[0];
        let child = graph.get(child_id).unwrap();
        assert_eq!(child.level, 1);
        assert_eq!(child.parent.as_ref(), Some(parent_id));
        assert_eq!(
            graph.route(child_id).unwrap().path,
            vec![parent_id.clone(), child_id.clone()]
        );
        assert_eq!(graph.deepest_level(), 1);
    }

    #[test]
    fn test_out_of_range_interaction_dropped() {
        let mut graph = DiscoveryGraph::new(10);
        let root = NavPoint::root("https://portal.test/");
        let outcome = graph.merge(
            &root,
            &observation(vec![link("a#1", "https://portal.test/a")], vec![navigate(7, "x")]),
        );
        assert_eq!(outcome.new_interactions, 0);
    }

    #[test]
    fn test_add_workflows_is_idempotent() {
        let mut graph = DiscoveryGraph::new(10);
        let wf = Workflow {
            id: Fingerprint::of(&["wf"]),
            name: "login".into(),
            steps: vec![],
            elements: vec![],
        };
        assert_eq!(graph.add_workflows(vec![wf.clone()]), 1);
        assert_eq!(graph.add_workflows(vec![wf]), 0);
        assert_eq!(graph.workflow_count(), 1);
    }
}
