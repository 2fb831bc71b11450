//! Workflow inference: groups interaction chains into multi-step workflows.

use crate::graph::{DiscoveryGraph, Fingerprint, Workflow};

/// Decides which interaction chains form a workflow.
///
/// Called once per successful visit with the elements that visit touched.
/// Implementations must be deterministic for a given graph: returned
/// workflows are deduplicated by id.
pub trait WorkflowClassifier: Send + Sync {
    fn classify(&self, graph: &DiscoveryGraph, touched: &[Fingerprint]) -> Vec<Workflow>;
}

/// Chains the navigation hops along an element's route and ends them with a
/// terminal action on that element.
///
/// For every touched element at level >= 1 carrying a terminal interaction,
/// each ancestor on its route must contribute the interaction whose target
/// is the point where the next route element was found. A chain with a
/// missing hop is not a workflow.
pub struct ChainClassifier {
    terminal_actions: Vec<String>,
}

impl ChainClassifier {
    pub fn new(terminal_actions: &[&str]) -> Self {
        Self {
            terminal_actions: terminal_actions.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn is_terminal(&self, action: &str) -> bool {
        self.terminal_actions.iter().any(|a| a == action)
    }

    fn hops(&self, graph: &DiscoveryGraph, path: &[Fingerprint]) -> Option<Vec<(Fingerprint, Fingerprint)>> {
        let mut hops = Vec::with_capacity(path.len());
        for pair in path.windows(2) {
            let from = graph.get(&pair[0])?;
            let to = graph.get(&pair[1])?;
            let hop = from
                .interactions
                .iter()
                .find(|i| i.target.as_deref() == Some(to.found_at.as_str()))?;
            hops.push((hop.id.clone(), from.id.clone()));
        }
        Some(hops)
    }
}

impl Default for ChainClassifier {
    fn default() -> Self {
        Self::new(&["submit"])
    }
}

impl WorkflowClassifier for ChainClassifier {
    fn classify(&self, graph: &DiscoveryGraph, touched: &[Fingerprint]) -> Vec<Workflow> {
        let mut found = Vec::new();
        for id in touched {
            let Some(element) = graph.get(id) else {
                continue;
            };
            if element.level == 0 {
                continue;
            }
            let Some(route) = graph.route(id) else {
                continue;
            };
            for terminal in element.interactions.iter().filter(|i| self.is_terminal(&i.action)) {
                let Some(hops) = self.hops(graph, &route.path) else {
                    tracing::debug!("no complete chain to {} for workflow inference", element.id);
                    break;
                };
                let (mut steps, mut elements): (Vec<_>, Vec<_>) = hops.into_iter().unzip();
                steps.push(terminal.id.clone());
                elements.push(element.id.clone());

                let step_ids: Vec<&str> = steps.iter().map(|s| s.as_str()).collect();
                let name = terminal
                    .label
                    .clone()
                    .or_else(|| element.label.clone())
                    .unwrap_or_else(|| format!("{} {}", terminal.action, element.kind));
                found.push(Workflow {
                    id: Fingerprint::of(&step_ids),
                    name: format!("{name} ({} steps)", steps.len()),
                    steps,
                    elements,
                });
            }
        }
        found
    }
}
