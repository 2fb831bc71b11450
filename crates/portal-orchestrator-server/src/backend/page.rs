//! HTML page → `Observation`.
//!
//! Reports links, forms, buttons and text-like inputs. Locators are CSS
//! paths built from tag names, ids and `nth-of-type` positions, so the
//! same control on a revisited page fingerprints the same way.

use std::collections::BTreeMap;

use scraper::{ElementRef, Html, Selector};
use url::Url;

use portal_orchestrator::{Observation, ObservedElement, ObservedInteraction};

const TEXT_INPUT_TYPES: &[&str] = &[
    "text", "email", "password", "search", "tel", "url", "number", "date",
];
const KEPT_ATTRIBUTES: &[&str] = &["id", "name", "type", "method", "role", "aria-label", "placeholder"];

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

/// Resolve `href` against `base`. Fragments, scripts and mail links are
/// not navigable.
pub fn resolve_target(base: &Url, href: &str, same_origin: bool) -> Option<String> {
    let href = href.trim();
    if href.is_empty()
        || href.starts_with('#')
        || href.starts_with("javascript:")
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
    {
        return None;
    }
    let mut resolved = base.join(href).ok()?;
    if !matches!(resolved.scheme(), "http" | "https") {
        return None;
    }
    if same_origin && resolved.origin() != base.origin() {
        return None;
    }
    resolved.set_fragment(None);
    Some(resolved.to_string())
}

fn text_of(element: &ElementRef<'_>) -> Option<String> {
    let text = element.text().collect::<Vec<_>>().join(" ");
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!text.is_empty()).then_some(text)
}

fn attributes(element: &ElementRef<'_>) -> BTreeMap<String, String> {
    KEPT_ATTRIBUTES
        .iter()
        .filter_map(|name| {
            element
                .value()
                .attr(name)
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect()
}

/// CSS path from the document root to `element`.
pub fn locator(element: &ElementRef<'_>) -> String {
    let mut segments = Vec::new();
    let mut current = Some(*element);
    while let Some(node) = current {
        let name = node.value().name();
        if let Some(id) = node.value().id() {
            segments.push(format!("{name}#{id}"));
            break;
        }
        let position = node
            .prev_siblings()
            .filter_map(ElementRef::wrap)
            .filter(|sibling| sibling.value().name() == name)
            .count()
            + 1;
        segments.push(format!("{name}:nth-of-type({position})"));
        current = node.parent().and_then(ElementRef::wrap);
    }
    segments.reverse();
    segments.join(" > ")
}

struct Collector {
    observation: Observation,
}

impl Collector {
    fn push(
        &mut self,
        element: &ElementRef<'_>,
        kind: &str,
        label: Option<String>,
        target: Option<String>,
        action: &str,
    ) {
        self.observation.elements.push(ObservedElement {
            kind: kind.to_string(),
            locator: locator(element),
            label: label.clone(),
            target: target.clone(),
            attributes: attributes(element),
        });
        self.observation.interactions.push(ObservedInteraction {
            element: self.observation.elements.len() - 1,
            action: action.to_string(),
            label,
            target,
        });
    }
}

/// Parse `html` fetched from `page_url`.
pub fn observe(html: &str, page_url: &Url, same_origin: bool) -> Observation {
    let document = Html::parse_document(html);
    let mut collector = Collector {
        observation: Observation {
            url: page_url.to_string(),
            ..Default::default()
        },
    };

    if let Some(sel) = selector("a[href]") {
        for link in document.select(&sel) {
            let Some(target) = link
                .value()
                .attr("href")
                .and_then(|href| resolve_target(page_url, href, same_origin))
            else {
                continue;
            };
            collector.push(&link, "link", text_of(&link), Some(target), "navigate");
        }
    }

    if let Some(sel) = selector("form") {
        for form in document.select(&sel) {
            let action = form.value().attr("action").unwrap_or("");
            let target = if action.is_empty() {
                Some(page_url.to_string())
            } else {
                resolve_target(page_url, action, same_origin)
            };
            let label = form
                .value()
                .attr("name")
                .or_else(|| form.value().attr("aria-label"))
                .map(str::to_string);
            collector.push(&form, "form", label, target, "submit");
        }
    }

    if let Some(sel) = selector("button, input[type=submit], input[type=button]") {
        for button in document.select(&sel) {
            let label = text_of(&button).or_else(|| button.value().attr("value").map(str::to_string));
            collector.push(&button, "button", label, None, "click");
        }
    }

    if let Some(sel) = selector("input, textarea, select") {
        for input in document.select(&sel) {
            let name = input.value().name();
            if name == "input" {
                let kind = input.value().attr("type").unwrap_or("text").to_ascii_lowercase();
                if !TEXT_INPUT_TYPES.contains(&kind.as_str()) {
                    continue;
                }
            }
            let label = input
                .value()
                .attr("aria-label")
                .or_else(|| input.value().attr("placeholder"))
                .or_else(|| input.value().attr("name"))
                .map(str::to_string);
            collector.push(&input, "input", label, None, "fill");
        }
    }

    collector.observation
}
