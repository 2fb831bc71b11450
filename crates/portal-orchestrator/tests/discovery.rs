//! Discovery traversal integration tests against a scripted site.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{links, push_control, push_link, url, Script, ScriptedBackend};
use portal_orchestrator::{
    ConfigOverrides, DiscoveryRequest, ElementFilter, ExecutionStatus, JobClass, Observation,
    Orchestrator,
};

// ─────────────────────── helpers ───────────────────────

fn discover(root: &str, config: ConfigOverrides) -> DiscoveryRequest {
    DiscoveryRequest {
        root_url: root.to_string(),
        credentials: None,
        config,
    }
}

fn depth_and_concurrency(max_depth: i64, concurrency: i64) -> ConfigOverrides {
    ConfigOverrides {
        max_depth: Some(max_depth),
        concurrency: Some(concurrency),
        ..Default::default()
    }
}

/// `/` → `/a`, `/b`; `/a` and `/b` both link home and to `/c`.
fn diamond() -> Script {
    let mut b = links(&url("/b"), &[&url("/"), &url("/c")]);
    push_control(&mut b, "button", "a[href='https://portal.test/']", "click");
    Script::default()
        .page(links(&url("/"), &[&url("/a"), &url("/b")]))
        .page(links(&url("/a"), &[&url("/"), &url("/c")]))
        .page(b)
}

// ─────────────────────── scenarios ───────────────────────

#[tokio::test]
async fn test_max_depth_zero_visits_only_root() {
    let backend = ScriptedBackend::new(
        Script::default().page(links(&url("/"), &[&url("/a"), &url("/b"), &url("/c")])),
    );
    let orchestrator = Orchestrator::new(backend.clone());

    let receipt = orchestrator
        .start_discovery(discover(&url("/"), depth_and_concurrency(0, 2)))
        .await
        .unwrap();
    assert_eq!(receipt.job_class, JobClass::Discovery);
    assert_eq!(receipt.root_url.as_deref(), Some(url("/").as_str()));

    let done = orchestrator.wait(&receipt.execution_id).await.unwrap();
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.progress_percent, 100.0);
    assert_eq!(backend.probe.visits(&url("/")), 1);
    assert_eq!(backend.probe.visits(&url("/a")), 0);

    let report = orchestrator.report(&receipt.execution_id).await.unwrap();
    assert_eq!(report.elements.len(), 3);
    assert!(report.elements.iter().all(|e| e.level == 0));
    assert_eq!(report.summary.routes, 3);
}

#[tokio::test]
async fn test_revisits_never_duplicate_elements() {
    let backend = ScriptedBackend::new(diamond());
    let orchestrator = Orchestrator::new(backend.clone());

    let receipt = orchestrator
        .start_discovery(discover(&url("/"), depth_and_concurrency(3, 1)))
        .await
        .unwrap();
    let done = orchestrator.wait(&receipt.execution_id).await.unwrap();
    assert_eq!(done.status, ExecutionStatus::Completed);

    // Every point is visited once, however many links reach it.
    for path in ["/", "/a", "/b", "/c"] {
        assert_eq!(backend.probe.visits(&url(path)), 1, "{path}");
    }

    let report = orchestrator.report(&receipt.execution_id).await.unwrap();
    let mut ids: Vec<_> = report.elements.iter().map(|e| e.id.clone()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), report.elements.len());

    // links to /a, /b, home, /c, plus the button on /b.
    assert_eq!(report.elements.len(), 5);

    let home = report
        .elements
        .iter()
        .find(|e| e.target.as_deref() == Some(url("/").as_str()))
        .unwrap();
    assert_eq!(home.level, 1);
    assert_eq!(home.found_at, url("/a"));
    let actions: Vec<_> = home.interactions.iter().map(|i| i.action.as_str()).collect();
    assert_eq!(actions, vec!["navigate"]);

    let to_c = report
        .elements
        .iter()
        .find(|e| e.target.as_deref() == Some(url("/c").as_str()))
        .unwrap();
    assert_eq!(to_c.interactions.len(), 1);
    assert_eq!(report.summary.max_level, 1);
}

#[tokio::test]
async fn test_interactions_are_unioned_on_revisit() {
    // The same home link is reported by /a with `navigate` and by /b with
    // `navigate` and `hover`.
    let mut b = links(&url("/b"), &[&url("/")]);
    b.interactions.push(portal_orchestrator::ObservedInteraction {
        element: 0,
        action: "hover".into(),
        label: None,
        target: None,
    });
    let script = Script::default()
        .page(links(&url("/"), &[&url("/a"), &url("/b")]))
        .page(links(&url("/a"), &[&url("/")]))
        .page(b);
    let orchestrator = Orchestrator::new(ScriptedBackend::new(script));

    let receipt = orchestrator
        .start_discovery(discover(&url("/"), depth_and_concurrency(2, 1)))
        .await
        .unwrap();
    orchestrator.wait(&receipt.execution_id).await.unwrap();

    let report = orchestrator.report(&receipt.execution_id).await.unwrap();
    let homes: Vec<_> = report
        .elements
        .iter()
        .filter(|e| e.target.as_deref() == Some(url("/").as_str()))
        .collect();
    assert_eq!(homes.len(), 1);
    let actions: Vec<_> = homes[0].interactions.iter().map(|i| i.action.as_str()).collect();
    assert_eq!(actions, vec!["navigate", "hover"]);
    assert_eq!(report.summary.interactions, 4);
}

#[tokio::test]
async fn test_depth_ceiling_is_a_hard_bound() {
    // A chain / → /1 → /2 → /3 → /4.
    let mut script = Script::default();
    let mut previous = url("/");
    for i in 1..=4 {
        let next = url(&format!("/{i}"));
        script = script.page(links(&previous, &[&next]));
        previous = next;
    }
    let backend = ScriptedBackend::new(script);
    let orchestrator = Orchestrator::new(backend.clone());

    let receipt = orchestrator
        .start_discovery(discover(&url("/"), depth_and_concurrency(2, 2)))
        .await
        .unwrap();
    orchestrator.wait(&receipt.execution_id).await.unwrap();

    let report = orchestrator.report(&receipt.execution_id).await.unwrap();
    assert!(report.elements.iter().all(|e| e.level <= 2));
    assert_eq!(report.elements.len(), 3);
    assert_eq!(backend.probe.visits(&url("/3")), 0);

    // Routes grow one hop per level.
    let deepest = report.elements.iter().find(|e| e.level == 2).unwrap();
    let route = report.routes.iter().find(|r| r.element == deepest.id).unwrap();
    assert_eq!(route.path.len(), 3);
}

#[tokio::test]
async fn test_element_ceiling_is_a_hard_bound() {
    let targets: Vec<String> = (0..10).map(|i| url(&format!("/p{i}"))).collect();
    let target_refs: Vec<&str> = targets.iter().map(String::as_str).collect();
    let backend = ScriptedBackend::new(Script::default().page(links(&url("/"), &target_refs)));
    let orchestrator = Orchestrator::new(backend.clone());

    let receipt = orchestrator
        .start_discovery(discover(
            &url("/"),
            ConfigOverrides {
                max_elements: Some(4),
                ..Default::default()
            },
        ))
        .await
        .unwrap();
    let done = orchestrator.wait(&receipt.execution_id).await.unwrap();
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.counts.elements, 4);
    // The ceiling was reached at the root, so nothing else is visited.
    assert_eq!(backend.probe.marks().len(), 2);
}

#[tokio::test]
async fn test_element_ceiling_holds_across_parallel_visits() {
    // `/` links to four pages; each of those links to three pages of its own.
    let pages: Vec<String> = (0..4).map(|i| url(&format!("/p{i}"))).collect();
    let page_refs: Vec<&str> = pages.iter().map(String::as_str).collect();
    let mut script =
        Script::with_delay(Duration::from_millis(20)).page(links(&url("/"), &page_refs));
    for page in &pages {
        let children: Vec<String> = (0..3).map(|j| format!("{page}/x{j}")).collect();
        let child_refs: Vec<&str> = children.iter().map(String::as_str).collect();
        script = script.page(links(page, &child_refs));
    }
    let backend = ScriptedBackend::new(script);
    let orchestrator = Orchestrator::new(backend.clone());

    let receipt = orchestrator
        .start_discovery(discover(
            &url("/"),
            ConfigOverrides {
                max_depth: Some(1),
                max_elements: Some(9),
                concurrency: Some(4),
                ..Default::default()
            },
        ))
        .await
        .unwrap();
    let done = orchestrator.wait(&receipt.execution_id).await.unwrap();
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.counts.elements, 9);
    assert!(backend.probe.peak() > 1);

    let report = orchestrator.report(&receipt.execution_id).await.unwrap();
    assert_eq!(report.elements.len(), 9);
    assert!(report.elements.iter().all(|e| e.level <= 1));
    assert_eq!(report.elements.iter().filter(|e| e.level == 0).count(), 4);
    // Depth 2 is past the limit, so no grandchild is ever visited.
    assert!(pages
        .iter()
        .all(|page| backend.probe.visits(&format!("{page}/x0")) == 0));
}

#[tokio::test]
async fn test_consecutive_failures_abort_with_error() {
    let targets: Vec<String> = (0..6).map(|i| url(&format!("/bad{i}"))).collect();
    let target_refs: Vec<&str> = targets.iter().map(String::as_str).collect();
    let mut script = Script::default().page(links(&url("/"), &target_refs));
    for target in &targets {
        script = script.failing(target);
    }
    let backend = ScriptedBackend::new(script);
    let orchestrator = Orchestrator::new(backend.clone());

    let receipt = orchestrator
        .start_discovery(discover(
            &url("/"),
            ConfigOverrides {
                concurrency: Some(1),
                max_consecutive_failures: Some(3),
                ..Default::default()
            },
        ))
        .await
        .unwrap();
    let done = orchestrator.wait(&receipt.execution_id).await.unwrap();
    assert_eq!(done.status, ExecutionStatus::Error);
    assert!(done.error.unwrap().contains("3 consecutive"));
    assert_eq!(done.counts.failed, 3);

    let report = orchestrator.report(&receipt.execution_id).await.unwrap();
    assert_eq!(report.failures.len(), 3);
    assert!(report.failures.iter().all(|f| !f.timed_out));
}

#[tokio::test]
async fn test_single_failure_does_not_abort() {
    let script = Script::default()
        .page(links(&url("/"), &[&url("/bad"), &url("/good")]))
        .page(links(&url("/good"), &[&url("/deeper")]))
        .failing(&url("/bad"));
    let orchestrator = Orchestrator::new(ScriptedBackend::new(script));

    let receipt = orchestrator
        .start_discovery(discover(&url("/"), depth_and_concurrency(3, 2)))
        .await
        .unwrap();
    let done = orchestrator.wait(&receipt.execution_id).await.unwrap();
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.counts.failed, 1);
    assert_eq!(done.counts.elements, 3);
}

#[tokio::test]
async fn test_visit_timeout_marks_point_failed_and_continues() {
    let script = Script::default()
        .page(links(&url("/"), &[&url("/slow"), &url("/fine")]))
        .page(links(&url("/fine"), &[&url("/next")]))
        .hanging(&url("/slow"));
    let orchestrator = Orchestrator::new(ScriptedBackend::new(script));

    let receipt = orchestrator
        .start_discovery(discover(
            &url("/"),
            ConfigOverrides {
                concurrency: Some(2),
                timeout_ms: Some(100),
                max_consecutive_failures: Some(1),
                ..Default::default()
            },
        ))
        .await
        .unwrap();
    let done = orchestrator.wait(&receipt.execution_id).await.unwrap();
    // Timeouts never count toward the consecutive-failure threshold.
    assert_eq!(done.status, ExecutionStatus::Completed);

    let report = orchestrator.report(&receipt.execution_id).await.unwrap();
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].timed_out);
    assert_eq!(report.failures[0].point, url("/slow"));
    assert!(report.elements.iter().any(|e| e.found_at == url("/fine")));
}

#[tokio::test]
async fn test_unreachable_root_ends_in_error() {
    let orchestrator = Orchestrator::new(ScriptedBackend::new(Script::default().failing(&url("/"))));
    let receipt = orchestrator
        .start_discovery(discover(&url("/"), ConfigOverrides::default()))
        .await
        .unwrap();
    let done = orchestrator.wait(&receipt.execution_id).await.unwrap();
    assert_eq!(done.status, ExecutionStatus::Error);
    assert!(done.error.unwrap().contains("all 1 visits failed"));
}

#[tokio::test]
async fn test_submit_behind_navigation_becomes_workflow() {
    let mut root = Observation {
        url: url("/"),
        ..Default::default()
    };
    push_link(&mut root, &url("/login"));
    let mut login = Observation {
        url: url("/login"),
        ..Default::default()
    };
    push_control(&mut login, "input", "input[name=user]", "fill");
    push_control(&mut login, "form", "form#login", "submit");

    let orchestrator = Orchestrator::new(ScriptedBackend::new(
        Script::default().page(root).page(login),
    ));
    let receipt = orchestrator
        .start_discovery(discover(&url("/"), ConfigOverrides::default()))
        .await
        .unwrap();
    orchestrator.wait(&receipt.execution_id).await.unwrap();

    let report = orchestrator.report(&receipt.execution_id).await.unwrap();
    assert_eq!(report.workflows.len(), 1);
    let workflow = &report.workflows[0];
    assert_eq!(workflow.steps.len(), 2);
    assert!(workflow.name.ends_with("(2 steps)"));

    let form = report.elements.iter().find(|e| e.kind == "form").unwrap();
    assert_eq!(workflow.elements.last(), Some(&form.id));
}

#[tokio::test]
async fn test_stop_discovery_reaches_stopped() {
    let targets: Vec<String> = (0..40).map(|i| url(&format!("/p{i}"))).collect();
    let target_refs: Vec<&str> = targets.iter().map(String::as_str).collect();
    let mut script = Script::with_delay(Duration::from_millis(30));
    script = script.page(links(&url("/"), &target_refs));
    let backend = ScriptedBackend::new(script);
    let orchestrator = Orchestrator::new(backend.clone());

    let receipt = orchestrator
        .start_discovery(discover(&url("/"), depth_and_concurrency(2, 2)))
        .await
        .unwrap();
    let id = receipt.execution_id;
    tokio::time::sleep(Duration::from_millis(100)).await;
    orchestrator.stop_running(Some(JobClass::Discovery)).await.unwrap();

    let done = tokio::time::timeout(Duration::from_secs(2), orchestrator.wait(&id))
        .await
        .expect("stop was not observed")
        .unwrap();
    assert_eq!(done.status, ExecutionStatus::Stopped);
    assert!(done.counts.processed < 41);
    assert_eq!(orchestrator.pool_stats(&id).unwrap().in_use, 0);
}

#[tokio::test]
async fn test_bulk_and_discovery_coexist() {
    let backend = ScriptedBackend::new(
        Script::with_delay(Duration::from_millis(30)).page(links(&url("/"), &[&url("/a")])),
    );
    let orchestrator = Arc::new(Orchestrator::new(backend));

    let discovery = orchestrator
        .start_discovery(discover(&url("/"), ConfigOverrides::default()))
        .await
        .unwrap();
    let bulk = orchestrator
        .start_bulk(portal_orchestrator::BulkRequest {
            targets: vec!["A".into()],
            ..Default::default()
        })
        .await
        .unwrap();
    let second_discovery = orchestrator
        .start_discovery(discover(&url("/"), ConfigOverrides::default()))
        .await;
    assert!(second_discovery.is_err());

    orchestrator.wait(&discovery.execution_id).await.unwrap();
    orchestrator.wait(&bulk.execution_id).await.unwrap();
}

#[tokio::test]
async fn test_element_filters_over_finished_discovery() {
    let mut root = links(&url("/"), &[&url("/a")]);
    push_control(&mut root, "button", "button#help", "click");
    let orchestrator = Orchestrator::new(ScriptedBackend::new(
        Script::default()
            .page(root)
            .page(links(&url("/a"), &[&url("/b")])),
    ));
    let receipt = orchestrator
        .start_discovery(discover(&url("/"), ConfigOverrides::default()))
        .await
        .unwrap();
    orchestrator.wait(&receipt.execution_id).await.unwrap();

    let level_one = orchestrator
        .elements(
            &receipt.execution_id,
            &ElementFilter {
                kind: Some("link".into()),
                level: Some(1),
            },
            100,
            0,
        )
        .await
        .unwrap();
    assert_eq!(level_one.total, 1);
    assert_eq!(level_one.elements[0].found_at, url("/a"));

    let buttons = orchestrator
        .elements(
            &receipt.execution_id,
            &ElementFilter {
                kind: Some("button".into()),
                level: None,
            },
            100,
            0,
        )
        .await
        .unwrap();
    assert_eq!(buttons.total, 1);

    let none = orchestrator
        .elements(
            &receipt.execution_id,
            &ElementFilter {
                kind: Some("table".into()),
                level: None,
            },
            100,
            0,
        )
        .await
        .unwrap();
    assert!(none.elements.is_empty());
}
