use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use weft::{ErrorKind, TaskContext, TaskRegistry, Workflow};

fn scan_registry(subdomains: usize) -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register_function("subdomain_scanner", move |_ctx: TaskContext| async move {
        let subdomains: Vec<Value> = (0..subdomains)
            .map(|i| json!({"url": format!("https://s{}.example.com", i), "rank": i}))
            .collect();
        Ok(json!({"subdomains": subdomains, "total": subdomains.len()}))
    });
    registry
}

// Fan-out over a 12-element sequence with a concurrency cap of 5: no more
// than 5 children in flight, and the aggregate keeps input order.
#[tokio::test]
async fn fan_out_respects_concurrency_cap_and_order() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let high_water = Arc::new(AtomicUsize::new(0));
    let probe_in_flight = Arc::clone(&in_flight);
    let probe_high_water = Arc::clone(&high_water);

    let mut registry = scan_registry(12);
    registry.register_function("url_checker", move |ctx: TaskContext| {
        let in_flight = Arc::clone(&probe_in_flight);
        let high_water = Arc::clone(&probe_high_water);
        async move {
            let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            high_water.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(json!({"checked": ctx.config_str("url").unwrap_or_default()}))
        }
    });
    registry.register_function("result_analyzer", |ctx: TaskContext| async move {
        let results = ctx.output("check.results").await?;
        Ok(json!({"seen": results.as_array().map(Vec::len).unwrap_or(0)}))
    });

    let mut workflow = Workflow::with_registry("recon", registry);
    workflow.create_task("subdomain_scanner", "scan", json!({})).unwrap();
    workflow
        .create_task("url_checker", "check", json!({}))
        .unwrap()
        .fan_out = Some(weft::FanOut {
        for_each: "scan.subdomains".to_string(),
        config_template: json!({"url": "$.url"}),
        max_concurrent: 5,
    });
    workflow.add_dependency("check", "scan").unwrap();
    workflow.create_task("result_analyzer", "analyze", json!({})).unwrap();
    workflow.add_dependency("analyze", "check").unwrap();

    let results = workflow.run().await.unwrap();

    assert!(high_water.load(Ordering::SeqCst) <= 5);
    let check = &results["check"];
    assert!(check.success);
    assert_eq!(check.output["success_count"], json!(12));
    assert_eq!(check.output["failure_count"], json!(0));
    let ordered: Vec<&str> = check.output["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["checked"].as_str().unwrap())
        .collect();
    let expected: Vec<String> = (0..12)
        .map(|i| format!("https://s{}.example.com", i))
        .collect();
    assert_eq!(ordered, expected);
    assert_eq!(results["analyze"].output["seen"], json!(12));
}

// One failing child does not fail the group; its slot in the aggregate keeps
// input order and the counters report the split.
#[tokio::test]
async fn partial_child_failure_keeps_the_group_alive() {
    let mut registry = scan_registry(4);
    registry.register_function("url_checker", |ctx: TaskContext| async move {
        let rank = ctx.config_value("rank").and_then(Value::as_i64).unwrap_or(0);
        if rank == 2 {
            Err(weft::EngineError::new(ErrorKind::Task, "unreachable host"))
        } else {
            Ok(json!({"rank": rank}))
        }
    });

    let mut workflow = Workflow::with_registry("partial", registry);
    workflow.create_task("subdomain_scanner", "scan", json!({})).unwrap();
    workflow
        .create_task("url_checker", "check", json!({}))
        .unwrap()
        .fan_out = Some(weft::FanOut {
        for_each: "scan.subdomains".to_string(),
        config_template: json!({"rank": "$.rank"}),
        max_concurrent: 4,
    });
    workflow.add_dependency("check", "scan").unwrap();

    let results = workflow.run().await.unwrap();
    let check = &results["check"];
    assert!(check.success);
    assert_eq!(check.output["success_count"], json!(3));
    assert_eq!(check.output["failure_count"], json!(1));
    let slots = check.output["results"].as_array().unwrap();
    assert_eq!(slots.len(), 4);
    // The failed child contributes its empty output at its input position.
    assert_eq!(slots[2], json!({}));
    assert_eq!(check.output["items"].as_array().unwrap().len(), 4);
}

// Every child failing fails the parent.
#[tokio::test]
async fn all_children_failing_fails_the_group() {
    let mut registry = scan_registry(3);
    registry.register_function("url_checker", |_ctx: TaskContext| async move {
        Err::<Value, _>(weft::EngineError::new(ErrorKind::Task, "down"))
    });

    let mut workflow = Workflow::with_registry("all-fail", registry);
    workflow.create_task("subdomain_scanner", "scan", json!({})).unwrap();
    workflow
        .create_task("url_checker", "check", json!({}))
        .unwrap()
        .fan_out = Some(weft::FanOut {
        for_each: "scan.subdomains".to_string(),
        config_template: json!({"url": "$.url"}),
        max_concurrent: 2,
    });
    workflow.add_dependency("check", "scan").unwrap();

    let results = workflow.run().await.unwrap();
    let check = &results["check"];
    assert!(!check.success);
    assert_eq!(check.output["failure_count"], json!(3));
}

// An empty sequence yields a successful empty aggregate.
#[tokio::test]
async fn empty_sequence_succeeds() {
    let mut registry = scan_registry(0);
    registry.register_function("url_checker", |_ctx: TaskContext| async move {
        Ok(json!({}))
    });

    let mut workflow = Workflow::with_registry("empty", registry);
    workflow.create_task("subdomain_scanner", "scan", json!({})).unwrap();
    workflow
        .create_task("url_checker", "check", json!({}))
        .unwrap()
        .fan_out = Some(weft::FanOut {
        for_each: "scan.subdomains".to_string(),
        config_template: json!({"url": "$.url"}),
        max_concurrent: 3,
    });
    workflow.add_dependency("check", "scan").unwrap();

    let results = workflow.run().await.unwrap();
    let check = &results["check"];
    assert!(check.success);
    assert_eq!(check.output["results"], json!([]));
    assert_eq!(check.output["success_count"], json!(0));
}

// A for_each path that does not resolve to a sequence fails the group with a
// reference error.
#[tokio::test]
async fn non_sequence_for_each_is_a_reference_error() {
    let mut registry = scan_registry(2);
    registry.register_function("url_checker", |_ctx: TaskContext| async move {
        Ok(json!({}))
    });

    let mut workflow = Workflow::with_registry("bad-path", registry);
    workflow.create_task("subdomain_scanner", "scan", json!({})).unwrap();
    workflow
        .create_task("url_checker", "check", json!({}))
        .unwrap()
        .fan_out = Some(weft::FanOut {
        for_each: "scan.total".to_string(),
        config_template: json!({"url": "$.url"}),
        max_concurrent: 1,
    });
    workflow.add_dependency("check", "scan").unwrap();

    let results = workflow.run().await.unwrap();
    let check = &results["check"];
    assert!(!check.success);
    assert_eq!(check.error.as_ref().unwrap().kind, "reference");
}
