use std::io::Write;

use serde_json::{json, Value};
use tempfile::NamedTempFile;
use weft::{RunEvent, TaskContext, TaskRegistry, Workflow, WorkflowTemplate};

const RECON_TEMPLATE: &str = r#"
name: recon
cache:
  type: memory
  max_size: 50
tasks:
  scan:
    type: subdomain_scanner
    config:
      target: example.com
  check:
    type: url_checker
    for_each: scan.subdomains
    config_template:
      url: $.url
    max_concurrent: 3
  analyze:
    type: result_analyzer
    config:
      results: "${check.results}"
    condition: "${scan.total} > 0"
    dependencies: [check]
"#;

fn recon_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register_function("subdomain_scanner", |ctx: TaskContext| async move {
        let target = ctx.config_str("target").unwrap_or("unknown").to_string();
        let subdomains: Vec<Value> = ["www", "api", "dev"]
            .iter()
            .map(|sub| json!({"url": format!("https://{}.{}", sub, target)}))
            .collect();
        Ok(json!({"subdomains": subdomains, "total": subdomains.len()}))
    });
    registry.register_function("url_checker", |ctx: TaskContext| async move {
        Ok(json!({"url": ctx.config_str("url").unwrap_or_default(), "live": true}))
    });
    registry.register_function("result_analyzer", |ctx: TaskContext| async move {
        let live = ctx
            .config_value("results")
            .and_then(Value::as_array)
            .map(|results| results.iter().filter(|r| r["live"] == json!(true)).count())
            .unwrap_or(0);
        Ok(json!({"live": live}))
    });
    registry
}

// A declarative template drives the full pipeline: fan-out from a scan, an
// expression condition, and interpolated aggregates.
#[tokio::test]
async fn template_runs_end_to_end() {
    let template = WorkflowTemplate::from_yaml_str(RECON_TEMPLATE).unwrap();
    let workflow = template.build(recon_registry()).unwrap();

    let results = workflow.run().await.unwrap();
    assert_eq!(results["scan"].output["total"], json!(3));
    let check = &results["check"];
    assert_eq!(check.output["success_count"], json!(3));
    assert_eq!(
        check.output["results"][0]["url"],
        json!("https://www.example.com")
    );
    assert_eq!(results["analyze"].output, json!({"live": 3}));
}

// Templates load from files dispatched on extension.
#[tokio::test]
async fn template_loads_from_file() {
    let mut file = NamedTempFile::with_suffix(".yaml").expect("temp file");
    write!(file, "{}", RECON_TEMPLATE).unwrap();
    let template = WorkflowTemplate::from_file(file.path()).unwrap();
    let workflow = template.build(recon_registry()).unwrap();
    let results = workflow.run().await.unwrap();
    assert_eq!(results.len(), 3);
}

// Loading a template, emitting its canonical form, and loading that again
// produces the same canonical form and the same run results.
#[tokio::test]
async fn canonical_template_round_trip() {
    let template = WorkflowTemplate::from_yaml_str(RECON_TEMPLATE).unwrap();
    let workflow = template.build(recon_registry()).unwrap();
    let canonical = WorkflowTemplate::from_workflow(&workflow);
    let canonical_text = canonical.to_yaml_string().unwrap();

    let reloaded = WorkflowTemplate::from_yaml_str(&canonical_text).unwrap();
    let rebuilt = reloaded.build(recon_registry()).unwrap();
    assert_eq!(
        WorkflowTemplate::from_workflow(&rebuilt)
            .to_yaml_string()
            .unwrap(),
        canonical_text
    );

    let results = rebuilt.run().await.unwrap();
    assert_eq!(results["analyze"].output, json!({"live": 3}));
}

// Run events narrate the lifecycle in a causally consistent order.
#[tokio::test]
async fn run_events_follow_the_lifecycle() {
    let mut registry = TaskRegistry::new();
    registry.register_function("echo", |ctx: TaskContext| async move {
        Ok(ctx.config.clone())
    });
    let mut workflow = Workflow::with_registry("observed", registry);
    workflow.create_task("echo", "first", json!({})).unwrap();
    workflow.create_task("echo", "second", json!({})).unwrap();
    workflow.add_dependency("second", "first").unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    workflow.on_event(tx);
    workflow.run().await.unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(matches!(events.first(), Some(RunEvent::WorkflowStarted { .. })));
    assert!(matches!(events.last(), Some(RunEvent::WorkflowFinished { succeeded: 2, .. })));
    let started_pos = events
        .iter()
        .position(|e| matches!(e, RunEvent::TaskStarted { instance_id, .. } if instance_id == "first"))
        .unwrap();
    let completed_pos = events
        .iter()
        .position(|e| matches!(e, RunEvent::TaskCompleted { instance_id, .. } if instance_id == "first"))
        .unwrap();
    assert!(started_pos < completed_pos);
}
