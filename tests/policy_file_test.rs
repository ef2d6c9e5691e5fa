use stage_harness::config::{ExecutionMode, HardKillAction, PipelineConfig};
use stage_harness::coordinator::Pipeline;
use stage_harness::error::HarnessError;
use stage_harness::events::{EventBroker, InMemoryBroker};
use stage_harness::pipeline::{Clipboard, StageRegistry, StageTester};
use stage_harness::value::PropertySet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn bundled_policy(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("policies")
        .join(name)
}

#[test]
fn test_policy_file_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("area.json");
    fs::write(
        &path,
        r#"{
            "name": "area",
            "nSlices": 4,
            "executionMode": "continuous",
            "hardKill": "abandon",
            "exitTopic": "areaDone",
            "appStages": [
                {"name": "area", "serialClass": "Area", "parallelClass": "Area",
                 "stagePolicy": {"inputScale": 0, "outputScale": 0}}
            ]
        }"#,
    )
    .unwrap();

    let config = PipelineConfig::from_file(&path).unwrap();
    assert_eq!(config.name, "area");
    assert_eq!(config.n_slices, 4);
    assert_eq!(config.execution_mode, ExecutionMode::Continuous);
    assert_eq!(config.hard_kill, HardKillAction::Abandon);
    assert_eq!(config.exit_topic.as_deref(), Some("areaDone"));
    assert!(StageRegistry::with_builtins().check(&config).is_ok());
}

#[test]
fn test_invalid_policy_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("broken.json");
    fs::write(&path, r#"{"appStages": [{"name": ""}]}"#).unwrap();

    assert!(matches!(
        PipelineConfig::from_file(&path),
        Err(HarnessError::Configuration(_))
    ));
}

#[test]
fn test_bundled_policy_runs_with_trigger() {
    let config = PipelineConfig::from_file(bundled_policy("trigger_and_publish.json")).unwrap();
    let broker = Arc::new(InMemoryBroker::new(config.event_broker_host.clone()));
    let accepted = broker.subscribe("visitAccepted").unwrap();
    broker
        .publish("triggerVisit", PropertySet::new().with("visitId", 7))
        .unwrap();

    let summary = Pipeline::launch(
        config,
        StageRegistry::with_builtins(),
        broker,
        Some("bundled".to_string()),
    )
    .unwrap();

    assert_eq!(summary.visits_completed, 1);
    assert!(!summary.any_flagged());
    assert!(summary.slices_clean());

    let payload = accepted.receive(Duration::from_secs(1)).unwrap().unwrap();
    assert_eq!(payload.get_i64("visitId"), Some(7));
}

#[test]
fn test_area_stage_in_isolation() {
    let registry = StageRegistry::with_builtins();
    let policy = PropertySet::new().with("inputScale", 0).with("outputScale", -2);
    let mut tester = StageTester::new(&registry, "Area", policy);

    let mut clipboard = Clipboard::new();
    clipboard.put("width", 2.0);
    clipboard.put("height", 3.0);

    let clipboard = tester.run_master(clipboard).unwrap();
    let clipboard = tester.run_worker(clipboard, 0).unwrap();
    // metres squared in square centimetres
    assert!((clipboard.get_f64("area").unwrap() - 60_000.0).abs() < 1e-6);

    let missing = tester.run_master(Clipboard::new());
    assert!(matches!(missing, Err(HarnessError::MissingData(_))));
}
