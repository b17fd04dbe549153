//! End-to-end monitor tests over the pub/sub topic and the SQLite store

use std::time::Duration;

use engineresults::monitor::{EngineResultsMonitor, MonitorConfig, MonitorState};
use engineresults::pubsub::PubSubManager;
use serde_json::json;
use statestore::{CHECKPOINT_DONE, Config, FileStateAttrs, Severity, StateManager, model};

const CONFIG: &str = r#"
id: cbc_binary_toolkit
version: 0.0.1
engine:
  name: TEST_ENGINE
  timeout_secs: 60
pubsub:
  result_queue_name: engine_results
database:
  _provider: sqlite
  location: ":memory:"
"#;

fn setup() -> (Config, StateManager, PubSubManager) {
    let config = Config::load(CONFIG).expect("Failed to load config");
    let state = StateManager::from_config(&config).expect("Failed to create state manager");
    let pubsub = PubSubManager::default();
    pubsub.create_queue("engine_results");
    (config, state, pubsub)
}

fn submit(state: &StateManager, hash: &str) {
    let attrs = FileStateAttrs {
        file_name: Some(format!("{}.exe", hash)),
        time_sent: Some(model::now()),
        ..FileStateAttrs::for_engine("TEST_ENGINE")
    };
    state.set_file_state(hash, &attrs, None).expect("Failed to submit");
}

#[tokio::test]
async fn test_results_flow_to_completion() {
    let (config, state, pubsub) = setup();
    submit(&state, "HASH1");
    submit(&state, "HASH2");

    let monitor_config = MonitorConfig::from_config(&config).unwrap();
    let rx = pubsub.subscribe(&monitor_config.result_queue_name).unwrap();
    let mut handle = EngineResultsMonitor::new(monitor_config, state.clone(), rx).spawn();

    pubsub
        .put(
            "engine_results",
            json!({
                "binary_hash": "HASH1",
                "engine_name": "TEST_ENGINE",
                "success": true,
                "iocs": [
                    {"id": "j39sbv7", "match_type": "equality", "values": ["127.0.0.1"], "severity": 1},
                    {"id": "slkf038", "match_type": "equality", "values": ["app.exe"], "severity": 10}
                ]
            }),
        )
        .await
        .unwrap();

    // a result for some other engine must not complete HASH2
    pubsub
        .put("engine_results", json!({"binary_hash": "HASH2", "engine_name": "OTHER"}))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.state(), MonitorState::AwaitingResults);

    pubsub
        .put("engine_results", json!({"binary_hash": "HASH2", "iocs": []}))
        .await
        .unwrap();

    let completed = tokio::time::timeout(Duration::from_secs(5), handle.wait_complete())
        .await
        .expect("monitor should complete");
    assert!(completed);

    let record = state.lookup("HASH1", Some("TEST_ENGINE")).unwrap().unwrap();
    assert!(record.time_returned.is_some());
    assert_eq!(record.checkpoint_name, CHECKPOINT_DONE);
    assert_eq!(
        state.get_previous_hashes("TEST_ENGINE").unwrap(),
        vec!["HASH1".to_string(), "HASH2".to_string()]
    );

    let low = state
        .get_current_report_items(Severity::try_from(1).unwrap(), "TEST_ENGINE")
        .unwrap();
    let high = state
        .get_current_report_items(Severity::try_from(10).unwrap(), "TEST_ENGINE")
        .unwrap();
    assert_eq!(low.len(), 1);
    assert_eq!(high.len(), 1);
    assert_eq!(high[0]["id"], "slkf038");

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_quiet_engine_raises_timeout() {
    let (_config, state, pubsub) = setup();
    submit(&state, "HASH1");

    let rx = pubsub.subscribe("engine_results").unwrap();
    let config = MonitorConfig::new("TEST_ENGINE", Duration::from_millis(100));
    let handle = EngineResultsMonitor::new(config, state.clone(), rx).spawn();
    let signal = handle.timeout_signal();
    assert!(!signal.is_set());

    let fired = tokio::time::timeout(Duration::from_secs(5), signal.wait())
        .await
        .expect("timeout should fire");
    assert!(fired);
    assert!(signal.is_set());
    assert_eq!(handle.state(), MonitorState::AwaitingResults);
    assert!(!handle.is_finished(), "timeout does not stop the monitor");

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_malformed_results_are_skipped() {
    let (_config, state, pubsub) = setup();
    submit(&state, "HASH1");

    let rx = pubsub.subscribe("engine_results").unwrap();
    let config = MonitorConfig::new("TEST_ENGINE", Duration::from_secs(60));
    let mut handle = EngineResultsMonitor::new(config, state.clone(), rx).spawn();

    pubsub.put("engine_results", json!("not an object")).await.unwrap();
    pubsub.put("engine_results", json!({"iocs": []})).await.unwrap();
    pubsub
        .put(
            "engine_results",
            json!({"binary_hash": "HASH1", "iocs": [{"id": "x", "severity": 42}]}),
        )
        .await
        .unwrap();

    assert!(
        tokio::time::timeout(Duration::from_secs(5), handle.wait_complete())
            .await
            .unwrap()
    );
    for severity in Severity::all() {
        assert!(
            state
                .get_current_report_items(severity, "TEST_ENGINE")
                .unwrap()
                .is_empty()
        );
    }

    handle.stop().await.unwrap();
}
