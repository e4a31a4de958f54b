//! End-to-end orchestration scenarios over scripted hardware.
//!
//! These exercise the full path a real deployment takes: discovery builds
//! daemons, daemons connect and poll, commands flow through the dispatcher
//! and tracker, readings land in the world state, and failures open the
//! breaker without disturbing sibling daemons.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use rigd_core::command::CommandStatus;
use rigd_core::{CommandId, CommandState, CommandTracker, DaemonState};
use rigd_test_utils::rig::{accelerator, mcu, radio};
use rigd_test_utils::tracing_setup::init_test_tracing;
use rigd_test_utils::TestRig;

const WAIT: Duration = Duration::from_secs(5);

/// Follow a command to its terminal state.
async fn wait_terminal(tracker: &Arc<CommandTracker>, id: CommandId) -> CommandStatus {
    let mut rx = tracker.watch(id).expect("command is tracked");
    tokio::time::timeout(WAIT, async {
        loop {
            let status = rx.borrow().clone();
            if status.state.is_terminal() {
                return status;
            }
            rx.changed().await.expect("tracker dropped");
        }
    })
    .await
    .expect("command never reached a terminal state")
}

async fn wait_running(rig: &TestRig, name: &str) {
    let handle = rig.manager.registry().get(name).expect("daemon registered");
    tokio::time::timeout(WAIT, handle.wait_for(DaemonState::Running))
        .await
        .expect("daemon never reached running");
}

/// Poll the world state until `path` holds `expected`.
async fn wait_for_value(rig: &TestRig, path: &str, expected: serde_json::Value) {
    tokio::time::timeout(WAIT, async {
        loop {
            if rig.world.get(path) == Some(expected.clone()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "{path} never became {expected}, last value: {:?}",
            rig.world.get(path)
        )
    });
}

#[tokio::test]
async fn test_mcu_write_lands_in_world_state() {
    init_test_tracing();
    let rig = TestRig::new();
    let device = rig.hub.handle("pico");
    device.reply_with(
        "discover",
        ["PERIPHERAL:status_led:13:actuator", "DISCOVER_DONE"],
    );
    device.reply_with("write:status_led:1", ["WRITE_OK:status_led:1"]);

    rig.bring_up(vec![mcu("pico", "/dev/ttyACM0")]).await;
    wait_running(&rig, "pico").await;

    let id = rig
        .dispatcher
        .submit("pico", "write", json!({ "target": "status_led", "value": 1 }))
        .unwrap();
    let status = wait_terminal(&rig.tracker, id).await;

    assert_eq!(status.state, CommandState::Completed);
    assert_eq!(
        status.result,
        Some(json!({ "name": "status_led", "value": 1 }))
    );
    wait_for_value(&rig, "status_led.value", json!(1)).await;

    rig.manager.shutdown().await;
}

#[tokio::test]
async fn test_sensor_polling_publishes_readings() {
    init_test_tracing();
    let rig = TestRig::new();
    let device = rig.hub.handle("pico");
    device.reply_with(
        "discover",
        ["PERIPHERAL:temp_sensor:26:sensor", "DISCOVER_DONE"],
    );
    device.reply_with("read:temp_sensor", ["SENSOR_VALUE:temp_sensor:21.5"]);

    let mut readings = rig.bus.subscribe("reading.pico");
    rig.bring_up(vec![mcu("pico", "/dev/ttyACM0")]).await;

    wait_for_value(&rig, "temp_sensor.value", json!(21.5)).await;
    let event = tokio::time::timeout(WAIT, readings.next_event())
        .await
        .expect("no reading event")
        .expect("bus closed");
    assert_eq!(event.topic, "reading.pico");

    // The versioned read reflects at least one poll cycle.
    let (_, version) = rig.world.get_versioned("temp_sensor.value").unwrap();
    assert!(version >= 1);

    rig.manager.shutdown().await;
}

#[tokio::test]
async fn test_dead_transport_fails_command_and_opens_breaker() {
    init_test_tracing();
    let rig = TestRig::new();
    let device = rig.hub.handle("flipper");
    device.reply_with("info", ["radio-mk2"]);
    device.reply_with("rssi", ["-71.5"]);

    rig.bring_up(vec![radio("flipper", "/dev/ttyUSB0", &["can-scan"])])
        .await;
    wait_running(&rig, "flipper").await;

    device.kill();

    let id = rig
        .dispatcher
        .submit(
            "flipper",
            "scan",
            json!({ "start_hz": 300_000_000u64, "end_hz": 348_000_000u64 }),
        )
        .unwrap();
    let status = wait_terminal(&rig.tracker, id).await;

    assert_eq!(status.state, CommandState::Failed);
    // Depending on whether the poll or the action hits the dead channel
    // first, the command fails with the transport detail or is drained by
    // the faulted daemon.
    let error = status.error.expect("failure carries a reason");
    assert!(
        error.contains("mock transport killed") || error.contains("peripheral unavailable"),
        "error: {error}"
    );

    // Polling keeps failing; the daemon faults and its mirrored status
    // shows the breaker open.
    tokio::time::timeout(WAIT, async {
        loop {
            if let Some(status) = rig.world.get("flipper.status") {
                if status["state"] == json!("faulted") && status["breaker"]["state"] == json!("open")
                {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("daemon never faulted with an open breaker");

    rig.manager.shutdown().await;
}

#[tokio::test]
async fn test_open_breaker_fails_fast_without_touching_hardware() {
    init_test_tracing();
    let rig = TestRig::new();
    let device = rig.hub.handle("flipper");
    device.reply_with("info", ["radio-mk2"]);
    device.reply_with("rssi", ["-71.5"]);

    rig.bring_up(vec![radio("flipper", "/dev/ttyUSB0", &["can-scan"])])
        .await;
    wait_running(&rig, "flipper").await;
    device.kill();

    // Drive the breaker open via failed commands (threshold is 2 in the
    // test config).
    for _ in 0..2 {
        let id = rig
            .dispatcher
            .submit(
                "flipper",
                "scan",
                json!({ "start_hz": 1_000u64, "end_hz": 2_000u64 }),
            )
            .unwrap();
        wait_terminal(&rig.tracker, id).await;
    }

    let scans_sent = |handle: &rigd_test_utils::MockTransportHandle| {
        handle
            .sent_lines()
            .iter()
            .filter(|l| l.starts_with("scan:"))
            .count()
    };
    let sent_before = scans_sent(&device);
    let started = std::time::Instant::now();
    let id = rig
        .dispatcher
        .submit(
            "flipper",
            "scan",
            json!({ "start_hz": 1_000u64, "end_hz": 2_000u64 }),
        )
        .unwrap();
    let status = wait_terminal(&rig.tracker, id).await;

    assert_eq!(status.state, CommandState::Failed);
    // Rejected before touching hardware: no new scan traffic, and far
    // quicker than the 250ms I/O timeout would allow.
    assert_eq!(scans_sent(&device), sent_before);
    assert!(
        started.elapsed() < Duration::from_millis(200),
        "fail-fast took {:?}",
        started.elapsed()
    );

    rig.manager.shutdown().await;
}

#[tokio::test]
async fn test_faulted_daemon_does_not_disturb_siblings() {
    init_test_tracing();
    let rig = TestRig::new();
    let coral = rig.hub.handle("coral");
    coral.reply_with("version", ["v2.1"]);
    coral.reply_with("features", [r#"{"edges": 0.4}"#]);
    coral.reply_with("infer:hello", [r#"{"label": "greeting"}"#]);
    let flipper = rig.hub.handle("flipper");
    flipper.reply_with("info", ["radio-mk2"]);
    flipper.reply_with("rssi", ["-71.5"]);

    rig.bring_up(vec![
        accelerator("coral", "/dev/bus/usb/001/004", &["can-infer"]),
        radio("flipper", "/dev/ttyUSB0", &["can-scan"]),
    ])
    .await;
    wait_running(&rig, "coral").await;
    wait_running(&rig, "flipper").await;

    flipper.kill();

    // The accelerator keeps serving commands while its sibling is faulted.
    let id = rig
        .dispatcher
        .submit("coral", "infer", json!({ "input": "hello" }))
        .unwrap();
    let status = wait_terminal(&rig.tracker, id).await;
    assert_eq!(status.state, CommandState::Completed);
    assert_eq!(status.result, Some(json!({ "label": "greeting" })));
    wait_for_value(&rig, "coral.last_inference", json!({
        "input": "hello",
        "result": { "label": "greeting" },
    }))
    .await;

    rig.manager.shutdown().await;
}

#[tokio::test]
async fn test_rediscovery_adds_daemon_while_running() {
    init_test_tracing();
    let rig = TestRig::new();
    let flipper = rig.hub.handle("flipper");
    flipper.reply_with("info", ["radio-mk2"]);
    flipper.reply_with("rssi", ["-71.5"]);

    rig.bring_up(vec![radio("flipper", "/dev/ttyUSB0", &[])]).await;
    wait_running(&rig, "flipper").await;

    // A second peripheral appears; re-running discovery brings it up
    // without touching the running daemon.
    let coral = rig.hub.handle("coral");
    coral.reply_with("version", ["v2.1"]);
    coral.reply_with("features", [r#"{"edges": 0.4}"#]);
    rig.probe.set(vec![
        radio("flipper", "/dev/ttyUSB0", &[]),
        accelerator("coral", "/dev/bus/usb/001/004", &[]),
    ]);
    let summary = rig.manager.discover_and_configure().await.unwrap();
    assert_eq!(summary.added, vec!["coral".to_string()]);
    assert_eq!(summary.kept, vec!["flipper".to_string()]);

    wait_running(&rig, "coral").await;
    rig.manager.shutdown().await;
}

#[tokio::test]
async fn test_command_to_unknown_target_is_rejected() {
    init_test_tracing();
    let rig = TestRig::new();
    let err = rig
        .dispatcher
        .submit("nobody", "read", json!({}))
        .unwrap_err();
    assert_eq!(err.to_string(), "daemon not found: nobody");
}

#[tokio::test]
async fn test_scan_results_reach_world_state() {
    init_test_tracing();
    let rig = TestRig::new();
    let device = rig.hub.handle("flipper");
    device.reply_with("info", ["radio-mk2"]);
    device.reply_with("rssi", ["-71.5"]);
    device.reply_with(
        "scan:300000000:348000000",
        ["HIT:315000000:-42.0", "HIT:318500000:-60.5", "SCAN_DONE:2"],
    );

    rig.bring_up(vec![radio("flipper", "/dev/ttyUSB0", &["can-scan"])])
        .await;
    wait_running(&rig, "flipper").await;

    let id = rig
        .dispatcher
        .submit(
            "flipper",
            "scan",
            json!({ "start_hz": 300_000_000u64, "end_hz": 348_000_000u64 }),
        )
        .unwrap();
    let status = wait_terminal(&rig.tracker, id).await;

    assert_eq!(status.state, CommandState::Completed);
    wait_for_value(&rig, "flipper.scan_count", json!(1)).await;
    let last_scan = rig.world.get("flipper.last_scan").expect("scan recorded");
    assert_eq!(last_scan["hits"][0]["freq_hz"], json!(315_000_000u64));

    rig.manager.shutdown().await;
}
