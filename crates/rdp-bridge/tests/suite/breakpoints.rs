use std::time::Duration;

use serde_json::json;

use rdp_bridge::{BreakpointChanged, BreakpointProtocol, SourceBreakpoint, ThreadState};
use rdp_config::BridgeConfig;

use super::{attached_bridge, eventually, SOURCE_URL};

#[tokio::test]
async fn thread_owned_breakpoints_install_while_running() {
    let (bridge, mut mock) = attached_bridge(
        json!({"breakpointWhileRunning": true}),
        BridgeConfig::default(),
    )
    .await;
    assert_eq!(bridge.protocol(), BreakpointProtocol::ThreadOwnedBreakpoint);
    let mut changes = bridge.subscribe_breakpoint_changes();

    let list = vec![SourceBreakpoint::at_line(3), SourceBreakpoint::at_line(8)];
    let infos = bridge.set_breakpoints(SOURCE_URL, list.clone());

    mock.expect_request("source1", "getBreakpointPositionsCompressed")
        .await;
    mock.send(json!({"from": "source1", "positions": {"3": [0], "9": [0]}}))
        .await;
    let mut lines = Vec::new();
    for _ in 0..2 {
        let request = mock.expect_request("thread1", "setBreakpoint").await;
        assert_eq!(request["location"]["sourceUrl"], SOURCE_URL);
        lines.push(request["location"]["line"].as_u64().unwrap());
        mock.send(json!({"from": "thread1"})).await;
    }
    lines.sort_unstable();
    assert_eq!(lines, [3, 9]);

    let mut verified = Vec::new();
    for _ in 0..2 {
        let change = tokio::time::timeout(Duration::from_secs(5), changes.recv())
            .await
            .unwrap()
            .unwrap();
        verified.push(change);
    }
    verified.sort_by_key(|change| change.id);
    assert_eq!(
        verified,
        [
            BreakpointChanged {
                id: infos[0].id(),
                verified: true,
                line: Some(3),
                column: Some(0),
            },
            BreakpointChanged {
                id: infos[1].id(),
                verified: true,
                line: Some(9),
                column: Some(0),
            },
        ]
    );
    assert_eq!(bridge.coordinator().state(), ThreadState::Running);

    // Same list again: same ids, nothing sent.
    let again = bridge.set_breakpoints(SOURCE_URL, list);
    assert_eq!(
        again.iter().map(|info| info.id()).collect::<Vec<_>>(),
        infos.iter().map(|info| info.id()).collect::<Vec<_>>()
    );
    mock.expect_silence(Duration::from_millis(100)).await;

    // Dropping line 3 removes only that one.
    bridge.set_breakpoints(SOURCE_URL, vec![SourceBreakpoint::at_line(8)]);
    let request = mock.expect_request("thread1", "removeBreakpoint").await;
    assert_eq!(request["location"]["line"], 3);
    mock.send(json!({"from": "thread1"})).await;
    mock.expect_silence(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn legacy_breakpoints_pause_the_thread_around_installation() {
    let (bridge, mut mock) = attached_bridge(json!({}), BridgeConfig::default()).await;

    let infos = bridge.set_breakpoints(SOURCE_URL, vec![SourceBreakpoint::at_line(8)]);

    mock.expect_request("source1", "getBreakpointPositionsCompressed")
        .await;
    mock.send(json!({"from": "source1", "positions": {"3": [0], "9": [0]}}))
        .await;
    mock.expect_request("thread1", "interrupt").await;
    mock.send(json!({"from": "thread1", "type": "paused", "why": {"type": "interrupted"}}))
        .await;
    let request = mock.expect_request("source1", "setBreakpoint").await;
    assert_eq!(request["location"]["line"], 9);
    mock.send(json!({
        "from": "source1",
        "actor": "bp1",
        "actualLocation": {"line": 9, "column": 0},
    }))
    .await;
    mock.expect_request("thread1", "resume").await;
    mock.send(json!({"from": "thread1", "type": "resumed"})).await;

    eventually(|| infos[0].is_verified()).await;
    assert_eq!(infos[0].verification().actual.map(|p| p.line), Some(9));
    eventually(|| bridge.coordinator().state() == ThreadState::Running).await;

    bridge.set_breakpoints(SOURCE_URL, Vec::new());
    mock.expect_request("thread1", "interrupt").await;
    mock.send(json!({"from": "thread1", "type": "paused", "why": {"type": "interrupted"}}))
        .await;
    mock.expect_request("bp1", "delete").await;
    mock.send(json!({"from": "bp1"})).await;
    mock.expect_request("thread1", "resume").await;
    mock.send(json!({"from": "thread1", "type": "resumed"})).await;
    eventually(|| !bridge.connection().is_registered("bp1")).await;
}

#[tokio::test]
async fn breakpoints_for_a_later_source_are_installed_when_it_loads() {
    let (bridge, mut mock) = attached_bridge(
        json!({"breakpointWhileRunning": true}),
        BridgeConfig::default(),
    )
    .await;
    let later = "http://localhost/later.js";

    let infos = bridge.set_breakpoints(later, vec![SourceBreakpoint::at_line(2)]);
    mock.expect_silence(Duration::from_millis(50)).await;

    mock.send(json!({
        "from": "thread1",
        "type": "newSource",
        "source": {"actor": "source2", "url": later},
    }))
    .await;
    mock.expect_request("source2", "getBreakpointPositionsCompressed")
        .await;
    mock.send(json!({"from": "source2", "positions": {"2": [4]}}))
        .await;
    let request = mock.expect_request("thread1", "setBreakpoint").await;
    assert_eq!(request["location"]["sourceUrl"], later);
    assert_eq!(request["location"]["column"], 4);
    mock.send(json!({"from": "thread1"})).await;

    eventually(|| infos[0].is_verified()).await;
}

#[tokio::test]
async fn breakpoints_install_where_requested_when_positions_are_unsupported() {
    let (bridge, mut mock) = attached_bridge(json!({}), BridgeConfig::default()).await;

    let infos = bridge.set_breakpoints(SOURCE_URL, vec![SourceBreakpoint::at_line(4)]);

    mock.expect_request("source1", "getBreakpointPositionsCompressed")
        .await;
    mock.send(json!({"from": "source1", "error": "unrecognizedPacketType"}))
        .await;
    mock.expect_request("thread1", "interrupt").await;
    mock.send(json!({"from": "thread1", "type": "paused", "why": {"type": "interrupted"}}))
        .await;
    let request = mock.expect_request("source1", "setBreakpoint").await;
    assert_eq!(request["location"]["line"], 4);
    mock.send(json!({
        "from": "source1",
        "actor": "bp1",
        "actualLocation": {"line": 5, "column": 2},
    }))
    .await;
    mock.expect_request("thread1", "resume").await;
    mock.send(json!({"from": "thread1", "type": "resumed"})).await;

    eventually(|| infos[0].is_verified()).await;
    assert_eq!(
        infos[0].verification().actual.map(|p| (p.line, p.column)),
        Some((5, 2))
    );
}

#[tokio::test]
async fn breakpoint_pauses_below_the_hit_condition_are_resumed() {
    let (bridge, mut mock) = attached_bridge(
        json!({"breakpointWhileRunning": true}),
        BridgeConfig::default(),
    )
    .await;

    let infos = bridge.set_breakpoints(
        SOURCE_URL,
        vec![SourceBreakpoint {
            hit_condition: Some("2".into()),
            ..SourceBreakpoint::at_line(3)
        }],
    );
    mock.expect_request("source1", "getBreakpointPositionsCompressed")
        .await;
    mock.send(json!({"from": "source1", "positions": {"3": [0]}}))
        .await;
    mock.expect_request("thread1", "setBreakpoint").await;
    mock.send(json!({"from": "thread1"})).await;
    eventually(|| infos[0].is_verified()).await;

    let hit = json!({
        "from": "thread1",
        "type": "paused",
        "why": {"type": "breakpoint"},
        "frame": {"actor": "frame1", "where": {"actor": "source1", "line": 3, "column": 0}},
    });

    // First hit: below the condition, resumed without anyone asking.
    mock.send(hit.clone()).await;
    mock.expect_request("thread1", "resume").await;
    mock.send(json!({"from": "thread1", "type": "resumed"})).await;
    eventually(|| bridge.coordinator().state() == ThreadState::Running).await;

    // Second hit stops.
    mock.send(hit).await;
    eventually(|| bridge.coordinator().state() == ThreadState::Paused).await;
    mock.expect_silence(Duration::from_millis(100)).await;
    assert_eq!(infos[0].hit_count(), 2);
}
