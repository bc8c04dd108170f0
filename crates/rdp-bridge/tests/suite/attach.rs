use std::time::Duration;

use serde_json::json;

use rdp_bridge::{BreakpointProtocol, ThreadState};
use rdp_config::{BreakpointProtocolPreference, BridgeConfig};
use rdp_wire::{ActorProxy, StepKind};

use super::{attached_bridge, eventually};

#[tokio::test]
async fn attach_leaves_the_thread_running() {
    let (bridge, _mock) = attached_bridge(json!({}), BridgeConfig::default()).await;

    assert_eq!(bridge.tab().actor, "tab1");
    assert_eq!(bridge.thread().name(), "thread1");
    assert_eq!(bridge.coordinator().state(), ThreadState::Running);
    assert_eq!(bridge.protocol(), BreakpointProtocol::LegacyBreakpointActor);
    assert!(bridge.pause_coordinator().paused_threads().is_empty());
}

#[tokio::test]
async fn configured_protocol_overrides_greeting_traits() {
    let mut config = BridgeConfig::default();
    config.breakpoints.protocol = BreakpointProtocolPreference::ThreadOwned;

    let (bridge, _mock) = attached_bridge(json!({}), config).await;

    assert_eq!(bridge.protocol(), BreakpointProtocol::ThreadOwnedBreakpoint);
}

#[tokio::test]
async fn remote_pause_and_resume_update_the_coordinator() {
    let (bridge, mut mock) = attached_bridge(json!({}), BridgeConfig::default()).await;

    mock.send(json!({"from": "thread1", "type": "paused", "why": {"type": "breakpoint"}}))
        .await;
    eventually(|| bridge.coordinator().state() == ThreadState::Paused).await;
    assert_eq!(bridge.pause_coordinator().paused_threads().len(), 1);

    mock.send(json!({"from": "thread1", "type": "resumed"})).await;
    eventually(|| bridge.coordinator().state() == ThreadState::Running).await;
    assert!(bridge.pause_coordinator().paused_threads().is_empty());
}

#[tokio::test]
async fn user_interrupt_and_resume_go_over_the_wire() {
    let (bridge, mut mock) = attached_bridge(json!({}), BridgeConfig::default()).await;

    let interrupt = tokio::spawn({
        let coordinator = bridge.coordinator().clone();
        async move { coordinator.interrupt().await }
    });
    mock.expect_request("thread1", "interrupt").await;
    mock.send(json!({"from": "thread1", "type": "paused", "why": {"type": "interrupted"}}))
        .await;
    interrupt.await.unwrap().unwrap();
    assert_eq!(bridge.coordinator().state(), ThreadState::Paused);

    // Already paused: no second request.
    bridge.coordinator().interrupt().await.unwrap();
    mock.expect_silence(Duration::from_millis(100)).await;

    let resume = tokio::spawn({
        let coordinator = bridge.coordinator().clone();
        async move { coordinator.resume(None, Some(StepKind::In)).await }
    });
    let request = mock.expect_request("thread1", "resume").await;
    assert_eq!(request["resumeLimit"]["type"], "step");
    mock.send(json!({"from": "thread1", "type": "resumed"})).await;
    resume.await.unwrap().unwrap();
    assert_eq!(bridge.coordinator().state(), ThreadState::Running);
}

#[tokio::test]
async fn losing_the_connection_closes_the_bridge() {
    let (bridge, mock) = attached_bridge(json!({}), BridgeConfig::default()).await;

    drop(mock);

    tokio::time::timeout(Duration::from_secs(5), bridge.closed())
        .await
        .expect("bridge did not notice the closed connection");
    assert!(bridge.coordinator().interrupt().await.is_err());
}
