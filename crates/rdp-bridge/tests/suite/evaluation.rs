use std::time::Duration;

use serde_json::json;

use rdp_bridge::{CoordinatorError, ThreadState};
use rdp_config::BridgeConfig;
use rdp_wire::Evaluation;

use super::{attached_bridge, eventually};

async fn keep(evaluation: Evaluation) -> Result<Evaluation, CoordinatorError> {
    Ok(evaluation)
}

#[tokio::test]
async fn evaluate_while_running_sends_nothing() {
    let (bridge, mut mock) = attached_bridge(json!({}), BridgeConfig::default()).await;

    let err = bridge
        .coordinator()
        .evaluate("1 + 1".into(), None, keep, keep)
        .await
        .unwrap_err();

    assert!(matches!(err, CoordinatorError::ThreadRunning), "{err:?}");
    mock.expect_silence(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn evaluate_in_a_paused_frame() {
    let (bridge, mut mock) = attached_bridge(json!({}), BridgeConfig::default()).await;
    mock.send(json!({"from": "thread1", "type": "paused", "why": {"type": "breakpoint"}}))
        .await;
    eventually(|| bridge.coordinator().state() == ThreadState::Paused).await;

    let eval = tokio::spawn({
        let coordinator = bridge.coordinator().clone();
        async move {
            coordinator
                .evaluate("answer".into(), Some("frame1".into()), keep, keep)
                .await
        }
    });
    let request = mock.expect_request("console1", "evaluateJS").await;
    assert_eq!(request["text"], "answer");
    assert_eq!(request["frameActor"], "frame1");
    mock.send(json!({"from": "console1", "input": "answer", "result": 42}))
        .await;

    let evaluation = eval.await.unwrap().unwrap();
    assert_eq!(evaluation.result.0, json!(42));
    assert_eq!(bridge.coordinator().state(), ThreadState::Paused);
}

#[tokio::test]
async fn pause_hit_during_evaluation_is_resumed() {
    let (bridge, mut mock) = attached_bridge(json!({}), BridgeConfig::default()).await;
    mock.send(json!({"from": "thread1", "type": "paused", "why": {"type": "breakpoint"}}))
        .await;
    eventually(|| bridge.coordinator().state() == ThreadState::Paused).await;

    let eval = tokio::spawn({
        let coordinator = bridge.coordinator().clone();
        async move {
            coordinator
                .evaluate("callsIntoBreakpoint()".into(), None, keep, keep)
                .await
        }
    });
    mock.expect_request("console1", "evaluateJS").await;
    assert_eq!(bridge.coordinator().state(), ThreadState::Evaluating);

    mock.send(json!({"from": "thread1", "type": "paused", "why": {"type": "breakpoint"}}))
        .await;
    mock.expect_request("thread1", "resume").await;
    assert_eq!(bridge.coordinator().state(), ThreadState::Evaluating);
    mock.send(json!({"from": "thread1", "type": "resumed"})).await;

    mock.send(json!({"from": "console1", "result": {"type": "undefined"}}))
        .await;
    eval.await.unwrap().unwrap();
    assert_eq!(bridge.coordinator().state(), ThreadState::Paused);
}
