mod attach;
mod breakpoints;
mod evaluation;

use std::time::Duration;

use serde_json::{json, Value};

use rdp_bridge::Bridge;
use rdp_config::BridgeConfig;
use rdp_wire::{mock::MockDebuggee, Connection, ConnectionConfig};

pub(crate) const SOURCE_URL: &str = "http://localhost/app.js";

/// Attach a bridge to a scripted debuggee with one tab, one thread and one
/// source. The thread is running when this returns.
pub(crate) async fn attached_bridge(traits: Value, config: BridgeConfig) -> (Bridge, MockDebuggee) {
    let (mut mock, stream) = MockDebuggee::pair();
    let (connection, root) = Connection::from_stream(stream, ConnectionConfig::default());
    mock.greet(traits).await;
    let greeting = root.greeting().await.unwrap();

    let attach =
        tokio::spawn(async move { Bridge::attach_to(connection, root, greeting, &config).await });

    mock.expect_request("root", "listTabs").await;
    mock.send(json!({
        "from": "root",
        "tabs": [{
            "actor": "tab1",
            "title": "Test page",
            "url": "http://localhost/",
            "consoleActor": "console1",
        }],
    }))
    .await;
    mock.expect_request("tab1", "attach").await;
    mock.send(json!({"from": "tab1", "type": "tabAttached", "threadActor": "thread1"}))
        .await;
    mock.expect_request("thread1", "attach").await;
    mock.send(json!({"from": "thread1", "type": "paused", "why": {"type": "attached"}}))
        .await;
    mock.expect_request("thread1", "sources").await;
    mock.send(json!({
        "from": "thread1",
        "sources": [{"actor": "source1", "url": SOURCE_URL}],
    }))
    .await;
    mock.expect_request("thread1", "resume").await;
    mock.send(json!({"from": "thread1", "type": "resumed"})).await;

    let bridge = attach.await.unwrap().unwrap();
    (bridge, mock)
}

/// Poll `condition` until it holds, failing the test after a few seconds.
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition was not reached in time");
}
