//! Coordinator verb surface and hub-event pump, driven end to end against a
//! scripted agent runner. The hub URL points at a closed port, so remote
//! frames are dropped with a warning — exactly the disconnected behavior the
//! verbs must tolerate.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::MockRunner;
use serde_json::json;

use cluster_hub::config::{ConfigFile, HubConfig};
use cluster_hub::coordinator::Coordinator;
use cluster_hub::events::FanoutEvent;
use cluster_hub::types::{MessageType, WsMessage};

fn test_config(dir: &tempfile::TempDir) -> HubConfig {
    HubConfig {
        // Closed port: every hub HTTP call fails fast.
        hub_url: "http://127.0.0.1:1".to_string(),
        node_id: Some("self-node".to_string()),
        cluster_id: Some("cluster-1".to_string()),
        token: Some("test-token".to_string()),
        data_dir: Some(dir.path().to_path_buf()),
        ..HubConfig::default()
    }
}

async fn coordinator_with(
    dir: &tempfile::TempDir,
    runner: Arc<MockRunner>,
    config_file: Option<ConfigFile>,
) -> Coordinator {
    Coordinator::with_runner(
        test_config(dir),
        config_file,
        runner as Arc<dyn cluster_hub::agent::AgentRunner>,
    )
    .await
}

/// Poll a verb until the predicate holds on its payload.
async fn poll_verb<F>(coordinator: &Coordinator, verb: &str, params: serde_json::Value, pred: F)
where
    F: Fn(&serde_json::Value) -> bool,
{
    for _ in 0..200 {
        let reply = coordinator.handle(verb, params.clone()).await;
        if let Some(payload) = reply.payload.as_ref() {
            if pred(payload) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("verb {verb} never satisfied the predicate");
}

#[tokio::test]
async fn self_task_in_local_mode_short_circuits_the_hub() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(MockRunner::auto_completing(Duration::from_millis(30)));
    let coordinator = coordinator_with(&dir, Arc::clone(&runner), None).await;
    let mut events = coordinator.subscribe();

    let reply = coordinator
        .handle(
            "task.send",
            json!({ "nodeId": "self-node", "instruction": "summarize" }),
        )
        .await;
    assert!(reply.ok, "{:?}", reply.message);
    let payload = reply.payload.unwrap();
    let task_id = payload["taskId"].as_str().unwrap().to_string();
    assert_eq!(payload["source"], "local");
    assert_eq!(payload["status"], "sent");

    // The loopback run completes through the agent bridge seam.
    poll_verb(&coordinator, "task.get", json!({ "taskId": task_id }), |t| {
        t["status"] == "completed" && t["result"] == "done"
    })
    .await;

    // The run used the per-task session convention.
    let dispatched = runner.dispatched().await;
    assert_eq!(dispatched.len(), 1);
    assert_eq!(
        dispatched[0].session_key,
        format!("agent:main:hub-task:{task_id}")
    );

    // Fan-out carried the send and the terminal update.
    let mut task_updates = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, FanoutEvent::TaskUpdate { .. }) {
            task_updates += 1;
        }
    }
    assert!(task_updates >= 2, "got {task_updates} task updates");
}

#[tokio::test]
async fn remote_task_is_recorded_and_stays_sent_while_offline() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(MockRunner::new());
    let coordinator = coordinator_with(&dir, runner, None).await;

    let reply = coordinator
        .handle(
            "task.send",
            json!({ "nodeId": "peer-7", "instruction": "run the report" }),
        )
        .await;
    assert!(reply.ok);
    let payload = reply.payload.unwrap();
    assert_eq!(payload["source"], "remote");
    assert_eq!(payload["targetNodeId"], "peer-7");

    let listed = coordinator
        .handle("task.list", json!({ "nodeId": "peer-7" }))
        .await;
    let tasks = listed.payload.unwrap();
    assert_eq!(tasks.as_array().unwrap().len(), 1);
    assert_eq!(tasks[0]["status"], "sent");
}

#[tokio::test]
async fn task_clear_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(MockRunner::auto_completing(Duration::from_millis(20)));
    let coordinator = coordinator_with(&dir, runner, None).await;

    let reply = coordinator
        .handle(
            "task.send",
            json!({ "nodeId": "self-node", "instruction": "quick" }),
        )
        .await;
    let task_id = reply.payload.unwrap()["taskId"].as_str().unwrap().to_string();
    poll_verb(&coordinator, "task.get", json!({ "taskId": task_id }), |t| {
        t["status"] == "completed"
    })
    .await;

    let first = coordinator.handle("task.clear", json!({})).await;
    assert_eq!(first.payload.unwrap()["cleared"], 1);

    let second = coordinator.handle("task.clear", json!({})).await;
    assert_eq!(second.payload.unwrap()["cleared"], 0);
}

#[tokio::test]
async fn cancel_remote_task_marks_it_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(MockRunner::new());
    let coordinator = coordinator_with(&dir, runner, None).await;

    let reply = coordinator
        .handle(
            "task.send",
            json!({ "nodeId": "peer-7", "instruction": "long job" }),
        )
        .await;
    let task_id = reply.payload.unwrap()["taskId"].as_str().unwrap().to_string();

    let cancel = coordinator
        .handle("task.cancel", json!({ "taskId": task_id }))
        .await;
    assert!(cancel.ok);
    assert_eq!(cancel.payload.unwrap()["remote"], true);

    let task = coordinator
        .handle("task.get", json!({ "taskId": task_id }))
        .await;
    assert_eq!(task.payload.unwrap()["status"], "cancelled");

    // Cancelling an already-terminal task finds nothing to do.
    let again = coordinator
        .handle("task.cancel", json!({ "taskId": task_id }))
        .await;
    assert!(!again.ok);
}

#[tokio::test]
async fn task_batch_sends_each_entry() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(MockRunner::new());
    let coordinator = coordinator_with(&dir, runner, None).await;

    let reply = coordinator
        .handle(
            "task.batch",
            json!({ "tasks": [
                { "nodeId": "peer-1", "instruction": "a" },
                { "nodeId": "peer-2", "instruction": "b" },
            ]}),
        )
        .await;
    assert!(reply.ok);
    assert_eq!(reply.payload.unwrap()["sent"].as_array().unwrap().len(), 2);

    let listed = coordinator.handle("task.list", json!({})).await;
    assert_eq!(listed.payload.unwrap().as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn inbound_task_frame_runs_through_the_queue() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(MockRunner::auto_completing(Duration::from_millis(30)));
    let coordinator = coordinator_with(&dir, Arc::clone(&runner), None).await;

    let mut frame = WsMessage::new(MessageType::Task, "remote-task-1");
    frame.from = Some("peer-9".to_string());
    frame.payload = json!({ "task": "echo hello", "priority": "high" });
    coordinator.hub().dispatch_frame(frame);

    poll_verb(&coordinator, "status", json!({}), |s| {
        s["queue"]["recentCompleted"]
            .as_array()
            .map(|ring| {
                ring.iter()
                    .any(|t| t["taskId"] == "remote-task-1" && t["status"] == "completed")
            })
            .unwrap_or(false)
    })
    .await;

    let dispatched = runner.dispatched().await;
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0].instruction, "echo hello");
}

#[tokio::test]
async fn ack_and_result_frames_update_the_sent_store() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(MockRunner::new());
    let coordinator = coordinator_with(&dir, runner, None).await;

    let reply = coordinator
        .handle(
            "task.send",
            json!({ "nodeId": "peer-7", "instruction": "remote work" }),
        )
        .await;
    let task_id = reply.payload.unwrap()["taskId"].as_str().unwrap().to_string();

    let mut ack = WsMessage::new(MessageType::TaskAck, &task_id);
    ack.from = Some("peer-7".to_string());
    ack.payload = json!({ "status": "running" });
    coordinator.hub().dispatch_frame(ack);

    poll_verb(&coordinator, "task.get", json!({ "taskId": task_id }), |t| {
        t["status"] == "running"
    })
    .await;

    let mut result = WsMessage::new(MessageType::Result, &task_id);
    result.from = Some("peer-7".to_string());
    result.payload = json!({ "success": true, "result": "all green" });
    coordinator.hub().dispatch_frame(result);

    poll_verb(&coordinator, "task.get", json!({ "taskId": task_id }), |t| {
        t["status"] == "completed" && t["result"] == "all green"
    })
    .await;

    // A late, out-of-order ack cannot regress the terminal state.
    let mut late = WsMessage::new(MessageType::TaskAck, &task_id);
    late.from = Some("peer-7".to_string());
    late.payload = json!({ "status": "queued" });
    coordinator.hub().dispatch_frame(late);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let task = coordinator
        .handle("task.get", json!({ "taskId": task_id }))
        .await;
    assert_eq!(task.payload.unwrap()["status"], "completed");
}

#[tokio::test]
async fn lifecycle_broadcasts_become_node_events() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(MockRunner::new());
    let coordinator = coordinator_with(&dir, runner, None).await;
    let mut events = coordinator.subscribe();

    for action in ["node_online", "node_offline"] {
        let mut msg = WsMessage::new(MessageType::Broadcast, uuid_like(action));
        msg.channel = Some("system".to_string());
        msg.payload = json!({ "action": action, "nodeId": "peer-a" });
        coordinator.hub().dispatch_frame(msg);
    }

    poll_verb(&coordinator, "node.events", json!({}), |events| {
        events.as_array().map(|e| e.len() == 2).unwrap_or(false)
    })
    .await;

    assert_eq!(coordinator.hub().change_seq(), 2);

    let listed = coordinator.handle("node.events", json!({})).await.payload.unwrap();
    // Ring is most recent first.
    assert_eq!(listed[0]["event"], "offline");
    assert_eq!(listed[1]["event"], "online");

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let FanoutEvent::NodeLifecycle { event } = event {
            kinds.push(event.event);
        }
    }
    assert_eq!(kinds.len(), 2);
}

fn uuid_like(tag: &str) -> String {
    format!("{tag}-{}", uuid::Uuid::new_v4())
}

#[tokio::test]
async fn chat_send_persists_and_chat_history_reads_back() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(MockRunner::new());
    let coordinator = coordinator_with(&dir, runner, None).await;
    let mut events = coordinator.subscribe();

    let reply = coordinator
        .handle(
            "chat.send",
            json!({ "nodeId": "peer-3", "content": "how is the migration going?" }),
        )
        .await;
    assert!(reply.ok);

    let history = coordinator
        .handle("chat.history", json!({ "nodeId": "peer-3" }))
        .await
        .payload
        .unwrap();
    assert_eq!(history.as_array().unwrap().len(), 1);
    assert_eq!(history[0]["role"], "user");

    // A peer reply frame is persisted as the assistant side.
    let mut frame = WsMessage::new(MessageType::Chat, uuid_like("chat"));
    frame.from = Some("peer-3".to_string());
    frame.payload = json!({
        "role": "assistant",
        "content": "migration is done",
        "timestamp": 1_700_000_000_000i64,
        "done": true,
    });
    coordinator.hub().dispatch_frame(frame);

    poll_verb(
        &coordinator,
        "chat.history",
        json!({ "nodeId": "peer-3" }),
        |h| h.as_array().map(|m| m.len() == 2).unwrap_or(false),
    )
    .await;

    let listed = coordinator.handle("chat.list", json!({})).await.payload.unwrap();
    assert_eq!(listed, json!(["peer-3"]));

    coordinator
        .handle("chat.clear", json!({ "nodeId": "peer-3" }))
        .await;
    let cleared = coordinator
        .handle("chat.history", json!({ "nodeId": "peer-3" }))
        .await
        .payload
        .unwrap();
    assert!(cleared.as_array().unwrap().is_empty());

    let mut chat_events = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, FanoutEvent::ChatMessage { .. }) {
            chat_events += 1;
        }
    }
    assert_eq!(chat_events, 2);
}

#[tokio::test]
async fn shared_config_registers_tools_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(MockRunner::new());
    let coordinator = coordinator_with(&dir, runner, None).await;
    assert!(!coordinator.tools_registered());

    for version in 1..=2 {
        let mut msg = WsMessage::new(MessageType::Direct, uuid_like("direct"));
        msg.payload = json!({
            "action": "connected",
            "nodeId": "self-node",
            "sharedConfig": { "version": version },
        });
        coordinator.hub().dispatch_frame(msg);
    }

    for _ in 0..100 {
        if coordinator.shared_config_cached().await == Some(json!({ "version": 2 })) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Registered once; the second push only refreshed the cache.
    assert!(coordinator.tools_registered());
    assert_eq!(
        coordinator.shared_config_cached().await,
        Some(json!({ "version": 2 }))
    );
}

#[tokio::test]
async fn unknown_verbs_and_missing_tasks_reply_not_ok() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(MockRunner::new());
    let coordinator = coordinator_with(&dir, runner, None).await;

    let unknown = coordinator.handle("task.destroy", json!({})).await;
    assert!(!unknown.ok);
    assert!(unknown.message.unwrap().contains("unknown verb"));

    let missing = coordinator
        .handle("task.get", json!({ "taskId": "ghost" }))
        .await;
    assert!(!missing.ok);
    assert!(missing.message.unwrap().contains("task not found"));

    let bad_params = coordinator.handle("task.send", json!({})).await;
    assert!(!bad_params.ok);
}

#[tokio::test]
async fn unregister_without_identity_is_a_benign_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.node_id = None;
    config.token = None;
    let runner = Arc::new(MockRunner::new());
    let coordinator = Coordinator::with_runner(
        config,
        None,
        runner as Arc<dyn cluster_hub::agent::AgentRunner>,
    )
    .await;

    let reply = coordinator.handle("unregister", json!({})).await;
    assert!(!reply.ok);
    assert!(reply.message.unwrap().contains("not registered"));

    // The store layer is untouched by the failure.
    let listed = coordinator.handle("task.list", json!({})).await;
    assert!(listed.ok);
}

#[tokio::test]
async fn config_set_patches_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("openclaw.json");
    let runner = Arc::new(MockRunner::new());
    let coordinator = coordinator_with(&dir, runner, Some(ConfigFile::new(&config_path))).await;

    let reply = coordinator
        .handle("config.set", json!({ "maxConcurrent": 7, "nodeAlias": "ops" }))
        .await;
    assert!(reply.ok);

    let current = coordinator.handle("config.get", json!({})).await.payload.unwrap();
    assert_eq!(current["maxConcurrent"], 7);
    assert_eq!(current["nodeAlias"], "ops");
    // Untouched fields keep their values.
    assert_eq!(current["nodeId"], "self-node");

    // The patch reached the config file under the plugin branch.
    let doc: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&config_path).unwrap()).unwrap();
    assert_eq!(
        doc["plugins"]["entries"]["cluster-hub"]["config"]["maxConcurrent"],
        7
    );
}

#[tokio::test]
async fn status_snapshot_has_all_sections() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(MockRunner::new());
    let coordinator = coordinator_with(&dir, runner, None).await;

    let status = coordinator.handle("status", json!({})).await.payload.unwrap();
    assert_eq!(status["hub"]["registered"], true);
    assert_eq!(status["hub"]["connected"], false);
    assert_eq!(status["hub"]["nodeId"], "self-node");
    assert_eq!(status["queue"]["maxConcurrent"], 3);
    assert_eq!(status["tasks"]["total"], 0);
    assert_eq!(status["changeSeq"], 0);
}

#[tokio::test]
async fn shutdown_flushes_stores_for_reload() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(MockRunner::new());
    let coordinator = coordinator_with(&dir, Arc::clone(&runner), None).await;

    coordinator
        .handle(
            "task.send",
            json!({ "nodeId": "peer-1", "instruction": "persist me" }),
        )
        .await;
    coordinator.shutdown().await;

    // A fresh coordinator over the same data dir sees the flushed task.
    let reloaded = coordinator_with(&dir, Arc::new(MockRunner::new()), None).await;
    let listed = reloaded.handle("task.list", json!({})).await.payload.unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["instruction"], "persist me");
}
