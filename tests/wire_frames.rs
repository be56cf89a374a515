//! Wire-format checks: frame and payload field names as the hub expects them.

use serde_json::json;

use cluster_hub::types::{
    AckStatus, ChatFrameConfig, ChatPayload, ResultPayload, TaskAckPayload, TaskPayload,
    TaskPriority, WsMessage,
};

#[test]
fn task_frame_shape() {
    let frame = WsMessage::task(
        "3e9d5c80-1111-2222-3333-444455556666",
        "node-b",
        &TaskPayload {
            task: "ls -la".to_string(),
            priority: Some(TaskPriority::High),
            config: None,
        },
    );
    let json = serde_json::to_value(&frame).unwrap();

    assert_eq!(json["type"], "task");
    assert_eq!(json["id"], "3e9d5c80-1111-2222-3333-444455556666");
    assert_eq!(json["to"], "node-b");
    assert_eq!(json["payload"]["task"], "ls -la");
    assert_eq!(json["payload"]["priority"], "high");
}

#[test]
fn ack_frame_shape() {
    let frame = WsMessage::task_ack(
        "t1",
        "node-a",
        &TaskAckPayload {
            status: AckStatus::Queued,
            position: Some(2),
        },
    );
    let json = serde_json::to_value(&frame).unwrap();
    assert_eq!(json["type"], "task_ack");
    assert_eq!(json["payload"]["status"], "queued");
    assert_eq!(json["payload"]["position"], 2);
}

#[test]
fn result_frame_shape() {
    let ok = serde_json::to_value(WsMessage::result("t1", "node-a", &ResultPayload::ok("out")))
        .unwrap();
    assert_eq!(ok["type"], "result");
    assert_eq!(ok["payload"]["success"], true);
    assert_eq!(ok["payload"]["result"], "out");
    assert!(ok["payload"].get("error").is_none());

    let err =
        serde_json::to_value(WsMessage::result("t1", "node-a", &ResultPayload::err("boom")))
            .unwrap();
    assert_eq!(err["payload"]["success"], false);
    assert_eq!(err["payload"]["error"], "boom");
    assert!(err["payload"].get("result").is_none());
}

#[test]
fn cancel_frame_shape() {
    let json =
        serde_json::to_value(WsMessage::task_cancel("t1", "node-b", Some("operator"))).unwrap();
    assert_eq!(json["type"], "task_cancel");
    assert_eq!(json["payload"]["reason"], "operator");
}

#[test]
fn chat_frame_gets_fresh_uuid_and_camel_case_config() {
    let frame = WsMessage::chat(
        "node-b",
        &ChatPayload {
            role: "user".to_string(),
            content: Some("hello".to_string()),
            messages: None,
            config: Some(ChatFrameConfig {
                whole: true,
                auto_refresh_ms: Some(500),
            }),
            reply_to: None,
            timestamp: 1_700_000_000_000,
            done: None,
        },
    );
    assert!(uuid::Uuid::parse_str(&frame.id).is_ok());

    let json = serde_json::to_value(&frame).unwrap();
    assert_eq!(json["type"], "chat");
    assert_eq!(json["payload"]["role"], "user");
    assert_eq!(json["payload"]["config"]["whole"], true);
    assert_eq!(json["payload"]["config"]["autoRefreshMs"], 500);
    assert_eq!(json["payload"]["timestamp"], 1_700_000_000_000i64);
}

#[test]
fn heartbeat_frame_shape() {
    let json = serde_json::to_value(WsMessage::heartbeat(0.25, 4)).unwrap();
    assert_eq!(json["type"], "heartbeat");
    assert_eq!(json["payload"]["load"], 0.25);
    assert_eq!(json["payload"]["activeTasks"], 4);
}

#[test]
fn inbound_frame_parses_with_unknown_payload_fields() {
    let text = r#"{
        "type": "task",
        "id": "t-9",
        "from": "node-x",
        "to": "node-y",
        "payload": { "task": "do it", "priority": "low", "futureField": 42 },
        "timestamp": 1700000000000
    }"#;
    let frame: WsMessage = serde_json::from_str(text).unwrap();
    let payload: TaskPayload = frame.payload_as().unwrap();
    assert_eq!(payload.task, "do it");
    assert_eq!(payload.priority, Some(TaskPriority::Low));
    assert_eq!(frame.from.as_deref(), Some("node-x"));
}

#[test]
fn frame_without_payload_defaults_to_null() {
    let frame: WsMessage =
        serde_json::from_str(r#"{ "type": "heartbeat", "id": "h1" }"#).unwrap();
    assert!(frame.payload.is_null());
    assert!(frame.timestamp.is_none());
}
