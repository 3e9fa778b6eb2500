//! Contract and health endpoints, driven in-process without a database.

mod common;

use axum::http::StatusCode;

#[tokio::test]
async fn health_answers_ok() {
    let router = common::make_offline_router();
    let (status, body) = common::call(router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(common::parse_json(&body)["status"], "ok");
}

#[tokio::test]
async fn run_contract_lists_states_and_reason_codes() {
    let router = common::make_offline_router();
    let (status, body) = common::call(router, "GET", "/api/runs/contract", None).await;
    assert_eq!(status, StatusCode::OK);

    let json = common::parse_json(&body);
    let states = json["states"].as_array().unwrap();
    assert_eq!(states.len(), 13);
    assert!(states.contains(&serde_json::json!("preview_ready")));
    let codes = json["failure_reason_codes"].as_array().unwrap();
    assert_eq!(codes.len(), 13);
    assert!(codes.contains(&serde_json::json!("PREVIEW_EXPIRED")));
}

#[tokio::test]
async fn slot_contract_documents_backpressure() {
    let router = common::make_offline_router();
    let (status, body) = common::call(router, "GET", "/api/slots/contract", None).await;
    assert_eq!(status, StatusCode::OK);

    let json = common::parse_json(&body);
    let behavior = &json["acquire_behavior"]["all_slots_occupied"];
    assert_eq!(behavior["acquired"], false);
    assert_eq!(behavior["queue_reason"], "WAITING_FOR_SLOT");
    assert_eq!(json["slot_ids"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn worktree_contract_documents_branch_pattern() {
    let router = common::make_offline_router();
    let (status, body) = common::call(router, "GET", "/api/worktrees/contract", None).await;
    assert_eq!(status, StatusCode::OK);

    let json = common::parse_json(&body);
    assert_eq!(json["branch_name_pattern"], "codex/run-<run_id>");
}

#[tokio::test]
async fn events_schema_is_the_contract_of_record() {
    let router = common::make_offline_router();
    let (status, body) = common::call(router, "GET", "/api/events/schema", None).await;
    assert_eq!(status, StatusCode::OK);

    let json = common::parse_json(&body);
    assert!(json["version"].as_i64().unwrap() >= 1);
    assert_eq!(json["stream"]["event_name"], "run_event");
    assert_eq!(json["stream"]["cursor_param"], "since_id");
}
