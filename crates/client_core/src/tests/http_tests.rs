use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use shared::protocol::InviteTeamMemberRequest;
use tokio::net::TcpListener;

use super::*;

#[derive(Clone, Default)]
struct ServerState {
    authorization: Arc<Mutex<Vec<Option<String>>>>,
    queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
    bodies: Arc<Mutex<Vec<Value>>>,
}

fn record_auth(state: &ServerState, headers: &HeaderMap) {
    let value = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    state.authorization.lock().push(value);
}

async fn team(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    record_auth(&state, &headers);
    state.queries.lock().push(query);
    Json(json!({
        "count": 1,
        "team_members": [{"id": 4, "email": "ana@example.com", "full_name": "Ana", "role": "sales"}]
    }))
}

async fn by_stage(
    State(state): State<ServerState>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    state.queries.lock().push(query);
    Json(json!({
        "1": {"stage": {"id": 1, "name": "Lead", "order": 1, "probability": 10}, "deals": []}
    }))
}

async fn deal_detail(Path(id): Path<i64>) -> (StatusCode, Json<Value>) {
    if id != 7 {
        return (StatusCode::NOT_FOUND, Json(json!({"detail": "Not found."})));
    }
    (
        StatusCode::OK,
        Json(json!({
            "id": 7,
            "title": "Acme renewal",
            "value": "1500.00",
            "currency": "EUR",
            "status": "open",
            "probability": 40,
            "stage": {"id": 2, "name": "Qualified"},
            "pipeline": {"id": 1, "name": "Sales"},
            "assigned_to": {"id": 3, "name": "Ana"},
            "updated_at": "2024-05-01T10:00:00Z"
        })),
    )
}

async fn move_stage_handler(
    State(state): State<ServerState>,
    Path(id): Path<i64>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.bodies.lock().push(body.clone());
    match (id, body["stage_id"].as_i64()) {
        (7, Some(2)) => (
            StatusCode::OK,
            Json(json!({"detail": "Deal moved to Qualified", "stage_id": 2, "probability": 40})),
        ),
        (7, _) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"detail": "Stage belongs to a different pipeline"})),
        ),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, Json(Value::Null)),
    }
}

async fn invite(State(state): State<ServerState>, Json(body): Json<Value>) -> StatusCode {
    state.bodies.lock().push(body);
    StatusCode::CREATED
}

async fn spawn_crm_server() -> Result<(String, ServerState)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = ServerState::default();
    let app = Router::new()
        .route("/api/auth/company/team/", get(team))
        .route("/api/auth/company/invite/", post(invite))
        .route("/api/deals/by-stage/", get(by_stage))
        .route("/api/deals/:id/", get(deal_detail))
        .route("/api/deals/:id/move-stage/", post(move_stage_handler))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}/api/"), state))
}

fn backend(base_url: &str) -> HttpCrmBackend {
    HttpCrmBackend::new(base_url, Duration::from_secs(5)).expect("http client")
}

#[tokio::test]
async fn fetch_sends_bearer_token_and_filters() {
    let (base_url, state) = spawn_crm_server().await.expect("spawn server");
    let backend = backend(&base_url);
    backend.set_access_token(Some("token-123".to_string()));

    let key = ResourceKey::new(ResourceFamily::CompanyTeam).with_filter("role", "sales");
    let body = backend.fetch(&key).await.expect("team");

    assert_eq!(body["count"], 1);
    assert_eq!(
        state.authorization.lock().as_slice(),
        &[Some("Bearer token-123".to_string())]
    );
    assert_eq!(
        state.queries.lock()[0].get("role").map(String::as_str),
        Some("sales")
    );
}

#[tokio::test]
async fn requests_without_token_carry_no_authorization() {
    let (base_url, state) = spawn_crm_server().await.expect("spawn server");
    let backend = backend(&base_url);

    backend
        .fetch(&ResourceKey::new(ResourceFamily::CompanyTeam))
        .await
        .expect("team");

    assert_eq!(state.authorization.lock().as_slice(), &[None]);
    assert!(state.queries.lock()[0].is_empty());
}

#[tokio::test]
async fn board_scope_becomes_pipeline_query() {
    let (base_url, state) = spawn_crm_server().await.expect("spawn server");
    let backend = backend(&base_url);

    let body = backend
        .fetch(&ResourceKey::scoped(ResourceFamily::DealBoard, 9))
        .await
        .expect("board");

    assert!(body.get("1").is_some());
    assert_eq!(
        state.queries.lock()[0].get("pipeline_id").map(String::as_str),
        Some("9")
    );
}

#[tokio::test]
async fn fetch_deal_decodes_detail_payload() {
    let (base_url, _state) = spawn_crm_server().await.expect("spawn server");
    let deal = backend(&base_url)
        .fetch_deal(DealId(7))
        .await
        .expect("deal");

    assert_eq!(deal.stage_id, StageId(2));
    assert_eq!(deal.stage_name.as_deref(), Some("Qualified"));
    assert_eq!(deal.currency, "EUR");
    assert_eq!(deal.probability, 40);
    assert!((deal.value - 1500.0).abs() < f64::EPSILON);
    assert!(deal.updated_at.is_some());
}

#[tokio::test]
async fn missing_deal_maps_to_not_found_with_detail() {
    let (base_url, _state) = spawn_crm_server().await.expect("spawn server");
    let err = backend(&base_url)
        .fetch_deal(DealId(8))
        .await
        .expect_err("missing deal");

    assert!(matches!(err, BackendError::NotFound { .. }));
    assert_eq!(err.detail(), Some("Not found."));
}

#[tokio::test]
async fn move_stage_posts_target_and_returns_acknowledgement() {
    let (base_url, state) = spawn_crm_server().await.expect("spawn server");
    let ack = backend(&base_url)
        .move_stage(DealId(7), StageId(2))
        .await
        .expect("moved");

    assert_eq!(ack.stage_id, StageId(2));
    assert_eq!(ack.probability, 40);
    assert_eq!(state.bodies.lock()[0], json!({"stage_id": 2}));
}

#[tokio::test]
async fn rejected_move_keeps_backend_detail() {
    let (base_url, _state) = spawn_crm_server().await.expect("spawn server");
    let err = backend(&base_url)
        .move_stage(DealId(7), StageId(5))
        .await
        .expect_err("rejected");

    assert!(matches!(err, BackendError::Validation { .. }));
    assert_eq!(
        err.user_message("Failed to move deal"),
        "Stage belongs to a different pipeline"
    );
}

#[tokio::test]
async fn server_error_without_detail_uses_status() {
    let (base_url, _state) = spawn_crm_server().await.expect("spawn server");
    let err = backend(&base_url)
        .move_stage(DealId(1), StageId(2))
        .await
        .expect_err("server error");

    assert!(matches!(err, BackendError::Server { status: 500, detail: None }));
}

#[tokio::test]
async fn invite_mutation_posts_request_body() {
    let (base_url, state) = spawn_crm_server().await.expect("spawn server");
    let result = backend(&base_url)
        .mutate(&Mutation::InviteTeamMember(InviteTeamMemberRequest {
            email: "new@example.com".to_string(),
            role: "sales".to_string(),
        }))
        .await
        .expect("invited");

    assert_eq!(result, Value::Null);
    assert_eq!(
        state.bodies.lock()[0],
        json!({"email": "new@example.com", "role": "sales"})
    );
}

#[tokio::test]
async fn unreachable_backend_is_a_network_error() {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let err = backend(&format!("http://{addr}/api"))
        .fetch(&ResourceKey::new(ResourceFamily::CompanyProfile))
        .await
        .expect_err("nothing listening");

    assert!(err.is_network());
    assert_eq!(err.user_message("Failed to load"), "Failed to load");
}
