use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use super::*;
use crate::session::MemoryTokenStore;

const FRESH_ACCESS: &str = "access-fresh";

#[derive(Clone, Default)]
struct MockState {
    refresh_calls: Arc<AtomicUsize>,
    server_list_calls: Arc<AtomicUsize>,
    refresh_fails: bool,
    refresh_stalls: bool,
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

fn expired() -> (StatusCode, Json<Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "invalid token, potentially expired" })),
    )
}

async fn handle_refresh(State(state): State<MockState>, Json(body): Json<Value>) -> impl IntoResponse {
    state.refresh_calls.fetch_add(1, Ordering::SeqCst);
    let delay = if state.refresh_stalls { 2_500 } else { 50 };
    tokio::time::sleep(Duration::from_millis(delay)).await;
    if state.refresh_fails || body["refreshToken"] != "refresh-1" {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Token not found" })),
        );
    }
    (
        StatusCode::OK,
        Json(json!({ "accessToken": FRESH_ACCESS, "refreshToken": "refresh-2" })),
    )
}

async fn handle_login(Json(body): Json<Value>) -> impl IntoResponse {
    if body["password"] != "hunter22" {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Wrong credential" })),
        );
    }
    (
        StatusCode::OK,
        Json(json!({ "accessToken": "access-login", "refreshToken": "refresh-1" })),
    )
}

async fn handle_logout() -> impl IntoResponse {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Internal server error" })),
    )
}

async fn handle_server_list(
    State(state): State<MockState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    state.server_list_calls.fetch_add(1, Ordering::SeqCst);
    if bearer(&headers) != Some(FRESH_ACCESS) {
        return expired();
    }
    (
        StatusCode::OK,
        Json(json!({ "result": [{ "id": "s1", "name": "Alpha" }] })),
    )
}

async fn handle_create_server(headers: HeaderMap) -> impl IntoResponse {
    if bearer(&headers) != Some(FRESH_ACCESS) {
        return expired();
    }
    (StatusCode::CREATED, Json(json!({ "id": "s9" })))
}

async fn handle_server(Path(id): Path<String>, headers: HeaderMap) -> impl IntoResponse {
    if id == "always-expired" || bearer(&headers) != Some(FRESH_ACCESS) {
        return expired();
    }
    (
        StatusCode::OK,
        Json(json!({
            "id": id,
            "name": "Ninth",
            "iconUrl": "https://cdn.example/icon.png",
            "createdAt": "2024-01-01T00:00:00Z",
            "updatedAt": "2024-01-01T00:00:00Z",
            "channels": [],
            "roles": []
        })),
    )
}

async fn handle_create_message() -> impl IntoResponse {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "missing authorization header" })),
    )
}

async fn handle_channel_messages() -> impl IntoResponse {
    Json(json!({ "result": [{ "id": "m1" }] }))
}

async fn spawn_backend(state: MockState) -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new()
        .route("/api/v1/auth/refresh", post(handle_refresh))
        .route("/api/v1/auth/login", post(handle_login))
        .route("/api/v1/auth/logout", post(handle_logout))
        .route("/api/v1/server", get(handle_server_list).post(handle_create_server))
        .route("/api/v1/server/:id", get(handle_server))
        .route("/api/v1/message", post(handle_create_message))
        .route("/api/v1/message/channel/:id", get(handle_channel_messages))
        .with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}/api/v1")
}

async fn client_with_stale_session(state: MockState) -> (Arc<ApiClient>, Arc<MemoryTokenStore>) {
    stale_client_with_timeout(state, ClientConfig::default().request_timeout_secs).await
}

async fn stale_client_with_timeout(
    state: MockState,
    request_timeout_secs: u64,
) -> (Arc<ApiClient>, Arc<MemoryTokenStore>) {
    let base = spawn_backend(state).await;
    let tokens = Arc::new(MemoryTokenStore::with_tokens(&TokenPair {
        access_token: "access-stale".into(),
        refresh_token: "refresh-1".into(),
    }));
    let config = ClientConfig {
        api_base_url: base,
        request_timeout_secs,
        ..ClientConfig::default()
    };
    let api = ApiClient::new(&config, tokens.clone()).expect("api client");
    (Arc::new(api), tokens)
}

#[tokio::test]
async fn concurrent_expired_requests_share_one_refresh() {
    let state = MockState::default();
    let (api, tokens) = client_with_stale_session(state.clone()).await;
    let mut session_events = api.subscribe_session();

    let (first, second) = tokio::join!(api.fetch_servers(), api.fetch_servers());

    let first = first.expect("first request");
    let second = second.expect("second request");
    assert_eq!(first, second);
    assert_eq!(first[0].name, "Alpha");
    assert_eq!(state.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(state.server_list_calls.load(Ordering::SeqCst), 4);

    let stored = tokens.load().await.expect("load").expect("session");
    assert_eq!(stored.access_token, FRESH_ACCESS);
    assert_eq!(stored.refresh_token, "refresh-2");
    assert_eq!(
        session_events.recv().await.expect("event"),
        SessionEvent::TokensRefreshed
    );
    assert!(api.refresh_coordinator().is_idle().await);
}

#[tokio::test]
async fn failed_refresh_rejects_all_waiters_and_clears_session() {
    let state = MockState {
        refresh_fails: true,
        ..MockState::default()
    };
    let (api, tokens) = client_with_stale_session(state.clone()).await;
    let mut session_events = api.subscribe_session();

    let (first, second) = tokio::join!(api.fetch_servers(), api.fetch_servers());

    for outcome in [first, second] {
        match outcome {
            Err(ClientError::SessionExpired(RefreshError::Rejected { status, message })) => {
                assert_eq!(status, 401);
                assert_eq!(message, "Token not found");
            }
            other => panic!("expected session expiry, got {other:?}"),
        }
    }
    assert_eq!(state.refresh_calls.load(Ordering::SeqCst), 1);
    // Original requests are not replayed.
    assert_eq!(state.server_list_calls.load(Ordering::SeqCst), 2);
    assert!(tokens.load().await.expect("load").is_none());
    assert_eq!(
        session_events.recv().await.expect("event"),
        SessionEvent::LoginRequired {
            notice: SESSION_EXPIRED_NOTICE.to_string()
        }
    );
    assert!(api.refresh_coordinator().is_idle().await);
}

#[tokio::test]
async fn refresh_that_never_completes_still_ends_session() {
    let state = MockState {
        refresh_stalls: true,
        ..MockState::default()
    };
    let (api, tokens) = stale_client_with_timeout(state.clone(), 1).await;
    let mut session_events = api.subscribe_session();

    let err = api.fetch_servers().await.expect_err("refresh timed out");

    assert!(
        matches!(err, ClientError::SessionExpired(RefreshError::Transport(_))),
        "{err:?}"
    );
    assert!(err.requires_login());
    assert_eq!(state.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(state.server_list_calls.load(Ordering::SeqCst), 1);
    assert!(tokens.load().await.expect("load").is_none());
    assert_eq!(
        session_events.recv().await.expect("event"),
        SessionEvent::LoginRequired {
            notice: SESSION_EXPIRED_NOTICE.to_string()
        }
    );
    assert!(api.refresh_coordinator().is_idle().await);
}

#[tokio::test]
async fn replay_is_attempted_only_once() {
    let state = MockState::default();
    let (api, _tokens) = client_with_stale_session(state.clone()).await;

    let err = api
        .fetch_server(&ServerId::from("always-expired"))
        .await
        .expect_err("replay rejected");

    assert!(matches!(err, ClientError::Unauthorized(_)), "{err:?}");
    assert!(err.requires_login());
    assert_eq!(state.refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unauthorized_without_expiry_marker_passes_through() {
    let state = MockState::default();
    let (api, _tokens) = client_with_stale_session(state.clone()).await;

    let err = api
        .send_channel_message(&ChannelId::from("c1"), "hi")
        .await
        .expect_err("rejected");

    match err {
        ClientError::Api {
            status,
            code,
            message,
        } => {
            assert_eq!(status, 401);
            assert_eq!(code, ErrorCode::from_status(401));
            assert_eq!(message, "missing authorization header");
        }
        other => panic!("expected api error, got {other:?}"),
    }
    assert_eq!(state.refresh_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn invalid_response_shape_is_a_validation_error() {
    let (api, _tokens) = client_with_stale_session(MockState::default()).await;

    let err = api
        .fetch_channel_messages(&ChannelId::from("c1"), 500)
        .await
        .expect_err("bad shape");

    assert!(
        matches!(err, ClientError::Validation { context: "messages", .. }),
        "{err:?}"
    );
}

#[tokio::test]
async fn create_server_builds_preview_from_follow_up_fetch() {
    let state = MockState::default();
    let (api, _tokens) = client_with_stale_session(state.clone()).await;

    let preview = api.create_server("  Ninth  ").await.expect("create");

    assert_eq!(preview.id, ServerId::from("s9"));
    assert_eq!(preview.name, "Ninth");
    assert_eq!(
        preview.icon_url.as_deref(),
        Some("https://cdn.example/icon.png")
    );
    assert_eq!(state.refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn create_server_rejects_blank_name_locally() {
    let (api, _tokens) = client_with_stale_session(MockState::default()).await;
    let err = api.create_server("   ").await.expect_err("blank name");
    assert!(matches!(err, ClientError::Validation { .. }), "{err:?}");
}

#[tokio::test]
async fn login_persists_tokens_and_announces_session() {
    let base = spawn_backend(MockState::default()).await;
    let tokens = Arc::new(MemoryTokenStore::new());
    let config = ClientConfig {
        api_base_url: base,
        ..ClientConfig::default()
    };
    let api = ApiClient::new(&config, tokens.clone()).expect("api client");
    let mut session_events = api.subscribe_session();

    let err = api.login("kitty", "wrong").await.expect_err("bad password");
    assert!(matches!(err, ClientError::Api { status: 401, .. }), "{err:?}");
    assert!(tokens.load().await.expect("load").is_none());

    api.login("kitty", "hunter22").await.expect("login");
    assert_eq!(
        api.access_token().await.expect("token").as_deref(),
        Some("access-login")
    );
    assert_eq!(
        session_events.recv().await.expect("event"),
        SessionEvent::SignedIn
    );
}

#[tokio::test]
async fn logout_clears_tokens_even_when_backend_fails() {
    let (api, tokens) = client_with_stale_session(MockState::default()).await;
    let mut session_events = api.subscribe_session();

    let err = api.logout().await.expect_err("backend error");
    assert!(matches!(err, ClientError::Api { status: 500, .. }), "{err:?}");
    assert!(tokens.load().await.expect("load").is_none());
    assert_eq!(
        session_events.recv().await.expect("event"),
        SessionEvent::SignedOut
    );

    assert!(matches!(api.logout().await, Err(ClientError::NoSession)));
}
