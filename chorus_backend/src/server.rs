use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::activity::ActivitySnapshot;
use crate::channel::ChannelSummary;
use crate::engine::{EngineEvent, MaintenanceReport, PersonaEngine};
use crate::evolution::EvolutionState;
use crate::mood::MoodSnapshot;
use crate::persona::PersonaSummary;
use crate::relationship::RelationshipEdge;
use crate::router::{DecisionPayload, InboundEvent, OutcomeReceipt, ResponseOutcome};

#[derive(Clone)]
pub struct ServerState {
    pub engine: Arc<PersonaEngine>,
    pub auth: BackendAuthConfig,
    pub ws_events: broadcast::Sender<ApiEventEnvelope>,
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

impl BackendAuthConfig {
    pub fn disabled() -> Self {
        Self {
            mode: AuthMode::Disabled,
            token: None,
        }
    }

    pub fn bearer(token: &str) -> Self {
        Self {
            mode: AuthMode::Required,
            token: Some(token.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiEventEnvelope {
    pub event_type: String,
    pub emitted_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    personas: usize,
    channels: usize,
    store: &'static str,
    pending_writes: usize,
}

#[derive(Debug, Serialize)]
struct TickResponse {
    edges_decayed: usize,
}

#[derive(Debug, Serialize)]
struct FlushResponse {
    written: usize,
    skipped: usize,
    failed: usize,
}

pub async fn serve_backend(
    engine: Arc<PersonaEngine>,
    event_rx: flume::Receiver<EngineEvent>,
) -> Result<()> {
    let bind_addr = std::env::var("CHORUS_BACKEND_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8797".to_string())
        .parse::<SocketAddr>()
        .context("Invalid CHORUS_BACKEND_BIND (expected host:port)")?;

    let auth = load_auth_config()?;
    let (ws_events, _) = broadcast::channel(512);

    let state = Arc::new(ServerState {
        engine: engine.clone(),
        auth,
        ws_events: ws_events.clone(),
    });

    spawn_event_bridge(event_rx, ws_events);
    let background = engine.spawn_background();

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Chorus backend listening on http://{}", bind_addr);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown requested");
        })
        .await
        .context("Backend server failed");

    background.shutdown().await;
    served
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/health", get(health))
        .route("/personas", get(list_personas))
        .route("/personas/:id/evolution", get(get_evolution))
        .route("/decide", post(decide))
        .route("/outcome", post(report_outcome))
        .route("/channels/:id", get(get_channel))
        .route("/channels/:id/mood", get(get_mood))
        .route("/channels/:id/activity", get(get_activity))
        .route("/relationships/:a/:b", get(get_relationship))
        .route("/maintenance/flush", post(flush))
        .route("/maintenance/sweep", post(sweep))
        .route("/maintenance/tick", post(tick))
        .route("/ws/events", get(ws_events_route))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new().nest("/v1", protected)
}

fn spawn_event_bridge(
    event_rx: flume::Receiver<EngineEvent>,
    ws_events: broadcast::Sender<ApiEventEnvelope>,
) {
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            let envelope = map_engine_event(event);
            let _ = ws_events.send(envelope);
        }
    });
}

fn map_engine_event(event: EngineEvent) -> ApiEventEnvelope {
    match event {
        EngineEvent::Decision(decision) => envelope(
            "decision",
            serde_json::to_value(decision).unwrap_or_else(|_| serde_json::json!({})),
        ),
        EngineEvent::Milestone(milestone) => envelope(
            "milestone",
            serde_json::to_value(milestone).unwrap_or_else(|_| serde_json::json!({})),
        ),
        EngineEvent::Maintenance(report) => envelope(
            "maintenance",
            serde_json::json!({
                "channels_evicted": report.channels_evicted,
                "activity_pruned": report.activity_pruned
            }),
        ),
    }
}

fn envelope(event_type: &str, payload: serde_json::Value) -> ApiEventEnvelope {
    ApiEventEnvelope {
        event_type: event_type.to_string(),
        emitted_at: Utc::now(),
        payload,
    }
}

fn load_auth_config() -> Result<BackendAuthConfig> {
    let mode = parse_auth_mode(std::env::var("CHORUS_BACKEND_AUTH_MODE").ok())?;
    let token = std::env::var("CHORUS_BACKEND_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "CHORUS_BACKEND_TOKEN is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("Backend auth mode is disabled; all API routes are unauthenticated");
    }

    Ok(BackendAuthConfig { mode, token })
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "required".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid CHORUS_BACKEND_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &BackendAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let Some(token) = auth.token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Some(raw_header) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(auth_value) = raw_header.to_str() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let expected = format!("Bearer {}", token);
    if auth_value.trim() != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

async fn health(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    let engine = &state.engine;
    Json(HealthResponse {
        status: "ok",
        personas: engine.roster.len(),
        channels: engine.channels.len(),
        store: engine.store_backend(),
        pending_writes: engine.pending_writes(),
    })
}

async fn list_personas(State(state): State<Arc<ServerState>>) -> Json<Vec<PersonaSummary>> {
    Json(state.engine.personas())
}

async fn get_evolution(
    State(state): State<Arc<ServerState>>,
    Path(persona_id): Path<String>,
) -> Result<Json<EvolutionState>, (StatusCode, String)> {
    state
        .engine
        .evolution_of(&persona_id)
        .map(Json)
        .ok_or_else(|| not_found(format!("persona '{}' not found", persona_id)))
}

async fn decide(
    State(state): State<Arc<ServerState>>,
    Json(event): Json<InboundEvent>,
) -> Result<Json<DecisionPayload>, (StatusCode, String)> {
    if event.channel_id.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "channel_id cannot be empty".to_string(),
        ));
    }
    let engine = state.engine.clone();
    tokio::task::spawn_blocking(move || engine.decide(&event))
        .await
        .map(Json)
        .map_err(|e| internal_error(anyhow!("decision task failed: {}", e)))
}

async fn report_outcome(
    State(state): State<Arc<ServerState>>,
    Json(outcome): Json<ResponseOutcome>,
) -> Result<Json<OutcomeReceipt>, (StatusCode, String)> {
    let unknown = std::iter::once(outcome.persona_id.as_str())
        .chain(outcome.responded_to_persona.as_deref())
        .find(|id| state.engine.roster.get(id).is_none());
    if let Some(id) = unknown {
        return Err(not_found(format!("persona '{}' not found", id)));
    }
    state
        .engine
        .report_outcome(&outcome)
        .map(Json)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
}

async fn get_channel(
    State(state): State<Arc<ServerState>>,
    Path(channel_id): Path<String>,
) -> Result<Json<ChannelSummary>, (StatusCode, String)> {
    state
        .engine
        .channel_summary(&channel_id)
        .map(Json)
        .ok_or_else(|| not_found(format!("channel '{}' not tracked", channel_id)))
}

async fn get_mood(
    State(state): State<Arc<ServerState>>,
    Path(channel_id): Path<String>,
) -> Json<MoodSnapshot> {
    Json(state.engine.mood_of(&channel_id))
}

async fn get_activity(
    State(state): State<Arc<ServerState>>,
    Path(channel_id): Path<String>,
) -> Json<ActivitySnapshot> {
    Json(state.engine.activity_of(&channel_id))
}

async fn get_relationship(
    State(state): State<Arc<ServerState>>,
    Path((a, b)): Path<(String, String)>,
) -> Result<Json<RelationshipEdge>, (StatusCode, String)> {
    for id in [&a, &b] {
        if state.engine.roster.get(id).is_none() {
            return Err(not_found(format!("persona '{}' not found", id)));
        }
    }
    Ok(Json(state.engine.relationship_between(&a, &b)))
}

async fn flush(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<FlushResponse>, (StatusCode, String)> {
    let engine = state.engine.clone();
    let report = tokio::task::spawn_blocking(move || engine.flush_now())
        .await
        .map_err(|e| internal_error(anyhow!("flush task failed: {}", e)))?;
    Ok(Json(FlushResponse {
        written: report.written,
        skipped: report.skipped,
        failed: report.failed,
    }))
}

async fn sweep(State(state): State<Arc<ServerState>>) -> Json<MaintenanceReport> {
    Json(state.engine.run_maintenance(Utc::now()))
}

async fn tick(State(state): State<Arc<ServerState>>) -> Json<TickResponse> {
    Json(TickResponse {
        edges_decayed: state.engine.relationships.tick(),
    })
}

async fn ws_events_route(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_socket(state, socket))
}

async fn handle_events_socket(state: Arc<ServerState>, mut socket: WebSocket) {
    let mut rx = state.ws_events.subscribe();
    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let payload = match serde_json::to_string(&event) {
                            Ok(serialized) => serialized,
                            Err(error) => {
                                tracing::warn!("Failed to serialize websocket event: {}", error);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

fn not_found(message: String) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, message)
}

fn internal_error(error: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, StorageKind};
    use crate::dice::FixedDice;
    use crate::engine::PersonaEngineBuilder;
    use axum::body::Body;
    use axum::http::{HeaderValue, Request};
    use tower::ServiceExt;

    fn test_state(auth: BackendAuthConfig) -> Arc<ServerState> {
        let mut config = EngineConfig::default();
        config.persistence.storage = StorageKind::Memory;
        config.router.decision_budget_ms = 0;
        config.personas = vec![
            serde_json::json!({ "id": "nova", "display_name": "Nova" }),
            serde_json::json!({ "id": "rook", "display_name": "Rook" }),
        ];
        let engine = PersonaEngineBuilder::new(config)
            .with_dice(Arc::new(FixedDice(0.999)))
            .build()
            .expect("engine");
        let (ws_events, _) = broadcast::channel(16);
        Arc::new(ServerState {
            engine: Arc::new(engine),
            auth,
            ws_events,
        })
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, "Bearer secret")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[test]
    fn authorize_accepts_matching_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer token-123"),
        );
        assert!(authorize(&headers, &BackendAuthConfig::bearer("token-123")).is_ok());
    }

    #[test]
    fn authorize_rejects_missing_or_invalid_token() {
        let headers = HeaderMap::new();
        assert!(authorize(&headers, &BackendAuthConfig::bearer("token-123")).is_err());

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer wrong"),
        );
        assert!(authorize(&headers, &BackendAuthConfig::bearer("token-123")).is_err());
        assert!(authorize(&HeaderMap::new(), &BackendAuthConfig::disabled()).is_ok());
    }

    #[test]
    fn parse_auth_mode_defaults_to_required() {
        assert!(matches!(parse_auth_mode(None).unwrap(), AuthMode::Required));
        assert!(matches!(
            parse_auth_mode(Some("off".to_string())).unwrap(),
            AuthMode::Disabled
        ));
        assert!(parse_auth_mode(Some("maybe".to_string())).is_err());
    }

    #[tokio::test]
    async fn decide_route_returns_decision() {
        let app = build_router(test_state(BackendAuthConfig::bearer("secret")));
        let response = app
            .oneshot(json_request(
                "POST",
                "/v1/decide",
                serde_json::json!({
                    "channel_id": "general",
                    "author_id": "u1",
                    "text": "Rook, thoughts?"
                }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["should_respond"], true);
        assert_eq!(body["responding_personas"][0], "rook");
        assert_eq!(body["rule"], "explicit_mention");
    }

    #[tokio::test]
    async fn requests_without_token_are_rejected() {
        let app = build_router(test_state(BackendAuthConfig::bearer("secret")));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn outcome_for_unknown_persona_is_not_found() {
        let state = test_state(BackendAuthConfig::bearer("secret"));
        let app = build_router(state.clone());
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/v1/outcome",
                serde_json::json!({
                    "channel_id": "general",
                    "persona_id": "ghost",
                    "user_id": "u1"
                }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/v1/outcome",
                serde_json::json!({
                    "channel_id": "general",
                    "persona_id": "nova",
                    "user_id": "u1",
                    "responded_to_persona": "ghost",
                    "valence": 1.0
                }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(state.engine.relationships.is_empty());

        let response = app
            .oneshot(json_request(
                "POST",
                "/v1/outcome",
                serde_json::json!({
                    "channel_id": "general",
                    "persona_id": "nova",
                    "user_id": "u1",
                    "responded_to_persona": "rook",
                    "valence": 1.0
                }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!((body["affinity"].as_f64().expect("affinity") - 0.2).abs() < 1e-6);
        assert_eq!(state.engine.relationship_between("rook", "nova").interaction_count, 1);
    }

    #[test]
    fn engine_events_map_to_envelopes() {
        let envelope = map_engine_event(EngineEvent::Maintenance(MaintenanceReport {
            channels_evicted: 2,
            activity_pruned: 0,
        }));
        assert_eq!(envelope.event_type, "maintenance");
        assert_eq!(envelope.payload["channels_evicted"], 2);
        assert!(envelope.emitted_at <= Utc::now());
    }
}
