use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flume::Sender;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header as ws_header;
use tokio_tungstenite::tungstenite::http::HeaderValue as WsHeaderValue;
use tokio_tungstenite::tungstenite::Message;

use chorus_backend::evolution::EvolutionEvent;
use chorus_backend::mood::MoodSnapshot;
use chorus_backend::persona::PersonaSummary;
use chorus_backend::relationship::RelationshipEdge;
use chorus_backend::router::{DecisionPayload, InboundEvent, OutcomeReceipt, ResponseOutcome};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8797";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEventEnvelope {
    pub event_type: String,
    pub emitted_at: DateTime<Utc>,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub enum BackendEvent {
    Decision(Box<DecisionPayload>),
    Milestone(EvolutionEvent),
    Maintenance {
        channels_evicted: u64,
        activity_pruned: u64,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlushSummary {
    pub written: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    ws_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn from_env() -> Self {
        let base = std::env::var("CHORUS_BACKEND_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let token = std::env::var("CHORUS_BACKEND_TOKEN")
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        Self::new(base, token)
    }

    pub fn new(base_url: String, token: Option<String>) -> Self {
        let normalized_base = normalize_base_url(&base_url);
        let ws_url = normalize_ws_url(&normalized_base);

        Self {
            http: reqwest::Client::new(),
            base_url: normalized_base,
            ws_url,
            token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> Result<Value> {
        self.request(reqwest::Method::GET, "/v1/health")
            .send()
            .await?
            .error_for_status()
            .context("GET /v1/health failed")?
            .json::<Value>()
            .await
            .context("Failed to decode health response")
    }

    pub async fn list_personas(&self) -> Result<Vec<PersonaSummary>> {
        let response = self
            .request(reqwest::Method::GET, "/v1/personas")
            .send()
            .await?
            .error_for_status()
            .context("GET /v1/personas failed")?;

        let body = response
            .text()
            .await
            .context("Failed to read persona list payload")?;
        serde_json::from_str::<Vec<PersonaSummary>>(&body).context(format!(
            "Failed to decode persona list. Payload preview: {}",
            body.chars().take(500).collect::<String>()
        ))
    }

    pub async fn decide(&self, event: &InboundEvent) -> Result<DecisionPayload> {
        self.request(reqwest::Method::POST, "/v1/decide")
            .json(event)
            .send()
            .await?
            .error_for_status()
            .context("POST /v1/decide failed")?
            .json::<DecisionPayload>()
            .await
            .context("Failed to decode decision")
    }

    pub async fn report_outcome(&self, outcome: &ResponseOutcome) -> Result<OutcomeReceipt> {
        self.request(reqwest::Method::POST, "/v1/outcome")
            .json(outcome)
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("POST /v1/outcome failed for '{}'", outcome.persona_id))?
            .json::<OutcomeReceipt>()
            .await
            .context("Failed to decode outcome receipt")
    }

    pub async fn mood(&self, channel_id: &str) -> Result<MoodSnapshot> {
        self.request(reqwest::Method::GET, &format!("/v1/channels/{}/mood", channel_id))
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("GET /v1/channels/{}/mood failed", channel_id))?
            .json::<MoodSnapshot>()
            .await
            .context("Failed to decode mood snapshot")
    }

    pub async fn relationship(&self, a: &str, b: &str) -> Result<RelationshipEdge> {
        self.request(reqwest::Method::GET, &format!("/v1/relationships/{}/{}", a, b))
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("GET /v1/relationships/{}/{} failed", a, b))?
            .json::<RelationshipEdge>()
            .await
            .context("Failed to decode relationship")
    }

    pub async fn flush(&self) -> Result<FlushSummary> {
        self.request(reqwest::Method::POST, "/v1/maintenance/flush")
            .send()
            .await?
            .error_for_status()
            .context("POST /v1/maintenance/flush failed")?
            .json::<FlushSummary>()
            .await
            .context("Failed to decode flush response")
    }

    pub async fn stream_events_forever(self, tx: Sender<BackendEvent>) {
        loop {
            match self.stream_events_once(&tx).await {
                Ok(()) => {
                    tracing::info!("Event stream disconnected; reconnecting in 2s");
                }
                Err(error) => {
                    tracing::warn!("Event stream failed: {}; reconnecting in 2s", error);
                }
            }
            if tx.is_disconnected() {
                return;
            }
            sleep(Duration::from_secs(2)).await;
        }
    }

    async fn stream_events_once(&self, tx: &Sender<BackendEvent>) -> Result<()> {
        let ws_endpoint = format!("{}/v1/ws/events", self.ws_url);
        let mut request = ws_endpoint
            .into_client_request()
            .context("Invalid websocket endpoint URL")?;

        if let Some(token) = self.token.as_deref() {
            let value = WsHeaderValue::from_str(&format!("Bearer {}", token))
                .context("Invalid bearer token for websocket auth")?;
            request
                .headers_mut()
                .insert(ws_header::AUTHORIZATION, value);
        }

        let (stream, _) = connect_async(request)
            .await
            .context("Failed to connect websocket event stream")?;
        let (_write, mut read) = stream.split();

        while let Some(message) = read.next().await {
            match message.context("Websocket read error")? {
                Message::Text(text) => {
                    if let Some(event) = parse_event_envelope(&text)? {
                        let _ = tx.send(event);
                    }
                }
                Message::Binary(bytes) => {
                    if let Ok(text) = String::from_utf8(bytes.to_vec()) {
                        if let Some(event) = parse_event_envelope(&text)? {
                            let _ = tx.send(event);
                        }
                    }
                }
                Message::Close(_) => {
                    return Ok(());
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }

        Ok(())
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.http.request(method, url);
        if let Some(token) = self.token.as_deref() {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

fn parse_event_envelope(text: &str) -> Result<Option<BackendEvent>> {
    let envelope: ApiEventEnvelope =
        serde_json::from_str(text).context("Failed to decode API event envelope")?;
    Ok(map_event(envelope))
}

fn map_event(envelope: ApiEventEnvelope) -> Option<BackendEvent> {
    match envelope.event_type.as_str() {
        "decision" => serde_json::from_value::<DecisionPayload>(envelope.payload)
            .ok()
            .map(|decision| BackendEvent::Decision(Box::new(decision))),
        "milestone" => serde_json::from_value::<EvolutionEvent>(envelope.payload)
            .ok()
            .map(BackendEvent::Milestone),
        "maintenance" => Some(BackendEvent::Maintenance {
            channels_evicted: envelope
                .payload
                .get("channels_evicted")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            activity_pruned: envelope
                .payload
                .get("activity_pruned")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        }),
        _ => None,
    }
}

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        DEFAULT_BASE_URL.to_string()
    } else {
        trimmed.to_string()
    }
}

fn normalize_ws_url(base_http_url: &str) -> String {
    if let Some(rest) = base_http_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base_http_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        format!("ws://{}", base_http_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_urls() {
        assert_eq!(normalize_base_url(" http://host:1/ "), "http://host:1");
        assert_eq!(normalize_base_url(""), DEFAULT_BASE_URL);
        assert_eq!(normalize_ws_url("https://host"), "wss://host");
        assert_eq!(normalize_ws_url("http://host:1"), "ws://host:1");
        assert_eq!(normalize_ws_url("host:1"), "ws://host:1");
    }

    #[test]
    fn maps_milestone_and_maintenance_envelopes() {
        let text = serde_json::json!({
            "event_type": "milestone",
            "emitted_at": "2026-03-01T10:00:00Z",
            "payload": {
                "persona_id": "nova",
                "milestones": [100],
                "total_messages": 100,
                "new_tone_shifts": [],
                "new_quirks": ["hums while thinking"],
                "new_knowledge": []
            }
        })
        .to_string();
        match parse_event_envelope(&text).expect("parse") {
            Some(BackendEvent::Milestone(event)) => {
                assert_eq!(event.persona_id, "nova");
                assert_eq!(event.milestones, vec![100]);
            }
            other => panic!("unexpected {:?}", other),
        }

        let maintenance = ApiEventEnvelope {
            event_type: "maintenance".to_string(),
            emitted_at: Utc::now(),
            payload: serde_json::json!({ "channels_evicted": 3 }),
        };
        assert!(matches!(
            map_event(maintenance),
            Some(BackendEvent::Maintenance {
                channels_evicted: 3,
                activity_pruned: 0
            })
        ));
    }

    #[test]
    fn unknown_or_malformed_events_are_ignored() {
        let unknown = ApiEventEnvelope {
            event_type: "mystery".to_string(),
            emitted_at: Utc::now(),
            payload: Value::Null,
        };
        assert!(map_event(unknown).is_none());

        let broken = ApiEventEnvelope {
            event_type: "decision".to_string(),
            emitted_at: Utc::now(),
            payload: serde_json::json!({ "channel_id": 5 }),
        };
        assert!(map_event(broken).is_none());
        assert!(parse_event_envelope("not json").is_err());
    }
}
