//! `reqwest`-backed client for the Limiar REST API.

use std::time::Duration;

use async_trait::async_trait;
use limiar_core::ids::{CampaignId, SessionId};
use limiar_core::roll::RollEvent;
use limiar_core::session::SessionSummary;
use limiar_settings::LimiarSettings;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, instrument};

use crate::errors::{ApiError, Result};

/// Source of recent roll history for a session.
#[async_trait]
pub trait RollHistorySource: Send + Sync {
    /// Up to `limit` most recent rolls, newest first.
    async fn recent_rolls(&self, session_id: &SessionId, limit: usize) -> Result<Vec<RollEvent>>;
}

/// Acknowledgement returned by the command endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandAck {
    /// Whether the command was broadcast.
    pub ok: bool,
}

#[derive(Serialize)]
struct CommandBody<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<&'a Map<String, Value>>,
}

/// REST client. Cheap to clone.
#[derive(Clone, Debug)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    /// Client for `base_url` with the default timeout.
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        Self::with_timeout(base_url, token, Duration::from_secs(15))
    }

    /// Client for `base_url` with an explicit request timeout.
    pub fn with_timeout(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(ApiError::MissingBaseUrl);
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.to_owned(),
            token: token.filter(|t| !t.is_empty()),
        })
    }

    /// Client configured from loaded settings.
    pub fn from_settings(settings: &LimiarSettings, token: Option<String>) -> Result<Self> {
        let base_url = settings
            .api
            .base_url
            .as_deref()
            .ok_or(ApiError::MissingBaseUrl)?;
        Self::with_timeout(
            base_url,
            token,
            Duration::from_millis(settings.api.request_timeout_ms),
        )
    }

    /// Configured base URL, without trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Active session of a campaign.
    #[instrument(skip_all, fields(campaign_id = %campaign_id))]
    pub async fn active_session(&self, campaign_id: &CampaignId) -> Result<SessionSummary> {
        let path = format!("/campaigns/{campaign_id}/sessions/active");
        self.json(self.request(Method::GET, &path)).await
    }

    /// All sessions of a campaign.
    #[instrument(skip_all, fields(campaign_id = %campaign_id))]
    pub async fn list_sessions(&self, campaign_id: &CampaignId) -> Result<Vec<SessionSummary>> {
        let path = format!("/campaigns/{campaign_id}/sessions");
        self.json(self.request(Method::GET, &path)).await
    }

    /// Start a new session; the server closes any previously active one.
    #[instrument(skip_all, fields(campaign_id = %campaign_id))]
    pub async fn activate_session(
        &self,
        campaign_id: &CampaignId,
        title: &str,
    ) -> Result<SessionSummary> {
        let path = format!("/campaigns/{campaign_id}/sessions");
        let body = json!({ "title": title });
        self.json(self.request(Method::POST, &path).json(&body)).await
    }

    /// Close an active session.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn close_session(&self, session_id: &SessionId) -> Result<SessionSummary> {
        let path = format!("/sessions/{session_id}/close");
        self.json(self.request(Method::POST, &path).json(&json!({})))
            .await
    }

    /// Resume a closed session.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn resume_session(&self, session_id: &SessionId) -> Result<SessionSummary> {
        let path = format!("/sessions/{session_id}/resume");
        self.json(self.request(Method::POST, &path).json(&json!({})))
            .await
    }

    /// Issue a GM command; the server broadcasts it as `gm_command`.
    #[instrument(skip_all, fields(session_id = %session_id, kind = kind))]
    pub async fn send_command(
        &self,
        session_id: &SessionId,
        kind: &str,
        payload: Option<&Map<String, Value>>,
    ) -> Result<CommandAck> {
        let path = format!("/sessions/{session_id}/commands");
        let body = CommandBody { kind, payload };
        let response = self.send(self.request(Method::POST, &path).json(&body)).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(CommandAck { ok: true });
        }
        Ok(response.json().await?)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{path}", self.base_url);
        let builder = self.http.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let reason = status.canonical_reason().unwrap_or_default().to_owned();
        let body = response.bytes().await.unwrap_or_default();
        let message = error_message(&body).unwrap_or(reason);
        debug!(status = status.as_u16(), %message, "request rejected");
        Err(ApiError::Http {
            status: status.as_u16(),
            message,
        })
    }

    async fn json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        Ok(self.send(builder).await?.json().await?)
    }
}

#[async_trait]
impl RollHistorySource for ApiClient {
    #[instrument(skip_all, fields(session_id = %session_id))]
    async fn recent_rolls(&self, session_id: &SessionId, limit: usize) -> Result<Vec<RollEvent>> {
        let path = format!("/sessions/{session_id}/rolls?limit={limit}");
        self.json(self.request(Method::GET, &path)).await
    }
}

/// Pull a human-readable message out of an error body: `error`, then
/// `message`, then `detail`.
fn error_message(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    ["error", "message", "detail"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .filter(|m| !m.is_empty())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn summary_json(id: &str, status: &str) -> Value {
        json!({
            "id": id,
            "campaignId": "c1",
            "number": 1,
            "title": "Opening night",
            "status": status,
            "isActive": status == "ACTIVE",
            "durationSeconds": 0,
            "createdAt": "2026-01-01T00:00:00Z"
        })
    }

    fn roll_json(id: &str, total: i64) -> Value {
        json!({
            "id": id,
            "campaignId": "c1",
            "sessionId": "s1",
            "authorName": "Ana",
            "roleMode": "PLAYER",
            "label": null,
            "expression": "1d20",
            "dice": {"count": 1, "sides": 20, "modifier": 0},
            "results": [total],
            "total": total,
            "createdAt": "2026-01-01T00:00:00Z"
        })
    }

    #[test]
    fn blank_base_url_rejected() {
        assert_matches!(ApiClient::new("  ", None), Err(ApiError::MissingBaseUrl));
    }

    #[test]
    fn from_settings_requires_base_url() {
        let settings = LimiarSettings::default();
        assert_matches!(
            ApiClient::from_settings(&settings, None),
            Err(ApiError::MissingBaseUrl)
        );
    }

    #[test]
    fn trailing_slash_trimmed() {
        let client = ApiClient::new("http://localhost:8000/api/", None).unwrap();
        assert_eq!(client.base_url(), "http://localhost:8000/api");
    }

    #[test]
    fn error_message_precedence() {
        assert_eq!(
            error_message(br#"{"error":"a","message":"b"}"#).as_deref(),
            Some("a")
        );
        assert_eq!(error_message(br#"{"message":"b"}"#).as_deref(), Some("b"));
        assert_eq!(
            error_message(br#"{"detail":"Session not found"}"#).as_deref(),
            Some("Session not found")
        );
        assert_eq!(error_message(b"<html>"), None);
        assert_eq!(error_message(br#"{"error":""}"#), None);
    }

    #[tokio::test]
    async fn recent_rolls_sends_limit_and_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/sessions/s1/rolls"))
            .and(query_param("limit", "50"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([roll_json("r2", 9), roll_json("r1", 4)])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = ApiClient::new(&format!("{}/api", server.uri()), Some("tok".into())).unwrap();
        let rolls = client.recent_rolls(&SessionId::from("s1"), 50).await.unwrap();
        assert_eq!(rolls.len(), 2);
        assert_eq!(rolls[0].id.as_str(), "r2");
        assert_eq!(rolls[1].total, 4);
    }

    #[tokio::test]
    async fn no_token_means_no_authorization_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/campaigns/c1/sessions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri(), None).unwrap();
        let sessions = client.list_sessions(&CampaignId::from("c1")).await.unwrap();
        assert!(sessions.is_empty());

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(!requests[0].headers.contains_key("authorization"));
    }

    #[tokio::test]
    async fn http_error_uses_body_error_field() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sessions/s1/close"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"error": "Session is not active"})),
            )
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri(), Some("t".into())).unwrap();
        let err = client.close_session(&SessionId::from("s1")).await.unwrap_err();
        assert_matches!(
            err,
            ApiError::Http { status: 400, ref message } if message == "Session is not active"
        );
    }

    #[tokio::test]
    async fn http_error_falls_back_to_reason() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/campaigns/c1/sessions/active"))
            .respond_with(ResponseTemplate::new(404).set_body_string("nope"))
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri(), None).unwrap();
        let err = client
            .active_session(&CampaignId::from("c1"))
            .await
            .unwrap_err();
        assert_matches!(
            err,
            ApiError::Http { status: 404, ref message } if message == "Not Found"
        );
    }

    #[tokio::test]
    async fn activate_posts_title() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/campaigns/c1/sessions"))
            .and(body_json(json!({"title": "Session 4"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(summary_json("s4", "ACTIVE")))
            .expect(1)
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri(), Some("t".into())).unwrap();
        let session = client
            .activate_session(&CampaignId::from("c1"), "Session 4")
            .await
            .unwrap();
        assert_eq!(session.id.as_str(), "s4");
        assert!(session.is_active);
    }

    #[tokio::test]
    async fn resume_returns_summary() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sessions/s2/resume"))
            .respond_with(ResponseTemplate::new(200).set_body_json(summary_json("s2", "ACTIVE")))
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri(), None).unwrap();
        let session = client.resume_session(&SessionId::from("s2")).await.unwrap();
        assert_eq!(session.id.as_str(), "s2");
    }

    #[tokio::test]
    async fn send_command_body_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sessions/s1/commands"))
            .and(body_json(json!({"type": "request_roll", "payload": {"expression": "1d20"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri(), Some("t".into())).unwrap();
        let mut payload = Map::new();
        let _ = payload.insert("expression".into(), json!("1d20"));
        let ack = client
            .send_command(&SessionId::from("s1"), "request_roll", Some(&payload))
            .await
            .unwrap();
        assert!(ack.ok);
    }

    #[tokio::test]
    async fn send_command_no_content_is_ok() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sessions/s1/commands"))
            .and(body_json(json!({"type": "open_shop"})))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri(), None).unwrap();
        let ack = client
            .send_command(&SessionId::from("s1"), "open_shop", None)
            .await
            .unwrap();
        assert_eq!(ack, CommandAck { ok: true });
    }
}
