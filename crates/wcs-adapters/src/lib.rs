//! Upstream workspace chat API client and payload normalization.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::Url;
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};
use wcs_core::{ChatRecord, ServerConfig};
use wcs_storage::{snippet, FetchError, FetchedResponse, HttpFetcher};

pub const CRATE_NAME: &str = "wcs-adapters";

/// Keys tried, in order, for the record array inside an envelope object.
pub const ENVELOPE_KEYS: [&str; 5] = ["items", "data", "results", "chats", "entries"];

const X_API_KEY: &str = "x-api-key";
const WORKSPACE_CHAT_PATH: &str = "/api/v1/workspace";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Server host configuration is missing")]
    MissingHost,
    #[error("Invalid base URL for sync endpoint: {0}")]
    InvalidHost(String),
    #[error("Invalid API key header value")]
    InvalidApiKey,
    #[error("Unable to reach sync API: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("Sync API returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Unexpected content type '{content_type}' when syncing {widget_id}")]
    ContentType {
        content_type: String,
        widget_id: String,
    },
    #[error("Invalid JSON received from sync API")]
    InvalidJson(#[source] serde_json::Error),
}

impl From<FetchError> for SyncError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Request(err) => SyncError::Transport(err),
            FetchError::HttpStatus { status, body, .. } => SyncError::Status { status, body },
        }
    }
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("message is required.")]
    EmptyMessage,
    #[error("Workspace slug not configured.")]
    MissingSlug,
    #[error("Server connection information is incomplete.")]
    MissingBaseUrl,
    #[error("API key not configured.")]
    MissingApiKey,
    #[error("Invalid API key header value")]
    InvalidApiKey,
    #[error("Unable to reach workspace API.")]
    Unreachable(#[source] FetchError),
}

/// Where chat records for a widget come from.
#[async_trait]
pub trait ChatSource: Send + Sync {
    async fn fetch_chats(
        &self,
        config: &ServerConfig,
        widget_id: &str,
    ) -> Result<Vec<ChatRecord>, SyncError>;
}

/// Sends a reviewer-typed message into the workspace chat.
#[async_trait]
pub trait MessageRelay: Send + Sync {
    /// The upstream reply is returned whatever its status.
    async fn send_message(
        &self,
        config: &ServerConfig,
        message: &str,
        session_id: &str,
    ) -> Result<FetchedResponse, MessageError>;
}

/// `GET {host}/api/v1/embed/{widgetId}/chats` against the configured workspace.
#[derive(Debug, Clone)]
pub struct WorkspaceChatClient {
    http: HttpFetcher,
}

impl WorkspaceChatClient {
    pub fn new(http: HttpFetcher) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ChatSource for WorkspaceChatClient {
    async fn fetch_chats(
        &self,
        config: &ServerConfig,
        widget_id: &str,
    ) -> Result<Vec<ChatRecord>, SyncError> {
        let url = build_sync_url(config, widget_id)?;
        let headers = request_headers(config)?;
        let response = self.http.fetch_bytes(url.as_str(), headers).await.map_err(|err| {
            warn!(widget_id, error = %err, "widget chat fetch failed");
            SyncError::from(err)
        })?;

        if !response
            .content_type
            .to_ascii_lowercase()
            .contains("application/json")
        {
            warn!(
                widget_id,
                content_type = %response.content_type,
                payload = %response.body_snippet(),
                "unexpected content type from sync API"
            );
            return Err(SyncError::ContentType {
                content_type: response.content_type,
                widget_id: widget_id.to_string(),
            });
        }

        let root: JsonValue = serde_json::from_slice(&response.body).map_err(|err| {
            warn!(widget_id, payload = %response.body_snippet(), "invalid JSON from sync API");
            SyncError::InvalidJson(err)
        })?;
        let records = normalize_payload(&root)
            .into_iter()
            .map(record_from_json)
            .collect::<Vec<_>>();
        debug!(widget_id, records = records.len(), url = %response.final_url, "fetched widget chats");
        Ok(records)
    }
}

#[async_trait]
impl MessageRelay for WorkspaceChatClient {
    async fn send_message(
        &self,
        config: &ServerConfig,
        message: &str,
        session_id: &str,
    ) -> Result<FetchedResponse, MessageError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(MessageError::EmptyMessage);
        }
        let url = workspace_chat_url(config)?;
        let key = config.api_key().ok_or(MessageError::MissingApiKey)?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {key}")).map_err(|_| MessageError::InvalidApiKey)?,
        );
        let body = json!({
            "message": message,
            "mode": "chat",
            "sessionId": session_id,
            "reset": false,
        });
        let reply = self.http.post_json(&url, headers, &body).await.map_err(|err| {
            warn!(url = %url, error = %err, "workspace chat unreachable");
            MessageError::Unreachable(err)
        })?;
        debug!(status = %reply.status, url = %url, "workspace chat replied");
        Ok(reply)
    }
}

/// Lower-cased workspace name with every run of other characters folded into
/// one `-`, trimmed of dashes. `None` when nothing is left.
pub fn workspace_slug(name: &str) -> Option<String> {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            slug.push(c);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-');
    (!slug.is_empty()).then(|| slug.to_string())
}

/// `connection_info` when set, otherwise the host (`https://` by default)
/// with the configured port unless the host already names one.
pub fn workspace_base_url(config: &ServerConfig) -> Option<String> {
    if let Some(info) = config
        .connection_info
        .as_deref()
        .map(str::trim)
        .filter(|info| !info.is_empty())
    {
        return Some(strip_trailing_slash(info).to_string());
    }
    let host = strip_trailing_slash(config.server_host.trim());
    if host.is_empty() {
        return None;
    }
    let mut base = if host.contains("://") {
        host.to_string()
    } else {
        format!("https://{host}")
    };
    let has_port = host
        .rsplit_once(':')
        .is_some_and(|(_, tail)| !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()));
    if !has_port {
        if let Some(port) = config.server_port.filter(|p| *p > 0) {
            base.push_str(&format!(":{port}"));
        }
    }
    Some(base)
}

fn strip_trailing_slash(value: &str) -> &str {
    value.strip_suffix('/').unwrap_or(value)
}

pub fn workspace_chat_url(config: &ServerConfig) -> Result<String, MessageError> {
    let slug = config
        .workspace_name
        .as_deref()
        .and_then(workspace_slug)
        .ok_or(MessageError::MissingSlug)?;
    let base = workspace_base_url(config).ok_or(MessageError::MissingBaseUrl)?;
    Ok(format!("{base}{WORKSPACE_CHAT_PATH}/{slug}/chat"))
}

pub fn request_headers(config: &ServerConfig) -> Result<HeaderMap, SyncError> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    if let Some(key) = config.api_key() {
        let bearer = HeaderValue::from_str(&format!("Bearer {key}"))
            .map_err(|_| SyncError::InvalidApiKey)?;
        let raw = HeaderValue::from_str(key).map_err(|_| SyncError::InvalidApiKey)?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(X_API_KEY, raw);
    }
    Ok(headers)
}

/// Sync endpoint for `widget_id`: `https://` when the host has no scheme, an
/// `/api` segment unless the path already has one, then the encoded widget id.
pub fn build_sync_url(config: &ServerConfig, widget_id: &str) -> Result<Url, SyncError> {
    let host = config.server_host.trim();
    if host.is_empty() {
        return Err(SyncError::MissingHost);
    }
    let with_scheme = if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{host}")
    };
    let mut url = Url::parse(&with_scheme).map_err(|err| SyncError::InvalidHost(err.to_string()))?;
    if url.cannot_be_a_base() {
        return Err(SyncError::InvalidHost(host.to_string()));
    }
    if url.port().is_none() {
        if let Some(port) = config.server_port.filter(|p| *p > 0) {
            let port = u16::try_from(port).map_err(|_| SyncError::InvalidHost(host.to_string()))?;
            url.set_port(Some(port))
                .map_err(|_| SyncError::InvalidHost(host.to_string()))?;
        }
    }

    let needs_api = !url.path().contains("/api");
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| SyncError::InvalidHost(host.to_string()))?;
        segments.pop_if_empty();
        if needs_api {
            segments.push("api");
        }
        segments.extend(["v1", "embed", widget_id, "chats"]);
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

/// Record objects in an upstream payload, whatever envelope they came in.
pub fn normalize_payload(root: &JsonValue) -> Vec<&Map<String, JsonValue>> {
    match root {
        JsonValue::Array(items) => items.iter().filter_map(JsonValue::as_object).collect(),
        JsonValue::Object(obj) => ENVELOPE_KEYS
            .iter()
            .find_map(|key| obj.get(*key).and_then(JsonValue::as_array))
            .map(|items| items.iter().filter_map(JsonValue::as_object).collect())
            .unwrap_or_else(|| vec![obj]),
        _ => Vec::new(),
    }
}

pub fn record_from_json(obj: &Map<String, JsonValue>) -> ChatRecord {
    ChatRecord {
        widget_chat_id: string_field(obj, "id"),
        prompt: string_field(obj, "prompt"),
        response_text: response_text(obj),
        created_at: string_field(obj, "createdAt")
            .or_else(|| string_field(obj, "created_at"))
            .and_then(|raw| parse_created_at(&raw)),
        session_id: string_field(obj, "session_id").or_else(|| string_field(obj, "sessionId")),
        username: string_field(obj, "username"),
    }
}

/// String value of `key`; other scalars and structures as their JSON text.
fn string_field(obj: &Map<String, JsonValue>, key: &str) -> Option<String> {
    match obj.get(key)? {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn extract_text(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::Null => None,
        JsonValue::Object(obj) => string_field(obj, "text"),
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Response prose from `response`, falling back to `raw_chat.response`.
pub fn response_text(obj: &Map<String, JsonValue>) -> Option<String> {
    let text = extract_text(obj.get("response")).or_else(|| {
        obj.get("raw_chat")
            .and_then(JsonValue::as_object)
            .and_then(|raw| extract_text(raw.get("response")))
    })?;
    Some(humanize(&unwrap_text_envelope(text)))
}

/// `{"text": "..."}` encoded as a string yields its inner text.
fn unwrap_text_envelope(raw: String) -> String {
    match serde_json::from_str::<JsonValue>(&raw) {
        Ok(JsonValue::Object(obj)) => string_field(&obj, "text").unwrap_or(raw),
        _ => raw,
    }
}

/// Turn literal `\n` / `\r` escape sequences into real line breaks and trim.
pub fn humanize(text: &str) -> String {
    text.replace("\\n", "\n").replace("\\r", "\r").trim().to_string()
}

pub fn parse_created_at(raw: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(raw.trim()) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(err) => {
            debug!(raw = %snippet(raw), error = %err, "unparsable chat timestamp");
            None
        }
    }
}
