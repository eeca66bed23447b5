//! Axum JSON surface for widget sync, table browsing and review selections.

pub mod session;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use wcs_adapters::{MessageError, MessageRelay, WorkspaceChatClient};
use wcs_core::{
    ChatRow, Page, PageRequest, RowFilters, RowQuery, SearchTerms, Selection, SelectionError,
    SelectionSource, SortColumn, SortDirection, SyncSettings, TableName, TermChatSnapshot,
};
use wcs_storage::{
    claim_table, ensure_table, RowSource, ServerConfigSource, SnapshotRowSource, TableClaim,
    TableRowSource, WidgetRegistry, WidgetTables,
};
use wcs_sync::{RunSyncError, SyncConfig, SyncDeps, SyncOrchestrator, SyncTimer, WidgetSyncStatus};

use crate::session::{session_cookie, session_id, SessionStore};

pub const CRATE_NAME: &str = "wcs-web";

const TERM_REVIEW_BACK_URL: &str = "/dashboard";

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<dyn WidgetRegistry>,
    pub tables: Arc<dyn WidgetTables>,
    pub server_config: Arc<dyn ServerConfigSource>,
    pub relay: Arc<dyn MessageRelay>,
    pub timer: SyncTimer,
    pub sessions: Arc<SessionStore>,
}

impl AppState {
    pub fn new(
        deps: &SyncDeps,
        relay: Arc<dyn MessageRelay>,
        timer: SyncTimer,
        sessions: Arc<SessionStore>,
    ) -> Self {
        Self {
            registry: deps.registry.clone(),
            tables: deps.tables.clone(),
            server_config: deps.server_config.clone(),
            relay,
            timer,
            sessions,
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Internal(String),
    #[error("{0}")]
    BadGateway(String),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Log the cause and answer with `message` only.
    fn internal(message: &str, err: anyhow::Error) -> Self {
        error!(error = %format!("{err:#}"), "{message}");
        Self::Internal(message.to_string())
    }
}

impl From<SelectionError> for ApiError {
    fn from(err: SelectionError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
        };
        (
            status,
            Json(json!({ "status": "error", "message": self.to_string() })),
        )
            .into_response()
    }
}

type ApiResult<T = Response> = Result<T, ApiError>;

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/widgets", get(widgets_handler))
        .route("/sync", post(sync_handler))
        .route("/sync/timer", get(timer_status_handler).post(timer_update_handler))
        .route("/table-check", get(table_check_handler).post(table_create_handler))
        .route("/view/data", get(view_data_handler))
        .route("/view/select-ids", get(select_ids_handler))
        .route("/review/start", post(review_start_handler))
        .route("/review/data", get(review_data_handler))
        .route("/review/meta", get(review_meta_handler))
        .route("/review/manual-message", post(manual_message_handler))
        .route("/terms/snapshots", post(term_snapshots_handler))
        .route("/dashboard/term-review", get(term_review_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("WCS_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = SyncConfig::from_env();
    let pool = wcs_storage::connect(&config.database_url).await?;
    wcs_storage::MIGRATOR.run(&pool).await?;

    let deps = SyncDeps::postgres(pool, &config)?;
    let relay = Arc::new(WorkspaceChatClient::new(config.http_fetcher()?));
    let orchestrator = Arc::new(SyncOrchestrator::new(deps.clone()));
    let timer = SyncTimer::start(orchestrator, config.scheduler_enabled).await?;
    let sessions = Arc::new(SessionStore::from_env());
    spawn_session_sweeper(sessions.clone());

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, scheduler = timer.is_scheduling(), "serving widget chat sync");
    axum::serve(listener, app(AppState::new(&deps, relay, timer.clone(), sessions))).await?;
    timer.shutdown().await?;
    Ok(())
}

fn spawn_session_sweeper(sessions: Arc<SessionStore>) {
    let period = sessions.idle().clamp(Duration::from_secs(1), Duration::from_secs(60));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let removed = sessions.sweep();
            if removed > 0 {
                info!(removed, "expired idle sessions");
            }
        }
    });
}

/// Query parameters shared by table browsing, id selection and review.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BrowseParams {
    widget_id: Option<String>,
    selection_id: Option<String>,
    page: Option<String>,
    limit: Option<String>,
    sort_column: Option<String>,
    sort_dir: Option<String>,
    search: Option<String>,
    filter_prompt: Option<String>,
    filter_response: Option<String>,
}

impl BrowseParams {
    fn filters(&self) -> RowFilters {
        RowFilters::new(
            self.filter_prompt.as_deref(),
            self.filter_response.as_deref(),
            self.search.as_deref(),
        )
    }

    fn row_query(&self) -> RowQuery {
        RowQuery {
            filters: self.filters(),
            sort: SortColumn::parse(self.sort_column.as_deref()),
            direction: SortDirection::parse(self.sort_dir.as_deref()),
            page: PageRequest::parse(self.page.as_deref(), self.limit.as_deref()),
        }
    }
}

fn required<'a>(value: Option<&'a str>, message: &str) -> ApiResult<&'a str> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::bad_request(message))
}

fn with_new_session(mut resp: Response, issued: Option<String>) -> Response {
    if let Some(value) = issued.as_deref().and_then(session_cookie) {
        resp.headers_mut().append(header::SET_COOKIE, value);
    }
    resp
}

async fn claim(state: &AppState, widget_id: &str) -> ApiResult<TableClaim> {
    claim_table(state.registry.as_ref(), widget_id)
        .await
        .map_err(|err| ApiError::internal("Unable to load widget.", err))
}

/// Reject widgets whose table belongs to an older registered widget.
fn ensure_owner(claim: &TableClaim) -> ApiResult<()> {
    match claim.foreign_owner() {
        Some(owner) => Err(ApiError::Conflict(format!(
            "Table name {} is already used by widget '{}'.",
            claim.table, owner.widget_id
        ))),
        None => Ok(()),
    }
}

#[derive(Debug, Deserialize)]
struct WidgetListParams {
    filter: Option<String>,
}

async fn widgets_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<WidgetListParams>,
) -> ApiResult {
    let widgets = state
        .registry
        .list(params.filter.as_deref())
        .await
        .map_err(|err| ApiError::internal("Unable to list widgets.", err))?;
    Ok(Json(json!({ "status": "ok", "widgets": widgets })).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncParams {
    widget_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncResponse {
    status: &'static str,
    widget_status: Vec<WidgetSyncStatus>,
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SyncParams>,
) -> ApiResult {
    match state.timer.run_now(params.widget_id.as_deref()).await {
        Ok(widget_status) => Ok(Json(SyncResponse {
            status: "ok",
            widget_status,
        })
        .into_response()),
        Err(err @ RunSyncError::MissingConfig) => {
            warn!(error = %err, "widget sync refused");
            Err(ApiError::Internal(format!("Widget sync failed: {err}")))
        }
        Err(RunSyncError::Store(err)) => {
            error!(error = %format!("{err:#}"), "widget sync failed");
            Err(ApiError::Internal(format!("Widget sync failed: {err}")))
        }
    }
}

#[derive(Serialize)]
struct TimerResponse {
    status: &'static str,
    #[serde(flatten)]
    settings: SyncSettings,
}

async fn timer_status_handler(State(state): State<Arc<AppState>>) -> ApiResult {
    let settings = state
        .timer
        .status()
        .await
        .map_err(|err| ApiError::internal("Unable to read sync settings.", err))?;
    Ok(Json(TimerResponse {
        status: "ok",
        settings,
    })
    .into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimerParams {
    interval_seconds: Option<String>,
}

async fn timer_update_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TimerParams>,
) -> ApiResult {
    let seconds = params
        .interval_seconds
        .as_deref()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .ok_or_else(|| ApiError::bad_request("Invalid interval specified."))?;
    let settings = state
        .timer
        .update_interval(seconds)
        .await
        .map_err(|err| ApiError::internal("Unable to update sync interval.", err))?;
    Ok(Json(TimerResponse {
        status: "ok",
        settings,
    })
    .into_response())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TableCheckResponse {
    status: &'static str,
    widget_id: String,
    table_name: TableName,
    table_exists: bool,
    created: bool,
    message: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableCheckParams {
    widget_id: Option<String>,
}

async fn table_check_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TableCheckParams>,
) -> ApiResult {
    let widget_id = required(params.widget_id.as_deref(), "widgetId is required.")?;
    let claim = claim(&state, widget_id).await?;
    ensure_owner(&claim)?;
    let table = claim.table;
    let exists = state
        .tables
        .table_exists(&table)
        .await
        .map_err(|err| ApiError::internal("Unable to inspect the database.", err))?;
    Ok(Json(TableCheckResponse {
        status: "ok",
        widget_id: widget_id.to_string(),
        table_name: table,
        table_exists: exists,
        created: false,
        message: if exists {
            "Table is accessible."
        } else {
            "Table does not exist."
        },
    })
    .into_response())
}

async fn table_create_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TableCheckParams>,
) -> ApiResult {
    let widget_id = required(params.widget_id.as_deref(), "widgetId is required.")?;
    let claim = claim(&state, widget_id).await?;
    ensure_owner(&claim)?;
    let table = claim.table;
    let outcome = ensure_table(state.tables.as_ref(), &table)
        .await
        .map_err(|err| ApiError::internal("Unable to create the table.", err))?;
    if !outcome.exists {
        return Err(ApiError::Internal("Unable to create the table.".to_string()));
    }
    Ok(Json(TableCheckResponse {
        status: "ok",
        widget_id: widget_id.to_string(),
        table_name: table,
        table_exists: true,
        created: outcome.created,
        message: if outcome.created {
            "Table created successfully."
        } else {
            "Table already exists."
        },
    })
    .into_response())
}

/// Resolve a registered widget with an existing table for browsing.
async fn browsable_table(state: &AppState, params: &BrowseParams) -> ApiResult<TableName> {
    let widget_id = required(params.widget_id.as_deref(), "widgetId required.")?;
    let claim = claim(state, widget_id).await?;
    if claim.widget.is_none() {
        return Err(ApiError::not_found("Widget not found."));
    }
    ensure_owner(&claim)?;
    let table = claim.table;
    let exists = state
        .tables
        .table_exists(&table)
        .await
        .map_err(|err| ApiError::internal("Unable to inspect the database.", err))?;
    if !exists {
        return Err(ApiError::bad_request("Table for widget does not exist."));
    }
    Ok(table)
}

#[derive(Serialize)]
struct PageResponse {
    status: &'static str,
    #[serde(flatten)]
    page: Page<ChatRow>,
    #[serde(rename = "searchTerms", skip_serializing_if = "Option::is_none")]
    search_terms: Option<SearchTerms>,
}

async fn view_data_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<BrowseParams>,
) -> ApiResult {
    let table = browsable_table(&state, &params).await?;
    let page = TableRowSource::new(state.tables.as_ref(), table)
        .query(&params.row_query())
        .await
        .map_err(|err| ApiError::internal("Unable to fetch widget data.", err))?;
    Ok(Json(PageResponse {
        status: "ok",
        page,
        search_terms: None,
    })
    .into_response())
}

async fn select_ids_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<BrowseParams>,
) -> ApiResult {
    let table = browsable_table(&state, &params).await?;
    let chat_ids = state
        .tables
        .matching_chat_ids(&table, &params.filters())
        .await
        .map_err(|err| ApiError::internal("Unable to fetch chat ids.", err))?;
    Ok(Json(json!({
        "status": "ok",
        "totalRows": chat_ids.len(),
        "chatIds": chat_ids,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewStartRequest {
    #[serde(default)]
    widget_id: String,
    #[serde(default)]
    selected_chat_ids: Vec<JsonValue>,
    #[serde(default)]
    search_terms: SearchTerms,
}

fn chat_id_text(value: JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

async fn review_start_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    let request: ReviewStartRequest = serde_json::from_slice(&body)
        .map_err(|_| ApiError::bad_request("Invalid payload."))?;
    if request.selected_chat_ids.is_empty() {
        return Err(SelectionError::MissingWidget.into());
    }
    let selection = Selection::for_table(
        &request.widget_id,
        request.selected_chat_ids.into_iter().filter_map(chat_id_text),
        request.search_terms,
    )?;
    if let Some(widget_id) = selection.widget_id() {
        let claim = claim(&state, widget_id).await?;
        if claim.widget.is_none() {
            return Err(ApiError::not_found("Widget not found."));
        }
        ensure_owner(&claim)?;
    }
    let chat_count = selection.chat_ids().len();

    let sid = session_id(&headers);
    let (selection_id, issued) = state
        .sessions
        .write(sid.as_deref(), |session| session.selections.insert(selection));
    info!(chat_count, "review selection created");
    Ok(with_new_session(
        Json(json!({ "status": "ok", "selectionId": selection_id })).into_response(),
        issued,
    ))
}

fn resolve_selection(
    state: &AppState,
    headers: &HeaderMap,
    selection_id: Option<&str>,
) -> ApiResult<Selection> {
    let selection_id = required(selection_id, "selectionId required.")?;
    let sid = session_id(headers);
    state
        .sessions
        .read(sid.as_deref(), |session| session.selections.get(selection_id).cloned())
        .flatten()
        .ok_or_else(|| ApiError::not_found("Selection not found."))
}

async fn review_data_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<BrowseParams>,
) -> ApiResult {
    let selection = resolve_selection(&state, &headers, params.selection_id.as_deref())?;
    let query = params.row_query();

    let page = match selection.source() {
        SelectionSource::Table { widget_id } => {
            let claim = claim(&state, widget_id).await?;
            ensure_owner(&claim)?;
            let table = claim.table;
            let exists = state
                .tables
                .table_exists(&table)
                .await
                .map_err(|err| ApiError::internal("Unable to inspect the database.", err))?;
            if !exists {
                return Err(ApiError::bad_request("Table does not exist."));
            }
            TableRowSource::new(state.tables.as_ref(), table)
                .scoped(selection.chat_ids())
                .query(&query)
                .await
        }
        SelectionSource::Snapshots { snapshots, .. } => {
            SnapshotRowSource::new(snapshots).query(&query).await
        }
    }
    .map_err(|err| ApiError::internal("Unable to fetch review data.", err))?;

    Ok(Json(PageResponse {
        status: "ok",
        page,
        search_terms: Some(selection.search_terms().clone()),
    })
    .into_response())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReviewMeta<'a> {
    status: &'static str,
    selection_id: &'a str,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    widget_id: Option<&'a str>,
    display_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    back_url: Option<&'a str>,
    chat_count: usize,
    search_terms: &'a SearchTerms,
}

async fn review_meta_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<BrowseParams>,
) -> ApiResult {
    let selection = resolve_selection(&state, &headers, params.selection_id.as_deref())?;
    let (kind, back_url) = match selection.source() {
        SelectionSource::Table { .. } => ("table", None),
        SelectionSource::Snapshots { back_url, .. } => ("snapshot", Some(back_url.as_str())),
    };
    let selection_id = params.selection_id.as_deref().unwrap_or_default().trim();
    Ok(Json(ReviewMeta {
        status: "ok",
        selection_id,
        kind,
        widget_id: selection.widget_id(),
        display_name: selection.display_name(),
        back_url,
        chat_count: selection.chat_ids().len(),
        search_terms: selection.search_terms(),
    })
    .into_response())
}

async fn term_snapshots_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    let terms: HashMap<String, Vec<TermChatSnapshot>> = serde_json::from_slice(&body)
        .map_err(|_| ApiError::bad_request("Invalid payload."))?;
    let term_count = terms.len();
    let sid = session_id(&headers);
    let ((), issued) = state
        .sessions
        .write(sid.as_deref(), |session| session.term_snapshots = terms);
    Ok(with_new_session(
        Json(json!({ "status": "ok", "terms": term_count })).into_response(),
        issued,
    ))
}

#[derive(Debug, Deserialize)]
struct TermReviewParams {
    term: Option<String>,
}

async fn term_review_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<TermReviewParams>,
) -> ApiResult {
    let term = params
        .term
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("term parameter is required."))?;
    let sid = session_id(&headers);
    let snapshots = state
        .sessions
        .read(sid.as_deref(), |session| {
            if session.term_snapshots.is_empty() {
                return Err(ApiError::not_found("No term data available."));
            }
            session
                .term_snapshots
                .get(term)
                .filter(|list| !list.is_empty())
                .cloned()
                .ok_or_else(|| ApiError::not_found("No chats found for the selected term."))
        })
        .unwrap_or_else(|| Err(ApiError::not_found("No term data available.")))?;

    let selection = Selection::for_snapshots(term, TERM_REVIEW_BACK_URL, snapshots)?;
    let (selection_id, issued) = state
        .sessions
        .write(sid.as_deref(), |session| session.selections.insert(selection));
    Ok(with_new_session(
        Json(json!({ "status": "ok", "selectionId": selection_id })).into_response(),
        issued,
    ))
}

#[derive(Debug, Deserialize)]
struct ManualMessageRequest {
    #[serde(default)]
    message: String,
}

async fn manual_message_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    let request: ManualMessageRequest = serde_json::from_slice(&body)
        .map_err(|_| ApiError::bad_request("Invalid payload."))?;
    let message = request.message.trim();
    if message.is_empty() {
        return Err(MessageError::EmptyMessage.into());
    }
    let config = state
        .server_config
        .load()
        .await
        .map_err(|err| ApiError::internal("Server configuration not available.", err))?
        .ok_or_else(|| ApiError::Internal("Server configuration missing.".to_string()))?;

    let sid = session_id(&headers);
    let ((), issued) = state.sessions.write(sid.as_deref(), |_| ());
    let session = issued.clone().or(sid).unwrap_or_default();

    let reply = state.relay.send_message(&config, message, &session).await?;
    let status = StatusCode::from_u16(reply.status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    info!(%status, "manual message relayed");
    Ok(with_new_session(
        (
            status,
            [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
            reply.body,
        )
            .into_response(),
        issued,
    ))
}

impl From<MessageError> for ApiError {
    fn from(err: MessageError) -> Self {
        match err {
            MessageError::Unreachable(ref cause) => {
                error!(error = %cause, "workspace chat unreachable");
                ApiError::BadGateway(err.to_string())
            }
            other => ApiError::BadRequest(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use std::sync::Mutex;
    use wcs_adapters::{ChatSource, SyncError};
    use wcs_core::{ChatRecord, ServerConfig, WidgetEntry};
    use wcs_storage::{FetchedResponse, HttpClientConfig, HttpFetcher};
    use wcs_storage::memory::{
        MemorySyncSettingsStore, MemoryWidgetRegistry, MemoryWidgetTables,
        StaticServerConfigSource,
    };

    struct CannedChats(Vec<ChatRecord>);

    #[async_trait]
    impl ChatSource for CannedChats {
        async fn fetch_chats(
            &self,
            _config: &ServerConfig,
            _widget_id: &str,
        ) -> Result<Vec<ChatRecord>, SyncError> {
            Ok(self.0.clone())
        }
    }

    /// Answers 202 and echoes what it was asked to send.
    #[derive(Default)]
    struct EchoRelay {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MessageRelay for EchoRelay {
        async fn send_message(
            &self,
            _config: &ServerConfig,
            message: &str,
            session_id: &str,
        ) -> Result<FetchedResponse, MessageError> {
            self.sent
                .lock()
                .unwrap()
                .push((message.to_string(), session_id.to_string()));
            Ok(FetchedResponse {
                status: StatusCode::ACCEPTED,
                final_url: "http://workspace.test/api/v1/workspace/demo/chat".into(),
                content_type: "application/json".into(),
                body: json!({ "textResponse": format!("echo: {message}") })
                    .to_string()
                    .into_bytes(),
            })
        }
    }

    fn chat(id: &str, prompt: &str, minute: u32) -> ChatRecord {
        ChatRecord {
            widget_chat_id: Some(id.to_string()),
            prompt: Some(prompt.to_string()),
            response_text: Some(format!("reply {id}")),
            created_at: Utc.with_ymd_and_hms(2026, 2, 1, 8, minute, 0).single(),
            session_id: Some(format!("s-{id}")),
            username: None,
        }
    }

    async fn test_app(config: Option<ServerConfig>) -> Router {
        test_app_with_relay(config, Arc::new(EchoRelay::default())).await
    }

    async fn test_app_with_relay(config: Option<ServerConfig>, relay: Arc<dyn MessageRelay>) -> Router {
        let widgets = vec![
            WidgetEntry {
                id: 1,
                widget_id: "Demo Bot!".into(),
                display_name: "Demo".into(),
                created_at: Utc::now(),
            },
            WidgetEntry {
                id: 2,
                widget_id: "fresh".into(),
                display_name: "Fresh".into(),
                created_at: Utc::now(),
            },
            // Registered later and sanitizes onto the Demo Bot! table.
            WidgetEntry {
                id: 3,
                widget_id: "Demo_Bot?".into(),
                display_name: "Copy".into(),
                created_at: Utc::now() + chrono::Duration::hours(1),
            },
        ];
        let records = (0..12)
            .map(|i| chat(&format!("c{i:02}"), if i < 4 { "refund please" } else { "hello" }, i))
            .collect::<Vec<_>>();
        let tables = MemoryWidgetTables::default()
            .with_table(TableName::from_widget_id("Demo Bot!"), records);
        let deps = SyncDeps {
            registry: Arc::new(MemoryWidgetRegistry::new(widgets)),
            server_config: Arc::new(StaticServerConfigSource::new(config)),
            tables: Arc::new(tables),
            chats: Arc::new(CannedChats(vec![chat("new-1", "synced", 30)])),
            settings: Arc::new(MemorySyncSettingsStore::default()),
        };
        let orchestrator = Arc::new(SyncOrchestrator::new(deps.clone()));
        let timer = SyncTimer::start(orchestrator, false).await.unwrap();
        app(AppState::new(&deps, relay, timer, Arc::new(SessionStore::default())))
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, HeaderMap, JsonValue) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&body).unwrap_or(JsonValue::Null);
        (status, headers, value)
    }

    fn get(uri: &str, cookie: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: JsonValue, cookie: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn cookie_from(headers: &HeaderMap) -> String {
        let raw = headers[header::SET_COOKIE].to_str().unwrap();
        raw.split(';').next().unwrap().to_string()
    }

    #[tokio::test]
    async fn view_data_pages_and_validates_input() {
        let app = test_app(None).await;

        let (status, _, body) = send(
            &app,
            get("/view/data?widgetId=Demo%20Bot!&limit=10&page=2&sortColumn=widget_chat_id&sortDir=asc", None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalRows"], 12);
        assert_eq!(body["totalPages"], 2);
        assert_eq!(body["page"], 2);
        assert_eq!(body["rows"].as_array().unwrap().len(), 2);
        assert_eq!(body["rows"][0]["chatId"], "c10");
        assert_eq!(body["rows"][0]["createdAt"], "2026-02-01T08:10:00Z");

        let (status, _, body) = send(&app, get("/view/data?widgetId=Demo%20Bot!&search=REFUND&sortColumn=;drop", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalRows"], 4);
        assert_eq!(body["rows"][0]["chatId"], "c03");

        let (status, _, body) = send(&app, get("/view/data", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "widgetId required.");

        let (status, _, body) = send(&app, get("/view/data?widgetId=ghost", None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "Widget not found.");

        let (status, _, body) = send(&app, get("/view/data?widgetId=fresh", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Table for widget does not exist.");
    }

    #[tokio::test]
    async fn select_ids_returns_every_match_newest_first() {
        let app = test_app(None).await;
        let (status, _, body) = send(&app, get("/view/select-ids?widgetId=Demo%20Bot!&filterPrompt=refund", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalRows"], 4);
        assert_eq!(body["chatIds"], json!(["c03", "c02", "c01", "c00"]));
    }

    #[tokio::test]
    async fn review_selection_is_scoped_to_its_session() {
        let app = test_app(None).await;
        let (status, headers, body) = send(
            &app,
            post_json(
                "/review/start",
                json!({
                    "widgetId": "Demo Bot!",
                    "selectedChatIds": ["c05", "c01", "c05", 7, "  "],
                    "searchTerms": {"global": "refund", "prompt": "", "response": ""}
                }),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let selection_id = body["selectionId"].as_str().unwrap().to_string();
        let cookie = cookie_from(&headers);
        assert!(cookie.starts_with("wcs_session="));

        let uri = format!("/review/data?selectionId={selection_id}&sortColumn=created_at&sortDir=asc");
        let (status, _, body) = send(&app, get(&uri, Some(&cookie))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalRows"], 2);
        assert_eq!(body["rows"][0]["chatId"], "c01");
        assert_eq!(body["searchTerms"]["global"], "refund");

        let (status, _, body) = send(&app, get(&uri, Some("wcs_session=someone-else"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "Selection not found.");

        let (status, _, _) = send(&app, get(&uri, None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let meta_uri = format!("/review/meta?selectionId={selection_id}");
        let (status, _, body) = send(&app, get(&meta_uri, Some(&cookie))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["kind"], "table");
        assert_eq!(body["widgetId"], "Demo Bot!");
        assert_eq!(body["chatCount"], 3);
    }

    #[tokio::test]
    async fn review_start_rejects_empty_selections() {
        let app = test_app(None).await;
        let (status, _, body) = send(
            &app,
            post_json("/review/start", json!({"widgetId": "w", "selectedChatIds": []}), None),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "widgetId and selections required.");

        let (status, _, body) = send(
            &app,
            post_json("/review/start", json!({"widgetId": "w", "selectedChatIds": ["", " "]}), None),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "At least one chat must be selected.");

        let bad = Request::builder()
            .method("POST")
            .uri("/review/start")
            .body(Body::from("{oops"))
            .unwrap();
        let (status, _, body) = send(&app, bad).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Invalid payload.");
    }

    #[tokio::test]
    async fn term_review_builds_snapshot_selection() {
        let app = test_app(None).await;
        let snapshot = |id: &str, prompt: &str| {
            json!({
                "termName": "refund",
                "widgetId": "Demo Bot!",
                "chatId": id,
                "prompt": prompt,
                "response": "r",
                "createdAt": null,
                "sessionId": "s"
            })
        };
        let (status, headers, _) = send(
            &app,
            post_json(
                "/terms/snapshots",
                json!({"refund": [snapshot("x1", "Zeta"), snapshot("x2", "alpha"), snapshot("x1", "Zeta")], "empty": []}),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let cookie = cookie_from(&headers);

        let (status, _, body) = send(&app, get("/dashboard/term-review?term=refund", Some(&cookie))).await;
        assert_eq!(status, StatusCode::OK);
        let selection_id = body["selectionId"].as_str().unwrap().to_string();

        let uri = format!("/review/data?selectionId={selection_id}&sortColumn=prompt&sortDir=asc");
        let (status, _, body) = send(&app, get(&uri, Some(&cookie))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalRows"], 2);
        assert_eq!(body["rows"][0]["prompt"], "alpha");
        assert_eq!(body["rows"][0]["createdAt"], "");

        let (_, _, meta) = send(&app, get(&format!("/review/meta?selectionId={selection_id}"), Some(&cookie))).await;
        assert_eq!(meta["kind"], "snapshot");
        assert_eq!(meta["displayName"], "refund");
        assert_eq!(meta["backUrl"], "/dashboard");

        let (status, _, body) = send(&app, get("/dashboard/term-review?term=empty", Some(&cookie))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "No chats found for the selected term.");

        let (status, _, _) = send(&app, get("/dashboard/term-review?term=refund", None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _, _) = send(&app, get("/dashboard/term-review", Some(&cookie))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn table_check_and_create() {
        let app = test_app(None).await;
        let (_, _, body) = send(&app, get("/table-check?widgetId=brand%20new", None)).await;
        assert_eq!(body["tableName"], "brand_new");
        assert_eq!(body["tableExists"], false);
        assert_eq!(body["message"], "Table does not exist.");

        let create = Request::builder()
            .method("POST")
            .uri("/table-check?widgetId=brand%20new")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&app, create).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["created"], true);
        assert_eq!(body["message"], "Table created successfully.");

        let (_, _, body) = send(&app, get("/table-check?widgetId=brand%20new", None)).await;
        assert_eq!(body["message"], "Table is accessible.");

        let (status, _, _) = send(&app, get("/table-check", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn sync_endpoint_reports_per_widget_status() {
        let app = test_app(Some(ServerConfig {
            server_host: "chat.example.com".into(),
            ..ServerConfig::default()
        }))
        .await;
        let req = Request::builder()
            .method("POST")
            .uri("/sync?widgetId=fresh")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["widgetStatus"][0]["tableName"], "fresh");
        assert_eq!(body["widgetStatus"][0]["synced"], true);
        assert_eq!(body["widgetStatus"][0]["inserted"], 1);

        let (_, _, timer) = send(&app, get("/sync/timer", None)).await;
        assert_eq!(timer["intervalSeconds"], 300);
        assert_ne!(timer["lastSynced"], "");
    }

    #[tokio::test]
    async fn sync_without_config_is_a_server_error() {
        let app = test_app(None).await;
        let req = Request::builder().method("POST").uri("/sync").body(Body::empty()).unwrap();
        let (status, _, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["message"], "Widget sync failed: Server configuration is missing.");
    }

    #[tokio::test]
    async fn timer_update_validates_and_clamps() {
        let app = test_app(None).await;
        let post = |uri: &str| Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap();

        let (status, _, body) = send(&app, post("/sync/timer?intervalSeconds=soon")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Invalid interval specified.");

        let (status, _, body) = send(&app, post("/sync/timer?intervalSeconds=5")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["intervalSeconds"], 30);
        assert_eq!(body["lastSynced"], "");

        let (_, _, body) = send(&app, get("/sync/timer", None)).await;
        assert_eq!(body["intervalSeconds"], 30);
    }

    #[tokio::test]
    async fn widgets_listing_filters() {
        let app = test_app(None).await;
        let (status, _, body) = send(&app, get("/widgets?filter=demo%20bot", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["widgets"].as_array().unwrap().len(), 1);
        assert_eq!(body["widgets"][0]["widgetId"], "Demo Bot!");
    }

    #[tokio::test]
    async fn newer_widget_cannot_browse_a_shared_table() {
        let app = test_app(None).await;

        let (status, _, body) = send(&app, get("/view/data?widgetId=Demo_Bot%3F", None)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(
            body["message"],
            "Table name Demo_Bot_ is already used by widget 'Demo Bot!'."
        );

        let (status, _, _) = send(&app, get("/view/select-ids?widgetId=Demo_Bot%3F", None)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _, _) = send(&app, get("/table-check?widgetId=Demo_Bot%3F", None)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _, body) = send(
            &app,
            post_json(
                "/review/start",
                json!({"widgetId": "Demo_Bot?", "selectedChatIds": ["c01"]}),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(
            body["message"],
            "Table name Demo_Bot_ is already used by widget 'Demo Bot!'."
        );

        // The owner is unaffected.
        let (status, _, body) = send(&app, get("/view/data?widgetId=Demo%20Bot!", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalRows"], 12);
    }

    #[tokio::test]
    async fn review_start_requires_a_registered_widget() {
        let app = test_app(None).await;
        let (status, headers, body) = send(
            &app,
            post_json(
                "/review/start",
                json!({"widgetId": "ghost", "selectedChatIds": ["c01"]}),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "Widget not found.");
        assert!(headers.get(header::SET_COOKIE).is_none());
    }

    #[tokio::test]
    async fn manual_message_is_relayed_with_the_session_id() {
        let relay = Arc::new(EchoRelay::default());
        let app = test_app_with_relay(
            Some(ServerConfig {
                server_host: "chat.example.com".into(),
                workspace_name: Some("Demo".into()),
                api_key: Some("k".into()),
                ..ServerConfig::default()
            }),
            relay.clone(),
        )
        .await;

        let (status, headers, body) = send(
            &app,
            post_json("/review/manual-message", json!({"message": "  hello there "}), None),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(headers[header::CONTENT_TYPE], "application/json");
        assert_eq!(body["textResponse"], "echo: hello there");
        let cookie = cookie_from(&headers);

        let (status, headers, _) = send(
            &app,
            post_json("/review/manual-message", json!({"message": "again"}), Some(&cookie)),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(headers.get(header::SET_COOKIE).is_none());

        let sent = relay.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, "hello there");
        assert_eq!(sent[0].1, sent[1].1);
        assert_eq!(format!("wcs_session={}", sent[0].1), cookie);
    }

    #[tokio::test]
    async fn manual_message_validates_payload_and_config() {
        let relay = Arc::new(EchoRelay::default());
        let app = test_app_with_relay(None, relay.clone()).await;

        let (status, _, body) = send(
            &app,
            post_json("/review/manual-message", json!({"message": "   "}), None),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "message is required.");

        let bad = Request::builder()
            .method("POST")
            .uri("/review/manual-message")
            .body(Body::from("not json"))
            .unwrap();
        let (status, _, body) = send(&app, bad).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Invalid payload.");

        let (status, _, body) = send(
            &app,
            post_json("/review/manual-message", json!({"message": "hi"}), None),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["message"], "Server configuration missing.");
        assert!(relay.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_workspace_is_a_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = WorkspaceChatClient::new(
            HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(2),
                ..HttpClientConfig::default()
            })
            .unwrap(),
        );
        let app = test_app_with_relay(
            Some(ServerConfig {
                server_host: "unused".into(),
                connection_info: Some(format!("http://{addr}")),
                workspace_name: Some("Demo".into()),
                api_key: Some("k".into()),
                ..ServerConfig::default()
            }),
            Arc::new(client),
        )
        .await;

        let (status, _, body) = send(
            &app,
            post_json("/review/manual-message", json!({"message": "hi"}), None),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["message"], "Unable to reach workspace API.");
    }
}
