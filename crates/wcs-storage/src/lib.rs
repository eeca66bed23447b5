//! Per-widget table storage, collaborator stores and HTTP fetch utilities for WCS.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};
use wcs_core::{
    like_pattern, query_rows, table_owner, ChatRecord, ChatRow, Page, RowFilters, RowQuery, ServerConfig,
    SortColumn, SortDirection, SyncSettings, TableName, TermChatSnapshot, WidgetEntry,
    DEFAULT_SYNC_INTERVAL_SECS,
};

#[cfg(any(test, feature = "memory"))]
pub mod memory;

pub const CRATE_NAME: &str = "wcs-storage";

/// Rows per INSERT statement; keeps bind parameters under the Postgres limit.
const INSERT_CHUNK_ROWS: usize = 5_000;
const BODY_SNIPPET_CHARS: usize = 512;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

pub async fn connect(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .context("connecting to postgres")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn body_snippet(&self) -> String {
        snippet(&String::from_utf8_lossy(&self.body))
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
}

/// At most 512 characters of a payload, for log and error messages.
pub fn snippet(body: &str) -> String {
    let mut chars = body.chars();
    let head = chars.by_ref().take(BODY_SNIPPET_CHARS).collect::<String>();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET `url`, retrying transient failures per the backoff policy.
    pub async fn fetch_bytes(
        &self,
        url: &str,
        headers: HeaderMap,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        async move {
            let mut attempt = 0usize;
            loop {
                let resp_result = self
                    .client
                    .get(url)
                    .headers(headers.clone())
                    .send()
                    .await;
                let retry_left = attempt < self.backoff.max_retries;

                match resp_result {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();
                        let content_type = resp
                            .headers()
                            .get(CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();

                        if status.is_success() {
                            let body = resp.bytes().await?.to_vec();
                            return Ok(FetchedResponse {
                                status,
                                final_url,
                                content_type,
                                body,
                            });
                        }

                        if classify_status(status) == RetryDisposition::Retryable && retry_left {
                            debug!(%status, attempt, "retrying after retryable status");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }

                        let body = resp.text().await.unwrap_or_default();
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                            body: snippet(&body),
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable && retry_left {
                            debug!(error = %err, attempt, "retrying after transport error");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// POST `body` as JSON once and hand back whatever status came back.
    /// Only transport failures are errors; nothing is retried.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        headers: HeaderMap,
        body: &T,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_post", url);
        async move {
            let resp = self.client.post(url).headers(headers).json(body).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let content_type = resp
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let body = resp.bytes().await?.to_vec();
            debug!(%status, bytes = body.len(), "post completed");
            Ok(FetchedResponse {
                status,
                final_url,
                content_type,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

/// Storage primitives for per-widget chat tables.
#[async_trait]
pub trait WidgetTables: Send + Sync {
    async fn table_exists(&self, table: &TableName) -> Result<bool>;

    async fn create_table(&self, table: &TableName) -> Result<()>;

    async fn existing_chat_ids(&self, table: &TableName) -> Result<HashSet<String>>;

    /// Insert all records or none of them.
    async fn insert_rows(&self, table: &TableName, records: &[ChatRecord]) -> Result<u64>;

    async fn count_rows(
        &self,
        table: &TableName,
        scope: Option<&[String]>,
        filters: &RowFilters,
    ) -> Result<u64>;

    async fn page_rows(
        &self,
        table: &TableName,
        scope: Option<&[String]>,
        query: &RowQuery,
    ) -> Result<Vec<ChatRow>>;

    /// Every non-blank chat id matching `filters`, newest first.
    async fn matching_chat_ids(&self, table: &TableName, filters: &RowFilters) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableStatus {
    pub exists: bool,
    pub created: bool,
}

/// Create the widget table if missing, then report what the catalog says.
pub async fn ensure_table(tables: &dyn WidgetTables, table: &TableName) -> Result<TableStatus> {
    if tables.table_exists(table).await? {
        return Ok(TableStatus {
            exists: true,
            created: false,
        });
    }
    let created = match tables.create_table(table).await {
        Ok(()) => true,
        Err(err) => {
            // A concurrent creator may have won; the re-check below decides.
            warn!(table = %table, error = %err, "creating widget table failed");
            false
        }
    };
    let exists = tables.table_exists(table).await?;
    Ok(TableStatus {
        exists,
        created: created && exists,
    })
}

/// Insert records whose ids are not stored yet. Existing rows are never touched.
///
/// Loads the table's full id set on every call, so cost grows with table size.
pub async fn insert_new(
    tables: &dyn WidgetTables,
    table: &TableName,
    records: &[ChatRecord],
) -> Result<u64> {
    if records.is_empty() {
        return Ok(0);
    }
    let existing = tables.existing_chat_ids(table).await?;
    let mut seen = HashSet::new();
    let fresh = records
        .iter()
        .filter(|record| match &record.widget_chat_id {
            Some(id) => !existing.contains(id) && seen.insert(id.clone()),
            None => false,
        })
        .cloned()
        .collect::<Vec<_>>();
    debug!(
        table = %table,
        incoming = records.len(),
        existing = existing.len(),
        fresh = fresh.len(),
        "filtered incoming chats"
    );
    if fresh.is_empty() {
        return Ok(0);
    }
    tables.insert_rows(table, &fresh).await
}

/// Count, then fetch one page; the page query is skipped when nothing matches.
pub async fn query_table(
    tables: &dyn WidgetTables,
    table: &TableName,
    scope: Option<&[String]>,
    query: &RowQuery,
) -> Result<Page<ChatRow>> {
    let total_rows = tables.count_rows(table, scope, &query.filters).await?;
    if total_rows == 0 {
        return Ok(Page::empty(query.page));
    }
    let rows = tables.page_rows(table, scope, query).await?;
    Ok(Page::new(rows, total_rows, query.page))
}

/// Something rows can be browsed from under the filter/sort/page contract.
#[async_trait]
pub trait RowSource: Send + Sync {
    async fn query(&self, query: &RowQuery) -> Result<Page<ChatRow>>;
}

/// A live widget table, optionally narrowed to a frozen id set.
pub struct TableRowSource<'a> {
    tables: &'a dyn WidgetTables,
    table: TableName,
    scope: Option<Vec<String>>,
}

impl<'a> TableRowSource<'a> {
    pub fn new(tables: &'a dyn WidgetTables, table: TableName) -> Self {
        Self {
            tables,
            table,
            scope: None,
        }
    }

    pub fn scoped(mut self, chat_ids: &[String]) -> Self {
        self.scope = Some(chat_ids.to_vec());
        self
    }
}

#[async_trait]
impl RowSource for TableRowSource<'_> {
    async fn query(&self, query: &RowQuery) -> Result<Page<ChatRow>> {
        query_table(self.tables, &self.table, self.scope.as_deref(), query).await
    }
}

/// Precomputed term snapshots held in memory.
pub struct SnapshotRowSource<'a> {
    snapshots: &'a [TermChatSnapshot],
}

impl<'a> SnapshotRowSource<'a> {
    pub fn new(snapshots: &'a [TermChatSnapshot]) -> Self {
        Self { snapshots }
    }
}

#[async_trait]
impl RowSource for SnapshotRowSource<'_> {
    async fn query(&self, query: &RowQuery) -> Result<Page<ChatRow>> {
        Ok(query_rows(self.snapshots.iter().map(ChatRow::from), query))
    }
}

#[derive(Debug, Clone)]
pub struct PgWidgetTables {
    pool: PgPool,
}

impl PgWidgetTables {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn push_filters(
    qb: &mut QueryBuilder<'_, Postgres>,
    scope: Option<&[String]>,
    filters: &RowFilters,
) {
    let mut sep = " WHERE ";
    if let Some(ids) = scope {
        qb.push(sep)
            .push("widget_chat_id = ANY(")
            .push_bind(ids.to_vec())
            .push(")");
        sep = " AND ";
    }
    if let Some(needle) = filters.prompt() {
        qb.push(sep)
            .push("prompt ILIKE ")
            .push_bind(like_pattern(needle))
            .push(" ESCAPE '\\'");
        sep = " AND ";
    }
    if let Some(needle) = filters.response() {
        qb.push(sep)
            .push("response_text ILIKE ")
            .push_bind(like_pattern(needle))
            .push(" ESCAPE '\\'");
        sep = " AND ";
    }
    if let Some(needle) = filters.global() {
        let pattern = like_pattern(needle);
        qb.push(sep)
            .push("(prompt ILIKE ")
            .push_bind(pattern.clone())
            .push(" ESCAPE '\\' OR response_text ILIKE ")
            .push_bind(pattern.clone())
            .push(" ESCAPE '\\' OR session_id ILIKE ")
            .push_bind(pattern)
            .push(" ESCAPE '\\')");
    }
}

fn push_order(qb: &mut QueryBuilder<'_, Postgres>, sort: SortColumn, direction: SortDirection) {
    let dir = direction.as_sql();
    match sort {
        SortColumn::CreatedAt => {
            let nulls = match direction {
                SortDirection::Asc => "NULLS FIRST",
                SortDirection::Desc => "NULLS LAST",
            };
            qb.push(format!(" ORDER BY created_at {dir} {nulls}"));
        }
        column => {
            qb.push(format!(
                " ORDER BY LOWER(COALESCE({}, '')) COLLATE \"C\" {dir}",
                column.column_name()
            ));
        }
    }
    qb.push(", widget_chat_id COLLATE \"C\" ASC");
}

fn chat_row_from_pg(row: &PgRow) -> Result<ChatRow> {
    Ok(ChatRow {
        chat_id: row
            .try_get::<Option<String>, _>("widget_chat_id")?
            .unwrap_or_default(),
        prompt: row.try_get::<Option<String>, _>("prompt")?.unwrap_or_default(),
        response: row
            .try_get::<Option<String>, _>("response_text")?
            .unwrap_or_default(),
        created_at: row.try_get::<Option<DateTime<Utc>>, _>("created_at")?,
        session_id: row
            .try_get::<Option<String>, _>("session_id")?
            .unwrap_or_default(),
    })
}

#[async_trait]
impl WidgetTables for PgWidgetTables {
    async fn table_exists(&self, table: &TableName) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1
                  FROM information_schema.tables
                 WHERE table_schema = ANY(current_schemas(false))
                   AND table_type = 'BASE TABLE'
                   AND table_name = ANY($1)
            )
            "#,
        )
        .bind(table.catalog_candidates())
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("checking catalog for table {table}"))?;
        Ok(exists)
    }

    async fn create_table(&self, table: &TableName) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             db_id BIGSERIAL PRIMARY KEY, \
             widget_chat_id TEXT UNIQUE, \
             prompt TEXT, \
             response_text TEXT, \
             created_at TIMESTAMPTZ, \
             session_id TEXT, \
             username TEXT)",
            table.quoted()
        );
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .with_context(|| format!("creating table {table}"))?;
        Ok(())
    }

    async fn existing_chat_ids(&self, table: &TableName) -> Result<HashSet<String>> {
        let sql = format!(
            "SELECT widget_chat_id FROM {} WHERE widget_chat_id IS NOT NULL",
            table.quoted()
        );
        let ids: Vec<String> = sqlx::query_scalar(&sql)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("loading stored chat ids from {table}"))?;
        Ok(ids.into_iter().collect())
    }

    async fn insert_rows(&self, table: &TableName, records: &[ChatRecord]) -> Result<u64> {
        let mut tx = self.pool.begin().await.context("opening insert transaction")?;
        let mut inserted = 0u64;
        for chunk in records.chunks(INSERT_CHUNK_ROWS) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} (widget_chat_id, prompt, response_text, created_at, session_id, username) ",
                table.quoted()
            ));
            qb.push_values(chunk, |mut b, record| {
                b.push_bind(record.widget_chat_id.clone())
                    .push_bind(record.prompt.clone())
                    .push_bind(record.response_text.clone())
                    .push_bind(record.created_at)
                    .push_bind(record.session_id.clone())
                    .push_bind(record.username.clone());
            });
            let result = qb
                .build()
                .execute(&mut *tx)
                .await
                .with_context(|| format!("inserting {} chat(s) into {table}", chunk.len()))?;
            inserted += result.rows_affected();
        }
        tx.commit().await.context("committing insert transaction")?;
        Ok(inserted)
    }

    async fn count_rows(
        &self,
        table: &TableName,
        scope: Option<&[String]>,
        filters: &RowFilters,
    ) -> Result<u64> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT COUNT(*) FROM {}", table.quoted()));
        push_filters(&mut qb, scope, filters);
        let count = qb
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("counting rows in {table}"))?;
        Ok(count.max(0) as u64)
    }

    async fn page_rows(
        &self,
        table: &TableName,
        scope: Option<&[String]>,
        query: &RowQuery,
    ) -> Result<Vec<ChatRow>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT widget_chat_id, prompt, response_text, created_at, session_id FROM {}",
            table.quoted()
        ));
        push_filters(&mut qb, scope, &query.filters);
        push_order(&mut qb, query.sort, query.direction);
        qb.push(" LIMIT ")
            .push_bind(i64::from(query.page.page_size()))
            .push(" OFFSET ")
            .push_bind(i64::try_from(query.page.offset()).unwrap_or(i64::MAX));

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("reading page from {table}"))?;
        rows.iter().map(chat_row_from_pg).collect()
    }

    async fn matching_chat_ids(&self, table: &TableName, filters: &RowFilters) -> Result<Vec<String>> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT widget_chat_id FROM {}", table.quoted()));
        push_filters(&mut qb, None, filters);
        push_order(&mut qb, SortColumn::CreatedAt, SortDirection::Desc);
        let ids = qb
            .build_query_scalar::<Option<String>>()
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("collecting chat ids from {table}"))?;
        Ok(ids
            .into_iter()
            .flatten()
            .filter(|id| !id.trim().is_empty())
            .collect())
    }
}

/// Persistence for the singleton sync settings row.
#[async_trait]
pub trait SyncSettingsStore: Send + Sync {
    /// Stored settings, writing the defaults on first use.
    async fn load(&self) -> Result<SyncSettings>;

    async fn save(&self, settings: &SyncSettings) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct PgSyncSettingsStore {
    pool: PgPool,
}

impl PgSyncSettingsStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS widget_sync_settings (
                id INTEGER PRIMARY KEY,
                interval_seconds BIGINT NOT NULL,
                last_synced TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("ensuring widget_sync_settings")?;
        Ok(())
    }
}

#[async_trait]
impl SyncSettingsStore for PgSyncSettingsStore {
    async fn load(&self) -> Result<SyncSettings> {
        self.ensure_table().await?;
        let row = sqlx::query(
            "SELECT interval_seconds, last_synced FROM widget_sync_settings WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("reading widget_sync_settings")?;

        let Some(row) = row else {
            let defaults = SyncSettings::default();
            self.save(&defaults).await?;
            return Ok(defaults);
        };
        let interval: i64 = row.try_get("interval_seconds")?;
        let interval = if interval > 0 {
            interval
        } else {
            DEFAULT_SYNC_INTERVAL_SECS
        };
        Ok(SyncSettings {
            interval_seconds: SyncSettings::clamp_interval(interval),
            last_synced: row.try_get("last_synced")?,
        })
    }

    async fn save(&self, settings: &SyncSettings) -> Result<()> {
        self.ensure_table().await?;
        sqlx::query(
            r#"
            INSERT INTO widget_sync_settings (id, interval_seconds, last_synced)
            VALUES (1, $1, $2)
            ON CONFLICT (id) DO UPDATE
               SET interval_seconds = EXCLUDED.interval_seconds,
                   last_synced = EXCLUDED.last_synced
            "#,
        )
        .bind(settings.interval_seconds)
        .bind(settings.last_synced)
        .execute(&self.pool)
        .await
        .context("writing widget_sync_settings")?;
        Ok(())
    }
}

/// Read side of the widget registry.
#[async_trait]
pub trait WidgetRegistry: Send + Sync {
    /// Widgets whose id or display name contains `filter`, newest first.
    async fn list(&self, filter: Option<&str>) -> Result<Vec<WidgetEntry>>;
}

/// A widget id resolved against the registry and its table ownership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableClaim {
    pub widget_id: String,
    pub table: TableName,
    /// Registry entry for `widget_id`, if registered.
    pub widget: Option<WidgetEntry>,
    /// Registered widget owning `table`, if any.
    pub owner: Option<WidgetEntry>,
}

impl TableClaim {
    /// The owner of `table` when that is some other widget.
    pub fn foreign_owner(&self) -> Option<&WidgetEntry> {
        self.owner
            .as_ref()
            .filter(|owner| owner.widget_id != self.widget_id)
    }
}

pub async fn claim_table(registry: &dyn WidgetRegistry, widget_id: &str) -> Result<TableClaim> {
    let widgets = registry.list(None).await?;
    let table = TableName::from_widget_id(widget_id);
    let owner = table_owner(&widgets, &table).cloned();
    let widget = widgets
        .into_iter()
        .find(|entry| entry.widget_id == widget_id);
    Ok(TableClaim {
        widget_id: widget_id.to_string(),
        table,
        widget,
        owner,
    })
}

pub fn filter_widgets(widgets: Vec<WidgetEntry>, filter: Option<&str>) -> Vec<WidgetEntry> {
    let Some(needle) = filter.map(str::trim).filter(|f| !f.is_empty()) else {
        return widgets;
    };
    let needle = needle.to_lowercase();
    widgets
        .into_iter()
        .filter(|w| {
            w.widget_id.to_lowercase().contains(&needle)
                || w.display_name.to_lowercase().contains(&needle)
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct WidgetsYaml {
    widgets: Vec<WidgetEntry>,
}

pub fn load_widgets_from_yaml(path: &Path) -> Result<Vec<WidgetEntry>> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let parsed: WidgetsYaml =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    let mut widgets = parsed.widgets;
    widgets.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(widgets)
}

/// `widget_entries` reader that falls back to a `widgets.yaml` file when the
/// table is empty or unreachable.
#[derive(Debug, Clone)]
pub struct PgWidgetRegistry {
    pool: PgPool,
    fallback_file: Option<PathBuf>,
}

impl PgWidgetRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            fallback_file: None,
        }
    }

    pub fn with_fallback_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.fallback_file = Some(path.into());
        self
    }

    async fn load_from_db(&self) -> Result<Vec<WidgetEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, widget_id, display_name, created_at
              FROM widget_entries
             ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing widget_entries")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(WidgetEntry {
                id: i64::from(row.try_get::<i32, _>("id")?),
                widget_id: row.try_get("widget_id")?,
                display_name: row.try_get("display_name")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(out)
    }

    fn fallback(&self) -> Option<&Path> {
        self.fallback_file.as_deref().filter(|p| p.exists())
    }
}

#[async_trait]
impl WidgetRegistry for PgWidgetRegistry {
    async fn list(&self, filter: Option<&str>) -> Result<Vec<WidgetEntry>> {
        let widgets = match (self.load_from_db().await, self.fallback()) {
            (Ok(rows), _) if !rows.is_empty() => rows,
            (Ok(_), Some(path)) => load_widgets_from_yaml(path)?,
            (Ok(rows), None) => rows,
            (Err(err), Some(path)) => {
                warn!(error = %err, path = %path.display(), "widget registry unavailable, using fallback file");
                load_widgets_from_yaml(path)?
            }
            (Err(err), None) => return Err(err),
        };
        Ok(filter_widgets(widgets, filter))
    }
}

/// Read side of the server configuration store.
#[async_trait]
pub trait ServerConfigSource: Send + Sync {
    /// The active configuration, or `None` when no usable host is stored.
    async fn load(&self) -> Result<Option<ServerConfig>>;
}

#[derive(Debug, Clone)]
pub struct PgServerConfigSource {
    pool: PgPool,
}

impl PgServerConfigSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ServerConfigSource for PgServerConfigSource {
    async fn load(&self) -> Result<Option<ServerConfig>> {
        let row = sqlx::query(
            r#"
            SELECT server_host, server_port, connection_info, api_key, workspace_name
              FROM server_config
             ORDER BY id DESC
             LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("reading server_config")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let config = ServerConfig {
            server_host: row
                .try_get::<Option<String>, _>("server_host")?
                .unwrap_or_default(),
            server_port: row.try_get("server_port")?,
            connection_info: row.try_get("connection_info")?,
            api_key: row.try_get("api_key")?,
            workspace_name: row.try_get("workspace_name")?,
        };
        Ok(config.has_host().then_some(config))
    }
}
