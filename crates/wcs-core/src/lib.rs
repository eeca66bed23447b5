//! Core domain model, table naming and row-query value types for WCS.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "wcs-core";

const TABLE_NAME_MAX_LEN: usize = 60;
const FALLBACK_TABLE_NAME: &str = "widget";

/// SQL table name derived from an untrusted widget id.
///
/// The only constructor is [`TableName::from_widget_id`], so any value of this
/// type matches `^[A-Za-z][A-Za-z0-9_]{0,59}$`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableName(String);

impl TableName {
    pub fn from_widget_id(widget_id: &str) -> Self {
        let mut normalized = widget_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect::<String>();
        if normalized.is_empty() {
            normalized = FALLBACK_TABLE_NAME.to_string();
        }
        if !normalized.starts_with(|c: char| c.is_ascii_alphabetic()) {
            normalized.insert_str(0, "w_");
        }
        // ASCII only at this point, byte truncation cannot split a char.
        normalized.truncate(TABLE_NAME_MAX_LEN);
        Self(normalized)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Double-quoted identifier with embedded quote characters doubled.
    pub fn quoted(&self) -> String {
        quote_identifier(&self.0)
    }

    /// Spellings to look up in catalogs that fold identifier case.
    pub fn catalog_candidates(&self) -> Vec<String> {
        let mut out = vec![self.0.clone()];
        for candidate in [self.0.to_ascii_uppercase(), self.0.to_ascii_lowercase()] {
            if !out.contains(&candidate) {
                out.push(candidate);
            }
        }
        out
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TableName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for TableName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

pub fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Registered widget, owned by the widget registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetEntry {
    #[serde(default)]
    pub id: i64,
    pub widget_id: String,
    pub display_name: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl WidgetEntry {
    pub fn table_name(&self) -> TableName {
        TableName::from_widget_id(&self.widget_id)
    }
}

/// The registered widget owning `table`: the oldest entry mapping to it,
/// lowest `id` on equal timestamps. Registry order never matters.
pub fn table_owner<'a>(widgets: &'a [WidgetEntry], table: &TableName) -> Option<&'a WidgetEntry> {
    widgets
        .iter()
        .filter(|w| !w.widget_id.trim().is_empty() && w.table_name() == *table)
        .min_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
}

/// Upstream workspace connection settings, owned by the configuration store.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub server_host: String,
    #[serde(default)]
    pub server_port: Option<i32>,
    #[serde(default)]
    pub connection_info: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub workspace_name: Option<String>,
}

impl ServerConfig {
    pub fn api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }

    pub fn has_host(&self) -> bool {
        !self.server_host.trim().is_empty()
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("server_host", &self.server_host)
            .field("server_port", &self.server_port)
            .field("connection_info", &self.connection_info)
            .field("api_key", &self.api_key().map(|_| "<redacted>"))
            .field("workspace_name", &self.workspace_name)
            .finish()
    }
}

/// One chat extracted from an upstream payload, before persistence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRecord {
    pub widget_chat_id: Option<String>,
    pub prompt: Option<String>,
    pub response_text: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub session_id: Option<String>,
    pub username: Option<String>,
}

/// Row wire shape shared by table browsing and review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRow {
    pub chat_id: String,
    pub prompt: String,
    pub response: String,
    #[serde(serialize_with = "serialize_instant_or_empty")]
    pub created_at: Option<DateTime<Utc>>,
    pub session_id: String,
}

impl ChatRow {
    /// Stored-row view of a record; `None` when the record carries no id.
    pub fn from_record(record: &ChatRecord) -> Option<Self> {
        let chat_id = record.widget_chat_id.clone()?;
        Some(Self {
            chat_id,
            prompt: record.prompt.clone().unwrap_or_default(),
            response: record.response_text.clone().unwrap_or_default(),
            created_at: record.created_at,
            session_id: record.session_id.clone().unwrap_or_default(),
        })
    }
}

impl From<&TermChatSnapshot> for ChatRow {
    fn from(snapshot: &TermChatSnapshot) -> Self {
        Self {
            chat_id: snapshot.chat_id.clone(),
            prompt: snapshot.prompt.clone(),
            response: snapshot.response.clone(),
            created_at: snapshot.created_at,
            session_id: snapshot.session_id.clone(),
        }
    }
}

/// ISO-8601 instant (`2026-01-02T03:04:05Z`) or `""` for missing timestamps.
pub fn format_instant(ts: Option<&DateTime<Utc>>) -> String {
    ts.map(|ts| ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        .unwrap_or_default()
}

pub fn serialize_instant_or_empty<S: Serializer>(
    ts: &Option<DateTime<Utc>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_instant(ts.as_ref()))
}

/// A chat that matched a term, precomputed by the term-matching collaborator.
///
/// Identity is `(term_name, widget_id, chat_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TermChatSnapshot {
    term_name: String,
    widget_id: String,
    chat_id: String,
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    response: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    session_id: String,
}

impl TermChatSnapshot {
    pub fn new(
        term_name: impl Into<String>,
        widget_id: impl Into<String>,
        chat_id: impl Into<String>,
        prompt: Option<String>,
        response: Option<String>,
        created_at: Option<DateTime<Utc>>,
        session_id: Option<String>,
    ) -> Self {
        Self {
            term_name: term_name.into(),
            widget_id: widget_id.into(),
            chat_id: chat_id.into(),
            prompt: prompt.unwrap_or_default(),
            response: response.unwrap_or_default(),
            created_at,
            session_id: session_id.unwrap_or_default(),
        }
    }

    pub fn term_name(&self) -> &str {
        &self.term_name
    }

    pub fn widget_id(&self) -> &str {
        &self.widget_id
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn response(&self) -> &str {
        &self.response
    }

    pub fn created_at(&self) -> Option<&DateTime<Utc>> {
        self.created_at.as_ref()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl PartialEq for TermChatSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.term_name == other.term_name
            && self.widget_id == other.widget_id
            && self.chat_id == other.chat_id
    }
}

impl Eq for TermChatSnapshot {}

impl std::hash::Hash for TermChatSnapshot {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.term_name.hash(state);
        self.widget_id.hash(state);
        self.chat_id.hash(state);
    }
}

/// Search inputs the operator had active when a selection was frozen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchTerms {
    pub global: String,
    pub prompt: String,
    pub response: String,
}

/// Case-insensitive substring predicates, combined with AND.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowFilters {
    prompt: Option<String>,
    response: Option<String>,
    global: Option<String>,
}

impl RowFilters {
    pub fn new(prompt: Option<&str>, response: Option<&str>, global: Option<&str>) -> Self {
        Self {
            prompt: non_blank(prompt),
            response: non_blank(response),
            global: non_blank(global),
        }
    }

    pub fn prompt(&self) -> Option<&str> {
        self.prompt.as_deref()
    }

    pub fn response(&self) -> Option<&str> {
        self.response.as_deref()
    }

    /// Matches prompt, response or session id.
    pub fn global(&self) -> Option<&str> {
        self.global.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.prompt.is_none() && self.response.is_none() && self.global.is_none()
    }

    pub fn matches(&self, row: &ChatRow) -> bool {
        if let Some(needle) = &self.prompt {
            if !contains_ignore_case(&row.prompt, needle) {
                return false;
            }
        }
        if let Some(needle) = &self.response {
            if !contains_ignore_case(&row.response, needle) {
                return false;
            }
        }
        if let Some(needle) = &self.global {
            return contains_ignore_case(&row.prompt, needle)
                || contains_ignore_case(&row.response, needle)
                || contains_ignore_case(&row.session_id, needle);
        }
        true
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// `%needle%` for `ILIKE ... ESCAPE '\'`, with LIKE metacharacters taken literally.
pub fn like_pattern(needle: &str) -> String {
    let mut out = String::with_capacity(needle.len() + 2);
    out.push('%');
    for c in needle.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

/// Sortable columns. Anything else falls back to `created_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortColumn {
    WidgetChatId,
    Prompt,
    #[default]
    CreatedAt,
    SessionId,
}

impl SortColumn {
    pub const ALLOWED: [SortColumn; 4] = [
        SortColumn::WidgetChatId,
        SortColumn::Prompt,
        SortColumn::CreatedAt,
        SortColumn::SessionId,
    ];

    pub fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::default();
        };
        let normalized = raw.trim().to_ascii_lowercase();
        Self::ALLOWED
            .into_iter()
            .find(|column| column.column_name() == normalized)
            .unwrap_or_default()
    }

    pub fn column_name(self) -> &'static str {
        match self {
            SortColumn::WidgetChatId => "widget_chat_id",
            SortColumn::Prompt => "prompt",
            SortColumn::CreatedAt => "created_at",
            SortColumn::SessionId => "session_id",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some(v) if v.trim().eq_ignore_ascii_case("asc") => SortDirection::Asc,
            _ => SortDirection::Desc,
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

pub const ALLOWED_PAGE_SIZES: [u32; 4] = [10, 25, 50, 100];
pub const DEFAULT_PAGE_SIZE: u32 = 10;

/// 1-based page number and an allow-listed page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    page: u32,
    page_size: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    pub fn new(page: i64, page_size: i64) -> Self {
        let page = page.clamp(1, i64::from(u32::MAX)) as u32;
        let page_size = ALLOWED_PAGE_SIZES
            .into_iter()
            .find(|allowed| i64::from(*allowed) == page_size)
            .unwrap_or(DEFAULT_PAGE_SIZE);
        Self { page, page_size }
    }

    /// Lenient parse of raw query values; garbage becomes the defaults.
    pub fn parse(page: Option<&str>, limit: Option<&str>) -> Self {
        let page = page
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(1);
        let limit = limit
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(i64::from(DEFAULT_PAGE_SIZE));
        Self::new(page, limit)
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.page_size)
    }
}

pub fn total_pages(total_rows: u64, page_size: u32) -> u64 {
    if total_rows == 0 {
        return 1;
    }
    total_rows.div_ceil(u64::from(page_size.max(1)))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub rows: Vec<T>,
    pub total_rows: u64,
    pub total_pages: u64,
    pub page: u32,
}

impl<T> Page<T> {
    pub fn new(rows: Vec<T>, total_rows: u64, request: PageRequest) -> Self {
        Self {
            rows,
            total_rows,
            total_pages: total_pages(total_rows, request.page_size()),
            page: request.page(),
        }
    }

    pub fn empty(request: PageRequest) -> Self {
        Self::new(Vec::new(), 0, request)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowQuery {
    pub filters: RowFilters,
    pub sort: SortColumn,
    pub direction: SortDirection,
    pub page: PageRequest,
}

/// Row ordering shared by every backing source: case-insensitive text,
/// missing timestamps lowest, ties on `chat_id` ascending.
pub fn compare_rows(a: &ChatRow, b: &ChatRow, sort: SortColumn, direction: SortDirection) -> Ordering {
    let primary = match sort {
        SortColumn::WidgetChatId => cmp_text(&a.chat_id, &b.chat_id),
        SortColumn::Prompt => cmp_text(&a.prompt, &b.prompt),
        SortColumn::SessionId => cmp_text(&a.session_id, &b.session_id),
        SortColumn::CreatedAt => a.created_at.cmp(&b.created_at),
    };
    let primary = match direction {
        SortDirection::Asc => primary,
        SortDirection::Desc => primary.reverse(),
    };
    primary.then_with(|| a.chat_id.cmp(&b.chat_id))
}

fn cmp_text(a: &str, b: &str) -> Ordering {
    a.to_lowercase().cmp(&b.to_lowercase())
}

pub fn filter_and_sort(
    rows: impl IntoIterator<Item = ChatRow>,
    filters: &RowFilters,
    sort: SortColumn,
    direction: SortDirection,
) -> Vec<ChatRow> {
    let mut matched = rows
        .into_iter()
        .filter(|row| filters.matches(row))
        .collect::<Vec<_>>();
    matched.sort_by(|a, b| compare_rows(a, b, sort, direction));
    matched
}

/// Filter, sort and slice rows held in memory.
pub fn query_rows(rows: impl IntoIterator<Item = ChatRow>, query: &RowQuery) -> Page<ChatRow> {
    let matched = filter_and_sort(rows, &query.filters, query.sort, query.direction);
    let total_rows = matched.len() as u64;
    if total_rows == 0 {
        return Page::empty(query.page);
    }
    let offset = usize::try_from(query.page.offset()).unwrap_or(usize::MAX);
    let rows = matched
        .into_iter()
        .skip(offset)
        .take(query.page.page_size() as usize)
        .collect();
    Page::new(rows, total_rows, query.page)
}

pub const MIN_SYNC_INTERVAL_SECS: i64 = 30;
pub const DEFAULT_SYNC_INTERVAL_SECS: i64 = 300;

/// Singleton recurring-sync settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    pub interval_seconds: i64,
    #[serde(serialize_with = "serialize_instant_or_empty")]
    pub last_synced: Option<DateTime<Utc>>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_seconds: DEFAULT_SYNC_INTERVAL_SECS,
            last_synced: None,
        }
    }
}

impl SyncSettings {
    pub fn clamp_interval(seconds: i64) -> i64 {
        seconds.max(MIN_SYNC_INTERVAL_SECS)
    }

    pub fn with_interval(self, seconds: i64) -> Self {
        Self {
            interval_seconds: Self::clamp_interval(seconds),
            ..self
        }
    }

    pub fn with_last_synced(self, at: DateTime<Utc>) -> Self {
        Self {
            last_synced: Some(at),
            ..self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("widgetId and selections required.")]
    MissingWidget,
    #[error("At least one chat must be selected.")]
    Empty,
}

/// Where a selection's rows come from.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectionSource {
    Table {
        widget_id: String,
    },
    Snapshots {
        display_name: String,
        back_url: String,
        snapshots: Vec<TermChatSnapshot>,
    },
}

/// A frozen, write-once set of rows to review.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    source: SelectionSource,
    chat_ids: Vec<String>,
    search_terms: SearchTerms,
}

impl Selection {
    pub fn for_table(
        widget_id: &str,
        chat_ids: impl IntoIterator<Item = String>,
        search_terms: SearchTerms,
    ) -> Result<Self, SelectionError> {
        let widget_id = widget_id.trim();
        if widget_id.is_empty() {
            return Err(SelectionError::MissingWidget);
        }
        let chat_ids = ordered_unique(chat_ids);
        if chat_ids.is_empty() {
            return Err(SelectionError::Empty);
        }
        Ok(Self {
            source: SelectionSource::Table {
                widget_id: widget_id.to_string(),
            },
            chat_ids,
            search_terms,
        })
    }

    pub fn for_snapshots(
        display_name: &str,
        back_url: &str,
        snapshots: Vec<TermChatSnapshot>,
    ) -> Result<Self, SelectionError> {
        let mut seen = HashSet::new();
        let snapshots = snapshots
            .into_iter()
            .filter(|s| seen.insert(s.clone()))
            .collect::<Vec<_>>();
        let chat_ids = ordered_unique(snapshots.iter().map(|s| s.chat_id().to_string()));
        if chat_ids.is_empty() {
            return Err(SelectionError::Empty);
        }
        Ok(Self {
            source: SelectionSource::Snapshots {
                display_name: display_name.trim().to_string(),
                back_url: back_url.to_string(),
                snapshots,
            },
            chat_ids,
            search_terms: SearchTerms::default(),
        })
    }

    pub fn source(&self) -> &SelectionSource {
        &self.source
    }

    pub fn chat_ids(&self) -> &[String] {
        &self.chat_ids
    }

    pub fn search_terms(&self) -> &SearchTerms {
        &self.search_terms
    }

    pub fn widget_id(&self) -> Option<&str> {
        match &self.source {
            SelectionSource::Table { widget_id } => Some(widget_id),
            SelectionSource::Snapshots { .. } => None,
        }
    }

    pub fn display_name(&self) -> &str {
        match &self.source {
            SelectionSource::Table { widget_id } => widget_id,
            SelectionSource::Snapshots { display_name, .. } => display_name,
        }
    }
}

fn ordered_unique(ids: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty() && seen.insert(id.clone()))
        .collect()
}

/// One session's selections, keyed by opaque random tokens.
#[derive(Debug, Default)]
pub struct SelectionBook {
    selections: HashMap<String, Selection>,
}

impl SelectionBook {
    pub fn insert(&mut self, selection: Selection) -> String {
        let token = Uuid::new_v4().to_string();
        self.selections.insert(token.clone(), selection);
        token
    }

    pub fn get(&self, token: &str) -> Option<&Selection> {
        self.selections.get(token)
    }

    pub fn len(&self) -> usize {
        self.selections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selections.is_empty()
    }
}
