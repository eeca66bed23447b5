//! In-memory stores behind the same traits as the Postgres ones.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use wcs_core::{
    filter_and_sort, ChatRecord, ChatRow, RowFilters, RowQuery, ServerConfig, SortColumn,
    SortDirection, SyncSettings, TableName, WidgetEntry,
};

use crate::{filter_widgets, ServerConfigSource, SyncSettingsStore, WidgetRegistry, WidgetTables};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
pub struct MemoryWidgetTables {
    tables: Mutex<HashMap<TableName, Vec<ChatRecord>>>,
    uncreatable: HashSet<TableName>,
}

impl MemoryWidgetTables {
    /// Make `create_table` fail for `table`, like a role without DDL rights.
    pub fn with_uncreatable(mut self, table: TableName) -> Self {
        self.uncreatable.insert(table);
        self
    }

    pub fn with_table(self, table: TableName, records: Vec<ChatRecord>) -> Self {
        lock(&self.tables).insert(table, records);
        self
    }

    pub fn records(&self, table: &TableName) -> Vec<ChatRecord> {
        lock(&self.tables).get(table).cloned().unwrap_or_default()
    }

    fn rows(
        &self,
        table: &TableName,
        scope: Option<&[String]>,
        filters: &RowFilters,
        sort: SortColumn,
        direction: SortDirection,
    ) -> Result<Vec<ChatRow>> {
        let guard = lock(&self.tables);
        let records = guard
            .get(table)
            .ok_or_else(|| anyhow!("relation {table} does not exist"))?;
        let rows = records
            .iter()
            .filter_map(ChatRow::from_record)
            .filter(|row| scope.map_or(true, |ids| ids.contains(&row.chat_id)));
        Ok(filter_and_sort(rows, filters, sort, direction))
    }
}

#[async_trait]
impl WidgetTables for MemoryWidgetTables {
    async fn table_exists(&self, table: &TableName) -> Result<bool> {
        Ok(lock(&self.tables).contains_key(table))
    }

    async fn create_table(&self, table: &TableName) -> Result<()> {
        if self.uncreatable.contains(table) {
            bail!("permission denied to create {table}");
        }
        lock(&self.tables).entry(table.clone()).or_default();
        Ok(())
    }

    async fn existing_chat_ids(&self, table: &TableName) -> Result<HashSet<String>> {
        let guard = lock(&self.tables);
        let records = guard
            .get(table)
            .ok_or_else(|| anyhow!("relation {table} does not exist"))?;
        Ok(records
            .iter()
            .filter_map(|r| r.widget_chat_id.clone())
            .collect())
    }

    async fn insert_rows(&self, table: &TableName, records: &[ChatRecord]) -> Result<u64> {
        let mut guard = lock(&self.tables);
        let stored = guard
            .get_mut(table)
            .ok_or_else(|| anyhow!("relation {table} does not exist"))?;
        let mut ids = stored
            .iter()
            .filter_map(|r| r.widget_chat_id.clone())
            .collect::<HashSet<_>>();
        for record in records {
            if let Some(id) = &record.widget_chat_id {
                if !ids.insert(id.clone()) {
                    bail!("duplicate key value violates unique constraint on widget_chat_id: {id}");
                }
            }
        }
        stored.extend(records.iter().cloned());
        Ok(records.len() as u64)
    }

    async fn count_rows(
        &self,
        table: &TableName,
        scope: Option<&[String]>,
        filters: &RowFilters,
    ) -> Result<u64> {
        let rows = self.rows(table, scope, filters, SortColumn::default(), SortDirection::default())?;
        Ok(rows.len() as u64)
    }

    async fn page_rows(
        &self,
        table: &TableName,
        scope: Option<&[String]>,
        query: &RowQuery,
    ) -> Result<Vec<ChatRow>> {
        let rows = self.rows(table, scope, &query.filters, query.sort, query.direction)?;
        let offset = usize::try_from(query.page.offset()).unwrap_or(usize::MAX);
        Ok(rows
            .into_iter()
            .skip(offset)
            .take(query.page.page_size() as usize)
            .collect())
    }

    async fn matching_chat_ids(&self, table: &TableName, filters: &RowFilters) -> Result<Vec<String>> {
        let rows = self.rows(table, None, filters, SortColumn::CreatedAt, SortDirection::Desc)?;
        Ok(rows
            .into_iter()
            .map(|row| row.chat_id)
            .filter(|id| !id.trim().is_empty())
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct MemorySyncSettingsStore {
    settings: Mutex<Option<SyncSettings>>,
}

impl MemorySyncSettingsStore {
    pub fn with_settings(settings: SyncSettings) -> Self {
        Self {
            settings: Mutex::new(Some(settings)),
        }
    }

    /// What was last written, without the load-time defaults.
    pub fn stored(&self) -> Option<SyncSettings> {
        *lock(&self.settings)
    }
}

#[async_trait]
impl SyncSettingsStore for MemorySyncSettingsStore {
    async fn load(&self) -> Result<SyncSettings> {
        let mut guard = lock(&self.settings);
        let settings = guard.get_or_insert_with(SyncSettings::default);
        Ok(settings.with_interval(settings.interval_seconds))
    }

    async fn save(&self, settings: &SyncSettings) -> Result<()> {
        *lock(&self.settings) = Some(*settings);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryWidgetRegistry {
    widgets: Mutex<Vec<WidgetEntry>>,
}

impl MemoryWidgetRegistry {
    pub fn new(widgets: Vec<WidgetEntry>) -> Self {
        Self {
            widgets: Mutex::new(widgets),
        }
    }
}

#[async_trait]
impl WidgetRegistry for MemoryWidgetRegistry {
    async fn list(&self, filter: Option<&str>) -> Result<Vec<WidgetEntry>> {
        let mut widgets = lock(&self.widgets).clone();
        widgets.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(filter_widgets(widgets, filter))
    }
}

#[derive(Debug, Default)]
pub struct StaticServerConfigSource {
    config: Option<ServerConfig>,
}

impl StaticServerConfigSource {
    pub fn new(config: Option<ServerConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ServerConfigSource for StaticServerConfigSource {
    async fn load(&self) -> Result<Option<ServerConfig>> {
        Ok(self.config.clone().filter(ServerConfig::has_host))
    }
}
