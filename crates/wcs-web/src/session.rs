//! Cookie-keyed in-memory sessions holding review selections and term snapshots.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use axum::http::{header, HeaderMap, HeaderValue};
use uuid::Uuid;
use wcs_core::{SelectionBook, TermChatSnapshot};

pub const SESSION_COOKIE: &str = "wcs_session";
pub const DEFAULT_IDLE: Duration = Duration::from_secs(1800);

#[derive(Debug, Default)]
pub struct SessionData {
    pub selections: SelectionBook,
    pub term_snapshots: HashMap<String, Vec<TermChatSnapshot>>,
}

#[derive(Debug)]
struct SessionEntry {
    data: SessionData,
    last_seen: Instant,
}

#[derive(Debug)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    idle: Duration,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE)
    }
}

impl SessionStore {
    pub fn new(idle: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            idle,
        }
    }

    pub fn from_env() -> Self {
        let idle = std::env::var("WCS_SESSION_IDLE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_IDLE);
        Self::new(idle)
    }

    pub fn idle(&self) -> Duration {
        self.idle
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` against a live session; `None` for unknown or expired ids.
    pub fn read<R>(&self, id: Option<&str>, f: impl FnOnce(&SessionData) -> R) -> Option<R> {
        let id = id?;
        let mut sessions = self.lock();
        let expired = sessions
            .get(id)
            .map(|entry| entry.last_seen.elapsed() >= self.idle)?;
        if expired {
            sessions.remove(id);
            return None;
        }
        let entry = sessions.get_mut(id)?;
        entry.last_seen = Instant::now();
        Some(f(&entry.data))
    }

    /// Run `f` against the caller's session, starting a fresh one when the
    /// cookie is absent, unknown or expired. Returns the id when it is new.
    pub fn write<R>(
        &self,
        id: Option<&str>,
        f: impl FnOnce(&mut SessionData) -> R,
    ) -> (R, Option<String>) {
        let mut sessions = self.lock();
        let live = id.filter(|id| {
            sessions
                .get(*id)
                .is_some_and(|entry| entry.last_seen.elapsed() < self.idle)
        });
        let (key, issued) = match live {
            Some(id) => (id.to_string(), None),
            None => {
                if let Some(stale) = id {
                    sessions.remove(stale);
                }
                let fresh = Uuid::new_v4().to_string();
                (fresh.clone(), Some(fresh))
            }
        };
        let entry = sessions.entry(key).or_insert_with(|| SessionEntry {
            data: SessionData::default(),
            last_seen: Instant::now(),
        });
        entry.last_seen = Instant::now();
        (f(&mut entry.data), issued)
    }

    /// Drop idle sessions, returning how many were removed.
    pub fn sweep(&self) -> usize {
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|_, entry| entry.last_seen.elapsed() < self.idle);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn session_cookie(id: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(&format!(
        "{SESSION_COOKIE}={id}; Path=/; HttpOnly; SameSite=Lax"
    ))
    .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wcs_core::{SearchTerms, Selection};

    fn selection() -> Selection {
        Selection::for_table("w", vec!["1".to_string()], SearchTerms::default()).unwrap()
    }

    #[test]
    fn cookie_is_found_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; wcs_session=abc-123 ; other=1"),
        );
        assert_eq!(session_id(&headers).as_deref(), Some("abc-123"));
        assert_eq!(session_id(&HeaderMap::new()), None);
    }

    #[test]
    fn write_issues_id_once_and_read_sees_it() {
        let store = SessionStore::default();
        let (token, issued) = store.write(None, |s| s.selections.insert(selection()));
        let sid = issued.expect("new session");

        let (_, again) = store.write(Some(&sid), |s| s.selections.len());
        assert!(again.is_none());
        assert!(store.read(Some(&sid), |s| s.selections.get(&token).is_some()).unwrap());
        assert_eq!(store.read(Some("someone-else"), |s| s.selections.len()), None);
    }

    #[test]
    fn unknown_cookie_gets_a_fresh_session() {
        let store = SessionStore::default();
        let (_, issued) = store.write(Some("forged"), |_| ());
        assert!(issued.is_some_and(|id| id != "forged"));
    }

    #[test]
    fn idle_sessions_expire() {
        let store = SessionStore::new(Duration::ZERO);
        let (_, issued) = store.write(None, |s| s.selections.insert(selection()));
        let sid = issued.unwrap();
        assert_eq!(store.read(Some(&sid), |s| s.selections.len()), None);

        store.write(None, |_| ());
        assert_eq!(store.sweep(), 1);
        assert!(store.is_empty());
    }
}
