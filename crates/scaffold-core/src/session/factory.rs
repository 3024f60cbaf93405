use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::models::error::poisoned;
use crate::models::{CoreError, CoreErrorKind, CoreResult, SessionKey};
use crate::persistence::{KeyedStore, StoreConfig};

pub const DEFAULT_MAX_SESSIONS: usize = 100;
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionFactoryConfig {
    pub max_sessions: usize,
    pub session_timeout: Duration,
    /// Base path for per-session flat files; each session saves to `{path}_{key}`.
    pub persistence_path: Option<PathBuf>,
    /// Whether a freshly opened session store loads its file.
    pub load_on_startup: bool,
}

impl Default for SessionFactoryConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            persistence_path: None,
            load_on_startup: false,
        }
    }
}

/// A session's store together with the sanitized key it was resolved under.
#[derive(Clone, Debug)]
pub struct SessionDatabase {
    pub key: SessionKey,
    pub store: Arc<KeyedStore>,
    /// Set when this lookup created the store.
    pub created: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub active_sessions: usize,
    pub max_sessions: usize,
    #[serde(rename = "sessionTimeout")]
    pub session_timeout_ms: u64,
}

struct SessionEntry {
    store: Arc<KeyedStore>,
    last_access: Instant,
    access_seq: u64,
}

#[derive(Default)]
struct FactoryState {
    next_access_seq: u64,
    sessions: HashMap<SessionKey, SessionEntry>,
}

impl FactoryState {
    fn touch(&mut self) -> u64 {
        self.next_access_seq = self.next_access_seq.saturating_add(1);
        self.next_access_seq
    }
}

/// Owns one [`KeyedStore`] per live session.
///
/// The number of live sessions never exceeds `max_sessions`: when a new
/// session needs room, expired sessions are swept first and then the least
/// recently accessed session is evicted.
pub struct SessionStoreFactory {
    config: SessionFactoryConfig,
    state: Mutex<FactoryState>,
}

impl SessionStoreFactory {
    pub fn new(config: SessionFactoryConfig) -> CoreResult<Self> {
        if config.max_sessions == 0 {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                "max_sessions must allow at least one session",
            ));
        }
        if config.session_timeout.is_zero() {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                "session_timeout must be greater than zero",
            ));
        }

        Ok(Self {
            config,
            state: Mutex::new(FactoryState::default()),
        })
    }

    pub fn config(&self) -> &SessionFactoryConfig {
        &self.config
    }

    /// Returns the store for `raw_key`, refreshing its last access, or creates a
    /// fresh one when the session is unknown or has expired.
    pub fn get_database(&self, raw_key: &str) -> CoreResult<SessionDatabase> {
        let key = SessionKey::sanitize(raw_key);
        let mut state = self.lock_state()?;
        let now = Instant::now();

        let expired = match state.sessions.get(&key) {
            Some(entry) => self.is_expired(entry, now),
            None => false,
        };
        if expired {
            state.sessions.remove(&key);
            tracing::debug!(session = %key, "session expired, recreating store");
        }

        let seq = state.touch();
        if let Some(entry) = state.sessions.get_mut(&key) {
            entry.last_access = now;
            entry.access_seq = seq;
            return Ok(SessionDatabase {
                key,
                store: entry.store.clone(),
                created: false,
            });
        }

        if state.sessions.len() >= self.config.max_sessions {
            let swept = self.sweep_expired(&mut state, now);
            if swept > 0 {
                tracing::debug!(count = swept, "reclaimed expired sessions at capacity");
            }
        }
        if state.sessions.len() >= self.config.max_sessions
            && let Some(oldest) = oldest_session(&state)
        {
            state.sessions.remove(&oldest);
            tracing::info!(
                session = %oldest,
                max_sessions = self.config.max_sessions,
                "evicted least recently used session"
            );
        }

        let store = Arc::new(KeyedStore::with_config(self.store_config(&key)));
        state.sessions.insert(
            key.clone(),
            SessionEntry {
                store: store.clone(),
                last_access: now,
                access_seq: seq,
            },
        );
        tracing::debug!(session = %key, "created session store");

        Ok(SessionDatabase {
            key,
            store,
            created: true,
        })
    }

    /// Like [`get_database`](Self::get_database), but a newly created store
    /// runs its [`init`](KeyedStore::init) before being returned.
    pub async fn open_database(&self, raw_key: &str) -> CoreResult<SessionDatabase> {
        let database = self.get_database(raw_key)?;
        if database.created && database.store.init().await? {
            tracing::debug!(session = %database.key, "loaded session store from disk");
        }
        Ok(database)
    }

    /// Looks up a live session without refreshing its last access.
    pub fn existing_database(&self, raw_key: &str) -> CoreResult<Option<SessionDatabase>> {
        let key = SessionKey::sanitize(raw_key);
        let state = self.lock_state()?;
        Ok(state.sessions.get(&key).map(|entry| SessionDatabase {
            key: key.clone(),
            store: entry.store.clone(),
            created: false,
        }))
    }

    pub fn remove_session(&self, raw_key: &str) -> CoreResult<bool> {
        let key = SessionKey::sanitize(raw_key);
        let removed = self.lock_state()?.sessions.remove(&key).is_some();
        if removed {
            tracing::debug!(session = %key, "removed session store");
        }
        Ok(removed)
    }

    pub fn cleanup_expired_sessions(&self) -> CoreResult<usize> {
        let mut state = self.lock_state()?;
        let removed = self.sweep_expired(&mut state, Instant::now());
        if removed > 0 {
            tracing::debug!(count = removed, "cleaned up expired sessions");
        }
        Ok(removed)
    }

    pub fn active_sessions(&self) -> CoreResult<Vec<SessionKey>> {
        let state = self.lock_state()?;
        let mut keys: Vec<SessionKey> = state.sessions.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    pub fn stats(&self) -> CoreResult<SessionStats> {
        let state = self.lock_state()?;
        Ok(SessionStats {
            active_sessions: state.sessions.len(),
            max_sessions: self.config.max_sessions,
            session_timeout_ms: u64::try_from(self.config.session_timeout.as_millis())
                .unwrap_or(u64::MAX),
        })
    }
}

impl SessionStoreFactory {
    fn is_expired(&self, entry: &SessionEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.last_access) > self.config.session_timeout
    }

    fn sweep_expired(&self, state: &mut FactoryState, now: Instant) -> usize {
        let before = state.sessions.len();
        state
            .sessions
            .retain(|_, entry| !self.is_expired(entry, now));
        before - state.sessions.len()
    }

    fn store_config(&self, key: &SessionKey) -> StoreConfig {
        StoreConfig {
            path: self.config.persistence_path.as_ref().map(|base| {
                let mut name = base.clone().into_os_string();
                name.push(format!("_{key}"));
                PathBuf::from(name)
            }),
            load_on_startup: self.config.load_on_startup,
        }
    }

    fn lock_state(&self) -> CoreResult<MutexGuard<'_, FactoryState>> {
        self.state.lock().map_err(|_| poisoned("session factory"))
    }
}

fn oldest_session(state: &FactoryState) -> Option<SessionKey> {
    state
        .sessions
        .iter()
        .min_by_key(|(_, entry)| entry.access_seq)
        .map(|(key, _)| key.clone())
}
