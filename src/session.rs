//! Session Store
//!
//! One ingestion run produces one immutable [`Session`]. Sessions are published with a
//! single insert and handed out as `Arc`s, so readers never observe a partial one.

use crate::reconstruct::ReconstructedRecord;
use crate::summary::{summarize_all, RequestSummary};
use crate::types::SessionId;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestDiagnostics {
    pub total_lines: usize,
    pub blank_lines: usize,
    pub skipped_lines: usize,
    pub unassigned_events: usize,
    pub skipped_fragments: usize,
    pub duplicate_events: usize,
    pub requests: usize,
    /// First few skipped lines, truncated
    pub samples: Vec<String>,
}

#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub created_at: Instant,
    pub diagnostics: IngestDiagnostics,
    records: Vec<Arc<ReconstructedRecord>>,
    index: HashMap<String, usize>,
}

impl Session {
    /// Records are kept in first-seen order of their correlation ids.
    pub fn new(records: Vec<ReconstructedRecord>, diagnostics: IngestDiagnostics) -> Self {
        let records: Vec<Arc<ReconstructedRecord>> = records.into_iter().map(Arc::new).collect();
        let index = records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.req_id.clone(), i))
            .collect();
        Self {
            id: SessionId::new(),
            created_at: Instant::now(),
            diagnostics,
            records,
            index,
        }
    }

    pub fn record(&self, req_id: &str) -> Option<Arc<ReconstructedRecord>> {
        self.index.get(req_id).map(|&i| self.records[i].clone())
    }

    pub fn summaries(&self) -> Vec<RequestSummary> {
        summarize_all(self.records.iter().map(|r| r.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

pub trait SessionStore: Send + Sync {
    /// Publish a fully built session. Returns its id.
    fn insert(&self, session: Session) -> SessionId;
    fn get(&self, id: &str) -> Option<Arc<Session>>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Drop expired sessions, returning how many were removed.
    fn evict_expired(&self) -> usize;
}

pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    ttl: Option<Duration>,
    max_sessions: usize,
}

impl MemorySessionStore {
    pub fn new(ttl: Option<Duration>, max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
            max_sessions: max_sessions.max(1),
        }
    }

    fn is_expired(&self, session: &Session) -> bool {
        match self.ttl {
            Some(ttl) => session.created_at.elapsed() >= ttl,
            None => false,
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Session>>> {
        match self.sessions.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Session>>> {
        match self.sessions.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new(
            Some(Duration::from_secs(crate::constants::DEFAULT_SESSION_TTL_SECS)),
            crate::constants::DEFAULT_MAX_SESSIONS,
        )
    }
}

impl SessionStore for MemorySessionStore {
    fn insert(&self, session: Session) -> SessionId {
        let id = session.id.clone();
        let session = Arc::new(session);
        let mut sessions = self.write();

        if let Some(ttl) = self.ttl {
            sessions.retain(|_, s| s.created_at.elapsed() < ttl);
        }
        while sessions.len() >= self.max_sessions {
            let oldest = sessions
                .values()
                .min_by_key(|s| s.created_at)
                .map(|s| s.id.0.clone());
            match oldest {
                Some(key) => {
                    tracing::info!(session = %crate::str_utils::prefix_chars(&key, 8), "Evicting oldest session (capacity {})", self.max_sessions);
                    sessions.remove(&key);
                }
                None => break,
            }
        }

        sessions.insert(id.0.clone(), session);
        id
    }

    fn get(&self, id: &str) -> Option<Arc<Session>> {
        let session = self.read().get(id).cloned()?;
        if self.is_expired(&session) {
            return None;
        }
        Some(session)
    }

    /// Expired sessions not yet swept are not counted.
    fn len(&self) -> usize {
        self.read().values().filter(|s| !self.is_expired(s)).count()
    }

    fn evict_expired(&self) -> usize {
        let ttl = match self.ttl {
            Some(ttl) => ttl,
            None => return 0,
        };
        let mut sessions = self.write();
        let before = sessions.len();
        sessions.retain(|_, s| s.created_at.elapsed() < ttl);
        let removed = before - sessions.len();
        if removed > 0 {
            tracing::info!("Evicted {} expired sessions", removed);
        }
        removed
    }
}
