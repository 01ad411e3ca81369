//! Persistence for the pending-request queue.
//!
//! The queue is stored as an ordered list: every save rewrites the whole
//! table inside one transaction, so disk always holds a complete snapshot of
//! some point in time and order is carried by `position`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use chrono::SecondsFormat;
use parking_lot::Mutex;
use tracing::instrument;

use beacon_core::Request;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Storage backend owned by the request queue.
pub trait QueueStore: Send + Sync {
    fn load(&self) -> Result<Vec<Request>, StoreError>;
    fn save(&self, requests: &[Request]) -> Result<(), StoreError>;
}

pub struct SqliteQueueStore {
    db: Database,
}

impl SqliteQueueStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl QueueStore for SqliteQueueStore {
    #[instrument(skip(self))]
    fn load(&self) -> Result<Vec<Request>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, kind, payload, created_at, attempts
                 FROM pending_requests ORDER BY position ASC",
            )?;
            let mut rows = stmt.query([])?;
            let mut requests = Vec::new();
            while let Some(row) = rows.next()? {
                requests.push(row_to_request(row)?);
            }
            Ok(requests)
        })
    }

    #[instrument(skip(self, requests), fields(count = requests.len()))]
    fn save(&self, requests: &[Request]) -> Result<(), StoreError> {
        self.db.with_tx(|tx| {
            tx.execute("DELETE FROM pending_requests", [])?;
            let mut stmt = tx.prepare(
                "INSERT INTO pending_requests (position, id, kind, payload, created_at, attempts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (position, request) in requests.iter().enumerate() {
                stmt.execute(rusqlite::params![
                    position as i64,
                    request.id.as_str(),
                    request.kind.to_string(),
                    serde_json::to_string(&request.payload)?,
                    request.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
                    request.attempts,
                ])?;
            }
            Ok(())
        })
    }
}

fn row_to_request(row: &rusqlite::Row<'_>) -> Result<Request, StoreError> {
    const TABLE: &str = "pending_requests";
    let id: String = row_helpers::get(row, 0, TABLE, "id")?;
    let kind: String = row_helpers::get(row, 1, TABLE, "kind")?;
    let payload: String = row_helpers::get(row, 2, TABLE, "payload")?;
    let created_at: String = row_helpers::get(row, 3, TABLE, "created_at")?;
    let attempts: u32 = row_helpers::get(row, 4, TABLE, "attempts")?;

    Ok(Request {
        id: beacon_core::RequestId::from_raw(id),
        kind: row_helpers::parse_enum(&kind, TABLE, "kind")?,
        created_at: row_helpers::parse_timestamp(&created_at, TABLE, "created_at")?,
        payload: row_helpers::parse_json(&payload, TABLE, "payload")?,
        attempts,
    })
}

/// In-process store. Survives a simulated restart as long as the same
/// instance is handed to the next queue.
#[derive(Default)]
pub struct MemoryQueueStore {
    requests: Mutex<Vec<Request>>,
    saves: AtomicUsize,
    fail_saves: AtomicBool,
    corrupt: AtomicBool,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_requests(requests: Vec<Request>) -> Self {
        Self {
            requests: Mutex::new(requests),
            ..Default::default()
        }
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn persisted(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    /// Make subsequent saves fail with an IO error.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent loads report corrupt data.
    pub fn set_corrupt(&self, corrupt: bool) {
        self.corrupt.store(corrupt, Ordering::SeqCst);
    }
}

impl QueueStore for MemoryQueueStore {
    fn load(&self) -> Result<Vec<Request>, StoreError> {
        if self.corrupt.load(Ordering::SeqCst) {
            return Err(StoreError::CorruptRow {
                table: "pending_requests",
                column: "payload",
                detail: "simulated corruption".into(),
            });
        }
        Ok(self.requests.lock().clone())
    }

    fn save(&self, requests: &[Request]) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Io("simulated write failure".into()));
        }
        *self.requests.lock() = requests.to_vec();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::{LinkContext, SessionPayload};

    fn sample() -> Vec<Request> {
        let mut install = Request::install(SessionPayload::new(
            Some(&LinkContext::url("https://x.test/abc")),
            None,
        ));
        install.attempts = 2;
        vec![
            install,
            Request::event("purchase", serde_json::json!({"amount": 3})),
            Request::identify("user-1"),
        ]
    }

    #[test]
    fn sqlite_save_then_load_preserves_order_and_attempts() {
        let store = SqliteQueueStore::new(Database::in_memory().unwrap());
        let requests = sample();
        store.save(&requests).unwrap();
        assert_eq!(store.load().unwrap(), requests);
    }

    #[test]
    fn sqlite_save_replaces_previous_snapshot() {
        let store = SqliteQueueStore::new(Database::in_memory().unwrap());
        store.save(&sample()).unwrap();
        let single = vec![Request::logout()];
        store.save(&single).unwrap();
        assert_eq!(store.load().unwrap(), single);
    }

    #[test]
    fn sqlite_unknown_kind_is_corrupt() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO pending_requests (position, id, kind, payload, created_at, attempts)
                 VALUES (0, 'req_x', 'teleport', '{}', '2026-01-01T00:00:00Z', 0)",
                [],
            )?;
            Ok(())
        })
        .unwrap();
        let err = SqliteQueueStore::new(db).load().unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn memory_store_failure_switches() {
        let store = MemoryQueueStore::new();
        store.set_fail_saves(true);
        assert!(store.save(&sample()).is_err());
        assert_eq!(store.save_count(), 0);

        store.set_fail_saves(false);
        store.save(&sample()).unwrap();
        assert_eq!(store.save_count(), 1);

        store.set_corrupt(true);
        assert!(store.load().unwrap_err().is_corruption());
    }
}
