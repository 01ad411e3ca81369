use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::instrument;

use crate::database::Database;
use crate::error::StoreError;

pub const IDENTITY_ID: &str = "identity_id";
pub const SESSION_ID: &str = "session_id";
pub const USER_IDENTITY: &str = "user_identity";
pub const FIRST_SESSION_PARAMS: &str = "first_session_params";
pub const LATEST_SESSION_PARAMS: &str = "latest_session_params";
pub const TRACKING_DISABLED: &str = "tracking_disabled";

/// Key/value preferences persisted next to the queue.
#[derive(Clone)]
pub struct PreferenceRepo {
    db: Database,
}

impl PreferenceRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT value FROM preferences WHERE key = ?1")?;
            let mut rows = stmt.query([key])?;
            match rows.next()? {
                Some(row) => Ok(Some(crate::row_helpers::get(row, 0, "preferences", "value")?)),
                None => Ok(None),
            }
        })
    }

    #[instrument(skip(self, value))]
    pub fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO preferences (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                rusqlite::params![key, value, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self))]
    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM preferences WHERE key = ?1", [key])?;
            Ok(())
        })
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        self.set(key, &serde_json::to_string(value)?)
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some_and(|v| v == "true"))
    }

    pub fn set_bool(&self, key: &str, value: bool) -> Result<(), StoreError> {
        self.set(key, if value { "true" } else { "false" })
    }

    /// A device with no stored identity has never completed a session.
    pub fn is_first_run(&self) -> Result<bool, StoreError> {
        Ok(self.get(IDENTITY_ID)?.is_none())
    }

    /// Forget everything tied to the current user and session.
    pub fn clear_session_state(&self) -> Result<(), StoreError> {
        for key in [SESSION_ID, USER_IDENTITY, LATEST_SESSION_PARAMS] {
            self.remove(key)?;
        }
        Ok(())
    }
}
