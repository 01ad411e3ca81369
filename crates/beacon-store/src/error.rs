#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl StoreError {
    /// True when the stored data itself is unreadable, as opposed to the
    /// database being unavailable.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::CorruptRow { .. } | Self::Serialization(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<StoreError> for beacon_core::SdkError {
    fn from(e: StoreError) -> Self {
        beacon_core::SdkError::PersistenceCorrupt(e.to_string())
    }
}
