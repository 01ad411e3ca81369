pub mod database;
pub mod error;
pub mod preferences;
pub mod queue_store;
pub mod row_helpers;
pub mod schema;

pub use database::Database;
pub use error::StoreError;
pub use preferences::PreferenceRepo;
pub use queue_store::{MemoryQueueStore, QueueStore, SqliteQueueStore};
