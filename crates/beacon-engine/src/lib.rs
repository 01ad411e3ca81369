//! Session coordination engine: durable queue, Open/Install coordinator,
//! dispatcher, and the [`Beacon`] façade that ties them together.

pub mod client;
pub mod completions;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod queue;
pub mod retry;

pub use client::{Beacon, BeaconBuilder};
pub use completions::{Completion, CompletionRegistry};
pub use config::{load_config, load_config_from_path, SdkConfig, SettingsError};
pub use coordinator::{BeginMode, OpenCoordinator, SessionPhase, SessionSeed};
pub use dispatcher::{DispatcherHandle, SessionGate};
pub use queue::{Enqueued, RequestQueue, DEFAULT_PERSIST_DELAY};
pub use retry::{Backoff, RetryPolicy};
