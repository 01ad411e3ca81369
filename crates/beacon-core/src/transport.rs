use async_trait::async_trait;
use serde_json::Value;

use crate::errors::SdkError;
use crate::request::Request;

/// Per-attempt metadata sent upstream alongside the request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchMeta {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Requests queued when this one was sent, itself included.
    pub queue_depth: usize,
    /// Time the request spent waiting since creation.
    pub age_ms: u64,
}

/// Successful server reply.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerResponse {
    pub status: u16,
    pub body: Value,
}

impl ServerResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }
}

/// The network boundary. One call per request attempt.
///
/// Implementations map non-2xx replies to [`SdkError::from_status`] and
/// connection problems to [`SdkError::NetworkFailure`]; deadlines are
/// enforced by the dispatcher.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, request: &Request, meta: DispatchMeta) -> Result<ServerResponse, SdkError>;
}
