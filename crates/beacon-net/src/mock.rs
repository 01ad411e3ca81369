use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

use beacon_core::{DispatchMeta, Request, RequestId, RequestKind, SdkError, ServerResponse, Transport};

/// Pre-programmed replies for deterministic testing without a server.
#[derive(Clone)]
pub enum MockReply {
    Ok(Value),
    Error(SdkError),
    /// Wait a duration, then resolve the inner reply.
    Delay(Duration, Box<MockReply>),
    /// Wait until the gate is notified, then resolve the inner reply.
    Held(Arc<Notify>, Box<MockReply>),
}

impl MockReply {
    /// A successful Install/Open reply.
    pub fn session(session_id: &str, identity_id: &str, data: Value) -> Self {
        Self::Ok(serde_json::json!({
            "session_id": session_id,
            "identity_id": identity_id,
            "data": data,
        }))
    }

    pub fn empty() -> Self {
        Self::Ok(Value::Object(Default::default()))
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }

    pub fn held(gate: Arc<Notify>, inner: MockReply) -> Self {
        Self::Held(gate, Box::new(inner))
    }
}

/// One observed call.
#[derive(Clone, Debug)]
pub struct MockCall {
    pub id: RequestId,
    pub kind: RequestKind,
    pub meta: DispatchMeta,
    pub payload: Value,
}

/// Transport returning scripted replies in call order.
#[derive(Default)]
pub struct MockTransport {
    replies: Mutex<VecDeque<MockReply>>,
    fallback: Mutex<Option<MockReply>>,
    calls: Mutex<Vec<MockCall>>,
}

impl MockTransport {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Default::default()
        }
    }

    /// Reply used once the script runs out.
    pub fn with_fallback(self, reply: MockReply) -> Self {
        *self.fallback.lock() = Some(reply);
        self
    }

    pub fn push(&self, reply: MockReply) {
        self.replies.lock().push_back(reply);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn calls_of(&self, kind: RequestKind) -> Vec<MockCall> {
        self.calls.lock().iter().filter(|c| c.kind == kind).cloned().collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn send(&self, request: &Request, meta: DispatchMeta) -> Result<ServerResponse, SdkError> {
        self.calls.lock().push(MockCall {
            id: request.id.clone(),
            kind: request.kind,
            meta,
            payload: request.payload.clone(),
        });

        let next = self.replies.lock().pop_front();
        let reply = match next.or_else(|| self.fallback.lock().clone()) {
            Some(reply) => reply,
            None => {
                return Err(SdkError::InvalidResponse(format!(
                    "MockTransport: no reply scripted for {} {}",
                    request.kind, request.id
                )))
            }
        };
        resolve(reply).await
    }
}

/// Unrolls nested delays and gates iteratively.
async fn resolve(reply: MockReply) -> Result<ServerResponse, SdkError> {
    let mut current = reply;
    loop {
        match current {
            MockReply::Ok(body) => return Ok(ServerResponse::ok(body)),
            MockReply::Error(e) => return Err(e),
            MockReply::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
            MockReply::Held(gate, inner) => {
                gate.notified().await;
                current = *inner;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::SessionPayload;

    #[tokio::test]
    async fn replies_in_order_then_errors() {
        let mock = MockTransport::new(vec![
            MockReply::session("s1", "i1", Value::Null),
            MockReply::Error(SdkError::NetworkFailure("down".into())),
        ]);
        let req = Request::open(SessionPayload::default());

        let first = mock.send(&req, DispatchMeta::default()).await.unwrap();
        assert_eq!(first.body["session_id"], "s1");
        assert!(mock.send(&req, DispatchMeta::default()).await.is_err());
        assert!(matches!(
            mock.send(&req, DispatchMeta::default()).await,
            Err(SdkError::InvalidResponse(_))
        ));
        assert_eq!(mock.call_count(), 3);
        assert!(mock.calls().iter().all(|c| c.id == req.id));
    }

    #[tokio::test]
    async fn fallback_used_after_script() {
        let mock = MockTransport::new(vec![]).with_fallback(MockReply::empty());
        let req = Request::event("e", Value::Null);
        assert!(mock.send(&req, DispatchMeta::default()).await.is_ok());
        assert!(mock.send(&req, DispatchMeta::default()).await.is_ok());
        assert_eq!(mock.calls_of(RequestKind::Event).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_reply_waits() {
        let mock = MockTransport::new(vec![MockReply::delayed(
            Duration::from_secs(3),
            MockReply::empty(),
        )]);
        let start = tokio::time::Instant::now();
        mock.send(&Request::logout(), DispatchMeta::default()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn held_reply_waits_for_gate() {
        let gate = Arc::new(Notify::new());
        let mock = Arc::new(MockTransport::new(vec![MockReply::held(gate.clone(), MockReply::empty())]));

        let m = mock.clone();
        let handle = tokio::spawn(async move { m.send(&Request::logout(), DispatchMeta::default()).await });
        tokio::task::yield_now().await;
        assert!(!handle.is_finished());

        gate.notify_one();
        assert!(handle.await.unwrap().is_ok());
    }
}
