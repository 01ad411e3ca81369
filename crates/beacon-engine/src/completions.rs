use dashmap::DashMap;
use tokio::sync::oneshot;

use beacon_core::{RequestId, SdkError, ServerResponse};

pub type Completion = Result<ServerResponse, SdkError>;

/// Waiters for in-memory requests, keyed by request id.
///
/// Requests restored from disk have no waiters; their outcome is only
/// reflected in the queue. Each entry resolves at most once.
#[derive(Default)]
pub struct CompletionRegistry {
    waiters: DashMap<RequestId, Vec<oneshot::Sender<Completion>>>,
}

impl CompletionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: &RequestId) -> oneshot::Receiver<Completion> {
        let (tx, rx) = oneshot::channel();
        self.waiters.entry(id.clone()).or_default().push(tx);
        rx
    }

    /// Deliver `outcome` to every waiter of `id`. Returns how many were waiting.
    pub fn resolve(&self, id: &RequestId, outcome: Completion) -> usize {
        let Some((_, senders)) = self.waiters.remove(id) else {
            return 0;
        };
        let count = senders.len();
        for tx in senders {
            let _ = tx.send(outcome.clone());
        }
        count
    }

    /// Drop the waiters of `id`; their receivers observe a closed channel.
    pub fn cancel(&self, id: &RequestId) {
        self.waiters.remove(id);
    }

    /// Fail every waiter with `error`.
    pub fn fail_all(&self, error: SdkError) {
        let ids: Vec<RequestId> = self.waiters.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.resolve(&id, Err(error.clone()));
        }
    }

    pub fn is_waiting(&self, id: &RequestId) -> bool {
        self.waiters.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_every_waiter_once() {
        let registry = CompletionRegistry::new();
        let id = RequestId::new();
        let a = registry.register(&id);
        let b = registry.register(&id);

        assert_eq!(registry.resolve(&id, Ok(ServerResponse::ok(serde_json::json!({"n": 1})))), 2);
        assert_eq!(registry.resolve(&id, Err(SdkError::Shutdown)), 0);

        assert_eq!(a.await.unwrap().unwrap().body["n"], 1);
        assert_eq!(b.await.unwrap().unwrap().body["n"], 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn cancel_closes_receivers() {
        let registry = CompletionRegistry::new();
        let id = RequestId::new();
        let rx = registry.register(&id);
        registry.cancel(&id);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn fail_all_reaches_every_request() {
        let registry = CompletionRegistry::new();
        let first = registry.register(&RequestId::new());
        let second = registry.register(&RequestId::new());
        registry.fail_all(SdkError::TrackingDisabled);
        assert!(matches!(first.await.unwrap(), Err(SdkError::TrackingDisabled)));
        assert!(matches!(second.await.unwrap(), Err(SdkError::TrackingDisabled)));
    }
}
