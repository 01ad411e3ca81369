//! Queue durability across a simulated process restart, backed by SQLite.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;

use beacon_core::{Request, RequestKind, SdkError, SessionPayload};
use beacon_engine::{Beacon, RequestQueue, RetryPolicy, DEFAULT_PERSIST_DELAY};
use beacon_net::{MockReply, MockTransport};
use beacon_store::{Database, PreferenceRepo, QueueStore, SqliteQueueStore};

fn temp_db() -> PathBuf {
    std::env::temp_dir()
        .join(format!("beacon-engine-test-{}", uuid::Uuid::now_v7()))
        .join("beacon.db")
}

fn sqlite_store(path: &PathBuf) -> Arc<dyn QueueStore> {
    Arc::new(SqliteQueueStore::new(Database::open(path).unwrap()))
}

#[tokio::test]
async fn queue_survives_restart_with_attempts() {
    let path = temp_db();

    let before = {
        let queue = RequestQueue::load(sqlite_store(&path), DEFAULT_PERSIST_DELAY);
        let install = Request::install(SessionPayload::default());
        let event = Request::event("purchase", json!({"amount": 12}));
        let identify = Request::identify("user-7");

        queue.enqueue(event.clone());
        queue.enqueue(identify.clone());
        queue.enqueue(install.clone());
        queue.record_attempt(&event.id);
        queue.record_attempt(&event.id);
        queue.record_attempt(&identify.id);
        queue.persist_immediately().unwrap();
        queue.snapshot()
    };

    let after = RequestQueue::load(sqlite_store(&path), DEFAULT_PERSIST_DELAY).snapshot();

    assert_eq!(after, before);
    let kinds: Vec<_> = after.iter().map(|r| r.kind).collect();
    assert_eq!(kinds, vec![RequestKind::Install, RequestKind::Event, RequestKind::Identify]);
    assert_eq!(after[1].attempts, 2);
    assert_eq!(after[2].attempts, 1);

    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[tokio::test(start_paused = true)]
async fn offline_requests_are_resent_after_restart() {
    let path = temp_db();
    let db = Database::open(&path).unwrap();
    let offline = MockReply::Error(SdkError::NetworkFailure("offline".into()));

    let event_id = {
        let mock = Arc::new(MockTransport::new(vec![]).with_fallback(offline));
        let b = Beacon::builder(mock.clone())
            .queue_store(Arc::new(SqliteQueueStore::new(db.clone())))
            .preferences(PreferenceRepo::new(db.clone()))
            .retry_policy(RetryPolicy::default())
            .build();

        assert!(matches!(b.initialize(None).await, Err(SdkError::RetriesExhausted { .. })));
        let event_id = b.log_event("purchase", json!({})).unwrap();
        b.shutdown().await;
        event_id
    };
    let pending = SqliteQueueStore::new(db.clone()).load().unwrap();
    assert_eq!(pending.len(), 2);
    let install_id = pending[0].id.clone();

    let mock = Arc::new(MockTransport::new(vec![
        MockReply::session("s1", "i1", json!({})),
        MockReply::empty(),
    ]));
    let b = Beacon::builder(mock.clone())
        .queue_store(Arc::new(SqliteQueueStore::new(db.clone())))
        .preferences(PreferenceRepo::new(db.clone()))
        .build();
    b.initialize(None).await.unwrap();
    while mock.call_count() < 2 {
        tokio::task::yield_now().await;
    }

    let ids: Vec<_> = mock.calls().into_iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![install_id, event_id]);
    assert_eq!(mock.calls()[0].kind, RequestKind::Install);
    b.shutdown().await;

    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}
