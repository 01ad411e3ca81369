//! Durable FIFO of pending requests.
//!
//! Memory is authoritative; every mutation schedules a debounced write of
//! the whole queue through the [`QueueStore`]. At most one Install/Open is
//! queued at any time and it always sits at the head.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use beacon_core::{LinkContext, Request, RequestId};
use beacon_store::{QueueStore, StoreError};

pub const DEFAULT_PERSIST_DELAY: Duration = Duration::from_millis(500);

/// Result of [`RequestQueue::enqueue`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Enqueued {
    /// Appended at this index.
    Appended(usize),
    /// Session request placed at the head.
    AtHead,
    /// Another Install/Open is already queued; nothing was added.
    Rejected { existing: RequestId },
}

#[derive(Default)]
struct QueueState {
    requests: VecDeque<Request>,
    /// Request currently on the wire; its payload is frozen.
    sending: Option<RequestId>,
}

struct Shared {
    state: Mutex<QueueState>,
    store: Arc<dyn QueueStore>,
    persist_delay: Duration,
    persist_scheduled: AtomicBool,
    /// Serializes snapshot+save so an older snapshot never lands last.
    write_lock: Mutex<()>,
    /// Bumped on every enqueue or explicit kick.
    kick: watch::Sender<u64>,
}

impl Shared {
    fn write(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let snapshot: Vec<Request> = self.state.lock().requests.iter().cloned().collect();
        match self.store.save(&snapshot) {
            Ok(()) => {
                debug!(len = snapshot.len(), "queue persisted");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, len = snapshot.len(), "queue persist failed, memory stays authoritative");
                Err(e)
            }
        }
    }
}

#[derive(Clone)]
pub struct RequestQueue {
    shared: Arc<Shared>,
}

impl RequestQueue {
    /// Empty queue over `store`, without reading it.
    pub fn new(store: Arc<dyn QueueStore>, persist_delay: Duration) -> Self {
        let (kick, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                store,
                persist_delay,
                persist_scheduled: AtomicBool::new(false),
                write_lock: Mutex::new(()),
                kick,
            }),
        }
    }

    /// Queue restored from `store`. Unreadable state is logged and treated
    /// as empty; the empty queue is written back so disk reconciles.
    pub fn load(store: Arc<dyn QueueStore>, persist_delay: Duration) -> Self {
        let queue = Self::new(store.clone(), persist_delay);
        match store.load() {
            Ok(requests) => {
                let restored = repair_order(requests);
                info!(len = restored.len(), "queue restored");
                queue.shared.state.lock().requests = restored.into();
            }
            Err(e) => {
                warn!(error = %e, corrupt = e.is_corruption(), "queue state unreadable, starting empty");
                let _ = queue.shared.write();
            }
        }
        queue
    }

    /// Append at the tail; Install/Open goes to the head instead, or is
    /// rejected when one is already queued.
    pub fn enqueue(&self, request: Request) -> Enqueued {
        let outcome = {
            let mut state = self.shared.state.lock();
            if request.is_session_establishing() {
                if let Some(existing) = state.requests.iter().find(|r| r.is_session_establishing()) {
                    return Enqueued::Rejected {
                        existing: existing.id.clone(),
                    };
                }
                state.requests.push_front(request);
                Enqueued::AtHead
            } else {
                state.requests.push_back(request);
                Enqueued::Appended(state.requests.len() - 1)
            }
        };
        self.persist_eventually();
        self.kick();
        outcome
    }

    /// Queue a session request at the head, or hand back the Install/Open
    /// already queued. The returned request is the one in the queue; the
    /// outcome is `AtHead` or `Rejected`.
    pub fn find_or_enqueue_session(&self, request: Request) -> (Request, Enqueued) {
        let outcome = {
            let mut state = self.shared.state.lock();
            if let Some(existing) = state.requests.iter().find(|r| r.is_session_establishing()) {
                let existing = existing.clone();
                let outcome = Enqueued::Rejected {
                    existing: existing.id.clone(),
                };
                return (existing, outcome);
            }
            state.requests.push_front(request.clone());
            Enqueued::AtHead
        };
        self.persist_eventually();
        self.kick();
        (request, outcome)
    }

    /// Insert at `index` (clamped). Session requests are routed through
    /// [`enqueue`](Self::enqueue) so they still land at the head.
    pub fn insert(&self, index: usize, request: Request) -> Enqueued {
        if request.is_session_establishing() {
            return self.enqueue(request);
        }
        let outcome = {
            let mut state = self.shared.state.lock();
            let floor = usize::from(state.requests.front().is_some_and(Request::is_session_establishing));
            let index = index.clamp(floor, state.requests.len());
            state.requests.insert(index, request);
            Enqueued::Appended(index)
        };
        self.persist_eventually();
        self.kick();
        outcome
    }

    pub fn peek(&self, index: usize) -> Option<Request> {
        self.shared.state.lock().requests.get(index).cloned()
    }

    pub fn peek_head(&self) -> Option<Request> {
        self.peek(0)
    }

    pub fn remove_at(&self, index: usize) -> Option<Request> {
        let removed = self.shared.state.lock().requests.remove(index);
        if removed.is_some() {
            self.persist_eventually();
        }
        removed
    }

    pub fn remove(&self, id: &RequestId) -> Option<Request> {
        let removed = {
            let mut state = self.shared.state.lock();
            let pos = state.requests.iter().position(|r| &r.id == id);
            pos.and_then(|pos| state.requests.remove(pos))
        };
        if removed.is_some() {
            self.persist_eventually();
        }
        removed
    }

    pub fn dequeue(&self) -> Option<Request> {
        self.remove_at(0)
    }

    pub fn contains_install_or_open(&self) -> bool {
        self.find_existing_install_or_open().is_some()
    }

    pub fn find_existing_install_or_open(&self) -> Option<Request> {
        self.shared
            .state
            .lock()
            .requests
            .iter()
            .find(|r| r.is_session_establishing())
            .cloned()
    }

    /// Move the queued Install/Open to the head. False when none is queued.
    pub fn promote_install_or_open(&self) -> bool {
        let moved = {
            let mut state = self.shared.state.lock();
            match state.requests.iter().position(Request::is_session_establishing) {
                Some(0) => return true,
                Some(pos) => {
                    if let Some(req) = state.requests.remove(pos) {
                        state.requests.push_front(req);
                    }
                    true
                }
                None => return false,
            }
        };
        self.persist_eventually();
        moved
    }

    pub fn remove_install_or_open(&self) -> Option<Request> {
        let removed = {
            let mut state = self.shared.state.lock();
            let pos = state.requests.iter().position(Request::is_session_establishing);
            pos.and_then(|pos| state.requests.remove(pos))
        };
        if removed.is_some() {
            self.persist_eventually();
        }
        removed
    }

    /// Merge link metadata into a queued session request. False when the
    /// request is gone, is not a session request, or is already on the wire.
    pub fn merge_link(&self, id: &RequestId, link: &LinkContext) -> bool {
        let merged = {
            let mut state = self.shared.state.lock();
            if state.sending.as_ref() == Some(id) {
                return false;
            }
            match state.requests.iter_mut().find(|r| &r.id == id) {
                Some(req) => req.merge_link(link),
                None => false,
            }
        };
        if merged {
            self.persist_eventually();
        }
        merged
    }

    /// Increment the attempt counter. None when the request is no longer queued.
    pub fn record_attempt(&self, id: &RequestId) -> Option<u32> {
        let attempts = {
            let mut state = self.shared.state.lock();
            let req = state.requests.iter_mut().find(|r| &r.id == id)?;
            req.attempts += 1;
            req.attempts
        };
        self.persist_eventually();
        Some(attempts)
    }

    /// Give a parked request a fresh retry budget.
    pub fn reset_attempts(&self, id: &RequestId) {
        let changed = {
            let mut state = self.shared.state.lock();
            match state.requests.iter_mut().find(|r| &r.id == id) {
                Some(req) if req.attempts != 0 => {
                    req.attempts = 0;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.persist_eventually();
        }
    }

    /// Freeze `id` for sending and return its current contents.
    pub(crate) fn begin_send(&self, id: &RequestId) -> Option<Request> {
        let mut state = self.shared.state.lock();
        let request = state.requests.iter().find(|r| &r.id == id)?.clone();
        state.sending = Some(id.clone());
        Some(request)
    }

    pub(crate) fn end_send(&self) {
        self.shared.state.lock().sending = None;
    }

    pub fn clear(&self) {
        self.shared.state.lock().requests.clear();
        self.persist_eventually();
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().requests.is_empty()
    }

    pub fn snapshot(&self) -> Vec<Request> {
        self.shared.state.lock().requests.iter().cloned().collect()
    }

    /// Schedule a write after the debounce window. Calls inside the window
    /// coalesce into one write. Outside a runtime the write happens inline.
    pub fn persist_eventually(&self) {
        if self.shared.persist_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let shared = self.shared.clone();
                handle.spawn(async move {
                    tokio::time::sleep(shared.persist_delay).await;
                    shared.persist_scheduled.store(false, Ordering::SeqCst);
                    let _ = shared.write();
                });
            }
            Err(_) => {
                self.shared.persist_scheduled.store(false, Ordering::SeqCst);
                let _ = self.shared.write();
            }
        }
    }

    /// Write now. Used before the host process is suspended.
    pub fn persist_immediately(&self) -> Result<(), StoreError> {
        self.shared.write()
    }

    /// Wake the dispatcher.
    pub fn kick(&self) {
        self.shared.kick.send_modify(|n| *n = n.wrapping_add(1));
    }

    pub(crate) fn kicks(&self) -> watch::Receiver<u64> {
        self.shared.kick.subscribe()
    }
}

/// Keep the first Install/Open (moved to the head) and drop any others.
fn repair_order(requests: Vec<Request>) -> Vec<Request> {
    let mut session: Option<Request> = None;
    let mut rest = Vec::with_capacity(requests.len());
    for req in requests {
        if req.is_session_establishing() {
            if session.is_none() {
                session = Some(req);
            } else {
                warn!(request_id = %req.id, kind = %req.kind, "dropping duplicate session request from disk");
            }
        } else {
            rest.push(req);
        }
    }
    session.into_iter().chain(rest).collect()
}
