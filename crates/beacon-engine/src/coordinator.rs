//! Open/Install coordination.
//!
//! Every trigger that arrives while a session request is outstanding joins
//! the current generation instead of starting a second one. Resolutions
//! are tagged with the generation that started them; once the generation
//! moves on (reset, or a new session) a late response is discarded.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use beacon_core::{
    IdentityId, LinkContext, Request, RequestId, RequestKind, SdkError, SessionData, SessionPayload,
    SessionResult,
};

use crate::completions::{Completion, CompletionRegistry};
use crate::dispatcher::SessionGate;
use crate::queue::{Enqueued, RequestQueue};

pub type SessionReceiver = oneshot::Receiver<Result<SessionResult, SdkError>>;

/// How a trigger treats an already-established session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BeginMode {
    /// Reuse a Ready session without a network call.
    Join,
    /// Start a fresh session even when one is Ready.
    Restart,
}

/// Inputs for building a new Install/Open.
#[derive(Clone, Debug, Default)]
pub struct SessionSeed {
    pub is_first_run: bool,
    pub identity_id: Option<IdentityId>,
}

/// Observable coordinator state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Initializing { generation: u64 },
    Ready { generation: u64 },
    Failed { generation: u64 },
}

struct Waiter {
    link: Option<LinkContext>,
    tx: oneshot::Sender<Result<SessionResult, SdkError>>,
}

struct InFlight {
    generation: u64,
    request_id: RequestId,
    is_first_session: bool,
    /// Every distinct URL the coalesced triggers brought, in arrival order.
    urls: Vec<String>,
    waiters: Vec<Waiter>,
}

enum SessionState {
    Idle,
    Initializing(InFlight),
    Ready { generation: u64, session: Arc<SessionData> },
    Failed { generation: u64, error: SdkError },
}

struct Inner {
    state: SessionState,
    generation: u64,
    ever_ready: bool,
}

pub struct OpenCoordinator {
    inner: Mutex<Inner>,
    queue: RequestQueue,
    completions: Arc<CompletionRegistry>,
    session_tx: watch::Sender<Option<Arc<SessionData>>>,
}

impl OpenCoordinator {
    pub fn new(queue: RequestQueue, completions: Arc<CompletionRegistry>) -> Arc<Self> {
        let (session_tx, _) = watch::channel(None);
        Arc::new(Self {
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                generation: 0,
                ever_ready: false,
            }),
            queue,
            completions,
            session_tx,
        })
    }

    /// The readiness gate: `Some` while a session is Ready.
    pub fn subscribe(&self) -> SessionGate {
        self.session_tx.subscribe()
    }

    /// Start, join, or reuse a session. The receiver yields exactly once.
    pub fn begin(
        self: &Arc<Self>,
        link: Option<LinkContext>,
        mode: BeginMode,
        seed: SessionSeed,
    ) -> SessionReceiver {
        let (tx, rx) = oneshot::channel();
        let link = link.filter(|l| !l.is_empty());
        let mut inner = self.inner.lock();

        match &mut inner.state {
            SessionState::Initializing(flight) => {
                if let Some(link) = &link {
                    if let Some(url) = &link.url {
                        if !flight.urls.contains(url) {
                            flight.urls.push(url.clone());
                        }
                    }
                    if !self.queue.merge_link(&flight.request_id, link) {
                        debug!(request_id = %flight.request_id, "session request already sent, link kept in memory");
                    }
                }
                flight.waiters.push(Waiter { link, tx });
                debug!(
                    generation = flight.generation,
                    waiters = flight.waiters.len(),
                    "trigger coalesced into in-flight session"
                );
                self.queue.kick();
                return rx;
            }
            SessionState::Ready { session, .. } if mode == BeginMode::Join => {
                let urls = link.as_ref().and_then(|l| l.url.clone()).into_iter().collect();
                let _ = tx.send(Ok(SessionResult {
                    session: session.clone(),
                    link,
                    urls,
                }));
                self.queue.kick();
                return rx;
            }
            _ => {}
        }

        self.start_generation(&mut inner, link, tx, seed);
        rx
    }

    fn start_generation(
        self: &Arc<Self>,
        inner: &mut Inner,
        link: Option<LinkContext>,
        tx: oneshot::Sender<Result<SessionResult, SdkError>>,
        seed: SessionSeed,
    ) {
        inner.generation += 1;
        let generation = inner.generation;

        let payload = SessionPayload::new(link.as_ref(), seed.identity_id);
        let candidate = if seed.is_first_run {
            Request::install(payload)
        } else {
            Request::open(payload)
        };
        let request = match self.queue.find_or_enqueue_session(candidate) {
            (existing, Enqueued::Rejected { .. }) => self.adopt(existing, link.as_ref()),
            (queued, _) => queued,
        };

        let urls = request.session_payload().map(|p| p.urls).unwrap_or_default();
        let done = self.completions.register(&request.id);
        info!(
            generation,
            request_id = %request.id,
            kind = %request.kind,
            "session initialization started"
        );

        inner.state = SessionState::Initializing(InFlight {
            generation,
            request_id: request.id.clone(),
            is_first_session: request.kind == RequestKind::Install,
            urls,
            waiters: vec![Waiter { link, tx }],
        });
        self.session_tx.send_replace(None);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = done.await.unwrap_or(Err(SdkError::Superseded));
            this.resolve(generation, outcome);
        });
        self.queue.kick();
    }

    /// Take over an Install/Open already queued: same id, link merged,
    /// fresh retry budget, moved to the head.
    fn adopt(&self, existing: Request, link: Option<&LinkContext>) -> Request {
        if let Some(link) = link {
            self.queue.merge_link(&existing.id, link);
        }
        self.queue.reset_attempts(&existing.id);
        self.queue.promote_install_or_open();
        debug!(request_id = %existing.id, kind = %existing.kind, "reusing queued session request");
        self.queue.find_existing_install_or_open().unwrap_or(existing)
    }

    fn resolve(&self, generation: u64, outcome: Completion) {
        let mut inner = self.inner.lock();
        let current = matches!(&inner.state, SessionState::Initializing(f) if f.generation == generation);
        if !current {
            debug!(generation, current = inner.generation, "discarding stale session resolution");
            return;
        }
        let SessionState::Initializing(flight) = std::mem::replace(&mut inner.state, SessionState::Idle) else {
            return;
        };

        let parsed = outcome.and_then(|response| SessionData::from_response(&response.body, flight.is_first_session));
        match parsed {
            Ok(data) => {
                let session = Arc::new(data);
                info!(
                    generation,
                    session_id = %session.session_id,
                    waiters = flight.waiters.len(),
                    "session ready"
                );
                inner.state = SessionState::Ready {
                    generation,
                    session: session.clone(),
                };
                inner.ever_ready = true;
                self.session_tx.send_replace(Some(session.clone()));
                for waiter in flight.waiters {
                    let _ = waiter.tx.send(Ok(SessionResult {
                        session: session.clone(),
                        link: waiter.link,
                        urls: flight.urls.clone(),
                    }));
                }
            }
            Err(error) => {
                warn!(generation, error = %error, waiters = flight.waiters.len(), "session initialization failed");
                for waiter in flight.waiters {
                    let _ = waiter.tx.send(Err(error.clone()));
                }
                inner.state = SessionState::Failed { generation, error };
            }
        }
    }

    /// Back to Idle. Pending waiters get `Superseded`; the queued
    /// Install/Open is dropped; a response still on the wire is ignored.
    pub fn reset_session(&self) {
        let mut inner = self.inner.lock();
        let previous = std::mem::replace(&mut inner.state, SessionState::Idle);
        if let SessionState::Initializing(flight) = previous {
            for waiter in flight.waiters {
                let _ = waiter.tx.send(Err(SdkError::Superseded));
            }
            self.completions.cancel(&flight.request_id);
        }
        if let Some(request) = self.queue.remove_install_or_open() {
            self.completions.cancel(&request.id);
        }
        self.session_tx.send_replace(None);
        info!(generation = inner.generation, "session reset");
    }

    pub fn session(&self) -> Option<Arc<SessionData>> {
        match &self.inner.lock().state {
            SessionState::Ready { session, .. } => Some(session.clone()),
            _ => None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        match &self.inner.lock().state {
            SessionState::Idle => SessionPhase::Idle,
            SessionState::Initializing(f) => SessionPhase::Initializing {
                generation: f.generation,
            },
            SessionState::Ready { generation, .. } => SessionPhase::Ready {
                generation: *generation,
            },
            SessionState::Failed { generation, .. } => SessionPhase::Failed {
                generation: *generation,
            },
        }
    }

    pub fn last_error(&self) -> Option<SdkError> {
        match &self.inner.lock().state {
            SessionState::Failed { error, .. } => Some(error.clone()),
            _ => None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// True once any generation has reached Ready, even if reset since.
    pub fn ever_ready(&self) -> bool {
        self.inner.lock().ever_ready
    }
}
