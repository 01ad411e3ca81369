//! Single worker that drains the queue head-first.
//!
//! The head is removed only once it resolves. Non-session requests wait
//! until the readiness gate reports a live session, so nothing is sent
//! ahead of a pending Install/Open. An Install/Open is only sent once the
//! coordinator has a generation waiting on it.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use beacon_core::{DispatchMeta, Request, RequestId, SdkError, ServerResponse, SessionData, Transport};

use crate::completions::CompletionRegistry;
use crate::queue::RequestQueue;
use crate::retry::RetryPolicy;

pub type SessionGate = watch::Receiver<Option<Arc<SessionData>>>;

enum Settled {
    Done(Result<ServerResponse, SdkError>),
    /// Removed from the queue while being worked, e.g. by a session reset.
    Vanished,
    /// Shutdown arrived during backoff. The request stays queued.
    Interrupted,
}

struct Dispatcher {
    queue: RequestQueue,
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    completions: Arc<CompletionRegistry>,
    gate: SessionGate,
    kicks: watch::Receiver<u64>,
    shutdown: watch::Receiver<bool>,
    /// Head left in place after its retry budget ran out. Skipped until the
    /// next kick.
    parked: Option<RequestId>,
}

/// Owner's handle on the worker task.
pub struct DispatcherHandle {
    queue: RequestQueue,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DispatcherHandle {
    /// Start the worker. Must be called inside a tokio runtime.
    pub fn spawn(
        queue: RequestQueue,
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        completions: Arc<CompletionRegistry>,
        gate: SessionGate,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = Dispatcher {
            queue: queue.clone(),
            transport,
            policy,
            completions,
            gate,
            kicks: queue.kicks(),
            shutdown: shutdown_rx,
            parked: None,
        };
        let task = tokio::spawn(worker.run());
        Self {
            queue,
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Wake the worker and release any parked request.
    pub fn kick(&self) {
        self.queue.kick();
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop after the current attempt. Queued requests stay queued.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "dispatcher task ended abnormally");
            }
        }
    }
}

impl Dispatcher {
    async fn run(mut self) {
        info!(transport = self.transport.name(), "dispatcher started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            self.kicks.borrow_and_update();
            if let Some(head) = self.next_ready() {
                let span = info_span!("dispatch", request_id = %head.id, kind = %head.kind);
                self.dispatch(head.id).instrument(span).await;
                continue;
            }
            tokio::select! {
                changed = self.kicks.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if let Some(id) = self.parked.take() {
                        debug!(request_id = %id, "parked request released");
                    }
                }
                changed = self.gate.changed() => {
                    if changed.is_err() {
                        debug!("session gate closed");
                        break;
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("dispatcher stopped");
    }

    fn next_ready(&mut self) -> Option<Request> {
        let session_ready = self.gate.borrow_and_update().is_some();
        let head = self.queue.peek_head()?;
        if self.parked.as_ref() == Some(&head.id) {
            return None;
        }
        if head.is_session_establishing() {
            // Restored or failed session requests wait for a trigger to adopt them.
            return self.completions.is_waiting(&head.id).then_some(head);
        }
        session_ready.then_some(head)
    }

    async fn dispatch(&mut self, id: RequestId) {
        let Some(request) = self.queue.begin_send(&id) else {
            return;
        };
        let settled = self.attempt(&request).await;
        self.queue.end_send();

        match settled {
            Settled::Done(Ok(response)) => {
                self.queue.remove(&id);
                info!(status = response.status, "request delivered");
                self.completions.resolve(&id, Ok(response));
            }
            Settled::Done(Err(error)) => self.settle_failure(&request, error),
            Settled::Vanished => {
                debug!("request left the queue mid-dispatch");
                self.completions.resolve(&id, Err(SdkError::Superseded));
            }
            Settled::Interrupted => {}
        }
    }

    /// Run attempts until success, a terminal error, or an empty budget.
    async fn attempt(&mut self, request: &Request) -> Settled {
        loop {
            let Some(attempt) = self.queue.record_attempt(&request.id) else {
                return Settled::Vanished;
            };
            let meta = DispatchMeta {
                attempt,
                queue_depth: self.queue.len(),
                age_ms: request.age_ms(Utc::now()),
            };

            let timeout = self.policy.timeout();
            let result = match tokio::time::timeout(timeout, self.transport.send(request, meta)).await {
                Ok(result) => result,
                Err(_) => Err(SdkError::Timeout(timeout)),
            };

            let error = match result {
                Ok(response) => return Settled::Done(Ok(response)),
                Err(e) => e,
            };
            if !error.is_retryable() {
                return Settled::Done(Err(error));
            }
            if !self.policy.allows_retry(attempt) {
                return Settled::Done(Err(SdkError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(error),
                }));
            }

            let delay = self.policy.delay_for(attempt);
            warn!(
                attempt,
                error = %error,
                error_kind = error.error_kind(),
                delay_ms = delay.as_millis() as u64,
                "attempt failed, retrying"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => return Settled::Interrupted,
            }
        }
    }

    fn settle_failure(&mut self, request: &Request, error: SdkError) {
        let exhausted = matches!(error, SdkError::RetriesExhausted { .. });
        let keep = exhausted && (request.kind.survives_exhaustion() || request.is_session_establishing());

        if !keep {
            warn!(error = %error, error_kind = error.error_kind(), "request failed, dropping");
            self.queue.remove(&request.id);
            self.completions.resolve(&request.id, Err(error));
            return;
        }

        warn!(error = %error, "retry budget spent, parking until next kick");
        self.queue.reset_attempts(&request.id);
        self.parked = Some(request.id.clone());
        self.kicks.borrow_and_update();
        // Identify/Logout callers keep waiting for the eventual delivery.
        if request.is_session_establishing() {
            self.completions.resolve(&request.id, Err(error));
        }
    }
}
