//! The `Beacon` façade: lifecycle entry points plus the non-session
//! requests (identify, logout, events, short URLs) that ride the same queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use beacon_core::{
    IdentityId, LinkContext, Request, RequestId, SdkError, ServerResponse, SessionData, SessionResult,
    Transport, Trigger,
};
use beacon_net::HttpTransport;
use beacon_store::preferences::{
    FIRST_SESSION_PARAMS, IDENTITY_ID, LATEST_SESSION_PARAMS, SESSION_ID, TRACKING_DISABLED, USER_IDENTITY,
};
use beacon_store::{Database, MemoryQueueStore, PreferenceRepo, QueueStore, SqliteQueueStore, StoreError};

use crate::completions::{Completion, CompletionRegistry};
use crate::config::SdkConfig;
use crate::coordinator::{BeginMode, OpenCoordinator, SessionPhase, SessionSeed};
use crate::dispatcher::DispatcherHandle;
use crate::queue::{RequestQueue, DEFAULT_PERSIST_DELAY};
use crate::retry::RetryPolicy;

pub struct BeaconBuilder {
    transport: Arc<dyn Transport>,
    queue_store: Option<Arc<dyn QueueStore>>,
    preferences: Option<PreferenceRepo>,
    retry: RetryPolicy,
    persist_delay: Duration,
    first_run: Option<bool>,
    tracking_disabled: Option<bool>,
}

impl BeaconBuilder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            queue_store: None,
            preferences: None,
            retry: RetryPolicy::default(),
            persist_delay: DEFAULT_PERSIST_DELAY,
            first_run: None,
            tracking_disabled: None,
        }
    }

    /// Defaults to an in-process store.
    pub fn queue_store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.queue_store = Some(store);
        self
    }

    pub fn preferences(mut self, preferences: PreferenceRepo) -> Self {
        self.preferences = Some(preferences);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn persist_delay(mut self, delay: Duration) -> Self {
        self.persist_delay = delay;
        self
    }

    /// Override first-run detection for the first session of this process.
    pub fn first_run(mut self, first_run: bool) -> Self {
        self.first_run = Some(first_run);
        self
    }

    pub fn tracking_disabled(mut self, disabled: bool) -> Self {
        self.tracking_disabled = Some(disabled);
        self
    }

    /// Restore the queue and start the dispatcher. Must be called inside a
    /// tokio runtime.
    pub fn build(self) -> Beacon {
        let store = self
            .queue_store
            .unwrap_or_else(|| Arc::new(MemoryQueueStore::new()));
        let queue = RequestQueue::load(store, self.persist_delay);
        let completions = Arc::new(CompletionRegistry::new());
        let coordinator = OpenCoordinator::new(queue.clone(), completions.clone());
        let dispatcher = DispatcherHandle::spawn(
            queue.clone(),
            self.transport,
            self.retry,
            completions.clone(),
            coordinator.subscribe(),
        );

        let prefs = self.preferences;
        let stored_disabled = prefs
            .as_ref()
            .map(|p| p.get_bool(TRACKING_DISABLED))
            .transpose()
            .unwrap_or_else(|e| {
                warn!(error = %e, "could not read tracking preference");
                None
            })
            .unwrap_or(false);
        let identity = prefs
            .as_ref()
            .and_then(|p| read_pref(p, USER_IDENTITY));

        info!(pending = queue.len(), "beacon started");
        Beacon {
            queue,
            completions,
            coordinator,
            dispatcher,
            prefs,
            first_run: self.first_run,
            tracking_disabled: AtomicBool::new(self.tracking_disabled.unwrap_or(stored_disabled)),
            identity: Mutex::new(identity),
            first_params: Mutex::new(None),
            recorded: Mutex::new(None),
        }
    }
}

pub struct Beacon {
    queue: RequestQueue,
    completions: Arc<CompletionRegistry>,
    coordinator: Arc<OpenCoordinator>,
    dispatcher: DispatcherHandle,
    prefs: Option<PreferenceRepo>,
    first_run: Option<bool>,
    tracking_disabled: AtomicBool,
    /// Developer-assigned user id.
    identity: Mutex<Option<String>>,
    first_params: Mutex<Option<Value>>,
    /// Last session written to preferences.
    recorded: Mutex<Option<Arc<SessionData>>>,
}

impl Beacon {
    pub fn builder(transport: Arc<dyn Transport>) -> BeaconBuilder {
        BeaconBuilder::new(transport)
    }

    /// HTTP transport, SQLite queue and preferences, all from `config`.
    pub fn from_config(config: &SdkConfig) -> Result<Self, SdkError> {
        let key = config
            .sdk_key
            .as_ref()
            .ok_or_else(|| SdkError::InvalidState("sdk_key is not configured".into()))?;
        let transport = HttpTransport::new(
            &config.api_base_url,
            SecretString::from(key.expose_secret().to_string()),
        )?;
        let db = Database::open(&config.store_path)?;

        let mut builder = BeaconBuilder::new(Arc::new(transport))
            .queue_store(Arc::new(SqliteQueueStore::new(db.clone())))
            .preferences(PreferenceRepo::new(db))
            .retry_policy(config.retry.clone())
            .persist_delay(Duration::from_millis(config.persist_delay_ms));
        if config.tracking_disabled {
            builder = builder.tracking_disabled(true);
        }
        Ok(builder.build())
    }

    /// Join the current session or start one. A Ready session is returned
    /// without a network call.
    pub async fn initialize(&self, link: Option<LinkContext>) -> Result<SessionResult, SdkError> {
        self.begin(link, BeginMode::Join).await
    }

    /// Re-attribute with a fresh session, or join one still initializing.
    pub async fn handle_deep_link(&self, link: LinkContext) -> Result<SessionResult, SdkError> {
        self.begin(Some(link), BeginMode::Restart).await
    }

    pub async fn handle_trigger(&self, trigger: Trigger) -> Result<SessionResult, SdkError> {
        debug!(trigger = trigger.name(), "lifecycle trigger");
        match trigger.link() {
            Some(link) if trigger.is_explicit_deep_link() => self.handle_deep_link(link.clone()).await,
            link => self.initialize(link.cloned()).await,
        }
    }

    /// Callback form of [`initialize`](Self::initialize).
    pub fn initialize_with<F>(self: &Arc<Self>, link: Option<LinkContext>, completion: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<SessionResult, SdkError>) + Send + 'static,
    {
        let this = Arc::clone(self);
        tokio::spawn(async move { completion(this.initialize(link).await) })
    }

    /// Callback form of [`handle_deep_link`](Self::handle_deep_link).
    pub fn handle_deep_link_with<F>(self: &Arc<Self>, link: LinkContext, completion: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<SessionResult, SdkError>) + Send + 'static,
    {
        let this = Arc::clone(self);
        tokio::spawn(async move { completion(this.handle_deep_link(link).await) })
    }

    async fn begin(&self, link: Option<LinkContext>, mode: BeginMode) -> Result<SessionResult, SdkError> {
        self.ensure_tracking()?;
        let rx = self.coordinator.begin(link, mode, self.seed());
        let result = rx.await.map_err(|_| SdkError::Shutdown)??;
        self.record_session(&result.session);
        Ok(result)
    }

    fn seed(&self) -> SessionSeed {
        let identity_id = self
            .prefs
            .as_ref()
            .and_then(|p| read_pref(p, IDENTITY_ID))
            .map(IdentityId::from_raw)
            .or_else(|| self.recorded.lock().as_ref().map(|s| s.identity_id.clone()));
        let detected = identity_id.is_none() && !self.coordinator.ever_ready();
        let is_first_run = match self.first_run {
            Some(forced) if !self.coordinator.ever_ready() => forced,
            _ => detected,
        };
        SessionSeed {
            is_first_run,
            identity_id,
        }
    }

    fn record_session(&self, session: &Arc<SessionData>) {
        {
            let mut recorded = self.recorded.lock();
            if recorded.as_ref().is_some_and(|r| Arc::ptr_eq(r, session)) {
                return;
            }
            *recorded = Some(session.clone());
        }
        if session.is_first_session {
            *self.first_params.lock() = Some(session.link_data.clone());
        }

        let Some(prefs) = &self.prefs else {
            return;
        };
        let stored = (|| -> Result<(), StoreError> {
            prefs.set(IDENTITY_ID, session.identity_id.as_str())?;
            prefs.set(SESSION_ID, session.session_id.as_str())?;
            prefs.set_json(LATEST_SESSION_PARAMS, &session.link_data)?;
            if session.is_first_session {
                prefs.set_json(FIRST_SESSION_PARAMS, &session.link_data)?;
            }
            Ok(())
        })();
        if let Err(e) = stored {
            warn!(error = %e, session_id = %session.session_id, "failed to store session preferences");
        }
    }

    /// Queue `request` and wait for its outcome.
    pub async fn send(&self, request: Request) -> Result<ServerResponse, SdkError> {
        let rx = self.submit(request)?;
        rx.await.map_err(|_| SdkError::Shutdown)?
    }

    fn submit(&self, request: Request) -> Result<oneshot::Receiver<Completion>, SdkError> {
        self.ensure_tracking()?;
        if request.is_session_establishing() {
            return Err(SdkError::InvalidState(
                "session requests are started by lifecycle triggers".into(),
            ));
        }
        let rx = self.completions.register(&request.id);
        self.queue.enqueue(request);
        Ok(rx)
    }

    /// Queue a custom event without waiting for delivery.
    pub fn log_event(&self, name: &str, data: Value) -> Result<RequestId, SdkError> {
        self.ensure_tracking()?;
        let request = Request::event(name, data);
        let id = request.id.clone();
        self.queue.enqueue(request);
        Ok(id)
    }

    /// Attach a developer user id. No request is sent when it already matches.
    pub async fn set_identity(&self, user_id: &str) -> Result<(), SdkError> {
        self.ensure_tracking()?;
        if !self.coordinator.ever_ready() {
            return Err(SdkError::InvalidState(
                "set_identity requires a prior successful session".into(),
            ));
        }
        if self.identity.lock().as_deref() == Some(user_id) {
            debug!("identity unchanged, skipping request");
            return Ok(());
        }

        self.send(Request::identify(user_id)).await?;
        *self.identity.lock() = Some(user_id.to_string());
        if let Some(prefs) = &self.prefs {
            if let Err(e) = prefs.set(USER_IDENTITY, user_id) {
                warn!(error = %e, "failed to store identity");
            }
        }
        info!("identity set");
        Ok(())
    }

    /// Drop the developer identity. The session is reset once the server
    /// acknowledges.
    pub async fn logout(&self) -> Result<(), SdkError> {
        self.ensure_tracking()?;
        if !self.coordinator.ever_ready() {
            return Err(SdkError::InvalidState("logout requires a prior successful session".into()));
        }
        self.send(Request::logout()).await?;
        self.coordinator.reset_session();
        self.forget_session_state();
        info!("logged out");
        Ok(())
    }

    pub async fn short_url(&self, params: Value) -> Result<String, SdkError> {
        let response = self.send(Request::short_url(params)).await?;
        response
            .body
            .get("url")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| SdkError::InvalidResponse("short url response has no url".into()))
    }

    pub fn reset_session(&self) {
        self.coordinator.reset_session();
    }

    /// Flush the queue to disk now, e.g. before the host is suspended.
    pub fn persist_immediately(&self) -> Result<(), SdkError> {
        self.queue.persist_immediately().map_err(SdkError::from)
    }

    pub fn session(&self) -> Option<Arc<SessionData>> {
        self.coordinator.session()
    }

    pub fn phase(&self) -> SessionPhase {
        self.coordinator.phase()
    }

    pub fn identity(&self) -> Option<String> {
        self.identity.lock().clone()
    }

    pub fn pending_requests(&self) -> Vec<Request> {
        self.queue.snapshot()
    }

    /// Link data of the install session.
    pub fn first_session_params(&self) -> Option<Value> {
        if let Some(params) = self.first_params.lock().clone() {
            return Some(params);
        }
        self.prefs.as_ref().and_then(|p| read_json(p, FIRST_SESSION_PARAMS))
    }

    /// Link data of the most recent session.
    pub fn latest_session_params(&self) -> Option<Value> {
        if let Some(session) = self.coordinator.session() {
            return Some(session.link_data.clone());
        }
        self.prefs.as_ref().and_then(|p| read_json(p, LATEST_SESSION_PARAMS))
    }

    pub fn is_tracking_disabled(&self) -> bool {
        self.tracking_disabled.load(Ordering::SeqCst)
    }

    /// Opting out resets the session, drops every pending request and
    /// fails their callers with `TrackingDisabled`.
    pub fn set_tracking_disabled(&self, disabled: bool) {
        self.tracking_disabled.store(disabled, Ordering::SeqCst);
        if let Some(prefs) = &self.prefs {
            if let Err(e) = prefs.set_bool(TRACKING_DISABLED, disabled) {
                warn!(error = %e, "failed to store tracking preference");
            }
        }
        if disabled {
            self.coordinator.reset_session();
            self.queue.clear();
            self.completions.fail_all(SdkError::TrackingDisabled);
            self.forget_session_state();
        }
        info!(disabled, "tracking preference changed");
    }

    /// Stop the dispatcher, flush the queue, and fail outstanding callers.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
        if let Err(e) = self.queue.persist_immediately() {
            warn!(error = %e, "final queue flush failed");
        }
        self.completions.fail_all(SdkError::Shutdown);
        info!(pending = self.queue.len(), "beacon stopped");
    }

    fn ensure_tracking(&self) -> Result<(), SdkError> {
        if self.is_tracking_disabled() {
            return Err(SdkError::TrackingDisabled);
        }
        Ok(())
    }

    fn forget_session_state(&self) {
        *self.identity.lock() = None;
        *self.recorded.lock() = None;
        if let Some(prefs) = &self.prefs {
            if let Err(e) = prefs.clear_session_state() {
                warn!(error = %e, "failed to clear session preferences");
            }
        }
    }
}

fn read_pref(prefs: &PreferenceRepo, key: &str) -> Option<String> {
    prefs.get(key).unwrap_or_else(|e| {
        warn!(error = %e, key, "could not read preference");
        None
    })
}

fn read_json(prefs: &PreferenceRepo, key: &str) -> Option<Value> {
    prefs.get_json(key).unwrap_or_else(|e| {
        warn!(error = %e, key, "could not read preference");
        None
    })
}
