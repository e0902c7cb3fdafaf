//! One deployed version of the cache worker.
//!
//! ```text
//! Parsed ──install()──▶ Installing ──▶ Installed ──activate()──▶ Activating ──▶ Activated
//!                                          │                                      │
//!                                          └──────────── replaced ──────────▶ Redundant
//! ```
//!
//! Only an `Activated` worker intercepts fetches.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use academy_common::{retry_with_backoff_if, RetryConfig};
use academy_net::{Fetcher, Request, Response};
use futures::future::{join_all, try_join_all};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::cache::{CacheKey, CacheStorage};
use crate::classify::{Classifier, Route};
use crate::clients::Clients;
use crate::config::{CacheNames, WorkerConfig};
use crate::error::{StorageError, WorkerError};
use crate::message::{ClientMessage, ControlMessage, ControlReply, ReplyPort};
use crate::notification::{Notification, NotificationClickOutcome, ACTION_CLOSE};
use crate::strategy::{StrategyEngine, NETWORK_FIRST_FALLBACK};

// ==================== Types ====================

/// Unique identifier for a worker version instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Created, nothing done yet.
    #[default]
    Parsed,
    /// Pre-caching the static asset set.
    Installing,
    /// Installed, waiting to take over.
    Installed,
    /// Purging old namespaces.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced or unregistered.
    Redundant,
}

impl ServiceWorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parsed => "parsed",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Activated => "activated",
            Self::Redundant => "redundant",
        }
    }
}

// ==================== Reports ====================

/// Outcome of the install step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    /// Namespace the static asset set went into.
    pub cache: String,
    /// Assets in the static asset set.
    pub requested: usize,
    /// Assets stored. Either all of them or none.
    pub stored: usize,
    /// Why the batch was not stored.
    pub error: Option<String>,
}

impl InstallReport {
    pub fn is_complete(&self) -> bool {
        self.error.is_none() && self.stored == self.requested
    }
}

/// Outcome of a namespace sweep. Each deletion is independent.
#[derive(Debug, Default)]
pub struct PurgeReport {
    pub deleted: Vec<String>,
    pub failed: Vec<(String, StorageError)>,
}

impl PurgeReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Outcome of the activate step.
#[derive(Debug)]
pub struct ActivateReport {
    pub purge: PurgeReport,
    /// Clients that changed controller.
    pub claimed: usize,
    /// Clients that received `CACHE_UPDATED`.
    pub notified: usize,
}

/// What handling a control message did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// The sender asked the waiting worker to take over now.
    SkipWaiting,
    /// A reply was posted.
    Replied(ControlReply),
    /// A reply was produced but no one was listening for it.
    Undelivered(ControlReply),
}

// ==================== Cache Worker ====================

/// One version of the worker and everything it needs.
pub struct CacheWorker {
    id: ServiceWorkerId,
    scope: Url,
    config: Arc<WorkerConfig>,
    names: CacheNames,
    classifier: Classifier,
    engine: StrategyEngine,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    clients: Arc<RwLock<Clients>>,
    state: watch::Sender<ServiceWorkerState>,
}

impl std::fmt::Debug for CacheWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheWorker")
            .field("id", &self.id)
            .field("version", &self.config.version)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CacheWorker {
    /// Create a worker for `config`. The config is validated here.
    pub fn new(
        config: WorkerConfig,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
        clients: Arc<RwLock<Clients>>,
    ) -> Result<Self, WorkerError> {
        config.validate()?;
        let names = config.cache_names();
        let engine = StrategyEngine::new(
            storage.clone(),
            fetcher.clone(),
            names.clone(),
            config.resolve(&config.offline_page)?,
            config.network_timeout(),
        );
        let (state, _) = watch::channel(ServiceWorkerState::Parsed);

        Ok(Self {
            id: ServiceWorkerId::new(),
            scope: config.origin.clone(),
            classifier: Classifier::from_config(&config),
            config: Arc::new(config),
            names,
            engine,
            storage,
            fetcher,
            clients,
            state,
        })
    }

    /// Run under a registration scope instead of the config origin.
    pub(crate) fn with_scope(mut self, scope: Url) -> Self {
        self.scope = scope;
        self
    }

    pub fn id(&self) -> ServiceWorkerId {
        self.id
    }

    /// Pages under this URL are claimed on activation.
    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn version(&self) -> &str {
        &self.config.version
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn cache_names(&self) -> &CacheNames {
        &self.names
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn state(&self) -> ServiceWorkerState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<ServiceWorkerState> {
        self.state.subscribe()
    }

    fn transition(
        &self,
        from: ServiceWorkerState,
        to: ServiceWorkerState,
    ) -> Result<(), WorkerError> {
        let mut current = from;
        let moved = self.state.send_if_modified(|state| {
            current = *state;
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });

        if !moved {
            return Err(WorkerError::State(format!(
                "worker {} is {}, expected {}",
                self.config.version,
                current.as_str(),
                from.as_str()
            )));
        }
        debug!(version = %self.config.version, state = to.as_str(), "Worker state changed");
        Ok(())
    }

    /// Retire this worker.
    pub fn mark_redundant(&self) {
        let previous = self.state.send_replace(ServiceWorkerState::Redundant);
        if previous != ServiceWorkerState::Redundant {
            debug!(version = %self.config.version, "Worker is redundant");
        }
    }

    // ==================== Lifecycle ====================

    /// Pre-cache the static asset set as one batch.
    ///
    /// A failed batch is logged and reported, and the worker still
    /// reaches `Installed`; missing assets are fetched on demand later.
    pub async fn install(&self) -> Result<InstallReport, WorkerError> {
        self.transition(ServiceWorkerState::Parsed, ServiceWorkerState::Installing)?;

        let urls = self.config.static_asset_urls()?;
        if let Err(e) = self.storage.open(&self.names.static_cache).await {
            warn!(cache = %self.names.static_cache, error = %e, "Failed to open static cache");
        }

        let retry = RetryConfig::precache(self.config.precache_attempts);
        let result =
            retry_with_backoff_if(&retry, || self.precache(&urls), WorkerError::is_retryable).await;

        let report = match result {
            Ok(stored) => InstallReport {
                cache: self.names.static_cache.clone(),
                requested: urls.len(),
                stored,
                error: None,
            },
            Err(e) => {
                warn!(version = %self.config.version, error = %e, "Pre-cache failed");
                InstallReport {
                    cache: self.names.static_cache.clone(),
                    requested: urls.len(),
                    stored: 0,
                    error: Some(e.to_string()),
                }
            }
        };

        self.transition(ServiceWorkerState::Installing, ServiceWorkerState::Installed)?;
        info!(
            version = %self.config.version,
            stored = report.stored,
            requested = report.requested,
            "Worker installed"
        );
        Ok(report)
    }

    async fn precache(&self, urls: &[Url]) -> Result<usize, WorkerError> {
        let batch = try_join_all(urls.iter().map(|url| async move {
            let request = Request::get(url.clone());
            let response = self.fetcher.fetch(&request).await?;
            if !response.ok() {
                return Err(WorkerError::UnexpectedStatus {
                    url: url.to_string(),
                    status: response.status,
                });
            }
            Ok((CacheKey::for_request(&request), response))
        }))
        .await?;

        let stored = batch.len();
        self.storage
            .put_all(&self.names.static_cache, batch)
            .await?;
        Ok(stored)
    }

    /// Take over: purge other versions, create the current namespaces,
    /// claim the clients in scope and tell every page to drop page-level
    /// state.
    pub async fn activate(&self) -> Result<ActivateReport, WorkerError> {
        self.transition(ServiceWorkerState::Installed, ServiceWorkerState::Activating)?;

        let stale = self
            .namespaces()
            .await
            .into_iter()
            .filter(|name| !self.names.is_current(name))
            .collect();
        let purge = self.delete_all(stale).await;

        for name in [&self.names.static_cache, &self.names.dynamic_cache] {
            if let Err(e) = self.storage.open(name).await {
                warn!(cache = %name, error = %e, "Failed to open cache");
            }
        }

        let (claimed, notified) = {
            let mut clients = self.clients.write().await;
            let claimed = clients.claim(self.id, &self.scope);
            let notified = clients.broadcast(&ClientMessage::cache_updated(&self.config.version));
            (claimed, notified)
        };

        self.transition(ServiceWorkerState::Activating, ServiceWorkerState::Activated)?;
        info!(
            version = %self.config.version,
            purged = purge.deleted.len(),
            failed = purge.failed.len(),
            claimed,
            notified,
            "Worker activated"
        );

        Ok(ActivateReport {
            purge,
            claimed,
            notified,
        })
    }

    /// Delete every namespace, current ones included.
    pub async fn clear_all_caches(&self) -> PurgeReport {
        let names = self.namespaces().await;
        let report = self.delete_all(names).await;
        info!(
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "Cleared all caches"
        );
        report
    }

    async fn namespaces(&self) -> Vec<String> {
        self.storage.keys().await.unwrap_or_else(|e| {
            warn!(error = %e, "Failed to list caches");
            Vec::new()
        })
    }

    async fn delete_all(&self, names: Vec<String>) -> PurgeReport {
        let results = join_all(names.into_iter().map(|name| async move {
            let result = self.storage.delete(&name).await;
            (name, result)
        }))
        .await;

        let mut report = PurgeReport::default();
        for (name, result) in results {
            match result {
                Ok(true) => report.deleted.push(name),
                Ok(false) => trace!(cache = %name, "Cache already gone"),
                Err(e) => {
                    warn!(cache = %name, error = %e, "Failed to delete cache");
                    report.failed.push((name, e));
                }
            }
        }
        report
    }

    /// Wait for background revalidations.
    pub async fn settle(&self) {
        self.engine.settle().await;
    }

    // ==================== Events ====================

    /// Intercept a fetch. `None` means the request is left alone.
    pub async fn handle_fetch(&self, request: &Request) -> Option<Response> {
        if self.state() != ServiceWorkerState::Activated {
            trace!(url = %request.url, state = self.state().as_str(), "Worker not active");
            return None;
        }
        match self.classifier.classify(request) {
            Route::PassThrough(reason) => {
                trace!(url = %request.url, ?reason, "Passing through");
                None
            }
            Route::Handle(strategy) => Some(self.engine.run(strategy, request).await),
        }
    }

    /// Always answer: intercepted requests go through a strategy, the rest
    /// straight to the network.
    pub async fn respond(&self, request: &Request) -> Response {
        match self.handle_fetch(request).await {
            Some(response) => response,
            None => pass_through(self.fetcher.as_ref(), request).await,
        }
    }

    /// Handle a control message.
    pub async fn handle_message(
        &self,
        message: ControlMessage,
        reply: Option<ReplyPort>,
    ) -> MessageOutcome {
        debug!(version = %self.config.version, ?message, "Control message");
        let answer = match message {
            ControlMessage::SkipWaiting => return MessageOutcome::SkipWaiting,
            ControlMessage::GetVersion => ControlReply::Version {
                version: self.config.version.clone(),
            },
            ControlMessage::ClearCache => {
                self.clear_all_caches().await;
                ControlReply::Cleared { success: true }
            }
        };

        match reply.map(|port| port.post(answer.clone())) {
            Some(true) => MessageOutcome::Replied(answer),
            _ => {
                debug!(?answer, "Reply had no listener");
                MessageOutcome::Undelivered(answer)
            }
        }
    }

    /// Parse and handle a posted JSON message. Unknown messages yield `None`.
    pub async fn handle_message_json(
        &self,
        data: &JsonValue,
        reply: Option<ReplyPort>,
    ) -> Option<MessageOutcome> {
        let message = ControlMessage::parse(data)?;
        Some(self.handle_message(message, reply).await)
    }

    /// Build the notification for a push.
    pub fn handle_push(&self, payload: Option<&[u8]>) -> Notification {
        let notification = Notification::from_push(payload, &self.config.notification);
        debug!(title = %notification.title, "Push received");
        notification
    }

    /// React to a notification click.
    pub async fn handle_notification_click(
        &self,
        action: Option<&str>,
        notification: &Notification,
    ) -> Result<NotificationClickOutcome, WorkerError> {
        if action == Some(ACTION_CLOSE) {
            return Ok(NotificationClickOutcome::Dismissed);
        }

        let target = self.config.resolve(&notification.data.url)?;
        let mut clients = self.clients.write().await;
        if let Some(id) = clients.find_window(&target).map(|c| c.id.clone()) {
            clients.focus(&id)?;
            debug!(url = %target, client = id.as_str(), "Focused existing window");
            return Ok(NotificationClickOutcome::Focused(id));
        }

        let connection = clients.open_window(target);
        clients.control(&connection.id, self.id);
        debug!(client = connection.id.as_str(), "Opened window");
        Ok(NotificationClickOutcome::Opened(connection))
    }
}

/// Send a request straight to the network, answering 503 on failure.
pub(crate) async fn pass_through(fetcher: &dyn Fetcher, request: &Request) -> Response {
    match fetcher.fetch(request).await {
        Ok(response) => response,
        Err(e) => {
            warn!(url = %request.url, error = %e, "Network request failed");
            Response::synthesized(StatusCode::SERVICE_UNAVAILABLE, NETWORK_FIRST_FALLBACK)
        }
    }
}
