//! A registration: the worker versions living under one scope.
//!
//! ```text
//! Registration (scope)
//!     ├── installing   being pre-cached
//!     ├── waiting      installed, not yet in control
//!     └── active       intercepting fetches
//! ```
//!
//! A new version waits behind an active one until `SKIP_WAITING` arrives.
//! With nothing active it takes over as soon as it is installed.

use std::sync::Arc;

use academy_net::{Fetcher, Request, Response};
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

use crate::cache::CacheStorage;
use crate::clients::{in_scope, ClientConnection, ClientType, Clients};
use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::message::ReplyPort;
use crate::worker::{
    pass_through, ActivateReport, CacheWorker, InstallReport, MessageOutcome, ServiceWorkerId,
};

/// Which worker a message is posted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSlot {
    Installing,
    Waiting,
    Active,
}

/// Result of [`Registration::register`].
#[derive(Debug)]
pub struct RegisterOutcome {
    pub worker: ServiceWorkerId,
    pub install: InstallReport,
    /// Set when the new version took over right away.
    pub activation: Option<ActivateReport>,
}

#[derive(Debug, Default)]
struct Slots {
    installing: Option<Arc<CacheWorker>>,
    waiting: Option<Arc<CacheWorker>>,
    active: Option<Arc<CacheWorker>>,
}

fn release_installing(slots: &mut Slots, worker: &Arc<CacheWorker>) {
    if slots
        .installing
        .as_ref()
        .is_some_and(|w| Arc::ptr_eq(w, worker))
    {
        slots.installing = None;
    }
}

/// Worker versions sharing one storage, network and client set.
pub struct Registration {
    scope: Url,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    clients: Arc<RwLock<Clients>>,
    slots: RwLock<Slots>,
}

impl Registration {
    /// Create an empty registration.
    pub fn new(scope: Url, storage: Arc<dyn CacheStorage>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            scope,
            storage,
            fetcher,
            clients: Arc::new(RwLock::new(Clients::new())),
            slots: RwLock::new(Slots::default()),
        }
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn clients(&self) -> Arc<RwLock<Clients>> {
        self.clients.clone()
    }

    pub fn storage(&self) -> Arc<dyn CacheStorage> {
        self.storage.clone()
    }

    /// Whether a page at `url` falls under this registration.
    pub fn in_scope(&self, url: &Url) -> bool {
        in_scope(&self.scope, url)
    }

    pub async fn installing(&self) -> Option<Arc<CacheWorker>> {
        self.slots.read().await.installing.clone()
    }

    pub async fn waiting(&self) -> Option<Arc<CacheWorker>> {
        self.slots.read().await.waiting.clone()
    }

    pub async fn active(&self) -> Option<Arc<CacheWorker>> {
        self.slots.read().await.active.clone()
    }

    /// Worker currently controlling pages.
    pub async fn controller(&self) -> Option<ServiceWorkerId> {
        self.active().await.map(|worker| worker.id())
    }

    async fn slot(&self, slot: WorkerSlot) -> Option<Arc<CacheWorker>> {
        let slots = self.slots.read().await;
        match slot {
            WorkerSlot::Installing => slots.installing.clone(),
            WorkerSlot::Waiting => slots.waiting.clone(),
            WorkerSlot::Active => slots.active.clone(),
        }
    }

    // ==================== Lifecycle ====================

    /// Install a new version. It activates right away when nothing is
    /// active; otherwise it waits.
    pub async fn register(&self, config: WorkerConfig) -> Result<RegisterOutcome, WorkerError> {
        let worker = Arc::new(
            CacheWorker::new(
                config,
                self.storage.clone(),
                self.fetcher.clone(),
                self.clients.clone(),
            )?
            .with_scope(self.scope.clone()),
        );
        info!(scope = %self.scope, version = worker.version(), "Registering worker");

        if let Some(previous) = self.slots.write().await.installing.replace(worker.clone()) {
            previous.mark_redundant();
        }

        let install = match worker.install().await {
            Ok(report) => report,
            Err(e) => {
                release_installing(&mut *self.slots.write().await, &worker);
                worker.mark_redundant();
                return Err(e);
            }
        };

        let has_active = {
            let mut slots = self.slots.write().await;
            release_installing(&mut slots, &worker);
            if let Some(previous) = slots.waiting.replace(worker.clone()) {
                debug!(version = previous.version(), "Replacing waiting worker");
                previous.mark_redundant();
            }
            slots.active.is_some()
        };

        let activation = if has_active {
            info!(version = worker.version(), "Worker waiting");
            None
        } else {
            self.activate_waiting().await?
        };

        Ok(RegisterOutcome {
            worker: worker.id(),
            install,
            activation,
        })
    }

    /// Promote the waiting worker, retiring the active one.
    /// `None` when nothing is waiting.
    pub async fn skip_waiting(&self) -> Result<Option<ActivateReport>, WorkerError> {
        self.activate_waiting().await
    }

    async fn activate_waiting(&self) -> Result<Option<ActivateReport>, WorkerError> {
        let (worker, previous) = {
            let mut slots = self.slots.write().await;
            let Some(worker) = slots.waiting.take() else {
                return Ok(None);
            };
            let previous = slots.active.replace(worker.clone());
            (worker, previous)
        };

        if let Some(previous) = previous {
            previous.settle().await;
            previous.mark_redundant();
        }

        let report = worker.activate().await?;
        Ok(Some(report))
    }

    /// Retire every worker. Cached data stays. Returns `false` if nothing
    /// was registered.
    pub async fn unregister(&self) -> bool {
        let workers: Vec<Arc<CacheWorker>> = {
            let mut slots = self.slots.write().await;
            [
                slots.installing.take(),
                slots.waiting.take(),
                slots.active.take(),
            ]
            .into_iter()
            .flatten()
            .collect()
        };

        for worker in &workers {
            worker.settle().await;
            worker.mark_redundant();
        }
        info!(scope = %self.scope, workers = workers.len(), "Unregistered");
        !workers.is_empty()
    }

    // ==================== Events ====================

    /// Answer a page request. Only the active worker intercepts.
    pub async fn fetch(&self, request: &Request) -> Response {
        match self.active().await {
            Some(worker) => worker.respond(request).await,
            None => pass_through(self.fetcher.as_ref(), request).await,
        }
    }

    /// Post a JSON message to one of the workers.
    ///
    /// `SKIP_WAITING` posted to the waiting worker promotes it. Unknown
    /// messages yield `Ok(None)`.
    pub async fn post_message(
        &self,
        target: WorkerSlot,
        data: &JsonValue,
        reply: Option<ReplyPort>,
    ) -> Result<Option<MessageOutcome>, WorkerError> {
        let worker = self
            .slot(target)
            .await
            .ok_or_else(|| WorkerError::State(format!("no {target:?} worker")))?;

        let outcome = worker.handle_message_json(data, reply).await;
        if outcome == Some(MessageOutcome::SkipWaiting) && target == WorkerSlot::Waiting {
            self.skip_waiting().await?;
        }
        Ok(outcome)
    }

    /// Connect a page. Pages inside the scope are controlled by the active
    /// worker, if any.
    pub async fn connect_client(&self, url: Url) -> ClientConnection {
        let controller = if self.in_scope(&url) {
            self.controller().await
        } else {
            None
        };

        let mut clients = self.clients.write().await;
        let connection = clients.connect(url, ClientType::Window);
        if let Some(worker) = controller {
            clients.control(&connection.id, worker);
        }
        connection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStorage;
    use crate::message::{ClientMessage, ControlReply};
    use crate::worker::ServiceWorkerState;
    use academy_net::MockFetcher;
    use serde_json::json;

    const ORIGIN: &str = "https://academy.example/";

    fn setup() -> (Registration, Arc<MockFetcher>) {
        let fetcher = Arc::new(MockFetcher::new());
        let origin = Url::parse(ORIGIN).unwrap();
        for version in ["v1.0.0", "v1.0.1"] {
            let config = WorkerConfig::for_origin(origin.clone()).with_version(version);
            for url in config.static_asset_urls().unwrap() {
                fetcher.route(url.as_str(), 200, "asset");
            }
        }
        let registration = Registration::new(
            origin,
            Arc::new(MemoryCacheStorage::new()),
            fetcher.clone(),
        );
        (registration, fetcher)
    }

    fn config(version: &str) -> WorkerConfig {
        WorkerConfig::for_origin(Url::parse(ORIGIN).unwrap()).with_version(version)
    }

    #[tokio::test]
    async fn test_first_worker_activates_immediately() {
        let (registration, _) = setup();
        let outcome = registration.register(config("v1.0.0")).await.unwrap();

        assert!(outcome.install.is_complete());
        assert!(outcome.activation.is_some());
        assert_eq!(registration.controller().await, Some(outcome.worker));
        assert!(registration.waiting().await.is_none());
        assert!(registration.installing().await.is_none());
    }

    #[tokio::test]
    async fn test_update_waits_for_skip_waiting() {
        let (registration, _) = setup();
        let first = registration.register(config("v1.0.0")).await.unwrap();
        let old = registration.active().await.unwrap();

        let second = registration.register(config("v1.0.1")).await.unwrap();
        assert!(second.activation.is_none());
        assert_eq!(registration.controller().await, Some(first.worker));
        let waiting = registration.waiting().await.unwrap();
        assert_eq!(waiting.state(), ServiceWorkerState::Installed);

        let outcome = registration
            .post_message(WorkerSlot::Waiting, &json!({"type": "SKIP_WAITING"}), None)
            .await
            .unwrap();
        assert_eq!(outcome, Some(MessageOutcome::SkipWaiting));
        assert_eq!(registration.controller().await, Some(second.worker));
        assert_eq!(old.state(), ServiceWorkerState::Redundant);
        assert!(registration.waiting().await.is_none());
    }

    #[tokio::test]
    async fn test_skip_waiting_to_active_is_a_no_op() {
        let (registration, _) = setup();
        let first = registration.register(config("v1.0.0")).await.unwrap();

        registration
            .post_message(WorkerSlot::Active, &json!({"type": "SKIP_WAITING"}), None)
            .await
            .unwrap();
        assert_eq!(registration.controller().await, Some(first.worker));
        assert!(registration.skip_waiting().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_post_message_to_empty_slot_fails() {
        let (registration, _) = setup();
        let result = registration
            .post_message(WorkerSlot::Waiting, &json!({"type": "GET_VERSION"}), None)
            .await;
        assert!(matches!(result, Err(WorkerError::State(_))));
    }

    #[tokio::test]
    async fn test_get_version_from_active() {
        let (registration, _) = setup();
        registration.register(config("v1.0.1")).await.unwrap();

        let (port, rx) = ReplyPort::channel();
        registration
            .post_message(WorkerSlot::Active, &json!({"type": "GET_VERSION"}), Some(port))
            .await
            .unwrap();
        assert_eq!(
            rx.await.unwrap(),
            ControlReply::Version {
                version: "v1.0.1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_activation_claims_and_notifies_pages() {
        let (registration, _) = setup();
        let mut page = registration
            .connect_client(Url::parse("https://academy.example/courses").unwrap())
            .await;
        assert!(registration.clients().read().await.get(&page.id).unwrap().controller.is_none());

        let outcome = registration.register(config("v1.0.1")).await.unwrap();
        let activation = outcome.activation.unwrap();
        assert_eq!(activation.claimed, 1);
        assert_eq!(activation.notified, 1);
        assert_eq!(
            page.messages.recv().await.unwrap(),
            ClientMessage::cache_updated("v1.0.1")
        );

        let late = registration
            .connect_client(Url::parse("https://academy.example/admin").unwrap())
            .await;
        let clients = registration.clients();
        let clients = clients.read().await;
        assert_eq!(clients.get(&late.id).unwrap().controller, Some(outcome.worker));
    }

    #[tokio::test]
    async fn test_out_of_scope_page_is_not_controlled() {
        let (registration, _) = setup();
        registration.register(config("v1.0.1")).await.unwrap();

        let page = registration
            .connect_client(Url::parse("https://elsewhere.example/").unwrap())
            .await;
        let clients = registration.clients();
        assert!(clients.read().await.get(&page.id).unwrap().controller.is_none());
    }

    #[tokio::test]
    async fn test_activation_claims_only_pages_in_scope() {
        let (registration, _) = setup();
        let inside = registration
            .connect_client(Url::parse("https://academy.example/courses").unwrap())
            .await;
        let outside = registration
            .connect_client(Url::parse("https://elsewhere.example/").unwrap())
            .await;

        let outcome = registration.register(config("v1.0.1")).await.unwrap();
        assert_eq!(outcome.activation.unwrap().claimed, 1);

        let clients = registration.clients();
        let clients = clients.read().await;
        assert_eq!(clients.get(&inside.id).unwrap().controller, Some(outcome.worker));
        assert!(clients.get(&outside.id).unwrap().controller.is_none());
    }

    #[tokio::test]
    async fn test_fetch_without_active_worker_passes_through() {
        let (registration, fetcher) = setup();
        fetcher.route("https://academy.example/app.js", 200, "live");

        let request = Request::parse("https://academy.example/app.js").unwrap();
        let response = registration.fetch(&request).await;
        assert_eq!(response.text().unwrap(), "live");
        assert!(!response.from_cache());
    }

    #[tokio::test]
    async fn test_unregister() {
        let (registration, _) = setup();
        assert!(!registration.unregister().await);

        registration.register(config("v1.0.1")).await.unwrap();
        let active = registration.active().await.unwrap();
        assert!(registration.unregister().await);
        assert_eq!(active.state(), ServiceWorkerState::Redundant);
        assert!(registration.controller().await.is_none());
    }
}
