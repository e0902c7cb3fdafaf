//! Event delivery to a registration.
//!
//! The host sends [`WorkerEvent`]s through a [`DispatcherHandle`]; one
//! dispatcher task receives them and never waits on a handler.
//!
//! ```text
//! DispatcherHandle ──▶ dispatcher ──┬── lifecycle queue   register, unregister (one at a time)
//!                                   └── task per event    fetch, message, push, notificationclick
//! ```
//!
//! Lifecycle events run in arrival order on their own queue, so the active
//! worker keeps answering fetches while a new version pre-caches.

use std::sync::Arc;

use academy_net::{Request, Response};
use bytes::Bytes;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::message::{ControlReply, ReplyPort};
use crate::notification::{Notification, NotificationClickOutcome};
use crate::registration::{RegisterOutcome, Registration, WorkerSlot};
use crate::worker::MessageOutcome;

/// An event for the registration.
#[derive(Debug)]
pub enum WorkerEvent {
    Register {
        config: Box<WorkerConfig>,
        done_tx: oneshot::Sender<Result<RegisterOutcome, WorkerError>>,
    },
    Unregister {
        done_tx: oneshot::Sender<bool>,
    },
    Fetch {
        request: Request,
        response_tx: oneshot::Sender<Response>,
    },
    Message {
        target: WorkerSlot,
        data: JsonValue,
        port: Option<ReplyPort>,
        done_tx: oneshot::Sender<Result<Option<MessageOutcome>, WorkerError>>,
    },
    Push {
        payload: Option<Bytes>,
        notification_tx: oneshot::Sender<Result<Notification, WorkerError>>,
    },
    NotificationClick {
        action: Option<String>,
        notification: Notification,
        done_tx: oneshot::Sender<Result<NotificationClickOutcome, WorkerError>>,
    },
}

impl WorkerEvent {
    fn kind(&self) -> &'static str {
        match self {
            WorkerEvent::Register { .. } => "register",
            WorkerEvent::Unregister { .. } => "unregister",
            WorkerEvent::Fetch { .. } => "fetch",
            WorkerEvent::Message { .. } => "message",
            WorkerEvent::Push { .. } => "push",
            WorkerEvent::NotificationClick { .. } => "notificationclick",
        }
    }
}

/// Runs events against one registration.
pub struct EventDispatcher {
    registration: Arc<Registration>,
    events_rx: mpsc::Receiver<WorkerEvent>,
    lifecycle_tx: mpsc::UnboundedSender<WorkerEvent>,
    tasks: TaskTracker,
}

impl EventDispatcher {
    /// Start the dispatcher task. It stops once every handle is dropped
    /// and in-flight events have finished.
    pub fn spawn(
        registration: Arc<Registration>,
        queue_size: usize,
    ) -> (DispatcherHandle, JoinHandle<()>) {
        let (events_tx, events_rx) = mpsc::channel(queue_size.max(1));
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let tasks = TaskTracker::new();
        tasks.spawn(run_lifecycle(registration.clone(), lifecycle_rx));

        let dispatcher = Self {
            registration,
            events_rx,
            lifecycle_tx,
            tasks,
        };
        let task = tokio::spawn(dispatcher.run());
        (DispatcherHandle { events_tx }, task)
    }

    async fn run(mut self) {
        while let Some(event) = self.events_rx.recv().await {
            debug!(event = event.kind(), "Dispatching event");
            self.dispatch(event);
        }

        let Self {
            registration,
            lifecycle_tx,
            tasks,
            ..
        } = self;
        drop(lifecycle_tx);
        tasks.close();
        tasks.wait().await;
        info!(scope = %registration.scope(), "Event dispatcher stopped");
    }

    fn dispatch(&self, event: WorkerEvent) {
        let registration = self.registration.clone();
        match event {
            event @ (WorkerEvent::Register { .. } | WorkerEvent::Unregister { .. }) => {
                if let Err(e) = self.lifecycle_tx.send(event) {
                    warn!(event = e.0.kind(), "Lifecycle queue closed, event dropped");
                }
            }
            WorkerEvent::Fetch {
                request,
                response_tx,
            } => {
                self.tasks.spawn(async move {
                    let _ = response_tx.send(registration.fetch(&request).await);
                });
            }
            WorkerEvent::Message {
                target,
                data,
                port,
                done_tx,
            } => {
                self.tasks.spawn(async move {
                    let outcome = registration.post_message(target, &data, port).await;
                    let _ = done_tx.send(outcome);
                });
            }
            WorkerEvent::Push {
                payload,
                notification_tx,
            } => {
                self.tasks.spawn(async move {
                    let notification = match registration.active().await {
                        Some(worker) => Ok(worker.handle_push(payload.as_deref())),
                        None => Err(no_active_worker()),
                    };
                    let _ = notification_tx.send(notification);
                });
            }
            WorkerEvent::NotificationClick {
                action,
                notification,
                done_tx,
            } => {
                self.tasks.spawn(async move {
                    let outcome = match registration.active().await {
                        Some(worker) => {
                            worker
                                .handle_notification_click(action.as_deref(), &notification)
                                .await
                        }
                        None => Err(no_active_worker()),
                    };
                    let _ = done_tx.send(outcome);
                });
            }
        }
    }
}

async fn run_lifecycle(
    registration: Arc<Registration>,
    mut lifecycle_rx: mpsc::UnboundedReceiver<WorkerEvent>,
) {
    while let Some(event) = lifecycle_rx.recv().await {
        match event {
            WorkerEvent::Register { config, done_tx } => {
                let _ = done_tx.send(registration.register(*config).await);
            }
            WorkerEvent::Unregister { done_tx } => {
                let _ = done_tx.send(registration.unregister().await);
            }
            other => warn!(event = other.kind(), "Not a lifecycle event"),
        }
    }
}

fn no_active_worker() -> WorkerError {
    WorkerError::State("no active worker".to_string())
}

fn dispatcher_gone() -> WorkerError {
    WorkerError::State("event dispatcher stopped".to_string())
}

/// Host-side entry point for sending events.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    events_tx: mpsc::Sender<WorkerEvent>,
}

impl DispatcherHandle {
    async fn send<T>(
        &self,
        event: WorkerEvent,
        done_rx: oneshot::Receiver<T>,
    ) -> Result<T, WorkerError> {
        self.events_tx.send(event).await.map_err(|e| {
            warn!(event = e.0.kind(), "Event dropped, dispatcher stopped");
            dispatcher_gone()
        })?;
        done_rx.await.map_err(|_| dispatcher_gone())
    }

    /// Install (and possibly activate) a new version.
    pub async fn register(&self, config: WorkerConfig) -> Result<RegisterOutcome, WorkerError> {
        let (done_tx, done_rx) = oneshot::channel();
        let event = WorkerEvent::Register {
            config: Box::new(config),
            done_tx,
        };
        self.send(event, done_rx).await?
    }

    pub async fn unregister(&self) -> Result<bool, WorkerError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(WorkerEvent::Unregister { done_tx }, done_rx).await
    }

    /// Answer a page request.
    pub async fn fetch(&self, request: Request) -> Result<Response, WorkerError> {
        let (response_tx, response_rx) = oneshot::channel();
        let event = WorkerEvent::Fetch {
            request,
            response_tx,
        };
        self.send(event, response_rx).await
    }

    /// Post a message with a reply port. The returned receiver resolves
    /// with the worker's reply; it errors when the message has none.
    pub async fn post_message(
        &self,
        target: WorkerSlot,
        data: JsonValue,
    ) -> Result<oneshot::Receiver<ControlReply>, WorkerError> {
        let (port, reply_rx) = ReplyPort::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let event = WorkerEvent::Message {
            target,
            data,
            port: Some(port),
            done_tx,
        };
        self.send(event, done_rx).await??;
        Ok(reply_rx)
    }

    /// Deliver a push and get the notification to show.
    pub async fn push(&self, payload: Option<Bytes>) -> Result<Notification, WorkerError> {
        let (notification_tx, notification_rx) = oneshot::channel();
        let event = WorkerEvent::Push {
            payload,
            notification_tx,
        };
        self.send(event, notification_rx).await?
    }

    /// Deliver a notification click.
    pub async fn notification_click(
        &self,
        action: Option<String>,
        notification: Notification,
    ) -> Result<NotificationClickOutcome, WorkerError> {
        let (done_tx, done_rx) = oneshot::channel();
        let event = WorkerEvent::NotificationClick {
            action,
            notification,
            done_tx,
        };
        self.send(event, done_rx).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStorage;
    use academy_net::MockFetcher;
    use http::StatusCode;
    use serde_json::json;
    use std::time::Duration;
    use url::Url;

    const ORIGIN: &str = "https://academy.example/";

    fn config() -> WorkerConfig {
        WorkerConfig::for_origin(Url::parse(ORIGIN).unwrap()).with_version("v1.0.1")
    }

    fn start() -> (DispatcherHandle, JoinHandle<()>, Arc<MockFetcher>) {
        let fetcher = Arc::new(MockFetcher::new());
        for url in config().static_asset_urls().unwrap() {
            fetcher.route(url.as_str(), 200, "asset");
        }
        let registration = Arc::new(Registration::new(
            Url::parse(ORIGIN).unwrap(),
            Arc::new(MemoryCacheStorage::new()),
            fetcher.clone(),
        ));
        let (handle, task) = EventDispatcher::spawn(registration, 16);
        (handle, task, fetcher)
    }

    #[tokio::test]
    async fn test_register_then_fetch_offline() {
        let (handle, _task, fetcher) = start();
        let outcome = handle.register(config()).await.unwrap();
        assert!(outcome.install.is_complete());

        fetcher.set_online(false);
        let request = Request::parse("https://academy.example/index.html").unwrap();
        let response = handle.fetch(request).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert!(response.from_cache());
    }

    #[tokio::test]
    async fn test_fetches_flow_while_a_version_installs() {
        let (handle, _task, fetcher) = start();
        handle.register(config()).await.unwrap();

        let mut next = config().with_version("v1.0.2");
        next.precache_attempts = 4;
        let manifest = next.resolve("/manifest.json").unwrap();
        fetcher.fail(manifest.as_str());
        fetcher.reset_calls();

        let install = tokio::spawn({
            let handle = handle.clone();
            async move { handle.register(next).await }
        });
        while fetcher.calls_to(manifest.as_str()) == 0 {
            tokio::task::yield_now().await;
        }

        let request = Request::parse("https://academy.example/font-loader.js").unwrap();
        let response = tokio::time::timeout(Duration::from_millis(200), handle.fetch(request))
            .await
            .expect("fetch answered during install")
            .unwrap();
        assert!(response.from_cache());
        assert!(!install.is_finished());

        let outcome = install.await.unwrap().unwrap();
        assert!(!outcome.install.is_complete());
        assert!(outcome.activation.is_none());
    }

    #[tokio::test]
    async fn test_lifecycle_events_keep_their_order() {
        let (handle, _task, _) = start();
        let first = handle.register(config().with_version("v1.0.0"));
        let second = handle.unregister();
        let (first, second) = tokio::join!(first, second);

        assert!(first.unwrap().activation.is_some());
        assert!(second.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_fetches() {
        let (handle, _task, fetcher) = start();
        handle.register(config()).await.unwrap();
        for i in 0..8 {
            fetcher.route(&format!("https://academy.example/api/courses/{i}"), 200, "{}");
        }

        let responses = futures::future::join_all((0..8).map(|i| {
            let handle = handle.clone();
            async move {
                let url = format!("https://academy.example/api/courses/{i}");
                handle.fetch(Request::parse(&url).unwrap()).await
            }
        }))
        .await;
        assert!(responses.iter().all(|r| r.as_ref().unwrap().ok()));
    }

    #[tokio::test]
    async fn test_post_message_reply() {
        let (handle, _task, _) = start();
        handle.register(config()).await.unwrap();

        let reply = handle
            .post_message(WorkerSlot::Active, json!({"type": "CLEAR_CACHE"}))
            .await
            .unwrap();
        assert_eq!(reply.await.unwrap(), ControlReply::Cleared { success: true });

        let no_reply = handle
            .post_message(WorkerSlot::Active, json!({"type": "SKIP_WAITING"}))
            .await
            .unwrap();
        assert!(no_reply.await.is_err());
    }

    #[tokio::test]
    async fn test_push_requires_active_worker() {
        let (handle, _task, _) = start();
        assert!(handle.push(None).await.is_err());

        handle.register(config()).await.unwrap();
        let notification = handle
            .push(Some(Bytes::from_static(b"Hello")))
            .await
            .unwrap();
        assert_eq!(notification.body, "Hello");

        let outcome = handle
            .notification_click(None, notification)
            .await
            .unwrap();
        assert!(matches!(outcome, NotificationClickOutcome::Opened(_)));
    }

    #[tokio::test]
    async fn test_dispatcher_stops_when_handles_drop() {
        let (handle, task, _) = start();
        assert!(!handle.unregister().await.unwrap());
        drop(handle);
        task.await.unwrap();
    }
}
