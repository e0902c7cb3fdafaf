//! Scripted in-process fetcher.
//!
//! Routes are keyed by absolute URL. Unrouted URLs answer `404` while
//! online; everything fails with [`NetError::Offline`] while offline. Every
//! call is recorded, including failed ones.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderValue, Method, StatusCode};
use tracing::trace;

use crate::{Fetcher, NetError, Request, Response, Url};

#[derive(Debug, Clone)]
struct MockRoute {
    status: StatusCode,
    content_type: Option<&'static str>,
    body: Bytes,
}

/// A fake network with an online switch and a call log.
#[derive(Debug)]
pub struct MockFetcher {
    routes: Mutex<HashMap<String, MockRoute>>,
    failing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<(Method, Url)>>,
    latency: Mutex<Option<Duration>>,
    online: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockFetcher {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            latency: Mutex::new(None),
            online: AtomicBool::new(true),
        }
    }

    /// Serve `body` with `status` for `url`, replacing any previous route.
    pub fn route(&self, url: &str, status: u16, body: impl Into<Bytes>) -> &Self {
        self.insert(url, status, None, body.into())
    }

    /// Like [`route`](Self::route) with an explicit `Content-Type`.
    pub fn route_typed(
        &self,
        url: &str,
        status: u16,
        content_type: &'static str,
        body: impl Into<Bytes>,
    ) -> &Self {
        self.insert(url, status, Some(content_type), body.into())
    }

    fn insert(
        &self,
        url: &str,
        status: u16,
        content_type: Option<&'static str>,
        body: Bytes,
    ) -> &Self {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        lock(&self.routes).insert(
            url.to_string(),
            MockRoute {
                status,
                content_type,
                body,
            },
        );
        self
    }

    /// Make `url` fail at the transport level even while online.
    pub fn fail(&self, url: &str) -> &Self {
        lock(&self.failing).insert(url.to_string());
        self
    }

    /// Undo [`fail`](Self::fail).
    pub fn heal(&self, url: &str) -> &Self {
        lock(&self.failing).remove(url);
        self
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Delay every answer.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *lock(&self.latency) = latency;
    }

    /// Total fetch attempts.
    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Fetch attempts for one URL.
    pub fn calls_to(&self, url: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|(_, u)| u.as_str() == url)
            .count()
    }

    pub fn calls(&self) -> Vec<(Method, Url)> {
        lock(&self.calls).clone()
    }

    pub fn reset_calls(&self) {
        lock(&self.calls).clear();
    }
}

impl Default for MockFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        lock(&self.calls).push((request.method.clone(), request.url.clone()));

        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let url = request.url.as_str();
        if !self.is_online() || lock(&self.failing).contains(url) {
            trace!(url, "Mock network unreachable");
            return Err(NetError::Offline(url.to_string()));
        }

        let route = lock(&self.routes).get(url).cloned();
        let response = match route {
            Some(route) => {
                let mut response = Response::new(route.status, route.body);
                if let Some(content_type) = route.content_type {
                    response
                        .headers
                        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
                }
                response
            }
            None => Response::new(StatusCode::NOT_FOUND, Bytes::new()),
        };

        Ok(response.with_url(request.url.clone()))
    }
}
