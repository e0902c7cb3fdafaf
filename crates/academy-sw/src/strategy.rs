//! The three caching algorithms.
//!
//! Every path ends in a response: a real one from the network or cache, or
//! a synthesized plain-text fallback with an explicit status. Network and
//! storage failures are logged and absorbed here.

use std::sync::Arc;
use std::time::Duration;

use academy_common::with_timeout;
use academy_net::{Fetcher, NetError, Request, Response};
use http::{Method, StatusCode};
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};
use url::Url;

use crate::cache::{CacheKey, CacheStorage};
use crate::classify::Strategy;
use crate::config::CacheNames;

/// Body of the 503 sent when a cache-first asset is unavailable.
pub const CACHE_FIRST_FALLBACK: &str = "Offline: resource not cached";
/// Body of the 503 sent when a network-first request cannot be answered.
pub const NETWORK_FIRST_FALLBACK: &str = "Offline: network unavailable";
/// Body of the 404 sent when stale-while-revalidate has nothing to serve.
pub const SWR_FALLBACK: &str = "Not found";

/// Runs strategies against one version's namespaces.
#[derive(Clone)]
pub struct StrategyEngine {
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    names: CacheNames,
    offline_page: Url,
    network_timeout: Option<Duration>,
    background: TaskTracker,
}

impl StrategyEngine {
    pub fn new(
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
        names: CacheNames,
        offline_page: Url,
        network_timeout: Option<Duration>,
    ) -> Self {
        Self {
            storage,
            fetcher,
            names,
            offline_page,
            network_timeout,
            background: TaskTracker::new(),
        }
    }

    pub fn names(&self) -> &CacheNames {
        &self.names
    }

    /// Answer `request` with `strategy`.
    pub async fn run(&self, strategy: Strategy, request: &Request) -> Response {
        debug!(url = %request.url, strategy = strategy.as_str(), "Handling request");
        match strategy {
            Strategy::CacheFirst => self.cache_first(request).await,
            Strategy::NetworkFirst => self.network_first(request).await,
            Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
        }
    }

    /// Serve from the static namespace; fetch and store only on a miss.
    ///
    /// A hit never touches the network and is never revalidated; it stays
    /// until the namespace is rotated.
    pub async fn cache_first(&self, request: &Request) -> Response {
        let key = CacheKey::for_request(request);
        if let Some(hit) = self.lookup_in(&self.names.static_cache, &key).await {
            trace!(url = %request.url, "Cache-first hit");
            return hit;
        }

        match self.network(request).await {
            Ok(response) => {
                if response.ok() {
                    self.store(&self.names.static_cache, key, response.clone())
                        .await;
                }
                response
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "Cache-first network failure");
                // another request may have filled the cache meanwhile
                match self.lookup_any(&key).await {
                    Some(hit) => hit,
                    None => Response::synthesized(
                        StatusCode::SERVICE_UNAVAILABLE,
                        CACHE_FIRST_FALLBACK,
                    ),
                }
            }
        }
    }

    /// Prefer the network, falling back to any cached copy, then to the
    /// offline page for documents.
    pub async fn network_first(&self, request: &Request) -> Response {
        let key = CacheKey::for_request(request);

        let error = match self.network(request).await {
            Ok(response) => {
                if response.ok() {
                    self.store(&self.names.dynamic_cache, key, response.clone())
                        .await;
                }
                return response;
            }
            Err(e) => e,
        };

        warn!(url = %request.url, error = %error, "Network-first falling back to cache");

        if request.method == Method::GET {
            if let Some(hit) = self.lookup_any(&key).await {
                return hit;
            }
        }

        if request.is_navigation() {
            let offline = CacheKey::get(&self.offline_page);
            if let Some(page) = self.lookup_in(&self.names.static_cache, &offline).await {
                debug!(url = %request.url, "Serving offline page");
                return page;
            }
        }

        Response::synthesized(StatusCode::SERVICE_UNAVAILABLE, NETWORK_FIRST_FALLBACK)
    }

    /// Serve the cached copy immediately and refresh it in the background;
    /// wait for the network only when nothing is cached.
    pub async fn stale_while_revalidate(&self, request: &Request) -> Response {
        let key = CacheKey::for_request(request);
        let cached = self.lookup_in(&self.names.dynamic_cache, &key).await;

        let engine = self.clone();
        let owned = request.clone();
        let revalidation = self.background.spawn(async move {
            match engine.network(&owned).await {
                Ok(response) => {
                    if response.ok() {
                        engine
                            .store(
                                &engine.names.dynamic_cache,
                                CacheKey::for_request(&owned),
                                response.clone(),
                            )
                            .await;
                    }
                    Some(response)
                }
                Err(e) => {
                    warn!(url = %owned.url, error = %e, "Background revalidation failed");
                    None
                }
            }
        });

        if let Some(stale) = cached {
            trace!(url = %request.url, "Serving stale copy while revalidating");
            return stale;
        }

        match revalidation.await {
            Ok(Some(response)) => response,
            Ok(None) => Response::synthesized(StatusCode::NOT_FOUND, SWR_FALLBACK),
            Err(e) => {
                warn!(url = %request.url, error = %e, "Revalidation task aborted");
                Response::synthesized(StatusCode::NOT_FOUND, SWR_FALLBACK)
            }
        }
    }

    /// Wait for every in-flight background revalidation.
    pub async fn settle(&self) {
        self.background.close();
        self.background.wait().await;
        self.background.reopen();
    }

    /// Background revalidations still running.
    pub fn pending_revalidations(&self) -> usize {
        self.background.len()
    }

    async fn network(&self, request: &Request) -> Result<Response, NetError> {
        match self.network_timeout {
            Some(timeout) => with_timeout(timeout, || self.fetcher.fetch(request))
                .await
                .unwrap_or(Err(NetError::Timeout(timeout))),
            None => self.fetcher.fetch(request).await,
        }
    }

    async fn store(&self, cache: &str, key: CacheKey, response: Response) {
        let url = key.url.clone();
        if let Err(e) = self.storage.put(cache, key, response).await {
            warn!(cache, url, error = %e, "Cache write failed");
        }
    }

    async fn lookup_in(&self, cache: &str, key: &CacheKey) -> Option<Response> {
        self.storage
            .match_in(cache, key)
            .await
            .unwrap_or_else(|e| {
                warn!(cache, url = %key.url, error = %e, "Cache read failed");
                None
            })
    }

    async fn lookup_any(&self, key: &CacheKey) -> Option<Response> {
        self.storage.match_any(key).await.unwrap_or_else(|e| {
            warn!(url = %key.url, error = %e, "Cache read failed");
            None
        })
    }
}
