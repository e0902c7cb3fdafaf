//! End-to-end behaviour of the cache worker against a scripted network.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use academy_net::{MockFetcher, Request, RequestDestination, Response};
use academy_sw::{
    CacheKey, CacheStorage, ControlReply, MemoryCacheStorage, Registration, StorageError,
    WorkerConfig, WorkerSlot,
};
use async_trait::async_trait;
use bytes::Bytes;
use http::{header, StatusCode};
use serde_json::json;
use url::Url;

const ORIGIN: &str = "https://academy.example/";

struct Harness {
    registration: Registration,
    storage: Arc<MemoryCacheStorage>,
    fetcher: Arc<MockFetcher>,
}

impl Harness {
    fn new() -> Self {
        Self::with_storage(MemoryCacheStorage::new())
    }

    fn with_storage(storage: MemoryCacheStorage) -> Self {
        let storage = Arc::new(storage);
        let fetcher = Arc::new(MockFetcher::new());
        for path in [
            "/index.html",
            "/manifest.json",
            "/offline.html",
            "/font-loader.js",
            "/vite.svg",
        ] {
            fetcher.route(&url(path), 200, format!("body of {path}"));
        }
        let registration =
            Registration::new(Url::parse(ORIGIN).unwrap(), storage.clone(), fetcher.clone());
        Self {
            registration,
            storage,
            fetcher,
        }
    }

    async fn install(&self, version: &str) {
        let outcome = self.registration.register(config(version)).await.unwrap();
        assert!(outcome.install.is_complete(), "{:?}", outcome.install);
    }

    async fn get(&self, path: &str) -> academy_net::Response {
        self.registration
            .fetch(&Request::parse(&url(path)).unwrap())
            .await
    }

    async fn namespaces(&self) -> Vec<String> {
        let mut names = self.storage.keys().await.unwrap();
        names.sort();
        names
    }
}

/// Memory storage that counts entry reads and writes.
#[derive(Default)]
struct CountingStorage {
    inner: MemoryCacheStorage,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl CountingStorage {
    fn reset(&self) {
        self.reads.store(0, Ordering::SeqCst);
        self.writes.store(0, Ordering::SeqCst);
    }

    fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CacheStorage for CountingStorage {
    async fn open(&self, name: &str) -> Result<(), StorageError> {
        self.inner.open(name).await
    }

    async fn has(&self, name: &str) -> Result<bool, StorageError> {
        self.inner.has(name).await
    }

    async fn delete(&self, name: &str) -> Result<bool, StorageError> {
        self.inner.delete(name).await
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.inner.keys().await
    }

    async fn match_in(
        &self,
        name: &str,
        key: &CacheKey,
    ) -> Result<Option<Response>, StorageError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.match_in(name, key).await
    }

    async fn match_any(&self, key: &CacheKey) -> Result<Option<Response>, StorageError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.match_any(key).await
    }

    async fn put(&self, name: &str, key: CacheKey, response: Response) -> Result<(), StorageError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.put(name, key, response).await
    }

    async fn put_all(
        &self,
        name: &str,
        batch: Vec<(CacheKey, Response)>,
    ) -> Result<(), StorageError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.put_all(name, batch).await
    }

    async fn entries(&self, name: &str) -> Result<Vec<CacheKey>, StorageError> {
        self.inner.entries(name).await
    }
}

fn url(path: &str) -> String {
    Url::parse(ORIGIN).unwrap().join(path).unwrap().to_string()
}

fn config(version: &str) -> WorkerConfig {
    WorkerConfig::for_origin(Url::parse(ORIGIN).unwrap()).with_version(version)
}

#[tokio::test]
async fn install_precaches_static_assets() {
    let h = Harness::new();
    h.install("v1.0.1").await;

    assert_eq!(h.fetcher.call_count(), 5);
    let mut stored: Vec<String> = h
        .storage
        .entries("static-v1.0.1")
        .await
        .unwrap()
        .into_iter()
        .map(|key| key.url)
        .collect();
    stored.sort();
    assert_eq!(
        stored,
        vec![
            url("/font-loader.js"),
            url("/index.html"),
            url("/manifest.json"),
            url("/offline.html"),
            url("/vite.svg"),
        ]
    );
}

#[tokio::test]
async fn offline_scenario() {
    let h = Harness::new();
    h.install("v1.0.1").await;
    h.fetcher.set_online(false);

    let index = h.get("/index.html").await;
    assert_eq!(index.status, StatusCode::OK);
    assert!(index.from_cache());
    assert_eq!(index.text().unwrap(), "body of /index.html");

    let courses = h.get("/api/courses").await;
    assert_eq!(courses.status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(courses.is_synthesized());
    assert_eq!(
        courses.headers[header::CONTENT_TYPE],
        "text/plain; charset=utf-8"
    );
}

#[tokio::test]
async fn offline_navigation_gets_offline_page() {
    let h = Harness::new();
    h.install("v1.0.1").await;
    h.fetcher.set_online(false);

    let navigation = Request::navigate(Url::parse(&url("/courses/rust")).unwrap());
    let response = h.registration.fetch(&navigation).await;
    assert_eq!(response.text().unwrap(), "body of /offline.html");

    let image = Request::parse(&url("/courses/rust"))
        .unwrap()
        .destination(RequestDestination::Image);
    let response = h.registration.fetch(&image).await;
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn cache_first_hit_never_touches_network() {
    let h = Harness::new();
    h.install("v1.0.1").await;
    h.fetcher.reset_calls();

    for _ in 0..3 {
        let response = h.get("/font-loader.js").await;
        assert!(response.from_cache());
    }
    assert_eq!(h.fetcher.call_count(), 0);
}

#[tokio::test]
async fn network_first_prefers_fresh_data() {
    let h = Harness::new();
    h.install("v1.0.1").await;

    let key = CacheKey::get(&Url::parse(&url("/api/courses")).unwrap());
    h.storage
        .put(
            "dynamic-v1.0.1",
            key.clone(),
            academy_net::Response::new(StatusCode::OK, "cached"),
        )
        .await
        .unwrap();
    h.fetcher.route(&url("/api/courses"), 200, "live");

    let live = h.get("/api/courses").await;
    assert_eq!(live.text().unwrap(), "live");
    let stored = h.storage.match_in("dynamic-v1.0.1", &key).await.unwrap().unwrap();
    assert_eq!(stored.text().unwrap(), "live");

    h.fetcher.set_online(false);
    let offline = h.get("/api/courses").await;
    assert_eq!(offline.text().unwrap(), "live");
    assert!(offline.from_cache());
}

#[tokio::test]
async fn stale_while_revalidate_returns_stale_then_updated() {
    let h = Harness::new();
    h.install("v1.0.1").await;

    h.fetcher.route(&url("/uploads/banner.png"), 200, "v1 banner");
    let first = h.get("/uploads/banner.png").await;
    assert_eq!(first.text().unwrap(), "v1 banner");
    h.registration.active().await.unwrap().settle().await;

    h.fetcher.route(&url("/uploads/banner.png"), 200, "v2 banner");
    let stale = h.get("/uploads/banner.png").await;
    assert_eq!(stale.text().unwrap(), "v1 banner");
    assert!(stale.from_cache());

    h.registration.active().await.unwrap().settle().await;
    let fresh = h.get("/uploads/banner.png").await;
    assert_eq!(fresh.text().unwrap(), "v2 banner");
}

#[tokio::test]
async fn rotation_purges_old_versions() {
    let h = Harness::new();
    for name in ["static-v1.0.0", "dynamic-v1.0.0", "other-cache"] {
        h.storage.open(name).await.unwrap();
    }

    h.install("v1.0.1").await;
    assert_eq!(h.namespaces().await, vec!["dynamic-v1.0.1", "static-v1.0.1"]);
}

#[tokio::test]
async fn update_rotates_on_skip_waiting() {
    let h = Harness::new();
    h.install("v1.0.0").await;
    h.get("/api/courses").await;
    assert_eq!(h.namespaces().await, vec!["dynamic-v1.0.0", "static-v1.0.0"]);

    h.install("v1.0.1").await;
    assert!(h.namespaces().await.contains(&"static-v1.0.1".to_string()));
    assert!(h.namespaces().await.contains(&"static-v1.0.0".to_string()));

    h.registration
        .post_message(WorkerSlot::Waiting, &json!({"type": "SKIP_WAITING"}), None)
        .await
        .unwrap();
    assert_eq!(h.namespaces().await, vec!["dynamic-v1.0.1", "static-v1.0.1"]);
}

#[tokio::test]
async fn clear_cache_deletes_everything() {
    let h = Harness::new();
    h.install("v1.0.1").await;
    h.storage.open("other-cache").await.unwrap();
    h.storage.open("academy-v1.0.1").await.unwrap();

    let (port, reply) = academy_sw::ReplyPort::channel();
    h.registration
        .post_message(WorkerSlot::Active, &json!({"type": "CLEAR_CACHE"}), Some(port))
        .await
        .unwrap();

    assert_eq!(reply.await.unwrap(), ControlReply::Cleared { success: true });
    assert!(h.storage.keys().await.unwrap().is_empty());
}

#[tokio::test]
async fn non_get_requests_bypass_the_cache() {
    let storage = Arc::new(CountingStorage::default());
    let fetcher = Arc::new(MockFetcher::new());
    let config = config("v1.0.1");
    for asset in config.static_asset_urls().unwrap() {
        fetcher.route(asset.as_str(), 200, "asset");
    }
    let registration =
        Registration::new(Url::parse(ORIGIN).unwrap(), storage.clone(), fetcher.clone());
    registration.register(config).await.unwrap();

    // an asset that is cached, so a read would find it
    let post = Request::post(
        Url::parse(&url("/index.html")).unwrap(),
        Bytes::from_static(b"name=ali"),
    );
    fetcher.route(&url("/index.html"), 200, "posted");
    storage.reset();

    let response = registration.fetch(&post).await;
    assert_eq!(response.text().unwrap(), "posted");
    assert!(!response.from_cache());
    assert_eq!(storage.reads(), 0);
    assert_eq!(storage.writes(), 0);

    fetcher.set_online(false);
    let response = registration.fetch(&post).await;
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(storage.reads(), 0);
    assert_eq!(storage.writes(), 0);

    let get = registration.fetch(&Request::parse(&url("/index.html")).unwrap()).await;
    assert!(get.from_cache());
    assert!(storage.reads() > 0);
}

#[tokio::test]
async fn failed_write_still_answers() {
    let h = Harness::with_storage(MemoryCacheStorage::with_quota(0));
    let outcome = h.registration.register(config("v1.0.1")).await.unwrap();
    assert!(!outcome.install.is_complete());
    assert!(outcome.activation.is_some());

    h.fetcher.route(&url("/api/courses"), 200, "[]");
    let response = h.get("/api/courses").await;
    assert_eq!(response.text().unwrap(), "[]");

    // assets missing from the static cache are fetched on demand
    let index = h.get("/index.html").await;
    assert_eq!(index.text().unwrap(), "body of /index.html");
    assert!(!index.from_cache());
}

#[tokio::test]
async fn versions_run_side_by_side() {
    let a = Harness::new();
    let b = Harness::new();
    a.install("v1.0.0").await;
    b.install("v2.0.0").await;

    let (port, reply) = academy_sw::ReplyPort::channel();
    a.registration
        .post_message(WorkerSlot::Active, &json!({"type": "GET_VERSION"}), Some(port))
        .await
        .unwrap();
    assert_eq!(
        reply.await.unwrap(),
        ControlReply::Version {
            version: "v1.0.0".to_string()
        }
    );
    assert_eq!(b.namespaces().await, vec!["dynamic-v2.0.0", "static-v2.0.0"]);
}
