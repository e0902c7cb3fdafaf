//! Storage failures are soft: they are reported, never fatal.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use academy_net::{MockFetcher, Request, Response};
use academy_sw::{
    CacheKey, CacheStorage, CacheWorker, Clients, MemoryCacheStorage, ServiceWorkerState,
    StorageError, WorkerConfig,
};
use async_trait::async_trait;
use http::StatusCode;
use tokio::sync::RwLock;
use url::Url;

const ORIGIN: &str = "https://academy.example/";

/// Memory storage with per-namespace failure injection.
#[derive(Default)]
struct FlakyStorage {
    inner: MemoryCacheStorage,
    undeletable: Mutex<HashSet<String>>,
    unreadable: Mutex<bool>,
}

impl FlakyStorage {
    fn refuse_delete(&self, name: &str) {
        self.undeletable.lock().unwrap().insert(name.to_string());
    }

    fn refuse_reads(&self) {
        *self.unreadable.lock().unwrap() = true;
    }

    fn check_read(&self) -> Result<(), StorageError> {
        if *self.unreadable.lock().unwrap() {
            return Err(StorageError::Unavailable("reads disabled".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStorage for FlakyStorage {
    async fn open(&self, name: &str) -> Result<(), StorageError> {
        self.inner.open(name).await
    }

    async fn has(&self, name: &str) -> Result<bool, StorageError> {
        self.inner.has(name).await
    }

    async fn delete(&self, name: &str) -> Result<bool, StorageError> {
        if self.undeletable.lock().unwrap().contains(name) {
            return Err(StorageError::Unavailable(format!("{name} is locked")));
        }
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
        self.check_read()?;
        self.inner.match_in(name, key).await
    }

    async fn match_any(&self, key: &CacheKey) -> Result<Option<Response>, StorageError> {
        self.check_read()?;
        self.inner.match_any(key).await
    }

    async fn put(&self, name: &str, key: CacheKey, response: Response) -> Result<(), StorageError> {
        self.inner.put(name, key, response).await
    }

    async fn entries(&self, name: &str) -> Result<Vec<CacheKey>, StorageError> {
        self.inner.entries(name).await
    }
}

fn worker(storage: Arc<FlakyStorage>) -> (CacheWorker, Arc<MockFetcher>) {
    let config = WorkerConfig::for_origin(Url::parse(ORIGIN).unwrap()).with_version("v1.0.1");
    let fetcher = Arc::new(MockFetcher::new());
    for url in config.static_asset_urls().unwrap() {
        fetcher.route(url.as_str(), 200, "asset");
    }
    let worker = CacheWorker::new(
        config,
        storage,
        fetcher.clone(),
        Arc::new(RwLock::new(Clients::new())),
    )
    .unwrap();
    (worker, fetcher)
}

#[tokio::test]
async fn one_failed_delete_does_not_stop_the_others() {
    let storage = Arc::new(FlakyStorage::default());
    for name in ["static-v0.9.0", "dynamic-v0.9.0", "static-v1.0.0", "other-cache"] {
        storage.open(name).await.unwrap();
    }
    storage.refuse_delete("dynamic-v0.9.0");

    let (worker, _) = worker(storage.clone());
    worker.install().await.unwrap();
    let report = worker.activate().await.unwrap();

    assert_eq!(worker.state(), ServiceWorkerState::Activated);
    assert_eq!(report.purge.failed.len(), 1);
    assert_eq!(report.purge.failed[0].0, "dynamic-v0.9.0");
    let mut deleted = report.purge.deleted.clone();
    deleted.sort();
    assert_eq!(deleted, vec!["other-cache", "static-v0.9.0", "static-v1.0.0"]);

    let mut left = storage.keys().await.unwrap();
    left.sort();
    assert_eq!(left, vec!["dynamic-v0.9.0", "dynamic-v1.0.1", "static-v1.0.1"]);
}

#[tokio::test]
async fn clear_cache_reports_partial_failure() {
    let storage = Arc::new(FlakyStorage::default());
    let (worker, _) = worker(storage.clone());
    worker.install().await.unwrap();
    worker.activate().await.unwrap();
    storage.refuse_delete("static-v1.0.1");

    let report = worker.clear_all_caches().await;
    assert!(!report.is_clean());
    assert_eq!(report.deleted, vec!["dynamic-v1.0.1"]);
    assert_eq!(storage.keys().await.unwrap(), vec!["static-v1.0.1"]);
}

#[tokio::test]
async fn unreadable_storage_falls_back_to_network() {
    let storage = Arc::new(FlakyStorage::default());
    let (worker, fetcher) = worker(storage.clone());
    worker.install().await.unwrap();
    worker.activate().await.unwrap();
    storage.refuse_reads();

    let request = Request::parse("https://academy.example/font-loader.js").unwrap();
    let response = worker.handle_fetch(&request).await.unwrap();
    assert_eq!(response.text().unwrap(), "asset");
    assert!(!response.from_cache());

    fetcher.set_online(false);
    let response = worker.handle_fetch(&request).await.unwrap();
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
}
