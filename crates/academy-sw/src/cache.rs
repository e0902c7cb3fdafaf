//! Cache storage: named namespaces of request → response entries.
//!
//! ```text
//! CacheStorage
//!     ├── static-v1.0.1
//!     │       └── (GET, url) → CacheEntry
//!     ├── dynamic-v1.0.1
//!     └── academy-v1.0.1
//! ```
//!
//! Entries are replaced wholesale, never edited in place, and carry no
//! expiry. Staleness is handled by rotating namespaces on activation.

use std::time::{SystemTime, UNIX_EPOCH};

use academy_net::{Request, Response, ResponseSource};
use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, Method, StatusCode};
use tokio::sync::RwLock;
use tracing::{debug, trace};
use url::Url;

use crate::error::StorageError;

// ==================== Keys and Entries ====================

/// Request identity inside a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub method: Method,
    pub url: String,
}

impl CacheKey {
    /// Key for an intercepted request. The fragment never reaches the
    /// network, so it is not part of the identity.
    pub fn for_request(request: &Request) -> Self {
        Self::new(request.method.clone(), &request.url)
    }

    /// GET key for a URL.
    pub fn get(url: &Url) -> Self {
        Self::new(Method::GET, url)
    }

    fn new(method: Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method,
            url: url.into(),
        }
    }
}

/// A stored response.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub status: StatusCode,
    pub status_text: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Milliseconds since the Unix epoch.
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response for storage.
    pub fn from_response(key: CacheKey, response: Response) -> Self {
        Self {
            key,
            status: response.status,
            status_text: response.status_text,
            headers: response.headers,
            body: response.body,
            cached_at: now_millis(),
        }
    }

    /// Rebuild a response marked as served from cache.
    pub fn to_response(&self) -> Response {
        Response {
            url: Url::parse(&self.key.url).ok(),
            status: self.status,
            status_text: self.status_text.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            source: ResponseSource::Cache,
        }
    }

    /// Approximate footprint used for quota accounting.
    pub fn size(&self) -> usize {
        let headers: usize = self
            .headers
            .iter()
            .map(|(name, value)| name.as_str().len() + value.len())
            .sum();
        self.key.url.len() + headers + self.body.len()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ==================== Cache ====================

/// One namespace.
#[derive(Debug, Default)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    entries: HashMap<CacheKey, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request.
    pub fn match_request(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Store an entry, replacing any previous one. Returns the replaced entry.
    pub fn put(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        self.entries.insert(entry.key.clone(), entry)
    }

    /// Delete entry.
    pub fn delete(&mut self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// All keys.
    pub fn keys(&self) -> Vec<CacheKey> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes held by this namespace.
    pub fn size(&self) -> usize {
        self.entries.values().map(CacheEntry::size).sum()
    }
}

// ==================== Storage Trait ====================

/// The worker's shared storage.
///
/// Namespace order is creation order; [`match_any`](Self::match_any)
/// returns the first hit in that order.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Create the namespace if it does not exist.
    async fn open(&self, name: &str) -> Result<(), StorageError>;

    async fn has(&self, name: &str) -> Result<bool, StorageError>;

    /// Delete a namespace. `Ok(false)` if it did not exist.
    async fn delete(&self, name: &str) -> Result<bool, StorageError>;

    /// All namespace names.
    async fn keys(&self) -> Result<Vec<String>, StorageError>;

    /// Look up in one namespace. A missing namespace is a miss.
    async fn match_in(&self, name: &str, key: &CacheKey)
        -> Result<Option<Response>, StorageError>;

    /// Look up across every namespace.
    async fn match_any(&self, key: &CacheKey) -> Result<Option<Response>, StorageError>;

    /// Store a response, creating the namespace on demand.
    async fn put(&self, name: &str, key: CacheKey, response: Response)
        -> Result<(), StorageError>;

    /// Store a batch. The default stops at the first failure and keeps
    /// what was already written; implementations may make it atomic.
    async fn put_all(
        &self,
        name: &str,
        batch: Vec<(CacheKey, Response)>,
    ) -> Result<(), StorageError> {
        for (key, response) in batch {
            self.put(name, key, response).await?;
        }
        Ok(())
    }

    /// Keys stored in one namespace.
    async fn entries(&self, name: &str) -> Result<Vec<CacheKey>, StorageError>;
}

// ==================== Memory Storage ====================

/// In-process storage with an optional byte quota.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    caches: RwLock<Vec<Cache>>,
    quota: Option<usize>,
}

impl MemoryCacheStorage {
    /// Create new, unbounded storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage that refuses writes beyond `bytes`.
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            caches: RwLock::new(Vec::new()),
            quota: Some(bytes),
        }
    }

    /// Bytes held across every namespace.
    pub async fn total_bytes(&self) -> usize {
        self.caches.read().await.iter().map(Cache::size).sum()
    }

    fn check_quota(&self, caches: &[Cache], freed: usize, needed: usize) -> Result<(), StorageError> {
        let Some(quota) = self.quota else {
            return Ok(());
        };
        let used = caches.iter().map(Cache::size).sum::<usize>() - freed;
        if used + needed > quota {
            return Err(StorageError::QuotaExceeded { needed, used, quota });
        }
        Ok(())
    }
}

fn position(caches: &[Cache], name: &str) -> Option<usize> {
    caches.iter().position(|c| c.name == name)
}

fn open_in<'a>(caches: &'a mut Vec<Cache>, name: &str) -> &'a mut Cache {
    match position(caches, name) {
        Some(index) => &mut caches[index],
        None => {
            debug!(cache = name, "Creating cache");
            caches.push(Cache::new(name));
            let last = caches.len() - 1;
            &mut caches[last]
        }
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<(), StorageError> {
        let mut caches = self.caches.write().await;
        open_in(&mut caches, name);
        Ok(())
    }

    async fn has(&self, name: &str) -> Result<bool, StorageError> {
        Ok(position(&self.caches.read().await, name).is_some())
    }

    async fn delete(&self, name: &str) -> Result<bool, StorageError> {
        let mut caches = self.caches.write().await;
        match position(&caches, name) {
            Some(index) => {
                let removed = caches.remove(index);
                debug!(cache = name, entries = removed.len(), "Deleted cache");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self
            .caches
            .read()
            .await
            .iter()
            .map(|c| c.name.clone())
            .collect())
    }

    async fn match_in(
        &self,
        name: &str,
        key: &CacheKey,
    ) -> Result<Option<Response>, StorageError> {
        let caches = self.caches.read().await;
        let hit = position(&caches, name)
            .and_then(|index| caches[index].match_request(key))
            .map(CacheEntry::to_response);
        trace!(cache = name, url = %key.url, hit = hit.is_some(), "Cache lookup");
        Ok(hit)
    }

    async fn match_any(&self, key: &CacheKey) -> Result<Option<Response>, StorageError> {
        let caches = self.caches.read().await;
        Ok(caches
            .iter()
            .find_map(|cache| cache.match_request(key))
            .map(CacheEntry::to_response))
    }

    async fn put(
        &self,
        name: &str,
        key: CacheKey,
        response: Response,
    ) -> Result<(), StorageError> {
        let entry = CacheEntry::from_response(key, response);
        let mut caches = self.caches.write().await;

        let freed = position(&caches, name)
            .and_then(|index| caches[index].match_request(&entry.key))
            .map(CacheEntry::size)
            .unwrap_or(0);
        self.check_quota(&caches, freed, entry.size())?;

        trace!(cache = name, url = %entry.key.url, bytes = entry.body.len(), "Cache put");
        open_in(&mut caches, name).put(entry);
        Ok(())
    }

    /// All-or-nothing: either every entry lands or none does.
    async fn put_all(
        &self,
        name: &str,
        batch: Vec<(CacheKey, Response)>,
    ) -> Result<(), StorageError> {
        let entries: Vec<CacheEntry> = batch
            .into_iter()
            .map(|(key, response)| CacheEntry::from_response(key, response))
            .collect();
        let mut caches = self.caches.write().await;

        let freed = match position(&caches, name) {
            Some(index) => entries
                .iter()
                .filter_map(|e| caches[index].match_request(&e.key))
                .map(CacheEntry::size)
                .sum(),
            None => 0,
        };
        let needed = entries.iter().map(CacheEntry::size).sum();
        self.check_quota(&caches, freed, needed)?;

        let cache = open_in(&mut caches, name);
        for entry in entries {
            cache.put(entry);
        }
        Ok(())
    }

    async fn entries(&self, name: &str) -> Result<Vec<CacheKey>, StorageError> {
        let caches = self.caches.read().await;
        position(&caches, name)
            .map(|index| caches[index].keys())
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }
}
