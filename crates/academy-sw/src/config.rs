//! Worker configuration.
//!
//! Version, namespace names and asset lists travel in an explicit value
//! handed to each worker, so several versions can run side by side in one
//! process.

use std::path::Path;
use std::time::Duration;

use academy_common::{AcademyError, ResultExt};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::WorkerError;

/// Immutable configuration for one deployed worker version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Prefix of the combined app namespace.
    pub app_name: String,

    /// Deployed version, e.g. `v1.0.1`.
    pub version: String,

    /// Origin the static asset paths are resolved against.
    pub origin: Url,

    /// Paths pre-fetched into the static namespace at install.
    pub static_assets: Vec<String>,

    /// Served for document requests when the network and cache both miss.
    pub offline_page: String,

    /// Every path under this prefix is network-first.
    pub api_prefix: String,

    /// Extra network-first API paths.
    pub cacheable_api: Vec<String>,

    /// Hosts whose responses are cache-first.
    pub cdn_hosts: Vec<String>,

    /// Optional deadline for each network call made by a strategy.
    pub network_timeout_ms: Option<u64>,

    /// Attempts for the install-time precache batch.
    pub precache_attempts: u32,

    /// Push notification defaults.
    pub notification: NotificationConfig,
}

/// Defaults used when a push payload leaves fields out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotificationConfig {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            app_name: "academy".to_string(),
            version: format!("v{}", env!("CARGO_PKG_VERSION")),
            origin: Url::parse("http://localhost/").expect("static URL parses"),
            static_assets: [
                "/index.html",
                "/manifest.json",
                "/offline.html",
                "/font-loader.js",
                "/vite.svg",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            offline_page: "/offline.html".to_string(),
            api_prefix: "/api/".to_string(),
            cacheable_api: ["/api/home/categories", "/api/courses", "/api/home/courses"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            cdn_hosts: ["fonts.googleapis.com", "fonts.gstatic.com", "cdn.jsdelivr.net"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            network_timeout_ms: None,
            precache_attempts: 1,
            notification: NotificationConfig::default(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            title: "Academy".to_string(),
            body: "You have a new notification".to_string(),
            icon: "/vite.svg".to_string(),
            badge: "/vite.svg".to_string(),
            vibrate: vec![100, 50, 100],
        }
    }
}

impl WorkerConfig {
    /// Default configuration for `origin`.
    pub fn for_origin(origin: Url) -> Self {
        Self {
            origin,
            ..Default::default()
        }
    }

    /// Override the version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, WorkerError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| AcademyError::config_with_source("invalid worker config", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, WorkerError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .context(format!("reading worker config {}", path.display()))?;
        Self::from_json_str(&json)
    }

    /// Check the invariants the worker relies on.
    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.version.trim().is_empty() {
            return Err(WorkerError::Config("version must not be empty".into()));
        }
        if self.app_name.trim().is_empty() {
            return Err(WorkerError::Config("app_name must not be empty".into()));
        }
        if !matches!(self.origin.scheme(), "http" | "https") {
            return Err(WorkerError::Config(format!(
                "origin must be http(s), got {}",
                self.origin
            )));
        }
        if let Some(path) = self
            .static_assets
            .iter()
            .chain(std::iter::once(&self.offline_page))
            .find(|p| !p.starts_with('/'))
        {
            return Err(WorkerError::Config(format!(
                "asset path `{path}` must start with '/'"
            )));
        }
        if !self.static_assets.contains(&self.offline_page) {
            return Err(WorkerError::Config(format!(
                "offline page `{}` is not a static asset",
                self.offline_page
            )));
        }
        Ok(())
    }

    /// Namespace names for this version.
    pub fn cache_names(&self) -> CacheNames {
        CacheNames::new(&self.app_name, &self.version)
    }

    pub fn network_timeout(&self) -> Option<Duration> {
        self.network_timeout_ms.map(Duration::from_millis)
    }

    /// Resolve a site-relative path against the origin.
    pub fn resolve(&self, path: &str) -> Result<Url, WorkerError> {
        self.origin
            .join(path)
            .map_err(|e| WorkerError::Config(format!("cannot resolve `{path}`: {e}")))
    }

    /// Absolute URLs of the static asset set.
    pub fn static_asset_urls(&self) -> Result<Vec<Url>, WorkerError> {
        self.static_assets.iter().map(|p| self.resolve(p)).collect()
    }
}

/// The current namespace names for one version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheNames {
    pub static_cache: String,
    pub dynamic_cache: String,
    pub app_cache: String,
}

impl CacheNames {
    pub fn new(app_name: &str, version: &str) -> Self {
        Self {
            static_cache: format!("static-{version}"),
            dynamic_cache: format!("dynamic-{version}"),
            app_cache: format!("{app_name}-{version}"),
        }
    }

    /// Whether `name` belongs to this version.
    pub fn is_current(&self, name: &str) -> bool {
        self.all().contains(&name)
    }

    pub fn all(&self) -> [&str; 3] {
        [
            self.static_cache.as_str(),
            self.dynamic_cache.as_str(),
            self.app_cache.as_str(),
        ]
    }
}
