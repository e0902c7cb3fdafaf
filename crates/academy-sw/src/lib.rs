//! # Academy Cache Worker
//!
//! Offline caching layer that sits between pages and the network.
//!
//! ## Features
//!
//! - **Versioned namespaces**: `static-{v}`, `dynamic-{v}`, `{app}-{v}`;
//!   everything else is purged on activation
//! - **Request classification**: ordered rules pick a caching strategy
//! - **Strategies**: cache-first, network-first, stale-while-revalidate
//! - **Control channel**: `SKIP_WAITING`, `GET_VERSION`, `CLEAR_CACHE`, and a
//!   `CACHE_UPDATED` broadcast on activation
//! - **Push**: notifications with view/close actions
//!
//! ## Architecture
//!
//! ```text
//! DispatcherHandle ──events──▶ EventDispatcher
//!                                   │
//!                                   └── Registration (scope)
//!                                           ├── installing / waiting / active (CacheWorker)
//!                                           │       ├── Classifier
//!                                           │       └── StrategyEngine
//!                                           ├── CacheStorage (shared)
//!                                           ├── Fetcher (shared)
//!                                           └── Clients (pages)
//! ```
//!
//! Every intercepted request is answered: by the network, the cache, or a
//! synthesized plain-text fallback with an explicit status.

pub mod cache;
pub mod classify;
pub mod clients;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod notification;
pub mod registration;
pub mod strategy;
pub mod worker;

pub use cache::{Cache, CacheEntry, CacheKey, CacheStorage, MemoryCacheStorage};
pub use classify::{Classifier, Matcher, PassThroughReason, Route, Rule, Strategy};
pub use clients::{Client, ClientConnection, ClientId, ClientMatchOptions, ClientType, Clients};
pub use config::{CacheNames, NotificationConfig, WorkerConfig};
pub use dispatch::{DispatcherHandle, EventDispatcher, WorkerEvent};
pub use error::{StorageError, WorkerError};
pub use message::{ClientMessage, ControlMessage, ControlReply, ReplyPort, StorageAction};
pub use notification::{Notification, NotificationAction, NotificationClickOutcome};
pub use registration::{RegisterOutcome, Registration, WorkerSlot};
pub use strategy::StrategyEngine;
pub use worker::{
    ActivateReport, CacheWorker, InstallReport, MessageOutcome, PurgeReport, ServiceWorkerId,
    ServiceWorkerState,
};
