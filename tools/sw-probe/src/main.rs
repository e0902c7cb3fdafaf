//! Probe for the academy cache worker.
//!
//! Runs a worker in-process with memory storage and real HTTP, for
//! checking a deployment by hand.
//!
//! ## Usage
//!
//! ```bash
//! # Which strategy handles a URL
//! sw-probe classify https://academy.example/api/courses
//!
//! # Pre-cache the static asset set from a live origin
//! sw-probe --origin https://academy.example install
//!
//! # Install, then answer requests through the worker
//! sw-probe --origin https://academy.example fetch /index.html /api/courses --navigate
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use academy_common::{init_logging, LogConfig, LogFormat};
use academy_net::{HttpFetcher, LoaderConfig, Request, Url};
use academy_sw::{
    CacheStorage, Classifier, MemoryCacheStorage, Registration, Route, WorkerConfig,
};
use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use http::Method;
use tracing::debug;

#[derive(Parser)]
#[command(name = "sw-probe")]
#[command(about = "Drive the academy cache worker against a live origin")]
struct Cli {
    /// Worker config JSON file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Origin the static assets are fetched from
    #[arg(long, global = true)]
    origin: Option<Url>,
    /// Log output format (pretty, compact, json)
    #[arg(long, global = true, default_value = "compact")]
    log_format: LogFormat,
    /// More logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show which strategy handles a request
    Classify {
        /// Absolute URL, or a path resolved against the origin
        url: String,
        /// Request method
        #[arg(short, long, default_value = "GET")]
        method: Method,
    },

    /// Pre-cache the static asset set and list what was stored
    Install,

    /// Install, then answer requests through the worker
    Fetch {
        /// Absolute URLs, or paths resolved against the origin
        #[arg(required = true)]
        urls: Vec<String>,
        /// Send the requests as page navigations
        #[arg(long)]
        navigate: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log = match cli.verbose {
        0 => LogConfig::default(),
        1 => LogConfig::debug(),
        _ => LogConfig::trace(),
    };
    init_logging(log.with_format(cli.log_format))?;

    let config = load_config(&cli)?;
    match cli.command {
        Commands::Classify { url, method } => classify(&config, &url, method),
        Commands::Install => install(config).await,
        Commands::Fetch { urls, navigate } => fetch(config, &urls, navigate).await,
    }
}

fn load_config(cli: &Cli) -> Result<WorkerConfig> {
    let mut config = match &cli.config {
        Some(path) => WorkerConfig::from_path(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => WorkerConfig::default(),
    };
    if let Some(origin) = &cli.origin {
        config.origin = origin.clone();
    }
    config.validate()?;
    Ok(config)
}

fn resolve(config: &WorkerConfig, url: &str) -> Result<Url> {
    config
        .origin
        .join(url)
        .with_context(|| format!("invalid URL `{url}`"))
}

fn classify(config: &WorkerConfig, url: &str, method: Method) -> Result<()> {
    let request = Request::get(resolve(config, url)?).method(method);
    match Classifier::from_config(config).classify(&request) {
        Route::PassThrough(reason) => {
            println!("{} {}  pass-through ({reason:?})", request.method, request.url)
        }
        Route::Handle(strategy) => {
            println!("{} {}  {}", request.method, request.url, strategy.as_str())
        }
    }
    Ok(())
}

async fn start(config: WorkerConfig) -> Result<(Registration, Arc<MemoryCacheStorage>)> {
    let storage = Arc::new(MemoryCacheStorage::new());
    let fetcher = Arc::new(HttpFetcher::new(LoaderConfig::default())?);
    let registration = Registration::new(config.origin.clone(), storage.clone(), fetcher);

    let outcome = registration.register(config).await?;
    let install = &outcome.install;
    println!(
        "Installed {} of {} assets into {}",
        install.stored, install.requested, install.cache
    );
    if let Some(error) = &install.error {
        println!("  pre-cache failed: {error}");
    }
    Ok((registration, storage))
}

async fn install(config: WorkerConfig) -> Result<()> {
    let (_registration, storage) = start(config).await?;
    for name in storage.keys().await? {
        let entries = storage.entries(&name).await?;
        println!("{name}: {} entries", entries.len());
        for key in entries {
            println!("  {} {}", key.method, key.url);
        }
    }
    Ok(())
}

async fn fetch(config: WorkerConfig, urls: &[String], navigate: bool) -> Result<()> {
    let targets = urls
        .iter()
        .map(|url| resolve(&config, url))
        .collect::<Result<Vec<_>>>()?;
    let (registration, _storage) = start(config).await?;

    for url in targets {
        let request = if navigate {
            Request::navigate(url)
        } else {
            Request::get(url)
        };
        let response = registration.fetch(&request).await;
        println!(
            "{} {}  {:?}  {} bytes",
            response.status.as_u16(),
            request.url,
            response.source,
            response.body.len()
        );
    }

    if let Some(worker) = registration.active().await {
        worker.settle().await;
        debug!("Background revalidations settled");
    }
    Ok(())
}
