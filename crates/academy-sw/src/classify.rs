//! Request classification.
//!
//! Maps an intercepted request to a caching strategy through an ordered
//! rule list. The first matching rule wins, so an image under `/api/` is
//! network-first, not stale-while-revalidate.

use academy_net::Request;
use http::Method;
use tracing::trace;

use crate::config::WorkerConfig;

/// Static files served cache-first.
pub const STATIC_EXTENSIONS: &[&str] = &["css", "js", "woff", "woff2", "ttf", "eot", "otf"];

/// Images served stale-while-revalidate.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "svg", "ico"];

/// Caching algorithm for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    CacheFirst,
    NetworkFirst,
    StaleWhileRevalidate,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::CacheFirst => "cache-first",
            Strategy::NetworkFirst => "network-first",
            Strategy::StaleWhileRevalidate => "stale-while-revalidate",
        }
    }
}

/// Why a request is left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassThroughReason {
    NonHttpScheme,
    NonGetMethod,
}

/// Classifier verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Not intercepted; the page talks to the network directly.
    PassThrough(PassThroughReason),
    /// Answered by the given strategy.
    Handle(Strategy),
}

/// A predicate over the request URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// Last path segment ends in `.ext` (case-insensitive).
    PathExtension(Vec<String>),
    /// Host equals one of these.
    Host(Vec<String>),
    /// Path starts with one of these.
    PathPrefix(Vec<String>),
    /// Any of the inner matchers.
    AnyOf(Vec<Matcher>),
}

impl Matcher {
    pub fn extensions(exts: &[&str]) -> Self {
        Self::PathExtension(exts.iter().map(|e| e.to_ascii_lowercase()).collect())
    }

    pub fn hosts(hosts: &[String]) -> Self {
        Self::Host(hosts.iter().map(|h| h.to_ascii_lowercase()).collect())
    }

    pub fn prefixes<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::PathPrefix(prefixes.into_iter().map(Into::into).collect())
    }

    /// Check if a request matches.
    pub fn matches(&self, request: &Request) -> bool {
        let url = &request.url;
        match self {
            Matcher::PathExtension(exts) => path_extension(url.path())
                .map(|ext| exts.iter().any(|e| e.eq_ignore_ascii_case(ext)))
                .unwrap_or(false),
            Matcher::Host(hosts) => url
                .host_str()
                .map(|host| hosts.iter().any(|h| h.eq_ignore_ascii_case(host)))
                .unwrap_or(false),
            Matcher::PathPrefix(prefixes) => {
                prefixes.iter().any(|p| url.path().starts_with(p.as_str()))
            }
            Matcher::AnyOf(matchers) => matchers.iter().any(|m| m.matches(request)),
        }
    }
}

fn path_extension(path: &str) -> Option<&str> {
    let segment = path.rsplit('/').next()?;
    segment.rsplit_once('.').map(|(_, ext)| ext)
}

/// One classification rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub name: &'static str,
    pub matcher: Matcher,
    pub strategy: Strategy,
}

/// Ordered rule list with a network-first fallback.
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<Rule>,
    default_strategy: Strategy,
}

impl Classifier {
    /// Build the standard rule set from config.
    pub fn from_config(config: &WorkerConfig) -> Self {
        let rules = vec![
            Rule {
                name: "static-asset",
                matcher: Matcher::AnyOf(vec![
                    Matcher::extensions(STATIC_EXTENSIONS),
                    Matcher::hosts(&config.cdn_hosts),
                ]),
                strategy: Strategy::CacheFirst,
            },
            Rule {
                name: "api",
                matcher: Matcher::prefixes(
                    std::iter::once(config.api_prefix.clone())
                        .chain(config.cacheable_api.iter().cloned()),
                ),
                strategy: Strategy::NetworkFirst,
            },
            Rule {
                name: "image",
                matcher: Matcher::extensions(IMAGE_EXTENSIONS),
                strategy: Strategy::StaleWhileRevalidate,
            },
        ];

        Self {
            rules,
            default_strategy: Strategy::NetworkFirst,
        }
    }

    /// Classifier with custom rules.
    pub fn with_rules(rules: Vec<Rule>, default_strategy: Strategy) -> Self {
        Self {
            rules,
            default_strategy,
        }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Classify a request. Pure: no I/O, no state.
    pub fn classify(&self, request: &Request) -> Route {
        if !matches!(request.url.scheme(), "http" | "https") {
            return Route::PassThrough(PassThroughReason::NonHttpScheme);
        }
        if request.method != Method::GET {
            return Route::PassThrough(PassThroughReason::NonGetMethod);
        }

        let strategy = self
            .rules
            .iter()
            .find(|rule| rule.matcher.matches(request))
            .map(|rule| {
                trace!(url = %request.url, rule = rule.name, "Rule matched");
                rule.strategy
            })
            .unwrap_or(self.default_strategy);

        Route::Handle(strategy)
    }
}
