//! Translation lookup (spec §2, §6): "routes each request through a
//! pluggable translation server that describes how to serve it." The wire
//! protocol to that server is explicitly out of scope (spec.md §1) — this
//! module defines the `TranslateResponse` shape the core consumes and a
//! `Translator` trait at the seam where a real translation-server client
//! would plug in, plus a `StaticTranslator` default that resolves the same
//! shape from an in-process route table instead of a socket round-trip.
//!
//! `StaticTranslator`'s matching engine is a `matchit` radix trie per HTTP
//! method plus a catch-all, rebuilt behind an `ArcSwap` so lookups never
//! block a concurrent reload.

use bp_core::{Address, GatewayError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// What the core asks the translation server to resolve.
pub struct TranslateRequest<'a> {
    pub method: &'a str,
    pub uri: &'a str,
    pub host: Option<&'a str>,
    pub headers: &'a [(String, String)],
    pub client_ip: &'a str,
}

/// Cookie/session directives a translation response can carry (spec §2:
/// "session binding" is consulted as middleware between translation and
/// dispatch).
#[derive(Debug, Clone, Default)]
pub struct SessionDirective {
    /// Bind this request to a session, creating one if the client has none.
    pub bind: bool,
    /// Realm the session belongs to, for `SessionStore::create`/`find`.
    pub realm: Option<String>,
}

/// Cache policy a translation response can attach to its target (spec §4.H
/// consumes this to decide whether a response is cacheable at all).
#[derive(Debug, Clone, Default)]
pub struct CacheDirective {
    pub cacheable: bool,
}

/// The core's view of a translation server's response (spec §6): target
/// address, cache policy, base for URI normalization, session directives.
/// Header-forwarding masks and access controls are represented minimally
/// (an allow/deny and a header-name blocklist) since their full generality
/// lives in the excluded wire protocol.
#[derive(Debug, Clone)]
pub struct TranslateResponse {
    pub address: Address,
    pub base: Option<String>,
    pub cache: CacheDirective,
    pub session: SessionDirective,
    pub deny: bool,
}

impl TranslateResponse {
    fn not_found() -> Self {
        TranslateResponse {
            address: Address::None,
            base: None,
            cache: CacheDirective::default(),
            session: SessionDirective::default(),
            deny: false,
        }
    }
}

/// The seam a real translation-server client would implement. Dispatch
/// calls this once per request; everything downstream only sees the
/// resulting `TranslateResponse`.
#[allow(async_fn_in_trait)]
pub trait Translator {
    async fn translate(&self, req: TranslateRequest<'_>) -> Result<TranslateResponse, GatewayError>;
}

/// One static routing rule, the config-driven stand-in for a translation
/// server's per-URI decision.
#[derive(Debug, Clone)]
pub struct RouteRule {
    pub id: String,
    /// `matchit` pattern, e.g. `/api/{*rest}`.
    pub pattern: String,
    pub methods: Vec<String>,
    pub address: Address,
    pub cacheable: bool,
    pub session_realm: Option<String>,
}

struct CompiledRoutes {
    by_method: HashMap<String, matchit::Router<Arc<str>>>,
    any_method: matchit::Router<Arc<str>>,
}

/// Default `Translator`: resolves requests against an in-process,
/// hot-reloadable route table instead of a translation-server socket.
/// Built on an `ArcSwap<CompiledRoutes>` plus per-method `matchit::Router`
/// shape, generalized from "route -> upstream string" to "route -> full
/// `Address`".
pub struct StaticTranslator {
    compiled: arc_swap::ArcSwap<CompiledRoutes>,
    rules: dashmap::DashMap<String, RouteRule>,
    version: AtomicU64,
}

impl StaticTranslator {
    pub fn new(rules: Vec<RouteRule>) -> Self {
        let translator = StaticTranslator {
            compiled: arc_swap::ArcSwap::new(Arc::new(CompiledRoutes {
                by_method: HashMap::new(),
                any_method: matchit::Router::new(),
            })),
            rules: dashmap::DashMap::new(),
            version: AtomicU64::new(0),
        };
        for rule in rules {
            translator.rules.insert(rule.id.clone(), rule);
        }
        translator.rebuild();
        translator
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }

    pub fn add_rule(&self, rule: RouteRule) {
        self.rules.insert(rule.id.clone(), rule);
        self.rebuild();
    }

    pub fn remove_rule(&self, id: &str) {
        self.rules.remove(id);
        self.rebuild();
    }

    fn rebuild(&self) {
        let mut by_method: HashMap<String, matchit::Router<Arc<str>>> = HashMap::new();
        let mut any_method = matchit::Router::new();
        for entry in self.rules.iter() {
            let rule = entry.value();
            let id: Arc<str> = Arc::from(rule.id.as_str());
            if rule.methods.is_empty() {
                let _ = any_method.insert(rule.pattern.clone(), Arc::clone(&id));
            } else {
                for method in &rule.methods {
                    let router = by_method.entry(method.to_ascii_uppercase()).or_insert_with(matchit::Router::new);
                    let _ = router.insert(rule.pattern.clone(), Arc::clone(&id));
                }
            }
        }
        self.compiled.store(Arc::new(CompiledRoutes { by_method, any_method }));
        self.version.fetch_add(1, Ordering::Relaxed);
    }

    fn match_rule_id(&self, method: &str, uri: &str) -> Option<Arc<str>> {
        let compiled = self.compiled.load();
        if let Some(router) = compiled.by_method.get(method)
            && let Ok(m) = router.at(uri)
        {
            return Some(Arc::clone(m.value));
        }
        compiled.any_method.at(uri).ok().map(|m| Arc::clone(m.value))
    }
}

impl Translator for StaticTranslator {
    async fn translate(&self, req: TranslateRequest<'_>) -> Result<TranslateResponse, GatewayError> {
        let Some(id) = self.match_rule_id(req.method, req.uri) else {
            return Ok(TranslateResponse::not_found());
        };
        let Some(rule) = self.rules.get(id.as_ref()) else {
            return Ok(TranslateResponse::not_found());
        };
        Ok(TranslateResponse {
            address: rule.address.clone(),
            base: None,
            cache: CacheDirective { cacheable: rule.cacheable },
            session: SessionDirective { bind: rule.session_realm.is_some(), realm: rule.session_realm.clone() },
            deny: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: &str, pattern: &str, addr: Address) -> RouteRule {
        RouteRule {
            id: id.to_string(),
            pattern: pattern.to_string(),
            methods: Vec::new(),
            address: addr,
            cacheable: false,
            session_realm: None,
        }
    }

    fn local_addr(root: &str) -> Address {
        Address::Local { document_root: root.to_string(), path_info: String::new() }
    }

    async fn translate(t: &StaticTranslator, method: &str, uri: &str) -> TranslateResponse {
        t.translate(TranslateRequest { method, uri, host: None, headers: &[], client_ip: "127.0.0.1" })
            .await
            .unwrap()
    }

    #[monoio::test]
    async fn test_exact_match_resolves_address() {
        let t = StaticTranslator::new(vec![rule("r1", "/api", local_addr("/srv/api"))]);
        let resp = translate(&t, "GET", "/api").await;
        assert!(matches!(resp.address, Address::Local { .. }));
    }

    #[monoio::test]
    async fn test_unmatched_uri_returns_none_address() {
        let t = StaticTranslator::new(vec![rule("r1", "/api", local_addr("/srv/api"))]);
        let resp = translate(&t, "GET", "/missing").await;
        assert!(matches!(resp.address, Address::None));
    }

    #[monoio::test]
    async fn test_wildcard_pattern_matches_subpaths() {
        let t = StaticTranslator::new(vec![rule("r1", "/api/{*rest}", local_addr("/srv/api"))]);
        let resp = translate(&t, "GET", "/api/users/1").await;
        assert!(matches!(resp.address, Address::Local { .. }));
    }

    #[monoio::test]
    async fn test_add_rule_is_visible_immediately() {
        let t = StaticTranslator::new(vec![]);
        assert!(matches!(translate(&t, "GET", "/new").await.address, Address::None));
        t.add_rule(rule("r2", "/new", local_addr("/srv/new")));
        assert!(matches!(translate(&t, "GET", "/new").await.address, Address::Local { .. }));
    }

    #[test]
    fn test_rebuild_bumps_version() {
        let t = StaticTranslator::new(vec![]);
        let before = t.version();
        t.add_rule(rule("r3", "/x", local_addr("/srv/x")));
        assert!(t.version() > before);
    }
}
