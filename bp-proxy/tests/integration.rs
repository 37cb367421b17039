//! Integration tests: StaticTranslator -> ProxyWorker resolution pipeline
//!
//! These tests exercise the translation lookup + peer selection dispatch
//! path without a real TCP listener. They verify that:
//!
//! 1. Routes registered on the translator become matchable.
//! 2. Method-specific rules only match their declared method.
//! 3. Peer selection resolves a single candidate out of an address list.
//! 4. A fully-failed address list falls back to 502.
//! 5. SharedState wires translator, failure manager, cache, and worker
//!    pool together consistently.
//! 6. Hot rule add/remove is immediately visible (no restart needed).

use bp_core::{Address, AddressList, GatewayConfig};
use bp_net::FailureManager;
use bp_proxy::proxy::{ProxyWorker, RequestResult, RESP_404, RESP_502};
use bp_proxy::translate::{RouteRule, StaticTranslator, Translator};
use bp_proxy::worker::SharedState;
use std::sync::Arc;

fn http_addr(port: u16) -> Address {
    Address::Http { addresses: AddressList::new(vec![format!("127.0.0.1:{port}").parse().unwrap()]), host: None }
}

fn rule(id: &str, pattern: &str, methods: Vec<&str>, addr: Address) -> RouteRule {
    RouteRule {
        id: id.to_string(),
        pattern: pattern.to_string(),
        methods: methods.into_iter().map(String::from).collect(),
        address: addr,
        cacheable: false,
        session_realm: None,
    }
}

// ── Test 1: rule registered on translator becomes matchable ──────────────────

#[monoio::test]
async fn rule_registered_on_translator_is_matched() {
    let translator = StaticTranslator::new(vec![rule("r1", "/hello", vec![], http_addr(8080))]);
    let resp = translator.translate(bp_proxy::translate::TranslateRequest {
        method: "GET",
        uri: "/hello",
        host: None,
        headers: &[],
        client_ip: "127.0.0.1",
    }).await.unwrap();
    assert!(matches!(resp.address, Address::Http { .. }));
}

// ── Test 2: unmatched route resolves to a 404 static response ────────────────

#[monoio::test]
async fn unmatched_route_resolves_to_404() {
    let mut w = ProxyWorker::new(Arc::new(StaticTranslator::new(vec![rule("r1", "/hello", vec![], http_addr(8080))])), Arc::new(FailureManager::new()));
    let result = w.handle_request("GET", "/missing", None, &[], "1.2.3.4", 0).await.unwrap();
    assert!(matches!(result, RequestResult::Static(RESP_404)));
}

// ── Test 3: method-specific rule only matches its declared method ────────────

#[monoio::test]
async fn method_specific_rule_only_matches_correct_method() {
    let mut w = ProxyWorker::new(
        Arc::new(StaticTranslator::new(vec![rule("rget", "/resource", vec!["GET"], http_addr(8080))])),
        Arc::new(FailureManager::new()),
    );
    let get_result = w.handle_request("GET", "/resource", None, &[], "1.2.3.4", 0).await.unwrap();
    assert!(matches!(get_result, RequestResult::Proxy { .. }));

    let post_result = w.handle_request("POST", "/resource", None, &[], "1.2.3.4", 0).await.unwrap();
    assert!(matches!(post_result, RequestResult::Static(RESP_404)));
}

// ── Test 4: all peers failed falls back to 502 ────────────────────────────────

#[monoio::test]
async fn all_peers_failed_falls_back_to_502() {
    let failures = Arc::new(FailureManager::new());
    failures.add("127.0.0.1:8080".parse().unwrap());
    let mut w = ProxyWorker::new(Arc::new(StaticTranslator::new(vec![rule("r1", "/api", vec![], http_addr(8080))])), failures);
    let result = w.handle_request("GET", "/api", None, &[], "1.2.3.4", 0).await.unwrap();
    assert!(matches!(result, RequestResult::Static(RESP_502)));
}

// ── Test 5: SharedState wires everything together consistently ───────────────

#[test]
fn shared_state_provides_consistent_view() {
    let translator = Arc::new(StaticTranslator::new(vec![rule("r1", "/api", vec![], http_addr(9000))]));
    let shared = SharedState::new(translator, GatewayConfig::default());

    assert_eq!(shared.translator.version(), 1);
    assert_eq!(shared.cache.bytes_used(), 0);
    assert!(shared.failures.is_usable("127.0.0.1:9000".parse().unwrap()));
    assert!(shared.sessions.is_empty());
}

// ── Test 6: hot rule add/remove is immediately visible ────────────────────────

#[monoio::test]
async fn hot_rule_add_and_remove_is_immediately_visible() {
    let translator = StaticTranslator::new(vec![]);
    let before = translator.translate(bp_proxy::translate::TranslateRequest {
        method: "GET",
        uri: "/v1",
        host: None,
        headers: &[],
        client_ip: "127.0.0.1",
    }).await.unwrap();
    assert!(matches!(before.address, Address::None));

    translator.add_rule(rule("r1", "/v1", vec![], http_addr(8080)));
    let after = translator.translate(bp_proxy::translate::TranslateRequest {
        method: "GET",
        uri: "/v1",
        host: None,
        headers: &[],
        client_ip: "127.0.0.1",
    }).await.unwrap();
    assert!(matches!(after.address, Address::Http { .. }));

    translator.remove_rule("r1");
    let removed = translator.translate(bp_proxy::translate::TranslateRequest {
        method: "GET",
        uri: "/v1",
        host: None,
        headers: &[],
        client_ip: "127.0.0.1",
    }).await.unwrap();
    assert!(matches!(removed.address, Address::None));
}
