//! Peer selection over an `AddressList` (spec §4.F), grounded on
//! `balancer.hxx`: round-robin selection for symmetric load spreading, with
//! optional session-based stickiness, skipping any address the
//! `FailureManager` currently considers down.

use crate::failure::FailureManager;
use bp_core::{AddressList, StickyMode};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Round-robin cursor over one `AddressList`. One `Balancer` is created per
/// distinct address list (e.g. per upstream cluster), shared across
/// worker threads.
pub struct Balancer {
    cursor: AtomicUsize,
}

impl Default for Balancer {
    fn default() -> Self {
        Self::new()
    }
}

impl Balancer {
    pub fn new() -> Self {
        Balancer { cursor: AtomicUsize::new(0) }
    }

    /// `balancer_get()` — picks one endpoint from `list` per its
    /// `StickyMode` (spec §4.F):
    ///
    /// - `Failover`: the first address that's usable; if none are, the
    ///   first address is returned anyway as a last resort (the caller
    ///   still gets *an* address to try and fail against).
    /// - `SourceIp`/`SessionModulo`/`Cookie`/`JvmRoute`: index
    ///   `session mod N` if that node is usable, else round-robin from
    ///   there. These differ only in how the caller derived `session`
    ///   (client IP hash, session id, cookie value, or JVM route suffix) —
    ///   the selection rule itself is identical.
    /// - `None`: plain round-robin, cursor carried in `self`.
    ///
    /// Returns `None` only if every address is currently marked failed
    /// (except under `Failover`, which always returns the first address).
    pub fn get(&self, list: &AddressList, failures: &FailureManager, session: u32) -> Option<SocketAddr> {
        if list.is_empty() {
            return None;
        }
        if list.sticky == StickyMode::Failover {
            for &addr in &list.addresses {
                if failures.is_usable(addr) {
                    return Some(addr);
                }
            }
            return Some(list.addresses[0]);
        }
        if list.sticky != StickyMode::None && session != 0 {
            let idx = (session as usize) % list.len();
            if failures.is_usable(list.addresses[idx]) {
                return Some(list.addresses[idx]);
            }
            return self.round_robin_from(list, failures, idx);
        }
        self.round_robin_from(list, failures, self.cursor.fetch_add(1, Ordering::Relaxed) % list.len())
    }

    fn round_robin_from(&self, list: &AddressList, failures: &FailureManager, start: usize) -> Option<SocketAddr> {
        let len = list.len();
        for attempt in 0..len {
            let idx = (start + attempt) % len;
            if failures.is_usable(list.addresses[idx]) {
                return Some(list.addresses[idx]);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(ports: &[u16]) -> AddressList {
        AddressList::new(ports.iter().map(|p| format!("127.0.0.1:{p}").parse().unwrap()).collect())
    }

    #[test]
    fn test_round_robin_cycles_through_all_addresses() {
        let l = list(&[1, 2, 3]);
        let failures = FailureManager::new();
        let balancer = Balancer::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            seen.insert(balancer.get(&l, &failures, 0).unwrap().port());
        }
        assert_eq!(seen, [1, 2, 3].into_iter().collect());
    }

    #[test]
    fn test_skips_failed_addresses() {
        let l = list(&[1, 2]);
        let failures = FailureManager::new();
        failures.add("127.0.0.1:1".parse().unwrap());
        let balancer = Balancer::new();
        for _ in 0..5 {
            assert_eq!(balancer.get(&l, &failures, 0).unwrap().port(), 2);
        }
    }

    #[test]
    fn test_empty_list_returns_none() {
        let l = AddressList::default();
        let failures = FailureManager::new();
        let balancer = Balancer::new();
        assert!(balancer.get(&l, &failures, 0).is_none());
    }

    #[test]
    fn test_sticky_session_picks_fixed_address() {
        let mut l = list(&[1, 2, 3]);
        l.sticky = StickyMode::SessionModulo;
        let failures = FailureManager::new();
        let balancer = Balancer::new();
        let first = balancer.get(&l, &failures, 42).unwrap();
        let second = balancer.get(&l, &failures, 42).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_sticky_falls_back_to_round_robin_when_target_down() {
        let mut l = list(&[1, 2, 3]);
        l.sticky = StickyMode::Cookie;
        let failures = FailureManager::new();
        let idx = 7usize % l.len();
        failures.add(l.addresses[idx]);
        let balancer = Balancer::new();
        let picked = balancer.get(&l, &failures, 7).unwrap();
        assert_ne!(picked, l.addresses[idx]);
    }

    #[test]
    fn test_failover_prefers_first_usable_address() {
        let mut l = list(&[1, 2, 3]);
        l.sticky = StickyMode::Failover;
        let failures = FailureManager::new();
        failures.add(l.addresses[0]);
        let balancer = Balancer::new();
        assert_eq!(balancer.get(&l, &failures, 0).unwrap().port(), 2);
    }

    #[test]
    fn test_failover_returns_first_address_as_last_resort_when_all_failed() {
        let mut l = list(&[1, 2]);
        l.sticky = StickyMode::Failover;
        let failures = FailureManager::new();
        failures.add(l.addresses[0]);
        failures.add(l.addresses[1]);
        let balancer = Balancer::new();
        assert_eq!(balancer.get(&l, &failures, 0).unwrap().port(), 1);
    }

    #[test]
    fn test_all_failed_returns_none() {
        let l = list(&[1, 2]);
        let failures = FailureManager::new();
        failures.add("127.0.0.1:1".parse().unwrap());
        failures.add("127.0.0.1:2".parse().unwrap());
        let balancer = Balancer::new();
        assert!(balancer.get(&l, &failures, 0).is_none());
    }
}
