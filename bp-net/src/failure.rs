//! Per-peer failure tracking (spec §4.F), grounded on `net/FailureManager.cxx`.
//!
//! Each backend address carries at most one `Failure` record with a status
//! and an expiry; `FAILURE_OK` is never stored (its absence from the map
//! *is* "ok"). Statuses have an ordering — a more severe status refuses to
//! be downgraded by a less severe one except via `FADE`, which is tracked
//! in a side expiry so it can resume once the more serious status lapses.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FailureStatus {
    Ok,
    Fade,
    ResponseSent,
    Failed,
    MonitorFailed,
}

struct Failure {
    status: FailureStatus,
    expires: Instant,
    fade_expires: Option<Instant>,
}

impl Failure {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires
    }

    fn is_fade(&self, now: Instant) -> bool {
        self.fade_expires.map(|e| now < e).unwrap_or(false)
    }

    /// `OverrideStatus` — returns whether the override was accepted.
    fn override_status(&mut self, now: Instant, new_status: FailureStatus, duration: Duration) -> bool {
        if self.is_expired(now) {
            // expired: override unconditionally
        } else if new_status == self.status {
            // same status: just refresh expiry
        } else if new_status == FailureStatus::Fade {
            self.fade_expires = Some(now + duration);
            return true;
        } else if self.status == FailureStatus::Fade {
            self.fade_expires = Some(self.expires);
        } else if new_status < self.status {
            return false;
        }
        self.expires = now + duration;
        self.status = new_status;
        true
    }
}

/// Tracks failure status for every backend address this node has seen,
/// keyed by socket address. Cheaply cloneable; shared across worker
/// threads via `Arc` in the caller.
#[derive(Default)]
pub struct FailureManager {
    failures: DashMap<SocketAddr, Failure>,
}

impl FailureManager {
    pub fn new() -> Self {
        FailureManager { failures: DashMap::new() }
    }

    pub fn set(&self, address: SocketAddr, status: FailureStatus, duration: Duration) {
        debug_assert!(status != FailureStatus::Ok);
        let now = Instant::now();
        self.failures
            .entry(address)
            .and_modify(|f| {
                f.override_status(now, status, duration);
            })
            .or_insert_with(|| Failure { status, expires: now + duration, fade_expires: None });
    }

    /// `Add()` — shorthand for a 20-second hard failure, the source's
    /// default cooldown for a refused/reset connection.
    pub fn add(&self, address: SocketAddr) {
        self.set(address, FailureStatus::Failed, Duration::from_secs(20));
    }

    /// `Unset(status)` — clears a status; `FailureStatus::Ok` acts as a
    /// catch-all wildcard that removes the record regardless of its
    /// current status, matching the source's `match_status` special case.
    pub fn unset(&self, address: SocketAddr, status: FailureStatus) {
        let now = Instant::now();
        let mut remove = false;
        if let Some(mut entry) = self.failures.get_mut(&address) {
            if status == FailureStatus::Fade {
                entry.fade_expires = None;
            }
            let matches = status == FailureStatus::Ok || entry.status == status;
            if !matches && !entry.is_expired(now) {
                return;
            }
            if status != FailureStatus::Ok && entry.is_fade(now) {
                entry.status = FailureStatus::Fade;
                if let Some(fade) = entry.fade_expires {
                    entry.expires = fade;
                }
                entry.fade_expires = None;
            } else {
                remove = true;
            }
        }
        if remove {
            self.failures.remove(&address);
        }
    }

    /// `Get()` — current status, `Ok` if no record or the record expired.
    /// A record whose primary status has expired can still be in `Fade`:
    /// a `Fade` received while a stronger status was active is remembered
    /// in `fade_expires` and takes over once that stronger status lapses.
    pub fn get(&self, address: SocketAddr) -> FailureStatus {
        let now = Instant::now();
        match self.failures.get(&address) {
            Some(f) if !f.is_expired(now) => f.status,
            Some(f) if f.is_fade(now) => FailureStatus::Fade,
            _ => FailureStatus::Ok,
        }
    }

    pub fn is_usable(&self, address: SocketAddr) -> bool {
        !matches!(self.get(address), FailureStatus::Failed | FailureStatus::MonitorFailed)
    }

    /// Count of addresses currently carrying a non-expired `Failed` or
    /// `MonitorFailed` record, for the metrics gauge (spec §4.Q:
    /// "failure-manager status gauges"). Per-address labels would need an
    /// enumerable upstream registry this crate doesn't have; this is the
    /// aggregate view that doesn't.
    pub fn unusable_count(&self) -> usize {
        let now = Instant::now();
        self.failures
            .iter()
            .filter(|entry| !entry.is_expired(now) && matches!(entry.status, FailureStatus::Failed | FailureStatus::MonitorFailed))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn test_fresh_address_is_ok() {
        let mgr = FailureManager::new();
        assert_eq!(mgr.get(addr(1)), FailureStatus::Ok);
    }

    #[test]
    fn test_add_marks_failed() {
        let mgr = FailureManager::new();
        mgr.add(addr(1));
        assert_eq!(mgr.get(addr(1)), FailureStatus::Failed);
        assert!(!mgr.is_usable(addr(1)));
    }

    #[test]
    fn test_more_severe_status_not_downgraded() {
        let mgr = FailureManager::new();
        mgr.set(addr(1), FailureStatus::Failed, Duration::from_secs(60));
        mgr.set(addr(1), FailureStatus::ResponseSent, Duration::from_secs(60));
        assert_eq!(mgr.get(addr(1)), FailureStatus::Failed);
    }

    #[test]
    fn test_unset_ok_removes_regardless_of_status() {
        let mgr = FailureManager::new();
        mgr.add(addr(1));
        mgr.unset(addr(1), FailureStatus::Ok);
        assert_eq!(mgr.get(addr(1)), FailureStatus::Ok);
    }

    #[test]
    fn test_unset_wrong_status_is_noop() {
        let mgr = FailureManager::new();
        mgr.set(addr(1), FailureStatus::Failed, Duration::from_secs(60));
        mgr.unset(addr(1), FailureStatus::ResponseSent);
        assert_eq!(mgr.get(addr(1)), FailureStatus::Failed);
    }

    #[test]
    fn test_failed_then_longer_fade_reports_fade_once_failed_expires() {
        let mgr = FailureManager::new();
        mgr.set(addr(1), FailureStatus::Failed, Duration::from_millis(10));
        mgr.set(addr(1), FailureStatus::Fade, Duration::from_millis(60));
        assert_eq!(mgr.get(addr(1)), FailureStatus::Failed);
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(mgr.get(addr(1)), FailureStatus::Fade);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(mgr.get(addr(1)), FailureStatus::Ok);
    }

    #[test]
    fn test_expired_failure_reports_ok() {
        let mgr = FailureManager::new();
        mgr.set(addr(1), FailureStatus::Failed, Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(mgr.get(addr(1)), FailureStatus::Ok);
    }

    #[test]
    fn test_unusable_count_counts_failed_and_monitor_failed_only() {
        let mgr = FailureManager::new();
        assert_eq!(mgr.unusable_count(), 0);
        mgr.add(addr(1));
        mgr.set(addr(2), FailureStatus::MonitorFailed, Duration::from_secs(60));
        mgr.set(addr(3), FailureStatus::ResponseSent, Duration::from_secs(60));
        assert_eq!(mgr.unusable_count(), 2);
    }

    #[test]
    fn test_unusable_count_excludes_expired() {
        let mgr = FailureManager::new();
        mgr.set(addr(1), FailureStatus::Failed, Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(mgr.unusable_count(), 0);
    }
}
