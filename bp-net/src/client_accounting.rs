//! Per-client connection accounting and tarpit delay (spec §4.F), grounded
//! on `net/ClientAccounting.cxx`: tracks how many connections and how busy
//! each remote client is, so a client hammering the gateway gets
//! progressively delayed (tarpitted) rather than refused outright.

use dashmap::DashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

const IDLE_THRESHOLD: Duration = Duration::from_secs(2);
const BUSY_THRESHOLD: Duration = Duration::from_secs(120);
const TARPIT_FOR: Duration = Duration::from_secs(60);
const MAX_DELAY: Duration = Duration::from_secs(60);
const DELAY_STEP: Duration = Duration::from_millis(500);
const CLEANUP_GRACE: Duration = Duration::from_secs(300);

struct PerClient {
    connections: u32,
    idle_since: Instant,
    busy_since: Instant,
    tarpit_until: Instant,
    delay: Duration,
    /// Set when the connection count drops to zero; the record is reaped
    /// once `now >= expires` by a periodic sweep.
    expires: Instant,
}

impl PerClient {
    fn new(now: Instant) -> Self {
        PerClient {
            connections: 0,
            idle_since: now,
            busy_since: now,
            tarpit_until: now,
            delay: Duration::ZERO,
            expires: now + CLEANUP_GRACE,
        }
    }

    /// `NoteRequest()` — updates the tarpit delay based on the gap since
    /// the last request and how long this client has been continuously
    /// busy, exactly mirroring the source's threshold/step constants.
    fn note_request(&mut self, now: Instant) {
        if now.saturating_duration_since(self.idle_since) > IDLE_THRESHOLD {
            self.busy_since = now;
            self.delay = self.delay.saturating_sub(DELAY_STEP);
        } else if now.saturating_duration_since(self.busy_since) > BUSY_THRESHOLD {
            self.tarpit_until = now + TARPIT_FOR;
            if self.delay < MAX_DELAY {
                self.delay += DELAY_STEP;
            }
        }
        self.idle_since = now;
        if now >= self.tarpit_until {
            self.delay = Duration::ZERO;
        }
    }

    fn note_response_finished(&mut self, now: Instant) {
        self.idle_since = now;
    }
}

/// Maps a remote IP address to its `PerClient` accounting record, with a
/// configurable per-client connection cap (0 = unlimited).
pub struct ClientAccountingMap {
    clients: DashMap<IpAddr, PerClient>,
    max_connections: usize,
}

impl ClientAccountingMap {
    pub fn new(max_connections: usize) -> Self {
        ClientAccountingMap { clients: DashMap::new(), max_connections }
    }

    /// `Check()` — true if this client is still under its connection cap.
    pub fn check(&self, addr: IpAddr) -> bool {
        if self.max_connections == 0 {
            return true;
        }
        self.clients.get(&addr).map(|c| (c.connections as usize) < self.max_connections).unwrap_or(true)
    }

    pub fn add_connection(&self, addr: IpAddr) {
        let now = Instant::now();
        self.clients.entry(addr).or_insert_with(|| PerClient::new(now)).connections += 1;
    }

    pub fn remove_connection(&self, addr: IpAddr) {
        let now = Instant::now();
        if let Some(mut c) = self.clients.get_mut(&addr) {
            c.connections = c.connections.saturating_sub(1);
            c.expires = now + CLEANUP_GRACE;
        }
    }

    pub fn note_request(&self, addr: IpAddr) {
        let now = Instant::now();
        if let Some(mut c) = self.clients.get_mut(&addr) {
            c.note_request(now);
        }
    }

    pub fn note_response_finished(&self, addr: IpAddr) {
        let now = Instant::now();
        if let Some(mut c) = self.clients.get_mut(&addr) {
            c.note_response_finished(now);
        }
    }

    /// Current tarpit delay to apply before accepting this client's next
    /// request, `Duration::ZERO` if not tarpitted.
    pub fn get_delay(&self, addr: IpAddr) -> Duration {
        self.clients.get(&addr).map(|c| c.delay).unwrap_or(Duration::ZERO)
    }

    /// `OnCleanupTimer()` — reaps client records with zero connections past
    /// their grace period. Call periodically from a worker's event loop.
    pub fn run_cleanup(&self) {
        let now = Instant::now();
        self.clients.retain(|_, c| c.connections > 0 || now < c.expires);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[test]
    fn test_check_respects_max_connections() {
        let map = ClientAccountingMap::new(1);
        assert!(map.check(ip()));
        map.add_connection(ip());
        assert!(!map.check(ip()));
    }

    #[test]
    fn test_unlimited_when_max_is_zero() {
        let map = ClientAccountingMap::new(0);
        for _ in 0..100 {
            map.add_connection(ip());
        }
        assert!(map.check(ip()));
    }

    #[test]
    fn test_cleanup_reaps_idle_client_past_grace() {
        let map = ClientAccountingMap::new(1);
        map.add_connection(ip());
        map.remove_connection(ip());
        // expires is 5 minutes out, so an immediate cleanup keeps it.
        map.run_cleanup();
        assert!(map.clients.contains_key(&ip()));
    }

    #[test]
    fn test_sustained_busy_increases_delay() {
        let map = ClientAccountingMap::new(0);
        map.add_connection(ip());
        {
            let mut c = map.clients.get_mut(&ip()).unwrap();
            c.busy_since = Instant::now() - Duration::from_secs(200);
            c.idle_since = Instant::now();
        }
        map.note_request(ip());
        assert!(map.get_delay(ip()) > Duration::ZERO);
    }
}
