//! Session identifiers (spec §4.I), grounded on `session_manager.cxx`'s
//! cluster-tagging requirement: a front-end load balancer dispatches by
//! `session_id.GetClusterHash()`, so part of the id must be cheaply
//! derivable into a stable node index without touching the session store.

use std::fmt;
use uuid::Uuid;

/// 128-bit random session id with an optional cluster-node tag folded
/// into its low byte, mirroring the source's reserved bit-slice scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; 16]);

impl SessionId {
    pub fn generate(cluster_size: u32, cluster_node: u32) -> Self {
        let bytes = *Uuid::new_v4().as_bytes();
        let mut id = SessionId(bytes);
        if cluster_size > 0 {
            id.set_cluster_node(cluster_size, cluster_node);
        }
        id
    }

    fn set_cluster_node(&mut self, cluster_size: u32, cluster_node: u32) {
        debug_assert!(cluster_node < cluster_size);
        self.0[0] = (cluster_node % cluster_size.max(1)) as u8;
    }

    /// Node index a front-end balancer should dispatch this session to.
    pub fn cluster_hash(&self, cluster_size: u32) -> u32 {
        if cluster_size == 0 {
            return 0;
        }
        (self.0[0] as u32) % cluster_size
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Parses the 32-hex-char cookie form produced by `Display`. Used to
    /// recover a session id from an inbound `Cookie` header.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 32 {
            return None;
        }
        let mut bytes = [0u8; 16];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(SessionId(bytes))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_distinct() {
        let a = SessionId::generate(0, 0);
        let b = SessionId::generate(0, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_cluster_hash_matches_assigned_node() {
        let id = SessionId::generate(4, 2);
        assert_eq!(id.cluster_hash(4), 2);
    }

    #[test]
    fn test_cluster_hash_zero_cluster_size_is_zero() {
        let id = SessionId::generate(0, 0);
        assert_eq!(id.cluster_hash(0), 0);
    }

    #[test]
    fn test_display_is_32_hex_chars() {
        let id = SessionId::generate(0, 0);
        assert_eq!(format!("{id}").len(), 32);
    }

    #[test]
    fn test_from_hex_round_trips_through_display() {
        let id = SessionId::generate(0, 0);
        let text = format!("{id}");
        assert_eq!(SessionId::from_hex(&text), Some(id));
    }

    #[test]
    fn test_from_hex_rejects_wrong_length_and_bad_digits() {
        assert_eq!(SessionId::from_hex("abcd"), None);
        assert_eq!(SessionId::from_hex(&"zz".repeat(16)), None);
    }
}
