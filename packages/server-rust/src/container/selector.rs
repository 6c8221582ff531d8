//! Endpoint choice for forwards.
//!
//! The channel id — not the account, not the destination — is the affinity
//! key: every packet from one connected client lands on the same logic
//! node for session-local state, while different clients shard across the
//! fleet.

use skein_core::Header;

use crate::naming::ServiceRecord;

/// Pluggable endpoint-choice function keyed on the packet header.
pub trait Selector: Send + Sync {
    /// Returns the chosen service id, or `None` when `services` is empty.
    fn lookup(&self, header: &Header, services: &[ServiceRecord]) -> Option<String>;
}

/// CRC32-IEEE hash of a routing key.
#[must_use]
pub fn hash_code(key: &str) -> u32 {
    crc32fast::hash(key.as_bytes())
}

/// Consistent-hash selector: `services[crc32(channel_id) % len]`.
///
/// Callers pass candidates in a stable order (the service map sorts by
/// id), so the choice is stable while the candidate set is unchanged.
#[derive(Debug, Default)]
pub struct HashSelector;

impl Selector for HashSelector {
    fn lookup(&self, header: &Header, services: &[ServiceRecord]) -> Option<String> {
        if services.is_empty() {
            return None;
        }
        let code = hash_code(&header.channel_id) as usize;
        Some(services[code % services.len()].id.clone())
    }
}
