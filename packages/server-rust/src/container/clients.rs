//! Service map: discovered peers of one service name.
//!
//! Entries carry the peer client, its discovery record, and a warm-up tag.
//! New records enter `Young` and a timer promotes them to `Adult`;
//! selection only ever sees adults, so a just-booted node receives no
//! traffic before its own dependency graph is warm.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::warn;

use crate::client::PeerClient;
use crate::naming::ServiceRecord;

/// Warm-up state of a discovered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceState {
    Young = 0,
    Adult = 1,
}

/// One discovered peer: client handle, discovery record, warm-up tag.
#[derive(Clone)]
pub struct PeerEntry {
    pub client: Arc<PeerClient>,
    pub service: ServiceRecord,
    state: Arc<AtomicU8>,
}

impl PeerEntry {
    #[must_use]
    pub fn new(client: Arc<PeerClient>, service: ServiceRecord, state: ServiceState) -> Self {
        Self {
            client,
            service,
            state: Arc::new(AtomicU8::new(state as u8)),
        }
    }

    #[must_use]
    pub fn state(&self) -> ServiceState {
        match self.state.load(Ordering::Acquire) {
            0 => ServiceState::Young,
            _ => ServiceState::Adult,
        }
    }

    /// Flips `Young -> Adult`; the warm-up timer's only job.
    pub fn promote(&self) {
        self.state.store(ServiceState::Adult as u8, Ordering::Release);
    }
}

/// serviceId -> peer entry for one dependency.
#[derive(Default)]
pub struct ClientMap {
    entries: DashMap<String, PeerEntry>,
}

impl ClientMap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn add(&self, entry: PeerEntry) {
        if entry.service.id.is_empty() {
            warn!(module = "clients", "service id is required");
            return;
        }
        self.entries.insert(entry.service.id.clone(), entry);
    }

    pub fn remove(&self, id: &str) -> Option<PeerEntry> {
        self.entries.remove(id).map(|(_, entry)| entry)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<PeerEntry> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Service records currently in `state`, sorted by id so selection is
    /// deterministic.
    #[must_use]
    pub fn services(&self, state: ServiceState) -> Vec<ServiceRecord> {
        let mut records: Vec<ServiceRecord> = self
            .entries
            .iter()
            .filter(|entry| entry.value().state() == state)
            .map(|entry| entry.value().service.clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
