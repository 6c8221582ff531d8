//! Channel registry: the in-process index behind outbound pushes.
//!
//! At most one channel per id is observable at any instant. `add` silently
//! replaces an existing holder of the id and closes it; the gateway server
//! additionally rejects duplicate ids at accept time with a distinct close
//! reason, so both policies stay observable at their call sites.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::warn;

use crate::channel::Channel;

/// Thread-safe channel id -> channel index.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: DashMap<String, Arc<Channel>>,
}

impl ChannelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Inserts a channel under its id. An existing entry is evicted and
    /// closed so the id never resolves to two live connections.
    pub fn add(&self, channel: Arc<Channel>) {
        if channel.id().is_empty() {
            warn!(module = "registry", "channel id is required");
            return;
        }
        if let Some(evicted) = self
            .channels
            .insert(channel.id().to_string(), channel)
        {
            warn!(module = "registry", id = %evicted.id(), "replaced existing channel");
            let _ = evicted.close();
        }
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Channel>> {
        self.channels.remove(id).map(|(_, channel)| channel)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Channel>> {
        self.channels.get(id).map(|entry| entry.value().clone())
    }

    /// All live channels as owned handles; used by shutdown fan-out.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Channel>> {
        self.channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
