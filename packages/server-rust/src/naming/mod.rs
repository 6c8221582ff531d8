//! Service discovery abstraction.
//!
//! The concrete backend (consul or similar) lives outside this crate; the
//! container only needs registration, point-in-time lookup, and a watch
//! that delivers batches of currently-healthy services on change. A
//! subscribe does NOT replay the current snapshot — implementations prime
//! their watch cursor silently, and callers pair `subscribe` with an
//! explicit `find` to seed initial state without duplicate callbacks.

pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub use memory::MemoryNaming;

/// One discovered (or registered) service instance.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    /// Wire profile: `tcp` for peer links, `ws` for client edges.
    pub protocol: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub meta: HashMap<String, String>,
}

impl ServiceRecord {
    #[must_use]
    pub fn new(id: &str, name: &str, protocol: &str, address: &str, port: u16) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            protocol: protocol.to_string(),
            address: address.to_string(),
            port,
            tags: Vec::new(),
            meta: HashMap::new(),
        }
    }

    /// Address a dialer connects to: bare `host:port` for tcp, a URL for
    /// everything else.
    #[must_use]
    pub fn dial_url(&self) -> String {
        if self.protocol == skein_core::wire::PROTOCOL_TCP {
            format!("{}:{}", self.address, self.port)
        } else {
            format!("{}://{}:{}", self.protocol, self.address, self.port)
        }
    }
}

/// Watch callback: receives the full healthy set for the watched name.
pub type SubscribeCallback = Arc<dyn Fn(Vec<ServiceRecord>) + Send + Sync>;

/// Naming service contract.
#[async_trait]
pub trait Naming: Send + Sync {
    async fn register(&self, service: &ServiceRecord) -> Result<(), Error>;
    async fn deregister(&self, service_id: &str) -> Result<(), Error>;
    /// Point-in-time lookup; `tags` must all be present on a returned
    /// record.
    async fn find(&self, name: &str, tags: &[String]) -> Result<Vec<ServiceRecord>, Error>;
    /// Installs a watcher. At most one per name; fails with
    /// `Error::AlreadySubscribed` on a second install.
    async fn subscribe(&self, name: &str, callback: SubscribeCallback) -> Result<(), Error>;
    async fn unsubscribe(&self, name: &str) -> Result<(), Error>;
}
