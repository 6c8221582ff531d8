//! In-process naming implementation for tests and single-host demos.
//!
//! Mirrors the backend contract the container relies on: `find` returns
//! the current set, watchers fire with the full set on every change, and
//! `subscribe` never replays the snapshot that existed at install time.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::Error;

use super::{Naming, ServiceRecord, SubscribeCallback};

#[derive(Default)]
pub struct MemoryNaming {
    /// name -> (id -> record)
    services: RwLock<HashMap<String, HashMap<String, ServiceRecord>>>,
    watchers: RwLock<HashMap<String, SubscribeCallback>>,
}

impl MemoryNaming {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self, name: &str) -> Vec<ServiceRecord> {
        self.services
            .read()
            .get(name)
            .map(|by_id| by_id.values().cloned().collect())
            .unwrap_or_default()
    }

    fn notify(&self, name: &str) {
        let callback = self.watchers.read().get(name).cloned();
        if let Some(callback) = callback {
            callback(self.snapshot(name));
        }
    }
}

#[async_trait]
impl Naming for MemoryNaming {
    async fn register(&self, service: &ServiceRecord) -> Result<(), Error> {
        debug!(module = "naming", id = %service.id, name = %service.name, "register");
        self.services
            .write()
            .entry(service.name.clone())
            .or_default()
            .insert(service.id.clone(), service.clone());
        self.notify(&service.name);
        Ok(())
    }

    async fn deregister(&self, service_id: &str) -> Result<(), Error> {
        let mut touched = None;
        {
            let mut services = self.services.write();
            for (name, by_id) in services.iter_mut() {
                if by_id.remove(service_id).is_some() {
                    touched = Some(name.clone());
                    break;
                }
            }
        }
        if let Some(name) = touched {
            debug!(module = "naming", id = %service_id, name = %name, "deregister");
            self.notify(&name);
        }
        Ok(())
    }

    async fn find(&self, name: &str, tags: &[String]) -> Result<Vec<ServiceRecord>, Error> {
        let mut records = self.snapshot(name);
        if !tags.is_empty() {
            records.retain(|record| tags.iter().all(|tag| record.tags.contains(tag)));
        }
        Ok(records)
    }

    async fn subscribe(&self, name: &str, callback: SubscribeCallback) -> Result<(), Error> {
        let mut watchers = self.watchers.write();
        if watchers.contains_key(name) {
            return Err(Error::AlreadySubscribed {
                name: name.to_string(),
            });
        }
        watchers.insert(name.to_string(), callback);
        Ok(())
    }

    async fn unsubscribe(&self, name: &str) -> Result<(), Error> {
        self.watchers.write().remove(name);
        Ok(())
    }
}
