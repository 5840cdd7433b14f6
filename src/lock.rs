//! Distributed, leased, single-holder lock persisted as a document-store
//! record. Used to serialize the import pipeline and the cleanse analysis
//! engine across concurrent process instances (§5): only the instance
//! holding the lock for a given resource may run its pipeline.

use bson::{doc, Bson};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::docstore::{Collection, DocumentStore};
use crate::errors::Error;

const COLLECTION: &str = "distributed_locks";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockDocument {
    #[serde(rename = "_id")]
    resource: String,
    holder: String,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// A held lock. Renews itself on a background heartbeat task until dropped
/// or explicitly released; `release` should be preferred so the document is
/// deleted immediately rather than left to expire.
pub struct LockGuard {
    resource: String,
    holder: String,
    collection: Arc<dyn Collection>,
    heartbeat: Option<JoinHandle<()>>,
    stop: Arc<Notify>,
}

impl LockGuard {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub async fn release(mut self) -> Result<(), Error> {
        self.stop_heartbeat();
        self.collection.delete_one(doc! { "_id": &self.resource, "holder": &self.holder }).await
    }

    fn stop_heartbeat(&mut self) {
        self.stop.notify_waiters();
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

pub struct LockService {
    collection: Arc<dyn Collection>,
    lease: Duration,
    heartbeat_interval: Duration,
}

impl LockService {
    pub fn new(store: &dyn DocumentStore, lease: Duration, heartbeat_interval: Duration) -> Self {
        Self { collection: store.collection(COLLECTION), lease, heartbeat_interval }
    }

    /// Attempts to acquire `resource`, polling every `poll_interval` until
    /// `timeout` elapses. Returns `Error::Conflict` if the resource is still
    /// held by another holder at timeout.
    pub async fn acquire(&self, resource: &str, holder: &str, timeout: Duration, poll_interval: Duration) -> Result<LockGuard, Error> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.try_acquire_once(resource, holder).await? {
                Some(guard) => return Ok(guard),
                None if tokio::time::Instant::now() >= deadline => {
                    return Err(Error::Conflict(format!("lock {resource} is held by another process")));
                }
                None => tokio::time::sleep(poll_interval).await,
            }
        }
    }

    async fn try_acquire_once(&self, resource: &str, holder: &str) -> Result<Option<LockGuard>, Error> {
        let now = Utc::now();
        let existing = self.collection.find_one(doc! { "_id": resource }).await?;

        let can_take = match existing {
            None => true,
            Some(doc) => {
                let expires_at = doc.get_datetime("expires_at").ok().map(|d| d.to_chrono()).unwrap_or(now);
                expires_at <= now
            }
        };

        if !can_take {
            return Ok(None);
        }

        let record = LockDocument { resource: resource.to_string(), holder: holder.to_string(), acquired_at: now, expires_at: now + self.lease };
        let replacement = crate::docstore::to_document(&record)?;

        // `replace_one` upserts unconditionally; a concurrent acquirer racing
        // between the expiry check above and this write may overwrite our
        // document, in which case our heartbeat simply fails to match on
        // `holder` later and we stop renewing rather than steal the lock back.
        self.collection.replace_one(doc! { "_id": resource }, replacement).await?;

        let stop = Arc::new(Notify::new());
        let heartbeat = self.spawn_heartbeat(resource.to_string(), holder.to_string(), stop.clone());

        Ok(Some(LockGuard { resource: resource.to_string(), holder: holder.to_string(), collection: self.collection.clone(), heartbeat: Some(heartbeat), stop }))
    }

    fn spawn_heartbeat(&self, resource: String, holder: String, stop: Arc<Notify>) -> JoinHandle<()> {
        let collection = self.collection.clone();
        let interval = self.heartbeat_interval;
        let lease = self.lease;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let expires_at = Utc::now() + lease;
                        let update = doc! { "$set": { "expires_at": Bson::DateTime(expires_at.into()) } };
                        if collection.update_one(doc! { "_id": &resource, "holder": &holder }, update).await.is_err() {
                            tracing::warn!(resource = %resource, "lock heartbeat failed to renew, lease may expire");
                        }
                    }
                    _ = stop.notified() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docstore::memory::InMemoryDocumentStore;

    #[tokio::test]
    async fn second_acquirer_is_rejected_while_the_lease_holds() {
        let store = InMemoryDocumentStore::new();
        let service = LockService::new(&store, Duration::from_secs(60), Duration::from_secs(30));

        let guard = service.acquire("import", "holder-a", Duration::from_millis(50), Duration::from_millis(10)).await.unwrap();
        let second = service.acquire("import", "holder-b", Duration::from_millis(50), Duration::from_millis(10)).await;
        assert!(second.is_err());

        guard.release().await.unwrap();
        let third = service.acquire("import", "holder-b", Duration::from_millis(50), Duration::from_millis(10)).await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn lock_is_reacquirable_once_the_lease_expires() {
        let store = InMemoryDocumentStore::new();
        let service = LockService::new(&store, Duration::from_millis(20), Duration::from_secs(30));

        let guard = service.acquire("cleanse-analysis", "holder-a", Duration::from_millis(50), Duration::from_millis(10)).await.unwrap();
        std::mem::forget(guard); // simulate a crashed holder that never released or renewed

        tokio::time::sleep(Duration::from_millis(40)).await;
        let reacquired = service.acquire("cleanse-analysis", "holder-b", Duration::from_millis(200), Duration::from_millis(10)).await;
        assert!(reacquired.is_ok());
    }
}
