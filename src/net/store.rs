//! Presence store
//!
//! The store is the shared rendezvous where endpoints publish their presence
//! records and learn about everyone else in their network group. A hosted
//! realtime database is the usual backing; [`MemoryPresenceStore`] keeps
//! everything in process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::identity::PeerId;
use super::presence::{GroupKey, PresenceError, PresenceRecord};
use super::transport::BoxFuture;

/// Capacity of the change broadcast. Slow subscribers skip what they missed.
const CHANGE_BUFFER: usize = 256;

/// A change observed by subscribers.
#[derive(Debug, Clone)]
pub enum PresenceChange {
    /// A record was created or refreshed.
    Published(PresenceRecord),
    /// A record was removed.
    Deleted(PeerId),
}

/// Publish/subscribe storage for presence records.
///
/// `last_heartbeat` is a local monotonic stamp. Implementations set it when a
/// record arrives (on publish, and again when a remote store's change or
/// snapshot reaches this process); a publisher's stamp is never trusted.
pub trait PresenceStore: Send + Sync + 'static {
    /// Creates or replaces the record keyed by its id, stamped on arrival.
    fn publish(&self, record: PresenceRecord) -> BoxFuture<'_, Result<(), PresenceError>>;

    /// Removes a record. Removing an unknown id is not an error.
    fn delete(&self, id: PeerId) -> BoxFuture<'_, Result<(), PresenceError>>;

    /// Current records in `group`.
    fn records(&self, group: GroupKey) -> BoxFuture<'_, Result<Vec<PresenceRecord>, PresenceError>>;

    /// Subscribes to changes in `group`. Dropping the feed unsubscribes.
    fn subscribe(&self, group: &GroupKey) -> PresenceFeed;

    /// Removes records whose last heartbeat is older than `age`.
    /// Stores with their own expiry may leave this as a no-op.
    fn purge_older_than(&self, _age: Duration) -> BoxFuture<'_, Result<usize, PresenceError>> {
        Box::pin(async { Ok(0) })
    }
}

/// Change feed for one network group.
#[derive(Debug)]
pub struct PresenceFeed {
    group: GroupKey,
    rx: broadcast::Receiver<PresenceChange>,
}

impl PresenceFeed {
    pub fn new(group: GroupKey, rx: broadcast::Receiver<PresenceChange>) -> Self {
        Self { group, rx }
    }

    pub fn group(&self) -> &GroupKey {
        &self.group
    }

    /// Next change relevant to this group. `None` once the store is gone.
    pub async fn next(&mut self) -> Option<PresenceChange> {
        loop {
            match self.rx.recv().await {
                Ok(PresenceChange::Published(record)) if record.group != self.group => continue,
                Ok(change) => return Some(change),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, group = %self.group, "Presence feed lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// In-process presence store.
#[derive(Debug)]
pub struct MemoryPresenceStore {
    records: RwLock<HashMap<PeerId, PresenceRecord>>,
    changes: broadcast::Sender<PresenceChange>,
}

impl MemoryPresenceStore {
    pub fn new() -> Arc<Self> {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Arc::new(Self {
            records: RwLock::new(HashMap::new()),
            changes,
        })
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn get(&self, id: &PeerId) -> Option<PresenceRecord> {
        self.records.read().get(id).cloned()
    }

    fn purge(&self, age: Duration) -> usize {
        let expired: Vec<PeerId> = {
            let mut records = self.records.write();
            let expired: Vec<PeerId> = records
                .values()
                .filter(|record| record.last_heartbeat.elapsed() > age)
                .map(|record| record.id)
                .collect();
            for id in &expired {
                records.remove(id);
            }
            expired
        };

        for id in &expired {
            debug!(peer = %id.short(), "Purged expired presence record");
            let _ = self.changes.send(PresenceChange::Deleted(*id));
        }
        expired.len()
    }
}

impl PresenceStore for MemoryPresenceStore {
    fn publish(&self, mut record: PresenceRecord) -> BoxFuture<'_, Result<(), PresenceError>> {
        record.last_heartbeat = Instant::now();
        trace!(peer = %record.id.short(), status = ?record.status, "Publishing presence");
        self.records.write().insert(record.id, record.clone());
        // No subscribers is fine.
        let _ = self.changes.send(PresenceChange::Published(record));
        Box::pin(async { Ok(()) })
    }

    fn delete(&self, id: PeerId) -> BoxFuture<'_, Result<(), PresenceError>> {
        if self.records.write().remove(&id).is_some() {
            let _ = self.changes.send(PresenceChange::Deleted(id));
        }
        Box::pin(async { Ok(()) })
    }

    fn records(
        &self,
        group: GroupKey,
    ) -> BoxFuture<'_, Result<Vec<PresenceRecord>, PresenceError>> {
        let records = self
            .records
            .read()
            .values()
            .filter(|record| record.group == group)
            .cloned()
            .collect();
        Box::pin(async { Ok(records) })
    }

    fn subscribe(&self, group: &GroupKey) -> PresenceFeed {
        PresenceFeed::new(group.clone(), self.changes.subscribe())
    }

    fn purge_older_than(&self, age: Duration) -> BoxFuture<'_, Result<usize, PresenceError>> {
        let purged = self.purge(age);
        Box::pin(async move { Ok(purged) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::presence::PresenceStatus;
    use tokio::time::Instant;

    fn record(group: &str) -> PresenceRecord {
        PresenceRecord {
            id: PeerId::random(),
            display_name: Arc::from("Calm Lake"),
            group: GroupKey::new(group),
            status: PresenceStatus::Online,
            last_heartbeat: Instant::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_replaces_record() {
        let store = MemoryPresenceStore::new();
        let mut rec = record("10.0.0");
        store.publish(rec.clone()).await.unwrap();
        rec.status = PresenceStatus::Busy;
        store.publish(rec.clone()).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&rec.id).unwrap().status, PresenceStatus::Busy);
    }

    #[tokio::test]
    async fn test_records_filtered_by_group() {
        let store = MemoryPresenceStore::new();
        store.publish(record("10.0.0")).await.unwrap();
        store.publish(record("10.0.0")).await.unwrap();
        store.publish(record("10.0.1")).await.unwrap();

        assert_eq!(store.records(GroupKey::new("10.0.0")).await.unwrap().len(), 2);
        assert_eq!(store.records(GroupKey::new("10.0.1")).await.unwrap().len(), 1);
        assert!(store.records(GroupKey::new("10.9.9")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_feed_only_sees_own_group() {
        let store = MemoryPresenceStore::new();
        let mut feed = store.subscribe(&GroupKey::new("10.0.0"));

        let other = record("10.0.1");
        let mine = record("10.0.0");
        store.publish(other).await.unwrap();
        store.publish(mine.clone()).await.unwrap();
        store.delete(mine.id).await.unwrap();

        match feed.next().await {
            Some(PresenceChange::Published(seen)) => assert_eq!(seen.id, mine.id),
            other => panic!("unexpected change: {:?}", other),
        }
        assert!(matches!(feed.next().await, Some(PresenceChange::Deleted(id)) if id == mine.id));
    }

    #[tokio::test]
    async fn test_delete_unknown_is_silent() {
        let store = MemoryPresenceStore::new();
        store.delete(PeerId::random()).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_stamps_arrival_time() {
        let store = MemoryPresenceStore::new();
        let late = record("10.0.0");
        tokio::time::advance(Duration::from_secs(90)).await;

        store.publish(late.clone()).await.unwrap();

        let stored = store.get(&late.id).unwrap();
        assert!(stored.last_heartbeat > late.last_heartbeat);
        assert!(stored.is_fresh(Duration::from_secs(15)));
        assert_eq!(store.purge_older_than(Duration::from_secs(60)).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_drops_dead_records_only() {
        let store = MemoryPresenceStore::new();
        let old = record("10.0.0");
        store.publish(old.clone()).await.unwrap();

        tokio::time::advance(Duration::from_secs(50)).await;
        let fresh = record("10.0.0");
        store.publish(fresh.clone()).await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;

        assert_eq!(store.purge_older_than(Duration::from_secs(60)).await.unwrap(), 1);
        assert!(store.get(&old.id).is_none());
        assert!(store.get(&fresh.id).is_some());
    }
}
