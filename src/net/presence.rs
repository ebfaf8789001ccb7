//! Presence and peer discovery
//!
//! Every endpoint publishes a presence record to a shared [`PresenceStore`]
//! and refreshes it with a heartbeat. Endpoints only see each other when they
//! share a network group key, which is derived from the local address by a
//! pluggable [`NetworkIdentifier`] (the routing prefix of the LAN address by
//! default).
//!
//! A record counts as present while its last heartbeat is younger than the
//! presence timeout (15 s by default). Snapshots are handed out as owned
//! [`Peer`] values; the registry's own view is only changed by the store's
//! change feed.

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::identity::{DeviceIdentity, PeerId};
use super::store::{PresenceChange, PresenceFeed, PresenceStore};
use super::transport::{BoxFuture, PeerTransport};

/// Default interval between heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Default age after which a silent peer is no longer visible.
pub const DEFAULT_PRESENCE_TIMEOUT: Duration = Duration::from_secs(15);

/// Default time allowed for resolving the group key.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default poll interval of [`PresenceRegistry::watch`].
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(1);

/// Address used to pick the outbound interface. Nothing is sent to it.
pub const DEFAULT_PROBE_TARGET: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 80);

/// Errors raised by the presence layer
#[derive(Error, Debug, Clone)]
pub enum PresenceError {
    #[error("network probe failed: {0}")]
    ProbeFailed(Arc<str>),

    #[error("presence store error: {0}")]
    Store(Arc<str>),
}

/// Key shared by endpoints on the same local network.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey(Arc<str>);

impl GroupKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    /// Routing prefix of `ip`: three octets for IPv4, four hextets for IPv6.
    pub fn from_ip(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => {
                let [a, b, c, _] = v4.octets();
                Self::new(format!("{a}.{b}.{c}"))
            }
            IpAddr::V6(v6) => {
                let s = v6.segments();
                Self::new(format!("{:x}:{:x}:{:x}:{:x}", s[0], s[1], s[2], s[3]))
            }
        }
    }

    /// A random key only this process will use.
    pub fn session_fallback() -> Self {
        let suffix: u64 = rand::thread_rng().gen();
        Self::new(format!("session-{suffix:016x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Advisory availability of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresenceStatus {
    Online,
    Busy,
    Offline,
}

/// One endpoint's presence, as stored and as handed to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub id: PeerId,
    pub display_name: Arc<str>,
    pub group: GroupKey,
    pub status: PresenceStatus,
    /// When the record last reached this process, on the local monotonic
    /// clock. Stores stamp it on arrival, so it is never compared across
    /// devices.
    pub last_heartbeat: Instant,
}

impl PresenceRecord {
    /// Whether the record was refreshed within `timeout`.
    #[inline]
    pub fn is_fresh(&self, timeout: Duration) -> bool {
        self.last_heartbeat.elapsed() < timeout
    }
}

/// A discovered peer.
pub type Peer = PresenceRecord;

/// Events emitted by [`PresenceRegistry::watch`].
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A peer became visible.
    Discovered(Peer),
    /// A peer is no longer visible.
    Lost(PeerId),
}

/// Strategy deciding which network group this endpoint belongs to.
pub trait NetworkIdentifier: Send + Sync {
    fn group_key(&self) -> BoxFuture<'_, Result<GroupKey, PresenceError>>;
}

/// Derives the group from the address the transport reports.
pub struct LocalAddrIdentifier {
    transport: Arc<dyn PeerTransport>,
}

impl LocalAddrIdentifier {
    pub fn new(transport: Arc<dyn PeerTransport>) -> Self {
        Self { transport }
    }
}

impl NetworkIdentifier for LocalAddrIdentifier {
    fn group_key(&self) -> BoxFuture<'_, Result<GroupKey, PresenceError>> {
        Box::pin(async move {
            let ip = self
                .transport
                .local_addr()
                .await
                .map_err(|e| PresenceError::ProbeFailed(Arc::from(e.to_string())))?;
            Ok(GroupKey::from_ip(ip))
        })
    }
}

/// Derives the group from the interface the OS would route `target` through.
#[derive(Debug, Clone)]
pub struct UdpProbeIdentifier {
    target: SocketAddr,
}

impl UdpProbeIdentifier {
    pub fn new(target: SocketAddr) -> Self {
        Self { target }
    }
}

impl Default for UdpProbeIdentifier {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TARGET)
    }
}

impl NetworkIdentifier for UdpProbeIdentifier {
    fn group_key(&self) -> BoxFuture<'_, Result<GroupKey, PresenceError>> {
        Box::pin(async move {
            let probe_failed =
                |e: std::io::Error| PresenceError::ProbeFailed(Arc::from(e.to_string()));

            let bind: SocketAddr = match self.target {
                SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
                SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
            };
            let socket = UdpSocket::bind(bind).await.map_err(probe_failed)?;
            // Connecting a UDP socket only selects a route.
            socket.connect(self.target).await.map_err(probe_failed)?;
            let local = socket.local_addr().map_err(probe_failed)?;

            if local.ip().is_unspecified() {
                return Err(PresenceError::ProbeFailed(Arc::from("no route to probe target")));
            }
            Ok(GroupKey::from_ip(local.ip()))
        })
    }
}

/// Always answers the same key.
#[derive(Debug, Clone)]
pub struct StaticIdentifier(pub GroupKey);

impl NetworkIdentifier for StaticIdentifier {
    fn group_key(&self) -> BoxFuture<'_, Result<GroupKey, PresenceError>> {
        let key = self.0.clone();
        Box::pin(async move { Ok(key) })
    }
}

/// Presence timing
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub heartbeat_interval: Duration,
    pub presence_timeout: Duration,
    pub probe_timeout: Duration,
    pub watch_interval: Duration,
}

impl PresenceConfig {
    /// How long dead records are kept in the store.
    pub fn retention(&self) -> Duration {
        self.presence_timeout * 4
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            presence_timeout: DEFAULT_PRESENCE_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            watch_interval: DEFAULT_WATCH_INTERVAL,
        }
    }
}

struct RegistryInner {
    id: PeerId,
    display_name: RwLock<Arc<str>>,
    status: RwLock<PresenceStatus>,
    group: GroupKey,
    degraded: bool,
    store: Arc<dyn PresenceStore>,
    view: DashMap<PeerId, PresenceRecord>,
    config: PresenceConfig,
    cancel: CancellationToken,
    stopped: AtomicBool,
}

impl RegistryInner {
    fn record(&self) -> PresenceRecord {
        PresenceRecord {
            id: self.id,
            display_name: self.display_name.read().clone(),
            group: self.group.clone(),
            status: *self.status.read(),
            last_heartbeat: Instant::now(),
        }
    }

    async fn publish(&self) -> Result<(), PresenceError> {
        self.store.publish(self.record()).await
    }

    fn apply(&self, change: PresenceChange) {
        match change {
            PresenceChange::Published(record) => {
                if record.id != self.id && record.group == self.group {
                    self.view.insert(record.id, record);
                }
            }
            PresenceChange::Deleted(id) => {
                self.view.remove(&id);
            }
        }
    }

    fn visible(&self) -> Vec<Peer> {
        let timeout = self.config.presence_timeout;
        let mut peers: Vec<Peer> = self
            .view
            .iter()
            .filter(|entry| entry.status != PresenceStatus::Offline && entry.is_fresh(timeout))
            .map(|entry| entry.value().clone())
            .collect();
        peers.sort_by(|a, b| a.display_name.cmp(&b.display_name).then(a.id.cmp(&b.id)));
        peers
    }

    fn prune_view(&self) {
        let retention = self.config.retention();
        self.view.retain(|_, record| record.last_heartbeat.elapsed() <= retention);
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Publishes this endpoint's presence and tracks peers in the same group.
///
/// Cloning is cheap. Background tasks stop on [`PresenceRegistry::stop`] or
/// when the last clone is dropped.
#[derive(Clone)]
pub struct PresenceRegistry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for PresenceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresenceRegistry")
            .field("id", &self.inner.id)
            .field("group", &self.inner.group)
            .field("degraded", &self.inner.degraded)
            .finish_non_exhaustive()
    }
}

impl PresenceRegistry {
    /// Resolves the network group, publishes this endpoint and starts the
    /// heartbeat.
    ///
    /// A failing or slow probe does not fail startup: the registry falls back
    /// to a session-scoped group and reports itself as degraded.
    #[instrument(skip_all, fields(device = %identity.id.short()))]
    pub async fn start(
        identity: &DeviceIdentity,
        identifier: &dyn NetworkIdentifier,
        store: Arc<dyn PresenceStore>,
        config: PresenceConfig,
    ) -> Result<Self, PresenceError> {
        let probe = tokio::time::timeout(config.probe_timeout, identifier.group_key()).await;
        let (group, degraded) = match probe {
            Ok(Ok(group)) => (group, false),
            Ok(Err(e)) => {
                warn!(error = %e, "PresenceProbeFailed: using a session-scoped group");
                (GroupKey::session_fallback(), true)
            }
            Err(_) => {
                warn!(timeout = ?config.probe_timeout, "PresenceProbeFailed: probe timed out, using a session-scoped group");
                (GroupKey::session_fallback(), true)
            }
        };

        let feed = store.subscribe(&group);
        let inner = Arc::new(RegistryInner {
            id: identity.id,
            display_name: RwLock::new(Arc::from(identity.display_name.as_str())),
            status: RwLock::new(PresenceStatus::Online),
            group,
            degraded,
            store,
            view: DashMap::new(),
            config,
            cancel: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        });

        for record in inner.store.records(inner.group.clone()).await? {
            inner.apply(PresenceChange::Published(record));
        }
        inner.publish().await?;

        tokio::spawn(follow_feed(Arc::downgrade(&inner), feed, inner.cancel.clone()));
        tokio::spawn(heartbeat(
            Arc::downgrade(&inner),
            inner.config.heartbeat_interval,
            inner.cancel.clone(),
        ));

        info!(group = %inner.group, degraded, "Presence registry started");
        Ok(Self { inner })
    }

    #[inline]
    pub fn local_id(&self) -> PeerId {
        self.inner.id
    }

    pub fn display_name(&self) -> Arc<str> {
        self.inner.display_name.read().clone()
    }

    pub fn status(&self) -> PresenceStatus {
        *self.inner.status.read()
    }

    pub fn group_key(&self) -> &GroupKey {
        &self.inner.group
    }

    /// Whether the group key is a session fallback.
    pub fn is_degraded(&self) -> bool {
        self.inner.degraded
    }

    /// Peers in the same group that heartbeated within the presence timeout.
    pub fn discover(&self) -> Vec<Peer> {
        self.inner.visible()
    }

    /// The visible peer with `id`, if any.
    pub fn peer(&self, id: PeerId) -> Option<Peer> {
        self.inner
            .view
            .get(&id)
            .filter(|record| {
                record.status != PresenceStatus::Offline
                    && record.is_fresh(self.inner.config.presence_timeout)
            })
            .map(|record| record.value().clone())
    }

    /// Streams discovered/lost events by diffing [`Self::discover`] once per
    /// watch interval.
    pub fn watch(&self) -> mpsc::Receiver<PeerEvent> {
        let (tx, rx) = mpsc::channel(128);
        let registry = Arc::downgrade(&self.inner);
        let cancel = self.inner.cancel.clone();
        let period = self.inner.config.watch_interval;

        tokio::spawn(async move {
            let mut known: HashSet<PeerId> = HashSet::new();
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(inner) = registry.upgrade() else { break };
                let current = inner.visible();
                drop(inner);

                let ids: HashSet<PeerId> = current.iter().map(|peer| peer.id).collect();

                for peer in current {
                    if known.contains(&peer.id) {
                        continue;
                    }
                    if tx.send(PeerEvent::Discovered(peer)).await.is_err() {
                        return;
                    }
                }
                for &id in known.difference(&ids) {
                    if tx.send(PeerEvent::Lost(id)).await.is_err() {
                        return;
                    }
                }

                known = ids;
            }
        });

        rx
    }

    /// Changes the advisory status and republishes immediately.
    pub async fn set_status(&self, status: PresenceStatus) -> Result<(), PresenceError> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Ok(());
        }
        let changed = {
            let mut current = self.inner.status.write();
            std::mem::replace(&mut *current, status) != status
        };
        if changed {
            debug!(status = ?status, "Presence status changed");
        }
        self.inner.publish().await
    }

    /// Renames this endpoint and republishes immediately.
    pub async fn set_display_name(&self, name: &str) -> Result<(), PresenceError> {
        *self.inner.display_name.write() = Arc::from(name);
        if self.inner.stopped.load(Ordering::Acquire) {
            return Ok(());
        }
        info!(name, "Display name changed");
        self.inner.publish().await
    }

    /// Stops the heartbeat, announces `Offline` and removes the record.
    /// Calling it again does nothing.
    #[instrument(skip(self), fields(device = %self.inner.id.short()))]
    pub async fn stop(&self) -> Result<(), PresenceError> {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.cancel.cancel();

        *self.inner.status.write() = PresenceStatus::Offline;
        let offline = self.inner.publish().await;
        let deleted = self.inner.store.delete(self.inner.id).await;
        self.inner.view.clear();

        info!("Presence registry stopped");
        offline.and(deleted)
    }
}

async fn follow_feed(
    registry: Weak<RegistryInner>,
    mut feed: PresenceFeed,
    cancel: CancellationToken,
) {
    loop {
        let change = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            change = feed.next() => change,
        };
        let Some(change) = change else { break };
        let Some(inner) = registry.upgrade() else { break };
        inner.apply(change);
    }
    debug!(group = %feed.group(), "Presence feed closed");
}

async fn heartbeat(registry: Weak<RegistryInner>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let Some(inner) = registry.upgrade() else { break };
        if let Err(e) = inner.publish().await {
            warn!(error = %e, "Heartbeat publish failed");
        }
        match inner.store.purge_older_than(inner.config.retention()).await {
            Ok(0) => {}
            Ok(purged) => debug!(purged, "Purged dead presence records"),
            Err(e) => warn!(error = %e, "Presence purge failed"),
        }
        inner.prune_view();
    }
}
