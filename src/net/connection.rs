//! Connection management
//!
//! The [`ConnectionManager`] owns every transport link this endpoint has.
//! Links are wrapped in [`Channel`]s and pooled, one per peer:
//!
//! - outbound channels are created by [`ConnectionManager::connect`], which
//!   reuses an open channel, joins an attempt already in flight, or opens a
//!   new link and waits for it with a timeout
//! - inbound channels arrive through the transport and are pooled the same
//!   way by the accept loop started with [`ConnectionManager::start`]
//! - a close or error signal evicts the channel exactly once; eviction
//!   compares connection ids so a late signal from an old link never removes
//!   its replacement
//! - idle channels are reaped by [`ConnectionManager::cleanup_stale`]
//!
//! Each channel runs one dispatcher task that decodes frames in arrival
//! order and routes them by transfer id to the session that subscribed to
//! them. A `Request` for an unknown transfer id opens a new route and is
//! queued as an [`InboundRequest`]; anything else for an unknown id is
//! dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use super::identity::PeerId;
use super::transport::{LinkEvent, LinkSink, PeerTransport, TransportError, TransportLink};
use super::wire::{FileMetadata, Message, TransferId, WireError};

/// Default budget callers give a whole `connect` call.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time a single link is given to open.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Default idle time after which a pooled channel is reaped.
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(60);

/// Default interval of the background stale-channel sweep.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(15);

/// Default capacity of the incoming request queue.
pub const DEFAULT_REQUEST_QUEUE_CAPACITY: usize = 32;

/// Label given to every link opened by this crate.
const CHANNEL_LABEL: &str = "lanbeam-transfer";

/// Errors that can occur while managing channels
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    #[error("connection to {peer} timed out after {after:?}")]
    Timeout { peer: PeerId, after: Duration },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("channel to {0} is closed")]
    Closed(PeerId),

    #[error("{0} already has a subscriber on this channel")]
    AlreadySubscribed(TransferId),

    #[error("failed to encode message: {0}")]
    Encode(#[from] WireError),

    #[error("connection manager has been shut down")]
    Shutdown,
}

/// Lifecycle of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
    Failed,
}

impl ChannelState {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Failed)
    }
}

/// Who opened the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    Outbound,
    Inbound,
}

/// How to drive attempts towards several peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FanOut {
    /// One peer at a time.
    #[default]
    Sequential,
    /// All peers at once.
    Parallel,
}

/// Callback invoked once per inbound channel that opens.
pub type OnIncoming = Arc<dyn Fn(PeerId) + Send + Sync + 'static>;

/// A pooled link to one peer.
pub struct Channel {
    peer_id: PeerId,
    connection_id: u64,
    direction: LinkDirection,
    sink: Arc<dyn LinkSink>,
    state: watch::Sender<ChannelState>,
    last_activity: Mutex<Instant>,
    routes: Mutex<HashMap<TransferId, mpsc::UnboundedSender<Message>>>,
    stray_messages: AtomicU64,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("peer_id", &self.peer_id)
            .field("connection_id", &self.connection_id)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Channel {
    fn new(
        peer_id: PeerId,
        connection_id: u64,
        direction: LinkDirection,
        sink: Arc<dyn LinkSink>,
    ) -> Self {
        let (state, _) = watch::channel(ChannelState::Connecting);
        Self {
            peer_id,
            connection_id,
            direction,
            sink,
            state,
            last_activity: Mutex::new(Instant::now()),
            routes: Mutex::new(HashMap::new()),
            stray_messages: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    #[inline]
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    #[inline]
    pub fn direction(&self) -> LinkDirection {
        self.direction
    }

    #[inline]
    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity().elapsed()
    }

    /// Marks the channel as active now.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Number of messages dropped because no session owned their transfer id.
    pub fn stray_messages(&self) -> u64 {
        self.stray_messages.load(Ordering::Relaxed)
    }

    /// Number of sessions currently subscribed to this channel.
    pub fn active_sessions(&self) -> usize {
        self.routes.lock().len()
    }

    /// Encodes and queues a message.
    pub fn send(&self, message: &Message) -> Result<(), ConnectionError> {
        if self.state().is_terminal() {
            return Err(ConnectionError::Closed(self.peer_id));
        }
        let frame = message.encode()?;
        self.sink
            .send(frame)
            .map_err(|_| ConnectionError::Closed(self.peer_id))?;
        self.touch();
        trace!(peer = %self.peer_id.short(), transfer_id = %message.transfer_id(), kind = ?message.kind(), "Sent message");
        Ok(())
    }

    /// Registers a session for `transfer_id`. Messages for that id are
    /// delivered to the returned subscription until it is dropped.
    pub fn subscribe(
        self: &Arc<Self>,
        transfer_id: TransferId,
    ) -> Result<Subscription, ConnectionError> {
        let mut routes = self.routes.lock();
        if self.state().is_terminal() {
            return Err(ConnectionError::Closed(self.peer_id));
        }
        if routes.contains_key(&transfer_id) {
            return Err(ConnectionError::AlreadySubscribed(transfer_id));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        routes.insert(transfer_id, tx);
        drop(routes);

        Ok(Subscription {
            channel: Arc::clone(self),
            transfer_id,
            rx,
        })
    }

    /// Closes the link once every queued message has been flushed.
    pub fn close(&self) {
        self.sink.close();
    }

    async fn wait_open(&self, timeout: Duration) -> Result<(), ConnectionError> {
        let mut rx = self.state.subscribe();
        let waited =
            tokio::time::timeout(timeout, rx.wait_for(|s| *s != ChannelState::Connecting)).await;
        match waited {
            Ok(Ok(state)) if *state == ChannelState::Open => Ok(()),
            Ok(_) => Err(ConnectionError::Closed(self.peer_id)),
            Err(_) => Err(ConnectionError::Timeout {
                peer: self.peer_id,
                after: timeout,
            }),
        }
    }

    fn mark_open(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ChannelState::Connecting {
                *state = ChannelState::Open;
                true
            } else {
                false
            }
        })
    }

    fn mark_terminal(&self, terminal: ChannelState) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = terminal;
                true
            }
        })
    }
}

/// A session's view of one channel: the messages addressed to its transfer
/// id. Dropping the subscription unregisters it.
pub struct Subscription {
    channel: Arc<Channel>,
    transfer_id: TransferId,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("transfer_id", &self.transfer_id)
            .field("peer_id", &self.channel.peer_id)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    #[inline]
    pub fn transfer_id(&self) -> TransferId {
        self.transfer_id
    }

    #[inline]
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Waits for the next message. `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Message, TryRecvError> {
        self.rx.try_recv()
    }

    /// Sends a message on the underlying channel.
    pub fn send(&self, message: &Message) -> Result<(), ConnectionError> {
        self.channel.send(message)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.channel.routes.lock().remove(&self.transfer_id);
    }
}

/// A transfer request received from a peer, already bound to its own
/// subscription so no later message for the transfer is lost.
#[derive(Debug)]
pub struct InboundRequest {
    pub peer_id: PeerId,
    pub transfer_id: TransferId,
    pub metadata: FileMetadata,
    pub total_chunks: u32,
    pub subscription: Subscription,
}

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Channels that are open
    pub open: usize,
    /// Channels still waiting for the transport
    pub connecting: usize,
    /// Total evictions since start
    pub evictions: u64,
}

/// Configuration for the connection manager
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Time a single link is given to open, capped by the caller's timeout
    pub open_timeout: Duration,
    /// Idle time after which a channel is reaped
    pub max_idle: Duration,
    /// Interval of the background sweep
    pub cleanup_interval: Duration,
    /// Capacity of the incoming request queue
    pub request_queue_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            max_idle: DEFAULT_MAX_IDLE,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            request_queue_capacity: DEFAULT_REQUEST_QUEUE_CAPACITY,
        }
    }
}

/// State shared between the manager and the dispatcher tasks.
struct Shared {
    pool: DashMap<PeerId, Arc<Channel>>,
    /// Live channels that lost their pool slot to another link to the same
    /// peer. They keep serving their sessions until released or reaped.
    detached: DashMap<u64, Arc<Channel>>,
    requests: mpsc::Sender<InboundRequest>,
    on_incoming: RwLock<Option<OnIncoming>>,
    evictions: AtomicU64,
    next_connection_id: AtomicU64,
}

impl Shared {
    fn new_channel(
        &self,
        peer_id: PeerId,
        sink: Arc<dyn LinkSink>,
        direction: LinkDirection,
    ) -> Arc<Channel> {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        Arc::new(Channel::new(peer_id, connection_id, direction, sink))
    }

    fn is_pooled(&self, channel: &Channel) -> bool {
        self.pool
            .get(&channel.peer_id)
            .is_some_and(|pooled| pooled.connection_id == channel.connection_id)
    }

    fn detach(&self, channel: Arc<Channel>) {
        if !channel.state().is_terminal() {
            self.detached.insert(channel.connection_id, channel);
        }
    }

    fn spawn_dispatcher(
        self: &Arc<Self>,
        channel: Arc<Channel>,
        events: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            shared.dispatch(channel, events).await;
        });
    }

    async fn dispatch(
        &self,
        channel: Arc<Channel>,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        let peer = channel.peer_id.short();
        let final_state = loop {
            let Some(event) = events.recv().await else {
                break ChannelState::Closed;
            };
            match event {
                LinkEvent::Open => {
                    if channel.mark_open() {
                        channel.touch();
                        debug!(peer = %peer, connection_id = channel.connection_id, direction = ?channel.direction, "Channel open");
                        if channel.direction == LinkDirection::Inbound {
                            let callback = self.on_incoming.read().clone();
                            if let Some(callback) = callback {
                                callback(channel.peer_id);
                            }
                        }
                    }
                }
                LinkEvent::Message(frame) => {
                    channel.touch();
                    match Message::decode(frame) {
                        Ok(message) => self.route(&channel, message),
                        Err(e) => warn!(peer = %peer, error = %e, "Dropping undecodable frame"),
                    }
                }
                LinkEvent::Close => break ChannelState::Closed,
                LinkEvent::Error(reason) => {
                    warn!(peer = %peer, reason = %reason, "Channel error");
                    break ChannelState::Failed;
                }
            }
        };

        self.evict(&channel, final_state);
    }

    fn route(&self, channel: &Arc<Channel>, message: Message) {
        let transfer_id = message.transfer_id();
        let mut routes = channel.routes.lock();

        if let Some(tx) = routes.get(&transfer_id) {
            if tx.send(message).is_err() {
                routes.remove(&transfer_id);
            }
            return;
        }

        match message {
            Message::Request {
                transfer_id,
                metadata,
                total_chunks,
            } => {
                let (tx, rx) = mpsc::unbounded_channel();
                routes.insert(transfer_id, tx);
                drop(routes);

                info!(
                    peer = %channel.peer_id.short(),
                    transfer_id = %transfer_id,
                    file_name = %metadata.name,
                    size = metadata.size,
                    "Incoming transfer request"
                );

                let request = InboundRequest {
                    peer_id: channel.peer_id,
                    transfer_id,
                    metadata,
                    total_chunks,
                    subscription: Subscription {
                        channel: Arc::clone(channel),
                        transfer_id,
                        rx,
                    },
                };

                if let Err(e) = self.requests.try_send(request) {
                    let request = match e {
                        mpsc::error::TrySendError::Full(request)
                        | mpsc::error::TrySendError::Closed(request) => request,
                    };
                    warn!(transfer_id = %transfer_id, "No room for incoming request, rejecting");
                    let _ = request.subscription.send(&Message::Reject { transfer_id });
                }
            }
            other => {
                channel.stray_messages.fetch_add(1, Ordering::Relaxed);
                debug!(
                    peer = %channel.peer_id.short(),
                    transfer_id = %transfer_id,
                    kind = ?other.kind(),
                    "Dropping message for unknown transfer"
                );
            }
        }
    }

    /// Moves the channel to a terminal state and removes it from the pool.
    /// Safe to call any number of times; returns true only for the call that
    /// removed the pool entry.
    fn evict(&self, channel: &Arc<Channel>, terminal: ChannelState) -> bool {
        channel.mark_terminal(terminal);
        channel.routes.lock().clear();
        channel.sink.close();

        self.detached.remove(&channel.connection_id);
        let removed = self
            .pool
            .remove_if(&channel.peer_id, |_, pooled| {
                pooled.connection_id == channel.connection_id
            })
            .is_some();

        if removed {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(
                peer = %channel.peer_id.short(),
                connection_id = channel.connection_id,
                state = ?channel.state(),
                "Channel evicted"
            );
        }
        removed
    }
}

struct ManagerInner {
    transport: Arc<dyn PeerTransport>,
    shared: Arc<Shared>,
    requests: AsyncMutex<mpsc::Receiver<InboundRequest>>,
    config: ConnectionConfig,
    cancel: CancellationToken,
    started: AtomicBool,
}

/// Owns the pool of peer channels.
///
/// Cloning is cheap; every clone drives the same pool.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("local_id", &self.inner.transport.local_id())
            .field("pooled", &self.inner.shared.pool.len())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn PeerTransport>, config: ConnectionConfig) -> Self {
        let (requests_tx, requests_rx) = mpsc::channel(config.request_queue_capacity.max(1));
        let shared = Arc::new(Shared {
            pool: DashMap::new(),
            detached: DashMap::new(),
            requests: requests_tx,
            on_incoming: RwLock::new(None),
            evictions: AtomicU64::new(0),
            next_connection_id: AtomicU64::new(1),
        });

        Self {
            inner: Arc::new(ManagerInner {
                transport,
                shared,
                requests: AsyncMutex::new(requests_rx),
                config,
                cancel: CancellationToken::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// The local endpoint's id.
    pub fn local_id(&self) -> PeerId {
        self.inner.transport.local_id()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Spawns the inbound accept loop and the periodic stale sweep.
    /// Calling it more than once has no effect.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }

        match self.inner.transport.take_incoming() {
            Some(mut incoming) => {
                let shared = Arc::clone(&self.inner.shared);
                let cancel = self.inner.cancel.clone();
                let local_id = self.local_id();
                tokio::spawn(async move {
                    debug!("Accept loop started");
                    loop {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break,
                            link = incoming.recv() => match link {
                                Some(link) => {
                                    Self::adopt_inbound(&shared, local_id, link.peer_id, link.link)
                                }
                                None => break,
                            },
                        }
                    }
                    debug!("Accept loop stopped");
                });
            }
            None => warn!("Incoming links already taken; inbound channels will not be accepted"),
        }

        let this = self.clone();
        tokio::spawn(async move {
            this.run_maintenance().await;
        });
    }

    /// Periodically reaps idle channels until shutdown.
    pub async fn run_maintenance(&self) {
        let period = self.inner.config.cleanup_interval;
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => break,
                _ = interval.tick() => {
                    let reaped = self.cleanup_stale(self.inner.config.max_idle);
                    if reaped > 0 {
                        debug!(reaped, "Reaped idle channels");
                    }
                }
            }
        }
    }

    /// Registers the callback invoked when an inbound channel opens.
    pub fn set_on_incoming(&self, callback: OnIncoming) {
        *self.inner.shared.on_incoming.write() = Some(callback);
    }

    /// Pools an inbound link. When both ends dial each other at once, both
    /// pools settle on the link opened by the lower peer id; the other link
    /// is detached, never closed, so the attempt waiting on it still succeeds.
    fn adopt_inbound(shared: &Arc<Shared>, local_id: PeerId, peer_id: PeerId, link: TransportLink) {
        let channel = shared.new_channel(peer_id, link.sink, LinkDirection::Inbound);

        match shared.pool.entry(peer_id) {
            Entry::Occupied(mut entry) => {
                let current = entry.get();
                let keep_outbound = local_id < peer_id
                    && current.direction == LinkDirection::Outbound
                    && !current.state().is_terminal();

                if keep_outbound {
                    debug!(peer = %peer_id.short(), "Crossed connect, keeping own outbound channel");
                    shared.detach(Arc::clone(&channel));
                } else {
                    let previous = entry.insert(Arc::clone(&channel));
                    debug!(
                        peer = %peer_id.short(),
                        replaced = previous.connection_id,
                        "Inbound channel takes over pool slot"
                    );
                    shared.detach(previous);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&channel));
            }
        }

        shared.spawn_dispatcher(channel, link.events);
    }

    /// Returns an open channel to `peer_id`, opening one if needed.
    #[instrument(skip(self), fields(peer = %peer_id.short()))]
    pub async fn connect(
        &self,
        peer_id: PeerId,
        timeout: Duration,
    ) -> Result<Arc<Channel>, ConnectionError> {
        if self.inner.cancel.is_cancelled() {
            return Err(ConnectionError::Shutdown);
        }
        let shared = &self.inner.shared;

        let (channel, events) = match shared.pool.entry(peer_id) {
            Entry::Occupied(entry) if !entry.get().state().is_terminal() => {
                let channel = Arc::clone(entry.get());
                if channel.is_open() {
                    debug!("Reusing pooled channel");
                    return Ok(channel);
                }
                debug!("Joining in-flight connection attempt");
                (channel, None)
            }
            entry => {
                let link = self.inner.transport.open(peer_id, CHANNEL_LABEL)?;
                let channel = shared.new_channel(peer_id, link.sink, LinkDirection::Outbound);
                entry.insert(Arc::clone(&channel));
                debug!(connection_id = channel.connection_id, "Opening new channel");
                (channel, Some(link.events))
            }
        };

        if let Some(events) = events {
            shared.spawn_dispatcher(Arc::clone(&channel), events);
        }

        match channel.wait_open(timeout.min(self.inner.config.open_timeout)).await {
            Ok(()) => {
                info!("Connected to peer");
                Ok(channel)
            }
            Err(err) => {
                shared.evict(&channel, ChannelState::Failed);
                if let ConnectionError::Closed(_) = err {
                    if let Some(current) = self.channel(peer_id).filter(|c| c.is_open()) {
                        debug!("Attempt superseded by an inbound channel");
                        return Ok(current);
                    }
                }
                warn!(error = %err, "Connection attempt failed");
                Err(err)
            }
        }
    }

    /// Connects to several peers. A failure towards one peer is logged and
    /// reported as `None` for that peer; it never affects the others.
    pub async fn connect_many(
        &self,
        peers: &[PeerId],
        mode: FanOut,
        timeout: Duration,
    ) -> HashMap<PeerId, Option<Arc<Channel>>> {
        let mut results = HashMap::with_capacity(peers.len());

        match mode {
            FanOut::Sequential => {
                for &peer in peers {
                    let outcome = self.connect(peer, timeout).await;
                    results.insert(peer, Self::keep_channel(peer, outcome));
                }
            }
            FanOut::Parallel => {
                let mut attempts = JoinSet::new();
                for &peer in peers {
                    let this = self.clone();
                    attempts.spawn(async move { (peer, this.connect(peer, timeout).await) });
                }
                while let Some(joined) = attempts.join_next().await {
                    match joined {
                        Ok((peer, outcome)) => {
                            results.insert(peer, Self::keep_channel(peer, outcome));
                        }
                        Err(e) => warn!(error = %e, "Connection attempt task failed"),
                    }
                }
                for &peer in peers {
                    results.entry(peer).or_insert(None);
                }
            }
        }

        results
    }

    fn keep_channel(
        peer: PeerId,
        outcome: Result<Arc<Channel>, ConnectionError>,
    ) -> Option<Arc<Channel>> {
        match outcome {
            Ok(channel) => Some(channel),
            Err(e) => {
                debug!(peer = %peer.short(), error = %e, "Peer left out of fan-out");
                None
            }
        }
    }

    /// The pooled channel for `peer_id`, if any.
    pub fn channel(&self, peer_id: PeerId) -> Option<Arc<Channel>> {
        self.inner
            .shared
            .pool
            .get(&peer_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Records activity on the channel to `peer_id`.
    pub fn update_activity(&self, peer_id: PeerId) {
        if let Some(channel) = self.inner.shared.pool.get(&peer_id) {
            channel.touch();
        }
    }

    /// Closes and evicts every channel idle for longer than `max_idle`.
    /// Returns the number of pooled channels evicted.
    pub fn cleanup_stale(&self, max_idle: Duration) -> usize {
        let shared = &self.inner.shared;
        let detached: Vec<Arc<Channel>> = shared
            .detached
            .iter()
            .filter(|entry| entry.value().idle_for() > max_idle)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for channel in &detached {
            debug!(peer = %channel.peer_id.short(), idle = ?channel.idle_for(), "Closing stale detached channel");
            shared.evict(channel, ChannelState::Closed);
        }

        let stale: Vec<Arc<Channel>> = shared
            .pool
            .iter()
            .filter(|entry| entry.value().idle_for() > max_idle)
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        stale
            .iter()
            .filter(|channel| {
                debug!(peer = %channel.peer_id.short(), idle = ?channel.idle_for(), "Closing stale channel");
                shared.evict(channel, ChannelState::Closed)
            })
            .count()
    }

    /// Hands a channel back after a session. A detached channel is closed
    /// once no session uses it; a pooled one stays open. Returns true if the
    /// channel was closed.
    pub fn release(&self, channel: &Arc<Channel>) -> bool {
        let shared = &self.inner.shared;
        if shared.is_pooled(channel) {
            channel.touch();
            return false;
        }
        if channel.active_sessions() > 0 {
            return false;
        }
        debug!(peer = %channel.peer_id.short(), connection_id = channel.connection_id, "Closing released detached channel");
        shared.evict(channel, ChannelState::Closed);
        true
    }

    /// Channels serving sessions outside the pool.
    pub fn detached_count(&self) -> usize {
        self.inner.shared.detached.len()
    }

    /// Closes and evicts the channel to `peer_id`.
    pub fn close(&self, peer_id: PeerId) -> bool {
        match self.channel(peer_id) {
            Some(channel) => self.inner.shared.evict(&channel, ChannelState::Closed),
            None => false,
        }
    }

    /// Closes and evicts this specific channel (if it is still pooled).
    pub fn close_channel(&self, channel: &Arc<Channel>) -> bool {
        self.inner.shared.evict(channel, ChannelState::Closed)
    }

    /// Waits for the next transfer request from any peer.
    pub async fn next_request(&self) -> Option<InboundRequest> {
        let mut requests = self.inner.requests.lock().await;
        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => None,
            request = requests.recv() => request,
        }
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            evictions: self.inner.shared.evictions.load(Ordering::Relaxed),
            ..PoolStats::default()
        };
        for entry in self.inner.shared.pool.iter() {
            match entry.value().state() {
                ChannelState::Open => stats.open += 1,
                ChannelState::Connecting => stats.connecting += 1,
                ChannelState::Closed | ChannelState::Failed => {}
            }
        }
        stats
    }

    /// Stops background tasks and closes every channel.
    #[instrument(skip(self))]
    pub fn shutdown(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();

        let shared = &self.inner.shared;
        let channels: Vec<Arc<Channel>> = shared
            .pool
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .chain(shared.detached.iter().map(|entry| Arc::clone(entry.value())))
            .collect();
        for channel in &channels {
            self.inner.shared.evict(channel, ChannelState::Closed);
        }
        info!(closed = channels.len(), "Connection manager shut down");
    }

    #[cfg(test)]
    fn evict_for_test(&self, channel: &Arc<Channel>, state: ChannelState) -> bool {
        self.inner.shared.evict(channel, state)
    }
}
