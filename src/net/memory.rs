//! In-process transport
//!
//! A [`MemoryNetwork`] connects any number of [`MemoryTransport`] endpoints
//! living in the same process. Links are pairs of unbounded channels, so
//! frames arrive in send order and a close is observed after every frame
//! queued before it, matching what a reliable ordered data channel provides.
//!
//! Endpoints can be marked unreachable: links opened towards them never
//! signal [`LinkEvent::Open`], which is how a stalled connection attempt
//! looks from the outside.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::identity::PeerId;
use super::transport::{
    BoxFuture, IncomingLink, LinkEvent, LinkSink, PeerTransport, TransportError, TransportLink,
};

/// Registration of one endpoint on the network.
#[derive(Debug)]
struct NodeSlot {
    incoming: mpsc::UnboundedSender<IncomingLink>,
    addr: Option<IpAddr>,
    reachable: Arc<AtomicBool>,
}

/// Shared switchboard for in-process endpoints.
#[derive(Debug, Default)]
pub struct MemoryNetwork {
    nodes: DashMap<PeerId, NodeSlot>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers an endpoint and returns its transport.
    ///
    /// `addr` is what [`PeerTransport::local_addr`] reports; `None` makes
    /// address resolution fail.
    pub fn join(self: &Arc<Self>, id: PeerId, addr: Option<IpAddr>) -> Arc<MemoryTransport> {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        self.nodes.insert(
            id,
            NodeSlot {
                incoming: incoming_tx,
                addr,
                reachable: Arc::new(AtomicBool::new(true)),
            },
        );
        debug!(node = %id.short(), "Endpoint joined memory network");

        Arc::new(MemoryTransport {
            id,
            network: Arc::clone(self),
            incoming: Mutex::new(Some(incoming_rx)),
        })
    }

    /// Removes an endpoint. Links opened towards it afterwards fail.
    pub fn leave(&self, id: &PeerId) {
        self.nodes.remove(id);
    }

    /// Controls whether links towards `id` ever open.
    pub fn set_reachable(&self, id: &PeerId, reachable: bool) {
        if let Some(slot) = self.nodes.get(id) {
            slot.reachable.store(reachable, Ordering::Release);
        }
    }

    fn addr_of(&self, id: &PeerId) -> Option<IpAddr> {
        self.nodes.get(id).and_then(|slot| slot.addr)
    }
}

/// Sending half of one side of a memory link.
#[derive(Debug)]
struct MemorySink {
    /// Events for the remote side.
    remote: mpsc::UnboundedSender<LinkEvent>,
    /// Events for our own side.
    local: mpsc::UnboundedSender<LinkEvent>,
    /// Shared by both sides of the link.
    closed: Arc<AtomicBool>,
}

impl LinkSink for MemorySink {
    fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        trace!(len = frame.len(), "memory link send");
        self.remote
            .send(LinkEvent::Message(frame))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.remote.send(LinkEvent::Close);
        let _ = self.local.send(LinkEvent::Close);
    }
}

/// One endpoint on a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryTransport {
    id: PeerId,
    network: Arc<MemoryNetwork>,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<IncomingLink>>>,
}

impl MemoryTransport {
    /// The network this endpoint is attached to.
    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }
}

impl PeerTransport for MemoryTransport {
    fn local_id(&self) -> PeerId {
        self.id
    }

    fn open(&self, peer_id: PeerId, label: &str) -> Result<TransportLink, TransportError> {
        let slot = self
            .network
            .nodes
            .get(&peer_id)
            .ok_or_else(|| TransportError::Unreachable(Arc::from(peer_id.to_string())))?;

        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let local_sink = Arc::new(MemorySink {
            remote: remote_tx.clone(),
            local: local_tx.clone(),
            closed: Arc::clone(&closed),
        });

        if !slot.reachable.load(Ordering::Acquire) {
            debug!(from = %self.id.short(), to = %peer_id.short(), label, "Peer unreachable, link will not open");
            return Ok(TransportLink {
                sink: local_sink,
                events: local_rx,
            });
        }

        let remote_sink = Arc::new(MemorySink {
            remote: local_tx.clone(),
            local: remote_tx.clone(),
            closed,
        });

        slot.incoming
            .send(IncomingLink {
                peer_id: self.id,
                link: TransportLink {
                    sink: remote_sink,
                    events: remote_rx,
                },
            })
            .map_err(|_| TransportError::Unreachable(Arc::from(peer_id.to_string())))?;

        let _ = remote_tx.send(LinkEvent::Open);
        let _ = local_tx.send(LinkEvent::Open);

        debug!(from = %self.id.short(), to = %peer_id.short(), label, "Memory link opened");

        Ok(TransportLink {
            sink: local_sink,
            events: local_rx,
        })
    }

    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<IncomingLink>> {
        self.incoming.lock().take()
    }

    fn local_addr(&self) -> BoxFuture<'_, Result<IpAddr, TransportError>> {
        let addr = self.network.addr_of(&self.id);
        Box::pin(async move {
            addr.ok_or_else(|| {
                TransportError::AddressUnavailable(Arc::from("no address configured"))
            })
        })
    }
}
