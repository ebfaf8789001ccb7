//! Peer transport seam
//!
//! The point-to-point transport (NAT traversal, session negotiation, the
//! reliable ordered channel itself) lives outside this crate. Everything the
//! rest of the networking stack needs from it is expressed here:
//!
//! - open a named link to a peer ([`PeerTransport::open`])
//! - receive links opened by peers ([`PeerTransport::take_incoming`])
//! - send opaque frames in order ([`LinkSink::send`])
//! - observe open/close/error ([`LinkEvent`])
//! - resolve the local network address ([`PeerTransport::local_addr`])
//!
//! [`super::memory`] provides an in-process implementation.

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use super::identity::PeerId;

/// Boxed future returned by transport and strategy traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors reported by a transport
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("peer unreachable: {0}")]
    Unreachable(Arc<str>),

    #[error("link closed")]
    Closed,

    #[error("local address unavailable: {0}")]
    AddressUnavailable(Arc<str>),
}

/// Signals delivered by a link, in order.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// The link is ready to carry messages.
    Open,
    /// One frame sent by the remote side.
    Message(Bytes),
    /// The link was closed (by either side).
    Close,
    /// The link failed.
    Error(Arc<str>),
}

/// Sending half of a link.
pub trait LinkSink: Send + Sync + 'static {
    /// Queues a frame. Frames are delivered in the order they were queued.
    fn send(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Closes the link after every queued frame. Calling it twice is a no-op.
    fn close(&self);
}

/// An opened (or opening) link: the sink plus the event stream.
pub struct TransportLink {
    pub sink: Arc<dyn LinkSink>,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

impl std::fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLink").finish_non_exhaustive()
    }
}

/// A link opened by a remote peer.
#[derive(Debug)]
pub struct IncomingLink {
    pub peer_id: PeerId,
    pub link: TransportLink,
}

/// The external point-to-point transport.
pub trait PeerTransport: Send + Sync + 'static {
    /// Identity of the local endpoint on this transport.
    fn local_id(&self) -> PeerId;

    /// Starts opening a link to `peer_id`. The returned link emits
    /// [`LinkEvent::Open`] once it is usable; a link to an unreachable peer
    /// may never open.
    fn open(&self, peer_id: PeerId, label: &str) -> Result<TransportLink, TransportError>;

    /// Hands out the stream of incoming links. Returns `None` after the
    /// first call.
    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<IncomingLink>>;

    /// Resolves the address this endpoint uses on the local network.
    fn local_addr(&self) -> BoxFuture<'_, Result<IpAddr, TransportError>>;
}
