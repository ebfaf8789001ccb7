//! Networking module for lanbeam
//!
//! This module provides everything needed to find peers on the local
//! network and move files to them directly:
//!
//! - **Identity**: Persistent device id and display name
//! - **Presence**: Heartbeat-based registry of peers in the same network group
//! - **Connection**: Pooled, deduplicated channels with per-transfer routing
//! - **Protocol**: Request/accept/chunk/complete sessions
//! - **Transfer**: Orchestration of sessions over pooled channels
//!
//! # Architecture
//!
//! Links and presence storage sit behind the [`PeerTransport`] and
//! [`PresenceStore`] traits. [`memory`] provides in-process versions of both
//! for demos and tests.
//!
//! # Example
//!
//! ```rust,ignore
//! use lanbeam::net::{ConnectionManager, OutgoingFile, TransferManager};
//!
//! let connections = ConnectionManager::new(transport, Default::default());
//! connections.start();
//! let transfers = TransferManager::new(connections, Some(presence), Default::default());
//!
//! let handle = transfers.send_file(peer_id, OutgoingFile::from_path("photo.jpg").await?);
//! handle.wait().await?;
//! ```

pub mod connection;
pub mod identity;
pub mod memory;
pub mod presence;
pub mod protocol;
pub mod store;
pub mod transfer;
pub mod transport;
pub mod wire;

pub use connection::{
    Channel, ChannelState, ConnectionConfig, ConnectionError, ConnectionManager, FanOut,
    InboundRequest, PoolStats,
};
pub use identity::{DeviceId, DeviceIdentity, PeerId};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use presence::{
    GroupKey, LocalAddrIdentifier, NetworkIdentifier, Peer, PeerEvent, PresenceConfig,
    PresenceError, PresenceRecord, PresenceRegistry, PresenceStatus, StaticIdentifier,
    UdpProbeIdentifier,
};
pub use protocol::{
    OutgoingFile, PendingTransfer, ReceivedFile, SendSession, SessionConfig, SessionReport,
    SessionState, TransferDirection, TransferError, TransferProgress,
};
pub use store::{MemoryPresenceStore, PresenceChange, PresenceFeed, PresenceStore};
pub use transfer::{
    TransferConfig, TransferHandle, TransferManager, TransferSnapshot, TransferStatus,
};
pub use transport::{PeerTransport, TransportError};
pub use wire::{FileMetadata, Message, TransferId, CHUNK_SIZE};
