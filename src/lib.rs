//! lanbeam - Direct file transfer between devices on the same network
//!
//! Devices announce themselves in a shared presence store, see everyone in
//! their network group, and send files to each other over direct links.
//!
//! # Architecture
//!
//! - [`net`]: Presence, connection pooling, the transfer protocol and its
//!   orchestration
//! - [`config`]: Defaults and environment overrides for every layer
//!
//! # Example
//!
//! ```rust,ignore
//! use lanbeam::net::{PresenceRegistry, StaticIdentifier, GroupKey};
//!
//! let identity = DeviceIdentity::load_or_create().await?;
//! let presence = PresenceRegistry::start(&identity, &identifier, store, config.presence).await?;
//! for peer in presence.discover() {
//!     println!("{} ({:?})", peer.display_name, peer.status);
//! }
//! ```

pub mod config;
pub mod net;

pub use config::Config;
pub use net::{PresenceRegistry, TransferManager};
