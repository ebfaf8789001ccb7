//! Device identity and persistence
//!
//! Each device has a stable identifier and a human-readable name stored at:
//! `~/.config/lanbeam/identity.json`
//!
//! The identifier survives restarts so that peers see the same device across
//! sessions. The display name is generated from two short word lists (e.g.
//! "Swift Heron") the first time the identity is created and may be changed
//! later through the presence registry.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Default configuration directory name
const CONFIG_DIR: &str = "lanbeam";

/// Identity filename
const IDENTITY_FILE: &str = "identity.json";

/// Environment variable overriding the configuration directory.
pub const CONFIG_DIR_ENV: &str = "LANBEAM_CONFIG_DIR";

/// Cached config directory path
static CONFIG_DIR_CACHE: OnceCell<PathBuf> = OnceCell::new();

const ADJECTIVES: &[&str] = &[
    "Red", "Blue", "Green", "Gold", "Silver", "Purple", "Orange", "Bright", "Dark", "Swift",
    "Calm", "Bold", "Brave", "Cool", "Warm", "Quiet",
];

const NOUNS: &[&str] = &[
    "Fish", "Heron", "Tree", "Star", "Moon", "Sun", "Wave", "Wind", "Rock", "Leaf", "Fire",
    "Rain", "Snow", "Sand", "Lake", "Hill",
];

/// Errors that can occur while handling identities
#[derive(Error, Debug, Clone)]
pub enum IdentityError {
    #[error("invalid device id: {0}")]
    InvalidId(Arc<str>),

    #[error("failed to access configuration directory: {0}")]
    ConfigDir(Arc<str>),
}

/// Stable identifier of a device on the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(Uuid);

impl DeviceId {
    /// Generates a fresh random identifier.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the raw UUID.
    #[inline]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Returns the first eight hex characters, handy for log lines.
    pub fn short(&self) -> String {
        let mut s = self.0.simple().to_string();
        s.truncate(8);
        s
    }
}

impl From<Uuid> for DeviceId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| IdentityError::InvalidId(Arc::from(e.to_string())))
    }
}

/// Peers are identified by their device id.
pub type PeerId = DeviceId;

/// The identity this endpoint presents to others.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub id: DeviceId,
    pub display_name: String,
}

impl DeviceIdentity {
    /// Creates an identity with a random id and a generated name.
    pub fn generate() -> Self {
        Self {
            id: DeviceId::random(),
            display_name: generate_display_name(),
        }
    }

    /// Creates an identity with an explicit name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            id: DeviceId::random(),
            display_name: name.into(),
        }
    }

    /// Loads the persisted identity from the default config directory, or
    /// creates and persists a new one.
    ///
    /// Respects the `LANBEAM_CONFIG_DIR` environment variable, which makes it
    /// possible to run several instances on one machine.
    #[instrument(name = "load_or_create_identity")]
    pub async fn load_or_create() -> Result<Self> {
        let dir = config_dir()?;
        Self::load_or_create_in(&dir).await
    }

    /// Loads or creates the identity inside `dir`.
    pub async fn load_or_create_in(dir: &Path) -> Result<Self> {
        let path = dir.join(IDENTITY_FILE);

        if fs::try_exists(&path).await.unwrap_or(false) {
            debug!(path = %path.display(), "Loading existing identity");
            let content = fs::read(&path)
                .await
                .context("failed to read identity file")?;

            match serde_json::from_slice::<DeviceIdentity>(&content) {
                Ok(identity) => {
                    info!(device_id = %identity.id, name = %identity.display_name, "Loaded existing device identity");
                    return Ok(identity);
                }
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "Identity file is corrupt, generating a new identity");
                }
            }
        }

        let identity = Self::generate();
        fs::create_dir_all(dir)
            .await
            .context("failed to create config directory")?;
        identity.save_to(&path).await?;

        info!(device_id = %identity.id, path = %path.display(), "Generated and saved new device identity");
        Ok(identity)
    }

    /// Persists the identity as JSON, writing to a temporary file first.
    pub async fn save_to(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_vec_pretty(self).context("failed to encode identity")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &content)
            .await
            .context("failed to write identity file")?;
        fs::rename(&tmp, path)
            .await
            .context("failed to move identity file into place")?;
        Ok(())
    }
}

/// Picks a random "Adjective Noun" name.
pub fn generate_display_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.gen_range(0..NOUNS.len())];
    format!("{adjective} {noun}")
}

/// Gets the path to the configuration directory (cached).
pub fn config_dir() -> Result<PathBuf> {
    CONFIG_DIR_CACHE
        .get_or_try_init(|| {
            if let Ok(custom_dir) = std::env::var(CONFIG_DIR_ENV) {
                return Ok(PathBuf::from(custom_dir));
            }

            dirs::config_dir()
                .map(|p| p.join(CONFIG_DIR))
                .ok_or_else(|| {
                    IdentityError::ConfigDir(Arc::from("could not determine config directory"))
                        .into()
                })
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_device_id_roundtrip_through_string() {
        let id = DeviceId::random();
        let parsed: DeviceId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_device_id_parse_invalid() {
        let err = "not-a-uuid".parse::<DeviceId>().unwrap_err();
        assert!(matches!(err, IdentityError::InvalidId(_)));
    }

    #[test]
    fn test_device_id_short() {
        let id = DeviceId::random();
        assert_eq!(id.short().len(), 8);
        assert!(id.to_string().replace('-', "").starts_with(&id.short()));
    }

    #[test]
    fn test_generated_name_uses_word_lists() {
        let name = generate_display_name();
        let (adjective, noun) = name.split_once(' ').unwrap();
        assert!(ADJECTIVES.contains(&adjective));
        assert!(NOUNS.contains(&noun));
    }

    #[tokio::test]
    async fn test_identity_generation_and_loading() {
        let temp_dir = TempDir::new().unwrap();

        let first = DeviceIdentity::load_or_create_in(temp_dir.path()).await.unwrap();
        assert!(temp_dir.path().join(IDENTITY_FILE).exists());

        let second = DeviceIdentity::load_or_create_in(temp_dir.path()).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_corrupt_identity_is_replaced() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(IDENTITY_FILE);
        std::fs::write(&path, b"{ not json").unwrap();

        let identity = DeviceIdentity::load_or_create_in(temp_dir.path()).await.unwrap();

        let on_disk: DeviceIdentity =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(identity, on_disk);
    }

    #[tokio::test]
    async fn test_identity_dir_is_created() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("a").join("b");

        DeviceIdentity::load_or_create_in(&nested).await.unwrap();
        assert!(nested.join(IDENTITY_FILE).exists());
    }
}
