//! In-memory user validator.
//!
//! The teacher only ever keeps a flat `HashSet<Uuid>` on `ServerConfig`;
//! this generalizes that into a dual-indexed, `RwLock`-guarded lookup
//! (the same concurrency shape the teacher uses for its per-host
//! connection pools), since the session driver needs to resolve both
//! by UUID (on every inbound request) and by email (for admin-style
//! lookups).

use md5::{Digest, Md5};
use std::collections::HashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::protocol::normalize_uuid;

/// Failure modes of the validator's mutating operations (spec §4.2/§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UserError {
    #[error("a user with this email already exists")]
    Duplicate,
    #[error("email must not be empty")]
    EmptyEmail,
    #[error("no user with this email")]
    NotFound,
}

/// Per-connection flow selector. Anything other than Vision or "no
/// flow" is rejected by the session driver before it reaches here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Flow {
    #[default]
    None,
    Vision,
}

impl Flow {
    pub fn parse(raw: Option<&str>) -> Option<Self> {
        match raw {
            None | Some("") => Some(Flow::None),
            Some("xtls-rprx-vision") => Some(Flow::Vision),
            Some(_) => None,
        }
    }
}

/// Xray derives a 16-byte "command key" per user by hashing the raw
/// UUID bytes with a fixed salt; kept here as an opaque identifier
/// that two users never share even if their normalized UUIDs collide.
const COMMAND_KEY_SALT: &[u8] = b"c48619fe-8f02-49e0-b9e9-edf763e17e21";

fn derive_command_key(uuid: &Uuid) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(uuid.as_bytes());
    hasher.update(COMMAND_KEY_SALT);
    let digest = hasher.finalize();
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest);
    key
}

/// Stable identity for a user: the raw UUID plus its derived command
/// key, compared in constant time where it gates authentication.
#[derive(Debug, Clone)]
pub struct UserId {
    pub uuid: Uuid,
    pub command_key: [u8; 16],
}

impl UserId {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            command_key: derive_command_key(&uuid),
            uuid,
        }
    }

    pub fn command_key_matches(&self, other: &[u8; 16]) -> bool {
        self.command_key.ct_eq(other).into()
    }
}

/// A configured client of the server.
#[derive(Debug, Clone)]
pub struct MemoryUser {
    pub id: UserId,
    pub email: String,
    pub level: u32,
    pub flow: Flow,
}

impl MemoryUser {
    pub fn new(uuid: Uuid, email: impl Into<String>, level: u32, flow: Flow) -> Self {
        Self {
            id: UserId::new(uuid),
            email: email.into(),
            level,
            flow,
        }
    }
}

/// Dual-indexed user table: normalized UUID -> user, lowercased email
/// -> UUID. Per spec §3/§4.2, two raw UUIDs that normalize to the same
/// key collide silently — the later `add` simply wins the index slot,
/// matching xray's own behavior rather than rejecting the insert.
#[derive(Default)]
struct Indexes {
    by_uuid: HashMap<[u8; 16], MemoryUser>,
    by_email: HashMap<String, [u8; 16]>,
}

pub struct UserValidator {
    indexes: RwLock<Indexes>,
}

impl UserValidator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            indexes: RwLock::new(Indexes::default()),
        })
    }

    /// Inserts `user` into both indexes. A non-empty email that
    /// already exists fails with [`UserError::Duplicate`] before either
    /// index is touched; an empty email is allowed but left out of the
    /// email index entirely (spec §4.2).
    pub async fn add(&self, user: MemoryUser) -> Result<(), UserError> {
        let key = normalize_uuid(&user.id.uuid);
        let mut indexes = self.indexes.write().await;

        let email = user.email.to_lowercase();
        if !email.is_empty() && indexes.by_email.contains_key(&email) {
            return Err(UserError::Duplicate);
        }

        if let Some(existing) = indexes.by_uuid.get(&key) {
            if existing.id.uuid != user.id.uuid {
                warn!(
                    "user {} collides with existing user {} after UUID normalization",
                    user.id.uuid, existing.id.uuid
                );
            }
        }

        if !email.is_empty() {
            indexes.by_email.insert(email, key);
        }
        indexes.by_uuid.insert(key, user);
        Ok(())
    }

    /// Removes the user with the given email (spec §4.2/§6: keyed by
    /// email, not UUID). An empty email fails with
    /// [`UserError::EmptyEmail`]; an email with no matching user fails
    /// with [`UserError::NotFound`].
    pub async fn del(&self, email: &str) -> Result<(), UserError> {
        if email.is_empty() {
            return Err(UserError::EmptyEmail);
        }
        let email = email.to_lowercase();
        let mut indexes = self.indexes.write().await;
        match indexes.by_email.remove(&email) {
            Some(key) => {
                indexes.by_uuid.remove(&key);
                Ok(())
            }
            None => Err(UserError::NotFound),
        }
    }

    pub async fn get(&self, uuid: &Uuid) -> Option<MemoryUser> {
        let key = normalize_uuid(uuid);
        self.indexes.read().await.by_uuid.get(&key).cloned()
    }

    pub async fn get_by_email(&self, email: &str) -> Option<MemoryUser> {
        let indexes = self.indexes.read().await;
        let key = indexes.by_email.get(&email.to_lowercase())?;
        indexes.by_uuid.get(key).cloned()
    }

    pub async fn all(&self) -> Vec<MemoryUser> {
        self.indexes.read().await.by_uuid.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.indexes.read().await.by_uuid.len()
    }
}
