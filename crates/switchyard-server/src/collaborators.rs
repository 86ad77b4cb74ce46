//! Services the hub consults but does not own.
//!
//! - [`IdentityVerifier`]: bearer token to identity, checked before upgrade
//! - [`MembershipService`]: whether an identity may enter a room
//! - [`PresenceStore`]: best-effort online/offline status

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use switchyard_proto::PresenceStatus;
use thiserror::Error;
use uuid::Uuid;

use crate::store::{CoordinationStore, StoreError};

/// Key prefix for presence entries.
pub const PRESENCE_PREFIX: &str = "presence:";

/// Presence entries expire unless refreshed within this window.
pub const PRESENCE_TTL: Duration = Duration::from_secs(5 * 60);

/// Bearer token rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No `Authorization: Bearer` header
    #[error("missing bearer token")]
    Missing,

    /// Signature, expiry or structure check failed
    #[error("invalid token: {0}")]
    Invalid(String),
}

/// Turns a bearer token into an identity.
pub trait IdentityVerifier: Send + Sync + 'static {
    /// Verify `token` and return the identity it names.
    fn verify(&self, token: &str) -> Result<Uuid, AuthError>;
}

/// Claims carried by hub access tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Identity
    pub sub: Uuid,
    /// Expiry, seconds since the Unix epoch
    pub exp: u64,
    /// Issue time, seconds since the Unix epoch
    #[serde(default)]
    pub iat: Option<u64>,
}

/// HS256 JWT verifier.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Verifier for tokens signed with `secret`.
    pub fn new(secret: &[u8]) -> Self {
        Self { key: DecodingKey::from_secret(secret), validation: Validation::new(Algorithm::HS256) }
    }
}

impl IdentityVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Uuid, AuthError> {
        jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims.sub)
            .map_err(|e| AuthError::Invalid(e.to_string()))
    }
}

/// Sign an HS256 token for `claims`.
///
/// Used by tooling and tests; the hub itself only verifies.
pub fn issue_token(secret: &[u8], claims: &Claims) -> Result<String, AuthError> {
    jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, &EncodingKey::from_secret(secret))
        .map_err(|e| AuthError::Invalid(e.to_string()))
}

/// Fixed token table.
#[derive(Debug, Clone, Default)]
pub struct StaticVerifier {
    tokens: HashMap<String, Uuid>,
}

impl StaticVerifier {
    /// Verifier that accepts nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` as `identity`.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, identity: Uuid) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }
}

impl IdentityVerifier for StaticVerifier {
    fn verify(&self, token: &str) -> Result<Uuid, AuthError> {
        self.tokens.get(token).copied().ok_or_else(|| AuthError::Invalid("unknown token".into()))
    }
}

/// Room membership authority.
#[async_trait]
pub trait MembershipService: Send + Sync + 'static {
    /// Whether `identity` may enter `room_id`.
    async fn is_member(&self, room_id: Uuid, identity: Uuid) -> bool;
}

/// Lets everyone in.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenMembership;

#[async_trait]
impl MembershipService for OpenMembership {
    async fn is_member(&self, _room_id: Uuid, _identity: Uuid) -> bool {
        true
    }
}

/// Fixed allow-list per room.
#[derive(Debug, Clone, Default)]
pub struct StaticMembership {
    rooms: HashMap<Uuid, HashSet<Uuid>>,
}

impl StaticMembership {
    /// Allow-list with no rooms.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `identity` into `room_id`.
    #[must_use]
    pub fn allow(mut self, room_id: Uuid, identity: Uuid) -> Self {
        self.rooms.entry(room_id).or_default().insert(identity);
        self
    }
}

#[async_trait]
impl MembershipService for StaticMembership {
    async fn is_member(&self, room_id: Uuid, identity: Uuid) -> bool {
        self.rooms.get(&room_id).is_some_and(|members| members.contains(&identity))
    }
}

/// Online/offline status of identities.
#[async_trait]
pub trait PresenceStore: Send + Sync + 'static {
    /// Record a status. `Offline` clears the entry.
    async fn set_status(&self, identity: Uuid, status: PresenceStatus) -> Result<(), StoreError>;

    /// Mark an identity online.
    async fn set_online(&self, identity: Uuid) -> Result<(), StoreError> {
        self.set_status(identity, PresenceStatus::Online).await
    }

    /// Mark an identity offline.
    async fn set_offline(&self, identity: Uuid) -> Result<(), StoreError> {
        self.set_status(identity, PresenceStatus::Offline).await
    }
}

/// Presence kept in the coordination store as `presence:{uuid}`.
#[derive(Clone)]
pub struct StorePresence {
    store: Arc<dyn CoordinationStore>,
}

impl StorePresence {
    /// Presence over `store`.
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// Key holding an identity's status.
    pub fn key_for(identity: Uuid) -> String {
        format!("{PRESENCE_PREFIX}{identity}")
    }

    /// Current status; `Offline` when absent or expired.
    pub async fn status(&self, identity: Uuid) -> Result<PresenceStatus, StoreError> {
        let Some(bytes) = self.store.get(&Self::key_for(identity)).await? else {
            return Ok(PresenceStatus::Offline);
        };
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

#[async_trait]
impl PresenceStore for StorePresence {
    async fn set_status(&self, identity: Uuid, status: PresenceStatus) -> Result<(), StoreError> {
        let key = Self::key_for(identity);
        if status == PresenceStatus::Offline {
            self.store.delete(&key).await?;
            return Ok(());
        }

        let value = serde_json::to_vec(&status).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.store.set(&key, Bytes::from(value), Some(PRESENCE_TTL)).await
    }
}

#[cfg(test)]
mod tests {
    use switchyard_core::Environment;

    use super::*;
    use crate::{SystemEnv, store::MemoryStore};

    const SECRET: &[u8] = b"test-secret";

    fn claims(sub: Uuid, valid_for_secs: i64) -> Claims {
        let now = SystemEnv::new().wall_clock().timestamp();
        Claims { sub, exp: (now + valid_for_secs) as u64, iat: Some(now as u64) }
    }

    #[test]
    fn jwt_round_trip() {
        let identity = Uuid::from_u128(0xA11CE);
        let token = issue_token(SECRET, &claims(identity, 3600)).unwrap();

        assert_eq!(JwtVerifier::new(SECRET).verify(&token), Ok(identity));
    }

    #[test]
    fn jwt_rejects_wrong_secret_and_expiry() {
        let identity = Uuid::from_u128(0xA11CE);
        let verifier = JwtVerifier::new(SECRET);

        let token = issue_token(b"other-secret", &claims(identity, 3600)).unwrap();
        assert!(matches!(verifier.verify(&token), Err(AuthError::Invalid(_))));

        let token = issue_token(SECRET, &claims(identity, -3600)).unwrap();
        assert!(matches!(verifier.verify(&token), Err(AuthError::Invalid(_))));

        assert!(verifier.verify("not.a.token").is_err());
    }

    #[test]
    fn static_verifier_table() {
        let verifier = StaticVerifier::new().with_token("alice", Uuid::from_u128(1));

        assert_eq!(verifier.verify("alice"), Ok(Uuid::from_u128(1)));
        assert!(verifier.verify("mallory").is_err());
    }

    #[tokio::test]
    async fn static_membership_allow_list() {
        let room = Uuid::from_u128(10);
        let membership = StaticMembership::new().allow(room, Uuid::from_u128(1));

        assert!(membership.is_member(room, Uuid::from_u128(1)).await);
        assert!(!membership.is_member(room, Uuid::from_u128(2)).await);
        assert!(!membership.is_member(Uuid::from_u128(11), Uuid::from_u128(1)).await);
        assert!(OpenMembership.is_member(room, Uuid::from_u128(2)).await);
    }

    #[tokio::test]
    async fn presence_online_then_offline() {
        let store = MemoryStore::new();
        let presence = StorePresence::new(Arc::new(store.clone()));
        let identity = Uuid::from_u128(7);

        presence.set_online(identity).await.unwrap();
        assert_eq!(presence.status(identity).await.unwrap(), PresenceStatus::Online);
        assert!(store.get(&StorePresence::key_for(identity)).await.unwrap().is_some());

        presence.set_status(identity, PresenceStatus::Away).await.unwrap();
        assert_eq!(presence.status(identity).await.unwrap(), PresenceStatus::Away);

        presence.set_offline(identity).await.unwrap();
        assert_eq!(presence.status(identity).await.unwrap(), PresenceStatus::Offline);
    }
}
