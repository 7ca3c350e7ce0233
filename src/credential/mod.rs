//! Scoped credential leases and the cache that keeps issuance off the hot
//! path.

pub mod cache;
pub mod retry;

pub use cache::{CacheMetrics, CredentialCache};

use crate::error::LakeguardError;
use crate::scope::{ScopeFingerprint, StorageScope};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use uuid::Uuid;
use zeroize::Zeroizing;

/// Key material for one scoped credential, as handed to the engine's
/// storage connector. The secret halves are wrapped in `Arc<Zeroizing<_>>`
/// so they are wiped from memory when the last lease holding them drops,
/// and the `Debug` output never carries them.
#[derive(Clone)]
pub struct CredentialMaterial {
    access_key_id: String,
    secret_access_key: Arc<Zeroizing<String>>,
    session_token: Arc<Zeroizing<String>>,
}

impl CredentialMaterial {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: impl Into<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: Arc::new(Zeroizing::new(secret_access_key.into())),
            session_token: Arc::new(Zeroizing::new(session_token.into())),
        }
    }

    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    pub fn secret_access_key(&self) -> &str {
        &self.secret_access_key
    }

    pub fn session_token(&self) -> &str {
        &self.session_token
    }
}

impl fmt::Debug for CredentialMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialMaterial")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .finish()
    }
}

/// What an issuer hands back: material, how long it lives, and the
/// upstream role the credential was cut from.
#[derive(Debug, Clone)]
pub struct IssuedCredential {
    pub material: CredentialMaterial,
    pub ttl: Duration,
    pub issuing_role: String,
}

/// Upstream that cuts short-lived credentials bounded to a storage scope,
/// an STS-style token service in production. Errors must be classified:
/// transient failures are retried, rejections are not.
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    async fn issue(
        &self,
        principal: &str,
        scope: &StorageScope,
    ) -> Result<IssuedCredential, LakeguardError>;
}

/// Where a lease sits in its lifetime relative to the refresh fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Valid,
    RefreshDue,
    Expired,
}

/// One issued credential bound to a principal and scope. Leases are shared
/// immutably out of the cache; holders read material until `expires_at` and
/// come back for a successor.
#[derive(Debug, Clone)]
pub struct CredentialLease {
    id: Uuid,
    principal: String,
    fingerprint: ScopeFingerprint,
    scope: StorageScope,
    material: CredentialMaterial,
    issuing_role: String,
    issued_at: Instant,
    ttl: Duration,
    expires_at_epoch_ms: u64,
}

impl CredentialLease {
    pub fn new(
        principal: &str,
        fingerprint: ScopeFingerprint,
        scope: StorageScope,
        issued: IssuedCredential,
        issued_at: Instant,
    ) -> Self {
        let expires_at_epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
            .saturating_add(issued.ttl.as_millis() as u64);
        Self {
            id: Uuid::new_v4(),
            principal: principal.to_string(),
            fingerprint,
            scope,
            material: issued.material,
            issuing_role: issued.issuing_role,
            issued_at,
            ttl: issued.ttl,
            expires_at_epoch_ms,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn fingerprint(&self) -> ScopeFingerprint {
        self.fingerprint
    }

    pub fn scope(&self) -> &StorageScope {
        &self.scope
    }

    pub fn material(&self) -> &CredentialMaterial {
        &self.material
    }

    /// The upstream role the lease's material was assumed under, for the
    /// audit trail.
    pub fn issuing_role(&self) -> &str {
        &self.issuing_role
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Wall-clock expiry in epoch milliseconds, for surfacing to engines
    /// that pass it through to storage connectors.
    pub fn expires_at_epoch_ms(&self) -> u64 {
        self.expires_at_epoch_ms
    }

    pub fn remaining_at(&self, now: Instant) -> Duration {
        (self.issued_at + self.ttl).saturating_duration_since(now)
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.issued_at + self.ttl
    }

    /// How long past its expiry instant the lease is, zero while it lives.
    pub fn expired_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.issued_at + self.ttl)
    }

    pub fn state_at(&self, now: Instant, refresh_fraction: f64) -> LeaseState {
        if self.is_expired_at(now) {
            return LeaseState::Expired;
        }
        let refresh_after = self.ttl.mul_f64(refresh_fraction);
        if now >= self.issued_at + refresh_after {
            LeaseState::RefreshDue
        } else {
            LeaseState::Valid
        }
    }
}
