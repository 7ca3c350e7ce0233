use crate::config::BrokerConfig;
use crate::credential::retry::issue_with_retry;
use crate::credential::{CredentialIssuer, CredentialLease, LeaseState};
use crate::error::LakeguardError;
use crate::scope::{ScopeFingerprint, StorageScope};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct CacheTelemetry {
    hits: AtomicU64,
    misses: AtomicU64,
    issued: AtomicU64,
    refreshes: AtomicU64,
    refresh_failures: AtomicU64,
    evicted: AtomicU64,
}

/// Counter snapshot for the credential cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub issued: u64,
    pub refreshes: u64,
    pub refresh_failures: u64,
    pub evicted: u64,
    pub resident: u64,
}

struct CacheSlot {
    lease: Arc<CredentialLease>,
    last_used: Instant,
    refresh_pending: bool,
}

#[derive(Clone)]
enum IssueState {
    Pending,
    Done(Result<Arc<CredentialLease>, LakeguardError>),
}

enum Joined {
    Ready(Arc<CredentialLease>),
    Wait(watch::Receiver<IssueState>),
}

struct CacheInner {
    issuer: Arc<dyn CredentialIssuer>,
    config: BrokerConfig,
    ready: Mutex<LruCache<ScopeFingerprint, CacheSlot>>,
    inflight: Mutex<HashMap<ScopeFingerprint, watch::Receiver<IssueState>>>,
    telemetry: CacheTelemetry,
}

/// Keyed store of issued leases with one issuance per fingerprint.
///
/// A miss spawns a detached issuance task and every concurrent requester
/// for the same fingerprint waits on it, so an upstream burst collapses to
/// one call. The task outlives its requesters: a caller walking away never
/// cancels an issuance other callers are waiting on. Failed issuances are
/// handed to the waiters and never cached.
///
/// Lock order inside the cache is `inflight` before `ready`; the issuance
/// and refresh tasks take `ready` alone.
#[derive(Clone)]
pub struct CredentialCache {
    inner: Arc<CacheInner>,
}

impl CredentialCache {
    pub fn new(issuer: Arc<dyn CredentialIssuer>, config: BrokerConfig) -> Self {
        let capacity = NonZeroUsize::new(config.credential_cache_capacity.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(CacheInner {
                issuer,
                config,
                ready: Mutex::new(LruCache::new(capacity)),
                inflight: Mutex::new(HashMap::new()),
                telemetry: CacheTelemetry::default(),
            }),
        }
    }

    /// Returns a live lease for the scope, issuing one if the cache cannot
    /// serve it. A lease past its refresh point is returned as-is while a
    /// background task fetches its successor.
    pub async fn get(
        &self,
        principal: &str,
        scope: &StorageScope,
    ) -> Result<Arc<CredentialLease>, LakeguardError> {
        let fingerprint = scope.fingerprint(principal);

        if let Some(lease) = self.lookup_ready(&fingerprint) {
            self.inner.telemetry.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(lease);
        }
        self.inner.telemetry.misses.fetch_add(1, Ordering::Relaxed);

        match self.join_issuance(fingerprint, principal, scope) {
            Joined::Ready(lease) => Ok(lease),
            Joined::Wait(mut rx) => loop {
                if let IssueState::Done(result) = &*rx.borrow_and_update() {
                    return result.clone();
                }
                if rx.changed().await.is_err() {
                    return Err(LakeguardError::CredentialUnavailable {
                        attempts: 0,
                        reason: "issuance task dropped".to_string(),
                    });
                }
            },
        }
    }

    /// Drops entries whose lease has been expired for longer than the grace
    /// window, and entries nobody has touched for a lease lifetime plus
    /// grace. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let grace = Duration::from_millis(self.inner.config.lease_evict_grace_ms);
        let mut ready = self.inner.ready.lock();
        let stale: Vec<ScopeFingerprint> = ready
            .iter()
            .filter(|(_, slot)| {
                slot.lease.expired_for(now) > grace
                    || now.saturating_duration_since(slot.last_used) > slot.lease.ttl() + grace
            })
            .map(|(fingerprint, _)| *fingerprint)
            .collect();
        for fingerprint in &stale {
            ready.pop(fingerprint);
        }
        drop(ready);

        let count = stale.len();
        if count > 0 {
            self.inner
                .telemetry
                .evicted
                .fetch_add(count as u64, Ordering::Relaxed);
            tracing::debug!(evicted = count, "credential cache sweep");
        }
        count
    }

    pub fn metrics(&self) -> CacheMetrics {
        let t = &self.inner.telemetry;
        CacheMetrics {
            hits: t.hits.load(Ordering::Relaxed),
            misses: t.misses.load(Ordering::Relaxed),
            issued: t.issued.load(Ordering::Relaxed),
            refreshes: t.refreshes.load(Ordering::Relaxed),
            refresh_failures: t.refresh_failures.load(Ordering::Relaxed),
            evicted: t.evicted.load(Ordering::Relaxed),
            resident: self.inner.ready.lock().len() as u64,
        }
    }

    fn lookup_ready(&self, fingerprint: &ScopeFingerprint) -> Option<Arc<CredentialLease>> {
        let now = Instant::now();
        let fraction = self.inner.config.lease_refresh_fraction;
        let mut ready = self.inner.ready.lock();

        let state = ready
            .peek(fingerprint)
            .map(|slot| slot.lease.state_at(now, fraction))?;
        if state == LeaseState::Expired {
            ready.pop(fingerprint);
            return None;
        }

        let slot = ready.get_mut(fingerprint)?;
        slot.last_used = now;
        let lease = slot.lease.clone();
        let start_refresh = state == LeaseState::RefreshDue && !slot.refresh_pending;
        if start_refresh {
            slot.refresh_pending = true;
        }
        drop(ready);

        if start_refresh {
            self.spawn_refresh(*fingerprint, lease.clone());
        }
        Some(lease)
    }

    fn join_issuance(
        &self,
        fingerprint: ScopeFingerprint,
        principal: &str,
        scope: &StorageScope,
    ) -> Joined {
        let mut inflight = self.inner.inflight.lock();

        // An issuance may have landed between the miss and this lock.
        if let Some(lease) = self.lookup_ready(&fingerprint) {
            return Joined::Ready(lease);
        }
        if let Some(rx) = inflight.get(&fingerprint) {
            return Joined::Wait(rx.clone());
        }

        let (tx, rx) = watch::channel(IssueState::Pending);
        inflight.insert(fingerprint, rx.clone());

        let inner = self.inner.clone();
        let principal = principal.to_string();
        let scope = scope.clone();
        tokio::spawn(async move {
            let result = issue_with_retry(
                inner.issuer.as_ref(),
                &principal,
                &scope,
                &inner.config,
                jitter_seed(&fingerprint),
            )
            .await;

            let outcome = match result {
                Ok(issued) => {
                    inner.telemetry.issued.fetch_add(1, Ordering::Relaxed);
                    let lease = Arc::new(CredentialLease::new(
                        &principal,
                        fingerprint,
                        scope,
                        issued,
                        Instant::now(),
                    ));
                    let mut ready = inner.ready.lock();
                    if let Some((evicted_key, _)) = ready.push(
                        fingerprint,
                        CacheSlot {
                            lease: lease.clone(),
                            last_used: Instant::now(),
                            refresh_pending: false,
                        },
                    ) {
                        if evicted_key != fingerprint {
                            inner.telemetry.evicted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    IssueState::Done(Ok(lease))
                }
                Err(err) => IssueState::Done(Err(err)),
            };

            inner.inflight.lock().remove(&fingerprint);
            let _ = tx.send(outcome);
        });

        Joined::Wait(rx)
    }

    fn spawn_refresh(&self, fingerprint: ScopeFingerprint, current: Arc<CredentialLease>) {
        self.inner
            .telemetry
            .refreshes
            .fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let result = issue_with_retry(
                inner.issuer.as_ref(),
                current.principal(),
                current.scope(),
                &inner.config,
                jitter_seed(&fingerprint),
            )
            .await;

            let mut ready = inner.ready.lock();
            match result {
                Ok(issued) => {
                    inner.telemetry.issued.fetch_add(1, Ordering::Relaxed);
                    let lease = Arc::new(CredentialLease::new(
                        current.principal(),
                        fingerprint,
                        current.scope().clone(),
                        issued,
                        Instant::now(),
                    ));
                    // An entry evicted while we refreshed stays evicted.
                    if let Some(slot) = ready.get_mut(&fingerprint) {
                        slot.lease = lease;
                        slot.refresh_pending = false;
                    }
                }
                Err(err) => {
                    inner
                        .telemetry
                        .refresh_failures
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        fingerprint = %fingerprint,
                        reason = %err,
                        "lease refresh failed, serving the current lease until expiry"
                    );
                    if let Some(slot) = ready.get_mut(&fingerprint) {
                        slot.refresh_pending = false;
                    }
                }
            }
        });
    }
}

fn jitter_seed(fingerprint: &ScopeFingerprint) -> u64 {
    let b = fingerprint.as_bytes();
    u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}
