pub mod audit;
pub mod config;
pub mod credential;
pub mod error;
pub mod model;
pub mod policy;
pub mod scope;

use crate::audit::{AuditEvent, AuditSink, BufferedAuditSink, DecisionEvent, IssuanceEvent};
use crate::audit::TracingAuditSink;
use crate::config::BrokerConfig;
use crate::credential::{CacheMetrics, CredentialCache, CredentialIssuer, CredentialLease};
use crate::error::LakeguardError;
use crate::model::{
    AccessDecision, PolicySnapshot, Principal, Privilege, RequestContext, Resource,
};
use crate::policy::{
    evaluate, GrantStore, IndexBuildReport, LoadedPolicy, PermissionIndex, parse_policy,
};
use crate::scope::{resolve_scope, LocationResolver};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct BrokerTelemetry {
    checks_total: AtomicU64,
    checks_denied: AtomicU64,
    check_latency_micros: AtomicU64,
    no_policy_checks: AtomicU64,
    credential_requests: AtomicU64,
    credential_failures: AtomicU64,
    snapshot_loads: AtomicU64,
    stale_snapshots: AtomicU64,
    poll_failures: AtomicU64,
}

/// Counters since construction, taken with relaxed loads. Safe to poll from
/// a metrics scraper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerMetrics {
    pub checks_total: u64,
    pub checks_denied: u64,
    pub avg_check_latency_micros: u64,
    /// Checks answered while no snapshot was loaded. All of them denied.
    pub no_policy_checks: u64,
    pub credential_requests: u64,
    pub credential_failures: u64,
    pub snapshot_loads: u64,
    pub stale_snapshots: u64,
    pub poll_failures: u64,
    pub active_snapshot_version: Option<u64>,
    pub audit_events_dropped: u64,
    pub cache: CacheMetrics,
}

pub struct AccessBrokerBuilder {
    config: BrokerConfig,
    issuer: Option<Arc<dyn CredentialIssuer>>,
    resolver: Option<Arc<dyn LocationResolver>>,
    audit_sink: Option<Arc<dyn AuditSink>>,
}

impl AccessBrokerBuilder {
    pub fn issuer(mut self, issuer: Arc<dyn CredentialIssuer>) -> Self {
        self.issuer = Some(issuer);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn LocationResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Downstream sink for audit events. Events reach it through the bounded
    /// queue regardless, so a slow sink delays nothing but its own stream.
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    /// Must run inside a Tokio runtime: the audit forwarder is spawned here.
    pub fn build(self) -> Result<AccessBroker, LakeguardError> {
        self.config.validate()?;
        let issuer = self.issuer.ok_or_else(|| LakeguardError::InvalidConfig {
            message: "a credential issuer is required".into(),
        })?;
        let resolver = self.resolver.ok_or_else(|| LakeguardError::InvalidConfig {
            message: "a location resolver is required".into(),
        })?;
        let downstream: Arc<dyn AuditSink> = self
            .audit_sink
            .unwrap_or_else(|| Arc::new(TracingAuditSink));

        let background_tasks = Arc::new(StdMutex::new(Vec::new()));
        let (audit, audit_rx) = BufferedAuditSink::channel(self.config.audit_queue_depth);
        let forwarder = BufferedAuditSink::spawn_forwarder(audit_rx, downstream);
        background_tasks
            .lock()
            .expect("background task list poisoned")
            .push(forwarder);

        let cache = CredentialCache::new(issuer, self.config.clone());
        Ok(AccessBroker {
            config: self.config,
            active: Arc::new(RwLock::new(None)),
            cache,
            resolver,
            audit,
            telemetry: Arc::new(BrokerTelemetry::default()),
            shut_down: Arc::new(AtomicBool::new(false)),
            background_tasks,
        })
    }
}

/// Policy decision point and credential broker for one engine cluster.
///
/// Decisions are served from the active immutable [`PermissionIndex`];
/// snapshot publication swaps the whole index, so a check never observes a
/// half-applied policy. Credential requests re-verify every access against
/// the active snapshot before a scope is resolved and a lease fetched from
/// the cache.
pub struct AccessBroker {
    config: BrokerConfig,
    active: Arc<RwLock<Option<Arc<PermissionIndex>>>>,
    cache: CredentialCache,
    resolver: Arc<dyn LocationResolver>,
    audit: BufferedAuditSink,
    telemetry: Arc<BrokerTelemetry>,
    /// Set once by `shutdown`; issuance refuses, background loops drain out.
    shut_down: Arc<AtomicBool>,
    background_tasks: Arc<StdMutex<Vec<JoinHandle<()>>>>,
}

impl AccessBroker {
    pub fn builder(config: BrokerConfig) -> AccessBrokerBuilder {
        AccessBrokerBuilder {
            config,
            issuer: None,
            resolver: None,
            audit_sink: None,
        }
    }

    /// Evaluates one access under the conditions holding right now.
    pub fn check_access(
        &self,
        principal: &Principal,
        resource: &Resource,
        privilege: Privilege,
    ) -> AccessDecision {
        self.check_access_with_context(principal, resource, privilege, &RequestContext::now())
    }

    /// Evaluates one access against the active snapshot. Never errors: with
    /// no snapshot loaded the answer is a deny carrying
    /// [`DecisionReason::NoPolicyLoaded`](crate::model::DecisionReason).
    pub fn check_access_with_context(
        &self,
        principal: &Principal,
        resource: &Resource,
        privilege: Privilege,
        ctx: &RequestContext,
    ) -> AccessDecision {
        let started = Instant::now();
        let index = self.active.read().clone();
        let decision = match index {
            Some(index) => evaluate(&index, principal, resource, privilege, ctx),
            None => {
                self.telemetry
                    .no_policy_checks
                    .fetch_add(1, Ordering::Relaxed);
                AccessDecision::no_policy()
            }
        };
        self.telemetry.checks_total.fetch_add(1, Ordering::Relaxed);
        if !decision.granted {
            self.telemetry.checks_denied.fetch_add(1, Ordering::Relaxed);
        }
        let latency_micros = started.elapsed().as_micros() as u64;
        self.telemetry
            .check_latency_micros
            .fetch_add(latency_micros, Ordering::Relaxed);
        self.audit.record(&AuditEvent::Decision(DecisionEvent {
            principal: principal.name().to_string(),
            resource: resource.to_string(),
            privilege: privilege.as_str(),
            granted: decision.granted,
            reason: decision.reason.as_str(),
            matched_grant: decision.matched.map(|grant| grant.to_string()),
            snapshot_version: decision.snapshot_version,
            latency_micros,
        }));
        decision
    }

    /// A lease covering exactly the storage behind `accesses`, all of which
    /// must be granted to the principal under the active snapshot. Leases
    /// are shared per (principal, scope), so repeated requests for the same
    /// accesses come back from the cache.
    pub async fn get_scoped_credentials(
        &self,
        principal: &Principal,
        accesses: &[(Resource, Privilege)],
    ) -> Result<Arc<CredentialLease>, LakeguardError> {
        self.get_scoped_credentials_with_context(principal, accesses, &RequestContext::now())
            .await
    }

    pub async fn get_scoped_credentials_with_context(
        &self,
        principal: &Principal,
        accesses: &[(Resource, Privilege)],
        ctx: &RequestContext,
    ) -> Result<Arc<CredentialLease>, LakeguardError> {
        let started = Instant::now();
        self.telemetry
            .credential_requests
            .fetch_add(1, Ordering::Relaxed);
        let result = self.issue_scoped(principal, accesses, ctx).await;
        let latency_micros = started.elapsed().as_micros() as u64;
        let event = match &result {
            Ok(lease) => IssuanceEvent {
                principal: principal.name().to_string(),
                fingerprint: Some(lease.fingerprint().to_string()),
                lease_id: Some(lease.id().to_string()),
                issuing_role: Some(lease.issuing_role().to_string()),
                prefix_count: lease.scope().prefix_count(),
                expires_at_epoch_ms: Some(lease.expires_at_epoch_ms()),
                ok: true,
                error: None,
                latency_micros,
            },
            Err(err) => {
                self.telemetry
                    .credential_failures
                    .fetch_add(1, Ordering::Relaxed);
                IssuanceEvent {
                    principal: principal.name().to_string(),
                    fingerprint: None,
                    lease_id: None,
                    issuing_role: None,
                    prefix_count: 0,
                    expires_at_epoch_ms: None,
                    ok: false,
                    error: Some(err.to_string()),
                    latency_micros,
                }
            }
        };
        self.audit.record(&AuditEvent::Issuance(event));
        result
    }

    async fn issue_scoped(
        &self,
        principal: &Principal,
        accesses: &[(Resource, Privilege)],
        ctx: &RequestContext,
    ) -> Result<Arc<CredentialLease>, LakeguardError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(LakeguardError::Shutdown);
        }
        let index = self
            .active
            .read()
            .clone()
            .ok_or(LakeguardError::PolicyUnavailable)?;
        for (resource, privilege) in accesses {
            let decision = evaluate(&index, principal, resource, *privilege, ctx);
            if !decision.granted {
                return Err(LakeguardError::NotGranted {
                    principal: principal.name().to_string(),
                    resource: resource.to_string(),
                    privilege: privilege.as_str().to_string(),
                });
            }
        }
        let scope = resolve_scope(self.resolver.as_ref(), accesses).await?;
        self.cache.get(principal.name(), &scope).await
    }

    /// Publishes a snapshot, replacing the active index. Versions must move
    /// forward; an offered version at or below the active one is rejected
    /// and the active snapshot keeps serving.
    pub fn load_snapshot(
        &self,
        snapshot: PolicySnapshot,
    ) -> Result<IndexBuildReport, LakeguardError> {
        publish_policy(
            &self.active,
            &self.telemetry,
            LoadedPolicy {
                snapshot,
                rejected: Vec::new(),
            },
        )
    }

    /// Parses and publishes a policy document in one step.
    pub fn load_policy_text(&self, text: &str) -> Result<IndexBuildReport, LakeguardError> {
        let loaded = parse_policy(text)?;
        publish_policy(&self.active, &self.telemetry, loaded)
    }

    pub fn active_snapshot_version(&self) -> Option<u64> {
        self.active.read().as_ref().map(|index| index.version())
    }

    /// Polls the store on the configured interval and publishes any strictly
    /// newer snapshot it returns. Fetch failures are counted and logged; the
    /// active snapshot keeps serving through them.
    pub fn start_policy_poller(&self, store: Arc<dyn GrantStore>) {
        let active = Arc::clone(&self.active);
        let telemetry = Arc::clone(&self.telemetry);
        let shut_down = Arc::clone(&self.shut_down);
        let period = Duration::from_millis(self.config.snapshot_poll_interval_ms);
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            loop {
                timer.tick().await;
                if shut_down.load(Ordering::Acquire) {
                    break;
                }
                let loaded = match store.fetch().await {
                    Ok(loaded) => loaded,
                    Err(err) => {
                        telemetry.poll_failures.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            error = %err,
                            "policy fetch failed; keeping active snapshot"
                        );
                        continue;
                    }
                };
                let current = active.read().as_ref().map(|index| index.version());
                if current.is_some_and(|version| loaded.snapshot.version <= version) {
                    continue;
                }
                if let Err(err) = publish_policy(&active, &telemetry, loaded) {
                    tracing::warn!(error = %err, "fetched snapshot was not publishable");
                }
            }
        });
        self.background_tasks
            .lock()
            .expect("background task list poisoned")
            .push(handle);
    }

    /// Sweeps expired leases out of the credential cache on the configured
    /// interval.
    pub fn start_cache_sweeper(&self) {
        let cache = self.cache.clone();
        let shut_down = Arc::clone(&self.shut_down);
        let period = Duration::from_millis(self.config.cache_sweep_interval_ms);
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            timer.tick().await;
            loop {
                timer.tick().await;
                if shut_down.load(Ordering::Acquire) {
                    break;
                }
                cache.sweep();
            }
        });
        self.background_tasks
            .lock()
            .expect("background task list poisoned")
            .push(handle);
    }

    /// Stops issuance and tears down background tasks. Decisions keep being
    /// answered from the last snapshot. Audit events still queued when the
    /// forwarder stops are dropped.
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self
                .background_tasks
                .lock()
                .expect("background task list poisoned");
            guard.drain(..).collect()
        };
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
    }

    pub fn metrics(&self) -> BrokerMetrics {
        let checks_total = self.telemetry.checks_total.load(Ordering::Relaxed);
        let latency_total = self.telemetry.check_latency_micros.load(Ordering::Relaxed);
        BrokerMetrics {
            checks_total,
            checks_denied: self.telemetry.checks_denied.load(Ordering::Relaxed),
            avg_check_latency_micros: latency_total / checks_total.max(1),
            no_policy_checks: self.telemetry.no_policy_checks.load(Ordering::Relaxed),
            credential_requests: self.telemetry.credential_requests.load(Ordering::Relaxed),
            credential_failures: self.telemetry.credential_failures.load(Ordering::Relaxed),
            snapshot_loads: self.telemetry.snapshot_loads.load(Ordering::Relaxed),
            stale_snapshots: self.telemetry.stale_snapshots.load(Ordering::Relaxed),
            poll_failures: self.telemetry.poll_failures.load(Ordering::Relaxed),
            active_snapshot_version: self.active_snapshot_version(),
            audit_events_dropped: self.audit.dropped(),
            cache: self.cache.metrics(),
        }
    }
}

impl Drop for AccessBroker {
    fn drop(&mut self) {
        if Arc::strong_count(&self.background_tasks) != 1 {
            return;
        }
        let mut handles = self
            .background_tasks
            .lock()
            .expect("background task list poisoned");
        for handle in handles.drain(..) {
            handle.abort();
        }
    }
}

fn publish_policy(
    active: &RwLock<Option<Arc<PermissionIndex>>>,
    telemetry: &BrokerTelemetry,
    loaded: LoadedPolicy,
) -> Result<IndexBuildReport, LakeguardError> {
    let offered = loaded.snapshot.version;
    let current = active.read().as_ref().map(|index| index.version());
    if let Some(current) = current {
        if offered <= current {
            telemetry.stale_snapshots.fetch_add(1, Ordering::Relaxed);
            return Err(LakeguardError::StaleSnapshot {
                offered,
                active: current,
            });
        }
    }

    let parse_rejections = loaded.rejected;
    let (index, mut report) = PermissionIndex::build(loaded.snapshot);
    if !parse_rejections.is_empty() {
        let mut merged = parse_rejections;
        merged.extend(report.rejected);
        report.rejected = merged;
    }

    {
        // Version re-checked under the write lock; two concurrent publishes
        // race the read check above.
        let mut guard = active.write();
        if let Some(current) = guard.as_ref() {
            if offered <= current.version() {
                let active_version = current.version();
                telemetry.stale_snapshots.fetch_add(1, Ordering::Relaxed);
                return Err(LakeguardError::StaleSnapshot {
                    offered,
                    active: active_version,
                });
            }
        }
        *guard = Some(Arc::new(index));
    }
    telemetry.snapshot_loads.fetch_add(1, Ordering::Relaxed);
    tracing::info!(
        version = offered,
        accepted = report.accepted,
        rejected = report.rejected.len(),
        "policy snapshot published"
    );
    Ok(report)
}
