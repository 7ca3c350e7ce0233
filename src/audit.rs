//! Audit trail for decisions and issuances. Emission is fire-and-forget:
//! recording never blocks or fails the request that produced the event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One access check, as recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionEvent {
    pub principal: String,
    pub resource: String,
    pub privilege: &'static str,
    pub granted: bool,
    pub reason: &'static str,
    pub matched_grant: Option<String>,
    pub snapshot_version: Option<u64>,
    pub latency_micros: u64,
}

/// One credential request, successful or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuanceEvent {
    pub principal: String,
    /// Absent when the request failed before a scope was resolved.
    pub fingerprint: Option<String>,
    pub lease_id: Option<String>,
    /// Upstream role the served lease was issued under.
    pub issuing_role: Option<String>,
    pub prefix_count: usize,
    pub expires_at_epoch_ms: Option<u64>,
    pub ok: bool,
    pub error: Option<String>,
    pub latency_micros: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditEvent {
    Decision(DecisionEvent),
    Issuance(IssuanceEvent),
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// Writes events as structured log lines under the `lakeguard::audit`
/// target, one line per event.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) {
        match event {
            AuditEvent::Decision(d) => {
                tracing::info!(
                    target: "lakeguard::audit",
                    principal = %d.principal,
                    resource = %d.resource,
                    privilege = d.privilege,
                    granted = d.granted,
                    reason = d.reason,
                    matched_grant = ?d.matched_grant,
                    snapshot_version = ?d.snapshot_version,
                    latency_micros = d.latency_micros,
                    "access decision"
                );
            }
            AuditEvent::Issuance(i) => {
                tracing::info!(
                    target: "lakeguard::audit",
                    principal = %i.principal,
                    fingerprint = ?i.fingerprint,
                    lease_id = ?i.lease_id,
                    issuing_role = ?i.issuing_role,
                    prefix_count = i.prefix_count,
                    expires_at_epoch_ms = ?i.expires_at_epoch_ms,
                    ok = i.ok,
                    error = ?i.error,
                    latency_micros = i.latency_micros,
                    "credential issuance"
                );
            }
        }
    }
}

/// Bounded hand-off in front of a downstream sink. `record` is a `try_send`:
/// when the queue is full the event is dropped and counted rather than
/// stalling the caller.
#[derive(Debug, Clone)]
pub struct BufferedAuditSink {
    tx: mpsc::Sender<AuditEvent>,
    dropped: Arc<AtomicU64>,
}

impl BufferedAuditSink {
    /// The sink half and the queue to drain. Pair with
    /// [`BufferedAuditSink::spawn_forwarder`] unless the caller drains the
    /// receiver itself.
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Forwards queued events to `downstream` until every sink handle is
    /// gone and the queue has drained.
    pub fn spawn_forwarder(
        mut rx: mpsc::Receiver<AuditEvent>,
        downstream: Arc<dyn AuditSink>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                downstream.record(&event);
            }
        })
    }

    /// Events discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AuditSink for BufferedAuditSink {
    fn record(&self, event: &AuditEvent) {
        if self.tx.try_send(event.clone()).is_err() {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::debug!(dropped_total = total, "audit event dropped, queue full or closed");
        }
    }
}
