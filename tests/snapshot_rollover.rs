use async_trait::async_trait;
use lakeguard::AccessBroker;
use lakeguard::config::BrokerConfig;
use lakeguard::credential::{CredentialIssuer, CredentialMaterial, IssuedCredential};
use lakeguard::error::{LakeguardError, LakeguardErrorCode};
use lakeguard::model::{Effect, Grant, PolicySnapshot, Principal, Privilege, Resource};
use lakeguard::policy::FileGrantStore;
use lakeguard::scope::{StaticLocationResolver, StorageScope};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tempfile::tempdir;
use tokio::task::JoinSet;

struct CountingIssuer {
    calls: AtomicU64,
}

#[async_trait]
impl CredentialIssuer for CountingIssuer {
    async fn issue(
        &self,
        principal: &str,
        _scope: &StorageScope,
    ) -> Result<IssuedCredential, LakeguardError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(IssuedCredential {
            material: CredentialMaterial::new("AKIDTEST", "secret", format!("token-{principal}")),
            ttl: Duration::from_secs(900),
            issuing_role: "arn:aws:iam::123456789012:role/warehouse".to_string(),
        })
    }
}

fn broker() -> (AccessBroker, Arc<CountingIssuer>) {
    let issuer = Arc::new(CountingIssuer {
        calls: AtomicU64::new(0),
    });
    let broker = AccessBroker::builder(BrokerConfig {
        snapshot_poll_interval_ms: 1_000,
        ..BrokerConfig::development()
    })
    .issuer(Arc::clone(&issuer) as Arc<dyn CredentialIssuer>)
    .resolver(Arc::new(
        StaticLocationResolver::new()
            .with_location(Resource::catalog("lake"), "s3://warehouse/")
            .expect("catalog location"),
    ))
    .build()
    .expect("broker builds");
    (broker, issuer)
}

fn grant(principal: &str, pattern: &str, privileges: &[Privilege], effect: Effect) -> Grant {
    Grant::new(
        principal.parse().expect("principal pattern"),
        pattern.parse().expect("resource pattern"),
        privileges.iter().copied(),
        effect,
    )
}

async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

/// Checks racing a snapshot swap must each land wholly in one snapshot:
/// under version 1 the access is granted, under version 2 it is denied, and
/// the version a decision reports always agrees with its outcome.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn decisions_are_never_torn_across_a_swap() {
    let (broker, _issuer) = broker();
    broker
        .load_snapshot(PolicySnapshot::new(
            1,
            vec![grant(
                "alice",
                "lake.sales.*",
                &[Privilege::Select],
                Effect::Allow,
            )],
        ))
        .expect("publish v1");
    let broker = Arc::new(broker);

    let mut tasks = JoinSet::new();
    for _ in 0..4 {
        let broker = Arc::clone(&broker);
        tasks.spawn(async move {
            let alice = Principal::new("alice");
            let orders = Resource::table("lake", "sales", "orders");
            // Check until the swap becomes visible, so every task is
            // guaranteed to straddle it.
            let mut observed = Vec::new();
            for i in 0.. {
                let decision = broker.check_access(&alice, &orders, Privilege::Select);
                let version = decision.snapshot_version;
                observed.push((decision.granted, version));
                if version == Some(2) {
                    break;
                }
                if i % 16 == 0 {
                    tokio::task::yield_now().await;
                }
                assert!(i < 1_000_000, "snapshot swap never became visible");
            }
            observed
        });
    }

    tokio::task::yield_now().await;
    broker
        .load_snapshot(PolicySnapshot::new(
            2,
            vec![grant(
                "alice",
                "lake.sales.*",
                &[Privilege::Select],
                Effect::Deny,
            )],
        ))
        .expect("publish v2");

    while let Some(joined) = tasks.join_next().await {
        let observed = joined.expect("task completes");
        let mut previous = 0;
        assert_eq!(observed.last().map(|(_, v)| *v), Some(Some(2)));
        for (granted, version) in observed {
            let version = version.expect("a snapshot was active");
            match version {
                1 => assert!(granted),
                2 => assert!(!granted),
                other => panic!("unexpected snapshot version {other}"),
            }
            // Within one task the active version never goes backwards.
            assert!(version >= previous);
            previous = version;
        }
    }
    assert_eq!(broker.active_snapshot_version(), Some(2));
}

/// Revoking a grant gates the next credential request immediately. The
/// lease already in a holder's hands stays usable until its own expiry;
/// revocation is not a recall.
#[tokio::test]
async fn revocation_blocks_new_credentials_not_live_leases() {
    let (broker, issuer) = broker();
    broker
        .load_snapshot(PolicySnapshot::new(
            1,
            vec![grant(
                "alice",
                "lake.sales.*",
                &[Privilege::Select],
                Effect::Allow,
            )],
        ))
        .expect("publish v1");

    let alice = Principal::new("alice");
    let accesses = [(Resource::table("lake", "sales", "orders"), Privilege::Select)];
    let lease = broker
        .get_scoped_credentials(&alice, &accesses)
        .await
        .expect("lease under v1");

    broker
        .load_snapshot(PolicySnapshot::new(2, Vec::new()))
        .expect("publish v2 revoking everything");

    let err = broker
        .get_scoped_credentials(&alice, &accesses)
        .await
        .err()
        .expect("revoked access refused");
    assert_eq!(err.code(), LakeguardErrorCode::NotGranted);
    assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);

    assert!(!lease.material().session_token().is_empty());
    assert!(lease.ttl() > Duration::ZERO);
}

/// The poller follows the file through its life: initial load, a corrupt
/// interlude that changes nothing, a regressed version that is ignored, and
/// finally a real successor.
#[tokio::test(start_paused = true)]
async fn the_poller_rides_out_bad_writes() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("grants.json");
    std::fs::write(
        &path,
        r#"{"version":1,"grants":[{"principalPattern":"alice","resourcePattern":"lake.sales.*","privileges":["SELECT"],"effect":"ALLOW"}]}"#,
    )
    .expect("seed policy");

    let (broker, _issuer) = broker();
    broker.start_policy_poller(Arc::new(FileGrantStore::new(&path)));
    settle().await;
    assert_eq!(broker.active_snapshot_version(), Some(1));

    // Truncated JSON: the fetch fails, the active snapshot keeps serving.
    std::fs::write(&path, r#"{"version":2,"grants":["#).expect("corrupt policy");
    tokio::time::advance(Duration::from_millis(1_000)).await;
    settle().await;
    assert_eq!(broker.active_snapshot_version(), Some(1));
    assert!(broker.metrics().poll_failures >= 1);

    // A version rollback is skipped without disturbing the active snapshot.
    std::fs::write(&path, r#"{"version":0,"grants":[]}"#).expect("regressed policy");
    tokio::time::advance(Duration::from_millis(1_000)).await;
    settle().await;
    assert_eq!(broker.active_snapshot_version(), Some(1));

    std::fs::write(&path, r#"{"version":3,"grants":[]}"#).expect("advance policy");
    tokio::time::advance(Duration::from_millis(1_000)).await;
    settle().await;
    assert_eq!(broker.active_snapshot_version(), Some(3));

    let alice = Principal::new("alice");
    let decision = broker.check_access(
        &alice,
        &Resource::table("lake", "sales", "orders"),
        Privilege::Select,
    );
    assert!(!decision.granted);
    broker.shutdown().await;
}

/// Stale explicit loads leave both the active snapshot and the caches of
/// everyone already holding leases untouched.
#[tokio::test]
async fn explicit_stale_loads_change_nothing() {
    let (broker, issuer) = broker();
    broker
        .load_snapshot(PolicySnapshot::new(
            4,
            vec![grant(
                "alice",
                "lake.sales.*",
                &[Privilege::Select],
                Effect::Allow,
            )],
        ))
        .expect("publish v4");

    let alice = Principal::new("alice");
    let accesses = [(Resource::table("lake", "sales", "orders"), Privilege::Select)];
    let before = broker
        .get_scoped_credentials(&alice, &accesses)
        .await
        .expect("lease under v4");

    let err = broker
        .load_snapshot(PolicySnapshot::new(
            4,
            vec![grant(
                "alice",
                "lake.sales.*",
                &[Privilege::Select],
                Effect::Deny,
            )],
        ))
        .err()
        .expect("same version refused");
    assert!(matches!(err, LakeguardError::StaleSnapshot { .. }));

    let after = broker
        .get_scoped_credentials(&alice, &accesses)
        .await
        .expect("still granted under v4");
    assert_eq!(after.id(), before.id());
    assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
}
