use crate::error::LakeguardError;
use crate::model::{Grant, PolicySnapshot};
use crate::policy::index::GrantRejection;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;

/// A snapshot as fetched from a source, before indexing. Grants that failed
/// to parse are dropped here, so sequence numbers inside the snapshot count
/// accepted grants only; `rejected` positions refer to the source list.
#[derive(Debug, Clone)]
pub struct LoadedPolicy {
    pub snapshot: PolicySnapshot,
    pub rejected: Vec<GrantRejection>,
}

/// Where policy snapshots come from. Implementations are polled by the
/// broker; a fetch error leaves the active snapshot serving.
#[async_trait]
pub trait GrantStore: Send + Sync {
    async fn fetch(&self) -> Result<LoadedPolicy, LakeguardError>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPolicyFile {
    version: u64,
    #[serde(default)]
    grants: Vec<serde_json::Value>,
}

/// Parses a policy document, skipping grant entries that do not parse
/// rather than failing the document. Only a missing or unreadable top level
/// is an error.
pub fn parse_policy(text: &str) -> Result<LoadedPolicy, LakeguardError> {
    let raw: RawPolicyFile =
        serde_json::from_str(text).map_err(|e| LakeguardError::PolicySource {
            reason: e.to_string(),
        })?;

    let mut grants = Vec::with_capacity(raw.grants.len());
    let mut rejected = Vec::new();
    for (position, value) in raw.grants.into_iter().enumerate() {
        match serde_json::from_value::<Grant>(value.clone()) {
            Ok(grant) => grants.push(grant),
            Err(e) => {
                tracing::warn!(
                    snapshot_version = raw.version,
                    position = position,
                    reason = %e,
                    "skipping unparseable grant"
                );
                rejected.push(GrantRejection {
                    position,
                    pattern: grant_excerpt(&value),
                    reason: e.to_string(),
                });
            }
        }
    }

    Ok(LoadedPolicy {
        snapshot: PolicySnapshot::new(raw.version, grants),
        rejected,
    })
}

fn grant_excerpt(value: &serde_json::Value) -> String {
    value
        .get("resourcePattern")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| value.to_string().chars().take(80).collect())
}

/// Policy file on local disk, the shape operators edit by hand. The broker
/// polls it on an interval and republishes when the version moves.
#[derive(Debug, Clone)]
pub struct FileGrantStore {
    path: PathBuf,
}

impl FileGrantStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl GrantStore for FileGrantStore {
    async fn fetch(&self) -> Result<LoadedPolicy, LakeguardError> {
        let text =
            std::fs::read_to_string(&self.path).map_err(|e| LakeguardError::PolicySource {
                reason: format!("{}: {e}", self.path.display()),
            })?;
        parse_policy(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_policy, FileGrantStore, GrantStore};
    use crate::error::LakeguardErrorCode;
    use crate::model::{Effect, PrincipalPattern};

    const POLICY: &str = r#"{
        "version": 12,
        "grants": [
            {
                "principalPattern": "group:analysts",
                "resourcePattern": "cat.sales.*",
                "privileges": ["SELECT"],
                "effect": "ALLOW"
            },
            {
                "principalPattern": "alice",
                "resourcePattern": "cat.sales.customers.ssn",
                "privileges": ["SELECT"],
                "effect": "DENY"
            }
        ]
    }"#;

    #[test]
    fn parses_a_well_formed_document() {
        let loaded = parse_policy(POLICY).expect("parse");
        assert_eq!(loaded.snapshot.version, 12);
        assert_eq!(loaded.snapshot.grants.len(), 2);
        assert!(loaded.rejected.is_empty());
        assert_eq!(
            loaded.snapshot.grants[0].principal_pattern,
            PrincipalPattern::group("analysts")
        );
        assert_eq!(loaded.snapshot.grants[1].effect, Effect::Deny);
    }

    #[test]
    fn bad_grants_are_skipped_not_fatal() {
        let text = r#"{
            "version": 3,
            "grants": [
                {"principalPattern": "alice", "resourcePattern": "cat.*.t",
                 "privileges": ["SELECT"], "effect": "ALLOW"},
                {"principalPattern": "alice", "resourcePattern": "cat",
                 "privileges": ["SELECT"], "effect": "ALLOW"},
                {"principalPattern": "alice", "resourcePattern": "cat.hr",
                 "privileges": ["EXECUTE"], "effect": "ALLOW"}
            ]
        }"#;
        let loaded = parse_policy(text).expect("parse");
        assert_eq!(loaded.snapshot.grants.len(), 1);
        assert_eq!(loaded.snapshot.grants[0].resource_pattern.to_string(), "cat");
        assert_eq!(loaded.rejected.len(), 2);
        assert_eq!(loaded.rejected[0].position, 0);
        assert_eq!(loaded.rejected[0].pattern, "cat.*.t");
        assert_eq!(loaded.rejected[1].position, 2);
    }

    #[test]
    fn unreadable_top_level_is_an_error() {
        let err = parse_policy("{broken").expect_err("must fail");
        assert_eq!(err.code(), LakeguardErrorCode::PolicySource);
        let err = parse_policy(r#"{"grants": []}"#).expect_err("version is required");
        assert_eq!(err.code(), LakeguardErrorCode::PolicySource);
    }

    #[test]
    fn empty_grant_list_is_a_valid_lockdown() {
        let loaded = parse_policy(r#"{"version": 1}"#).expect("parse");
        assert!(loaded.snapshot.grants.is_empty());
    }

    #[tokio::test]
    async fn file_store_reads_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("policy.json");
        std::fs::write(&path, POLICY).expect("write policy");

        let store = FileGrantStore::new(&path);
        let loaded = store.fetch().await.expect("fetch");
        assert_eq!(loaded.snapshot.version, 12);

        let missing = FileGrantStore::new(dir.path().join("absent.json"));
        let err = missing.fetch().await.expect_err("missing file");
        assert_eq!(err.code(), LakeguardErrorCode::PolicySource);
    }
}
