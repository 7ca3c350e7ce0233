//! Storage scopes: the minimal set of object-store prefixes a credential
//! must cover, and the fingerprint that keys the credential cache.

pub mod resolver;

pub use resolver::{resolve_scope, LocationResolver, StaticLocationResolver};

use crate::model::Privilege;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;

/// A normalized object-store location, e.g. `s3://bucket/warehouse/sales/`.
///
/// Normalization appends a trailing `/`, which keeps containment on segment
/// boundaries: `s3://b/a/` covers `s3://b/a/x/` but never `s3://b/ab/`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoragePrefix(String);

impl StoragePrefix {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err("empty location".to_string());
        }
        let Some((scheme, rest)) = trimmed.split_once("://") else {
            return Err(format!("location '{trimmed}' has no scheme"));
        };
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(format!("location '{trimmed}' has an invalid scheme"));
        }
        if rest.is_empty() {
            return Err(format!("location '{trimmed}' names no bucket"));
        }
        let mut normalized = trimmed.to_string();
        if !normalized.ends_with('/') {
            normalized.push('/');
        }
        Ok(StoragePrefix(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when every object under `other` is also under `self`.
    pub fn covers(&self, other: &StoragePrefix) -> bool {
        other.0.starts_with(&self.0)
    }
}

impl fmt::Display for StoragePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a privilege needs from storage. Only data-touching privileges map
/// to an action; DDL and grant administration never widen a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScopeAction {
    Read,
    Write,
}

impl ScopeAction {
    pub fn for_privilege(privilege: Privilege) -> Option<Self> {
        match privilege {
            Privilege::Select => Some(ScopeAction::Read),
            Privilege::Insert => Some(ScopeAction::Write),
            Privilege::Delete | Privilege::Create | Privilege::Drop | Privilege::Grant => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScopeAction::Read => "read",
            ScopeAction::Write => "write",
        }
    }
}

/// The storage footprint of one credential request: read and write prefix
/// sets, each kept minimal under containment. Read and write never merge
/// into each other, so folding locations cannot widen an action.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageScope {
    read: BTreeSet<StoragePrefix>,
    write: BTreeSet<StoragePrefix>,
}

impl StorageScope {
    pub fn insert(&mut self, action: ScopeAction, prefix: StoragePrefix) {
        let set = match action {
            ScopeAction::Read => &mut self.read,
            ScopeAction::Write => &mut self.write,
        };
        if set.iter().any(|existing| existing.covers(&prefix)) {
            return;
        }
        set.retain(|existing| !prefix.covers(existing));
        set.insert(prefix);
    }

    pub fn is_empty(&self) -> bool {
        self.read.is_empty() && self.write.is_empty()
    }

    pub fn read_prefixes(&self) -> impl Iterator<Item = &StoragePrefix> {
        self.read.iter()
    }

    pub fn write_prefixes(&self) -> impl Iterator<Item = &StoragePrefix> {
        self.write.iter()
    }

    pub fn prefix_count(&self) -> usize {
        self.read.len() + self.write.len()
    }

    /// True when a credential cut for `self` could serve every access that
    /// one cut for `other` could.
    pub fn covers(&self, other: &StorageScope) -> bool {
        let covered = |set: &BTreeSet<StoragePrefix>, p: &StoragePrefix| {
            set.iter().any(|mine| mine.covers(p))
        };
        other.read.iter().all(|p| covered(&self.read, p))
            && other.write.iter().all(|p| covered(&self.write, p))
    }

    /// Stable digest of the principal and the canonical scope. Two requests
    /// that reduce to the same minimal scope for the same principal collide
    /// here on purpose, so they share one cached credential.
    pub fn fingerprint(&self, principal: &str) -> ScopeFingerprint {
        let mut hasher = Sha256::new();
        hasher.update(b"lakeguard.scope.v1\x00");
        hasher.update(principal.as_bytes());
        hasher.update([0x00]);
        hasher.update(b"read\x00");
        for prefix in &self.read {
            hasher.update(prefix.as_str().as_bytes());
            hasher.update([0x00]);
        }
        hasher.update(b"write\x00");
        for prefix in &self.write {
            hasher.update(prefix.as_str().as_bytes());
            hasher.update([0x00]);
        }
        ScopeFingerprint(hasher.finalize().into())
    }
}

/// Cache key for issued credentials.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeFingerprint([u8; 32]);

impl ScopeFingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ScopeFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ScopeFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScopeFingerprint({})", &hex::encode(self.0)[..12])
    }
}

#[cfg(test)]
mod tests {
    use super::{ScopeAction, StoragePrefix, StorageScope};
    use crate::model::Privilege;
    use proptest::prelude::*;

    fn prefix(s: &str) -> StoragePrefix {
        StoragePrefix::parse(s).expect("prefix")
    }

    #[test]
    fn parse_normalizes_and_validates() {
        assert_eq!(prefix("s3://bucket/a").as_str(), "s3://bucket/a/");
        assert_eq!(prefix("s3://bucket/a/").as_str(), "s3://bucket/a/");
        assert_eq!(prefix(" s3://bucket ").as_str(), "s3://bucket/");
        assert!(StoragePrefix::parse("").is_err());
        assert!(StoragePrefix::parse("no-scheme/path").is_err());
        assert!(StoragePrefix::parse("://bucket").is_err());
        assert!(StoragePrefix::parse("s3://").is_err());
    }

    #[test]
    fn containment_respects_segment_boundaries() {
        let a = prefix("s3://b/a");
        assert!(a.covers(&prefix("s3://b/a/x")));
        assert!(a.covers(&prefix("s3://b/a")));
        assert!(!a.covers(&prefix("s3://b/ab")));
        assert!(!prefix("s3://b/a/x").covers(&a));
        assert!(!prefix("gs://b/a").covers(&prefix("s3://b/a")));
    }

    #[test]
    fn insert_folds_contained_prefixes() {
        let mut scope = StorageScope::default();
        scope.insert(ScopeAction::Read, prefix("s3://b/warehouse/sales/q1"));
        scope.insert(ScopeAction::Read, prefix("s3://b/warehouse/sales/q2"));
        scope.insert(ScopeAction::Read, prefix("s3://b/warehouse/sales"));
        scope.insert(ScopeAction::Read, prefix("s3://b/warehouse/sales/q3"));

        let reads: Vec<_> = scope.read_prefixes().map(|p| p.as_str()).collect();
        assert_eq!(reads, vec!["s3://b/warehouse/sales/"]);
    }

    #[test]
    fn read_and_write_never_fold_into_each_other() {
        let mut scope = StorageScope::default();
        scope.insert(ScopeAction::Read, prefix("s3://b/warehouse"));
        scope.insert(ScopeAction::Write, prefix("s3://b/warehouse/staging"));

        assert_eq!(scope.read_prefixes().count(), 1);
        let writes: Vec<_> = scope.write_prefixes().map(|p| p.as_str()).collect();
        assert_eq!(writes, vec!["s3://b/warehouse/staging/"]);
    }

    #[test]
    fn privilege_mapping_is_read_write_only() {
        assert_eq!(
            ScopeAction::for_privilege(Privilege::Select),
            Some(ScopeAction::Read)
        );
        assert_eq!(
            ScopeAction::for_privilege(Privilege::Insert),
            Some(ScopeAction::Write)
        );
        for p in [
            Privilege::Delete,
            Privilege::Create,
            Privilege::Drop,
            Privilege::Grant,
        ] {
            assert_eq!(ScopeAction::for_privilege(p), None);
        }
    }

    #[test]
    fn fingerprint_ignores_insertion_order() {
        let mut a = StorageScope::default();
        a.insert(ScopeAction::Read, prefix("s3://b/x"));
        a.insert(ScopeAction::Write, prefix("s3://b/y"));
        let mut b = StorageScope::default();
        b.insert(ScopeAction::Write, prefix("s3://b/y"));
        b.insert(ScopeAction::Read, prefix("s3://b/x"));
        assert_eq!(a.fingerprint("alice"), b.fingerprint("alice"));
    }

    #[test]
    fn fingerprint_separates_principal_and_action() {
        let mut read = StorageScope::default();
        read.insert(ScopeAction::Read, prefix("s3://b/x"));
        let mut write = StorageScope::default();
        write.insert(ScopeAction::Write, prefix("s3://b/x"));

        assert_ne!(read.fingerprint("alice"), read.fingerprint("bob"));
        assert_ne!(read.fingerprint("alice"), write.fingerprint("alice"));
        assert_eq!(read.fingerprint("alice"), read.fingerprint("alice"));
        assert_eq!(read.fingerprint("alice").to_string().len(), 64);
    }

    fn arb_prefix() -> impl Strategy<Value = StoragePrefix> {
        (
            prop::sample::select(vec!["s3://b", "s3://c"]),
            prop::collection::vec(prop::sample::select(vec!["a", "b", "ab", "x1"]), 0..4),
        )
            .prop_map(|(bucket, segments)| {
                let mut raw = bucket.to_string();
                for segment in segments {
                    raw.push('/');
                    raw.push_str(segment);
                }
                StoragePrefix::parse(&raw).expect("generated prefix")
            })
    }

    proptest! {
        #[test]
        fn merged_scope_covers_every_input(prefixes in prop::collection::vec(arb_prefix(), 1..12)) {
            let mut scope = StorageScope::default();
            for p in &prefixes {
                scope.insert(ScopeAction::Read, p.clone());
            }
            for p in &prefixes {
                prop_assert!(scope.read_prefixes().any(|kept| kept.covers(p)));
            }
        }

        #[test]
        fn merged_scope_is_minimal(prefixes in prop::collection::vec(arb_prefix(), 1..12)) {
            let mut scope = StorageScope::default();
            for p in &prefixes {
                scope.insert(ScopeAction::Read, p.clone());
            }
            let kept: Vec<_> = scope.read_prefixes().cloned().collect();
            for (i, a) in kept.iter().enumerate() {
                for (j, b) in kept.iter().enumerate() {
                    if i != j {
                        prop_assert!(!a.covers(b));
                    }
                }
            }
        }

        #[test]
        fn merged_scope_keeps_only_input_prefixes(prefixes in prop::collection::vec(arb_prefix(), 1..12)) {
            let mut scope = StorageScope::default();
            for p in &prefixes {
                scope.insert(ScopeAction::Read, p.clone());
            }
            for kept in scope.read_prefixes() {
                prop_assert!(prefixes.contains(kept));
            }
        }

        #[test]
        fn insertion_order_never_changes_the_result(prefixes in prop::collection::vec(arb_prefix(), 1..8)) {
            let mut forward = StorageScope::default();
            for p in &prefixes {
                forward.insert(ScopeAction::Read, p.clone());
            }
            let mut backward = StorageScope::default();
            for p in prefixes.iter().rev() {
                backward.insert(ScopeAction::Read, p.clone());
            }
            prop_assert_eq!(forward, backward);
        }
    }
}
