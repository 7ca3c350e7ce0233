use crate::model::{Grant, PolicySnapshot, Resource, ResourceLevel};
use compact_str::CompactString;
use std::collections::HashMap;

/// Total specificity order over matched grants. Field order is the
/// comparison order: deeper tier first, then exact resource over wildcard,
/// exact user over group, and finally later definition over earlier. Two
/// distinct matched grants never compare equal because `seq` is unique
/// within a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MatchRank {
    pub tier: ResourceLevel,
    pub exact_resource: bool,
    pub exact_principal: bool,
    pub seq: u64,
}

/// A grant accepted into the index, with its specificity precomputed.
#[derive(Debug)]
pub struct IndexedGrant {
    pub seq: u64,
    pub grant: Grant,
    tier: ResourceLevel,
    exact_resource: bool,
}

impl IndexedGrant {
    pub fn tier(&self) -> ResourceLevel {
        self.tier
    }

    pub fn rank(&self) -> MatchRank {
        MatchRank {
            tier: self.tier,
            exact_resource: self.exact_resource,
            exact_principal: self.grant.principal_pattern.is_exact_user(),
            seq: self.seq,
        }
    }
}

/// A grant dropped during snapshot parsing or indexing, with where it sat in
/// its source list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantRejection {
    pub position: usize,
    pub pattern: String,
    pub reason: String,
}

/// What a snapshot publication accepted and what it skipped. Rejections are
/// already logged by the time the report is returned; the report exists so
/// callers can surface them without re-parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexBuildReport {
    pub snapshot_version: u64,
    pub accepted: usize,
    pub rejected: Vec<GrantRejection>,
}

#[derive(Debug, Default)]
struct PatternNode {
    exact: Vec<u32>,
    wildcard: Vec<u32>,
    children: HashMap<CompactString, PatternNode>,
}

/// Immutable lookup structure over one policy snapshot. Grants are keyed by
/// the exact leading segments of their resource pattern, so matching a
/// resource is one walk from the root along its name.
///
/// The index is built once per publication and never mutated; readers share
/// it through an `Arc` and a snapshot swap can never tear an in-flight
/// evaluation.
#[derive(Debug)]
pub struct PermissionIndex {
    version: u64,
    grants: Vec<IndexedGrant>,
    root: PatternNode,
}

impl PermissionIndex {
    /// Indexes every valid grant of the snapshot. Grants that fail
    /// validation are skipped and reported, never a build failure: one bad
    /// rule must not take the whole policy down.
    pub fn build(snapshot: PolicySnapshot) -> (Self, IndexBuildReport) {
        let PolicySnapshot { version, grants } = snapshot;
        let mut index = PermissionIndex {
            version,
            grants: Vec::with_capacity(grants.len()),
            root: PatternNode::default(),
        };
        let mut rejected = Vec::new();

        for (position, grant) in grants.into_iter().enumerate() {
            if let Err(reason) = grant.validate() {
                tracing::warn!(
                    snapshot_version = version,
                    position = position,
                    pattern = %grant.resource_pattern,
                    reason = %reason,
                    "skipping invalid grant"
                );
                rejected.push(GrantRejection {
                    position,
                    pattern: grant.resource_pattern.to_string(),
                    reason,
                });
                continue;
            }
            index.insert(position as u64, grant);
        }

        let report = IndexBuildReport {
            snapshot_version: version,
            accepted: index.grants.len(),
            rejected,
        };
        (index, report)
    }

    fn insert(&mut self, seq: u64, grant: Grant) {
        let idx = self.grants.len() as u32;
        let pattern = &grant.resource_pattern;

        let mut node = &mut self.root;
        for segment in pattern.base_segments() {
            node = node
                .children
                .entry(CompactString::from(segment))
                .or_default();
        }
        if pattern.is_wildcard() {
            node.wildcard.push(idx);
        } else {
            node.exact.push(idx);
        }

        let tier = pattern.tier();
        let exact_resource = !pattern.is_wildcard();
        self.grants.push(IndexedGrant {
            seq,
            grant,
            tier,
            exact_resource,
        });
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn grant_count(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    /// All grants whose resource pattern covers `resource`, by one walk down
    /// the name's segments. Exact patterns on the walked path always cover
    /// the resource; a wildcard at the final node would only cover names
    /// strictly beneath the resource, so it is excluded there.
    pub fn covering(&self, resource: &Resource) -> Vec<&IndexedGrant> {
        let mut hits = Vec::new();
        let mut node = Some(&self.root);

        for segment in resource.segments() {
            let Some(current) = node else {
                break;
            };
            for &idx in &current.exact {
                hits.push(&self.grants[idx as usize]);
            }
            for &idx in &current.wildcard {
                hits.push(&self.grants[idx as usize]);
            }
            node = current.children.get(segment);
        }

        if let Some(last) = node {
            for &idx in &last.exact {
                hits.push(&self.grants[idx as usize]);
            }
        }
        hits
    }
}

#[cfg(test)]
mod tests {
    use super::{MatchRank, PermissionIndex};
    use crate::model::{
        Effect, Grant, GrantCondition, PolicySnapshot, PrincipalPattern, Privilege, Resource,
        ResourceLevel,
    };
    use proptest::prelude::*;

    fn allow(principal: &str, pattern: &str) -> Grant {
        Grant::new(
            principal.parse().expect("principal"),
            pattern.parse().expect("pattern"),
            [Privilege::Select],
            Effect::Allow,
        )
    }

    #[test]
    fn covering_walks_the_resource_path() {
        let snapshot = PolicySnapshot::new(
            1,
            vec![
                allow("alice", "cat"),
                allow("alice", "cat.*"),
                allow("alice", "cat.sales"),
                allow("alice", "cat.sales.*"),
                allow("alice", "cat.sales.customers"),
                allow("alice", "cat.hr.*"),
                allow("alice", "other"),
            ],
        );
        let (index, report) = PermissionIndex::build(snapshot);
        assert_eq!(report.accepted, 7);
        assert!(report.rejected.is_empty());

        let seqs = |resource: &Resource| {
            let mut s: Vec<u64> = index.covering(resource).iter().map(|g| g.seq).collect();
            s.sort_unstable();
            s
        };

        assert_eq!(
            seqs(&Resource::table("cat", "sales", "customers")),
            vec![0, 1, 2, 3, 4]
        );
        // The wildcard at the table's own node covers columns, not the table.
        assert_eq!(
            seqs(&Resource::column("cat", "sales", "customers", "ssn")),
            vec![0, 1, 2, 3, 4]
        );
        assert_eq!(seqs(&Resource::schema("cat", "sales")), vec![0, 1, 2]);
        assert_eq!(seqs(&Resource::catalog("cat")), vec![0]);
        assert_eq!(seqs(&Resource::catalog("other")), vec![6]);
        assert_eq!(seqs(&Resource::catalog("unknown")), Vec::<u64>::new());
    }

    #[test]
    fn wildcard_under_table_covers_only_columns() {
        let snapshot = PolicySnapshot::new(1, vec![allow("alice", "cat.sales.customers.*")]);
        let (index, _) = PermissionIndex::build(snapshot);
        assert!(index
            .covering(&Resource::table("cat", "sales", "customers"))
            .is_empty());
        assert_eq!(
            index
                .covering(&Resource::column("cat", "sales", "customers", "ssn"))
                .len(),
            1
        );
    }

    #[test]
    fn invalid_grants_are_skipped_and_reported() {
        let no_privileges = Grant::new(
            PrincipalPattern::user("alice"),
            "cat".parse().expect("pattern"),
            [],
            Effect::Allow,
        );
        let bad_condition = Grant::new(
            PrincipalPattern::user("alice"),
            "cat.sales".parse().expect("pattern"),
            [Privilege::Select],
            Effect::Allow,
        )
        .with_conditions([GrantCondition::TimeOfDay {
            start_minute: 9_999,
            end_minute: 0,
        }]);
        let snapshot = PolicySnapshot::new(
            3,
            vec![no_privileges, allow("alice", "cat"), bad_condition],
        );
        let (index, report) = PermissionIndex::build(snapshot);
        assert_eq!(index.version(), 3);
        assert_eq!(index.grant_count(), 1);
        assert_eq!(report.accepted, 1);
        assert_eq!(report.rejected.len(), 2);
        assert_eq!(report.rejected[0].position, 0);
        assert_eq!(report.rejected[1].position, 2);
        assert_eq!(report.rejected[1].pattern, "cat.sales");
    }

    #[test]
    fn rank_orders_tier_then_exactness_then_recency() {
        let rank = |tier, exact_resource, exact_principal, seq| MatchRank {
            tier,
            exact_resource,
            exact_principal,
            seq,
        };
        // Deeper tier beats everything at a shallower one.
        assert!(
            rank(ResourceLevel::Column, false, false, 0)
                > rank(ResourceLevel::Table, true, true, 99)
        );
        // Same tier: exact resource beats wildcard.
        assert!(
            rank(ResourceLevel::Table, true, false, 0) > rank(ResourceLevel::Table, false, true, 99)
        );
        // Same tier and exactness: exact user beats group.
        assert!(
            rank(ResourceLevel::Table, true, true, 0) > rank(ResourceLevel::Table, true, false, 99)
        );
        // Full tie: the later grant wins.
        assert!(
            rank(ResourceLevel::Table, true, true, 5) > rank(ResourceLevel::Table, true, true, 4)
        );
    }

    #[test]
    fn seq_follows_snapshot_position_across_rejections() {
        let snapshot = PolicySnapshot::new(
            1,
            vec![
                Grant::new(
                    PrincipalPattern::user("alice"),
                    "cat".parse().expect("pattern"),
                    [],
                    Effect::Allow,
                ),
                allow("alice", "cat"),
            ],
        );
        let (index, _) = PermissionIndex::build(snapshot);
        let hits = index.covering(&Resource::catalog("cat"));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].seq, 1);
    }

    fn arb_rank() -> impl Strategy<Value = MatchRank> {
        (
            prop::sample::select(vec![
                ResourceLevel::Catalog,
                ResourceLevel::Schema,
                ResourceLevel::Table,
                ResourceLevel::Column,
            ]),
            any::<bool>(),
            any::<bool>(),
            0u64..32,
        )
            .prop_map(|(tier, exact_resource, exact_principal, seq)| MatchRank {
                tier,
                exact_resource,
                exact_principal,
                seq,
            })
    }

    proptest! {
        #[test]
        fn rank_comparison_is_tier_first_lexicographic(a in arb_rank(), b in arb_rank()) {
            let expected = a
                .tier
                .cmp(&b.tier)
                .then(a.exact_resource.cmp(&b.exact_resource))
                .then(a.exact_principal.cmp(&b.exact_principal))
                .then(a.seq.cmp(&b.seq));
            prop_assert_eq!(a.cmp(&b), expected);
            if a.tier > b.tier {
                prop_assert!(a > b);
            }
        }
    }
}
