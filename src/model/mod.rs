//! Policy wire model: principals, grants, snapshots and the decision types
//! the evaluator hands back.

pub mod condition;
pub mod resource;

pub use condition::{GrantCondition, RequestContext, MINUTES_PER_DAY};
pub use resource::{Resource, ResourceLevel, ResourcePattern, MAX_RESOURCE_LEVELS};

use crate::error::LakeguardError;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// The identity a request runs as, with the groups it belongs to. Group
/// membership is resolved by the caller before the check; evaluation never
/// looks memberships up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    name: CompactString,
    groups: BTreeSet<CompactString>,
}

impl Principal {
    pub fn new(name: impl Into<CompactString>) -> Self {
        Self {
            name: name.into(),
            groups: BTreeSet::new(),
        }
    }

    pub fn with_groups<I, S>(name: impl Into<CompactString>, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<CompactString>,
    {
        Self {
            name: name.into(),
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|g| g.as_str())
    }

    pub fn is_member_of(&self, group: &str) -> bool {
        self.groups.contains(group)
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Who a grant applies to: one named user, or every member of a group.
/// The wire form is the bare user name or `group:<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PrincipalPattern {
    User(CompactString),
    Group(CompactString),
}

impl PrincipalPattern {
    pub fn user(name: impl Into<CompactString>) -> Self {
        PrincipalPattern::User(name.into())
    }

    pub fn group(name: impl Into<CompactString>) -> Self {
        PrincipalPattern::Group(name.into())
    }

    pub fn matches(&self, principal: &Principal) -> bool {
        match self {
            PrincipalPattern::User(name) => name == principal.name(),
            PrincipalPattern::Group(group) => principal.is_member_of(group),
        }
    }

    /// Exact-user patterns outrank group patterns when everything else ties.
    pub fn is_exact_user(&self) -> bool {
        matches!(self, PrincipalPattern::User(_))
    }
}

impl fmt::Display for PrincipalPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrincipalPattern::User(name) => f.write_str(name),
            PrincipalPattern::Group(name) => write!(f, "group:{name}"),
        }
    }
}

impl FromStr for PrincipalPattern {
    type Err = LakeguardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (pattern, name) = match s.split_once(':') {
            Some(("group", name)) => (PrincipalPattern::group(name), name),
            Some(("user", name)) => (PrincipalPattern::user(name), name),
            Some((prefix, _)) => {
                return Err(LakeguardError::MalformedGrant {
                    pattern: s.to_string(),
                    reason: format!("unknown principal kind '{prefix}'"),
                });
            }
            None => (PrincipalPattern::user(s), s),
        };
        if name.is_empty() {
            return Err(LakeguardError::MalformedGrant {
                pattern: s.to_string(),
                reason: "empty principal name".to_string(),
            });
        }
        Ok(pattern)
    }
}

impl TryFrom<String> for PrincipalPattern {
    type Error = LakeguardError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PrincipalPattern> for String {
    fn from(value: PrincipalPattern) -> Self {
        value.to_string()
    }
}

/// The closed set of operations a grant can speak to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Privilege {
    Select,
    Insert,
    Delete,
    Create,
    Drop,
    Grant,
}

impl Privilege {
    pub fn as_str(self) -> &'static str {
        match self {
            Privilege::Select => "SELECT",
            Privilege::Insert => "INSERT",
            Privilege::Delete => "DELETE",
            Privilege::Create => "CREATE",
            Privilege::Drop => "DROP",
            Privilege::Grant => "GRANT",
        }
    }
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Effect {
    Allow,
    Deny,
}

/// One policy rule. Later grants in a snapshot win ties against earlier ones
/// at the same specificity, so definition order is meaningful.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    pub principal_pattern: PrincipalPattern,
    pub resource_pattern: ResourcePattern,
    pub privileges: BTreeSet<Privilege>,
    pub effect: Effect,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<GrantCondition>,
}

impl Grant {
    pub fn new(
        principal_pattern: PrincipalPattern,
        resource_pattern: ResourcePattern,
        privileges: impl IntoIterator<Item = Privilege>,
        effect: Effect,
    ) -> Self {
        Self {
            principal_pattern,
            resource_pattern,
            privileges: privileges.into_iter().collect(),
            effect,
            conditions: Vec::new(),
        }
    }

    pub fn with_conditions(mut self, conditions: impl IntoIterator<Item = GrantCondition>) -> Self {
        self.conditions = conditions.into_iter().collect();
        self
    }

    /// Structural checks the pattern parser cannot see; applied when a
    /// snapshot is indexed.
    pub fn validate(&self) -> Result<(), String> {
        if self.privileges.is_empty() {
            return Err("grant lists no privileges".to_string());
        }
        for condition in &self.conditions {
            condition.validate()?;
        }
        Ok(())
    }
}

/// An immutable, versioned set of grants. Versions must strictly increase
/// across publications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySnapshot {
    pub version: u64,
    pub grants: Vec<Grant>,
}

impl PolicySnapshot {
    pub fn new(version: u64, grants: Vec<Grant>) -> Self {
        Self { version, grants }
    }
}

/// Position of a grant inside a published snapshot, for audit trails and
/// decision explanations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GrantRef {
    pub snapshot_version: u64,
    pub seq: u64,
}

impl fmt::Display for GrantRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.snapshot_version, self.seq)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    AllowMatched,
    DenyMatched,
    DefaultDeny,
    NoPolicyLoaded,
}

impl DecisionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionReason::AllowMatched => "allow-matched",
            DecisionReason::DenyMatched => "deny-matched",
            DecisionReason::DefaultDeny => "default-deny",
            DecisionReason::NoPolicyLoaded => "no-policy-loaded",
        }
    }
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one access check. `matched` names the winning grant when one
/// existed; a default deny carries the consulted snapshot version but no
/// grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessDecision {
    pub granted: bool,
    pub reason: DecisionReason,
    pub matched: Option<GrantRef>,
    pub snapshot_version: Option<u64>,
}

impl AccessDecision {
    pub fn no_policy() -> Self {
        Self {
            granted: false,
            reason: DecisionReason::NoPolicyLoaded,
            matched: None,
            snapshot_version: None,
        }
    }

    pub fn default_deny(snapshot_version: u64) -> Self {
        Self {
            granted: false,
            reason: DecisionReason::DefaultDeny,
            matched: None,
            snapshot_version: Some(snapshot_version),
        }
    }

    pub fn matched(effect: Effect, grant: GrantRef) -> Self {
        let granted = effect == Effect::Allow;
        Self {
            granted,
            reason: if granted {
                DecisionReason::AllowMatched
            } else {
                DecisionReason::DenyMatched
            },
            matched: Some(grant),
            snapshot_version: Some(grant.snapshot_version),
        }
    }
}
