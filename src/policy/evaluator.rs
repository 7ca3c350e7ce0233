use crate::model::{
    AccessDecision, Effect, GrantRef, Principal, Privilege, RequestContext, Resource,
};
use crate::policy::index::{IndexedGrant, MatchRank, PermissionIndex};

/// Decides one `(principal, resource, privilege)` check against an index.
///
/// A grant participates only when its principal pattern matches, it lists
/// the privilege, and every condition holds for the request. Among the
/// participants the deepest tier wins; inside that tier any deny beats every
/// allow, no matter how the two were spelled. No participants means deny.
pub fn evaluate(
    index: &PermissionIndex,
    principal: &Principal,
    resource: &Resource,
    privilege: Privilege,
    ctx: &RequestContext,
) -> AccessDecision {
    let mut best_allow: Option<(MatchRank, &IndexedGrant)> = None;
    let mut best_deny: Option<(MatchRank, &IndexedGrant)> = None;

    for candidate in index.covering(resource) {
        let grant = &candidate.grant;
        if !grant.privileges.contains(&privilege) {
            continue;
        }
        if !grant.principal_pattern.matches(principal) {
            continue;
        }
        if !grant.conditions.iter().all(|c| c.is_satisfied(ctx)) {
            continue;
        }
        let rank = candidate.rank();
        let slot = match grant.effect {
            Effect::Allow => &mut best_allow,
            Effect::Deny => &mut best_deny,
        };
        if slot.as_ref().is_none_or(|(best, _)| rank > *best) {
            *slot = Some((rank, candidate));
        }
    }

    // The best rank per effect carries that effect's deepest tier, so the
    // tier comparison below is exactly "does a deny exist at the winning
    // tier".
    let winner = match (best_allow, best_deny) {
        (None, None) => return AccessDecision::default_deny(index.version()),
        (Some(allow), None) => allow,
        (None, Some(deny)) => deny,
        (Some(allow), Some(deny)) => {
            if deny.0.tier >= allow.0.tier {
                deny
            } else {
                allow
            }
        }
    };

    AccessDecision::matched(
        winner.1.grant.effect,
        GrantRef {
            snapshot_version: index.version(),
            seq: winner.1.seq,
        },
    )
}
