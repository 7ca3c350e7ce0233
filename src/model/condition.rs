use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

pub const MINUTES_PER_DAY: u16 = 1440;

/// Optional restriction attached to a grant. A grant with conditions only
/// matches a request when every condition is satisfied; an unsatisfied
/// condition makes the grant invisible to the evaluation rather than turning
/// it into a deny.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum GrantCondition {
    /// UTC minute-of-day window `[start_minute, end_minute)`. A window with
    /// `end_minute < start_minute` wraps past midnight; equal bounds name an
    /// empty window that never matches.
    TimeOfDay { start_minute: u16, end_minute: u16 },
    /// At least one of the listed tags must be present on the request.
    ClientTag { any_of: BTreeSet<String> },
}

impl GrantCondition {
    pub fn is_satisfied(&self, ctx: &RequestContext) -> bool {
        match self {
            GrantCondition::TimeOfDay {
                start_minute,
                end_minute,
            } => {
                let minute = ctx.minute_of_day;
                if start_minute <= end_minute {
                    minute >= *start_minute && minute < *end_minute
                } else {
                    minute >= *start_minute || minute < *end_minute
                }
            }
            GrantCondition::ClientTag { any_of } => {
                any_of.iter().any(|tag| ctx.client_tags.contains(tag))
            }
        }
    }

    /// Bounds check applied when a snapshot is indexed.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            GrantCondition::TimeOfDay {
                start_minute,
                end_minute,
            } => {
                if *start_minute >= MINUTES_PER_DAY || *end_minute >= MINUTES_PER_DAY {
                    return Err(format!(
                        "time-of-day minutes must be below {MINUTES_PER_DAY}, got {start_minute}..{end_minute}"
                    ));
                }
                Ok(())
            }
            GrantCondition::ClientTag { any_of } => {
                if any_of.is_empty() {
                    return Err("client-tag condition lists no tags".to_string());
                }
                Ok(())
            }
        }
    }
}

/// Request-scoped attributes that conditions are evaluated against. Captured
/// once when the check starts so that every grant in one evaluation sees the
/// same clock and tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    minute_of_day: u16,
    client_tags: BTreeSet<String>,
}

impl RequestContext {
    /// Context for a request arriving now, with no client tags.
    pub fn now() -> Self {
        let epoch_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self::at_epoch_secs(epoch_secs)
    }

    pub fn at_epoch_secs(epoch_secs: u64) -> Self {
        Self {
            minute_of_day: ((epoch_secs % 86_400) / 60) as u16,
            client_tags: BTreeSet::new(),
        }
    }

    pub fn at_minute(minute_of_day: u16) -> Self {
        Self {
            minute_of_day: minute_of_day % MINUTES_PER_DAY,
            client_tags: BTreeSet::new(),
        }
    }

    pub fn with_client_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.client_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn minute_of_day(&self) -> u16 {
        self.minute_of_day
    }

    pub fn client_tags(&self) -> &BTreeSet<String> {
        &self.client_tags
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::now()
    }
}
