use crate::config::BrokerConfig;
use crate::credential::{CredentialIssuer, IssuedCredential};
use crate::error::LakeguardError;
use crate::scope::StorageScope;
use std::time::Duration;

/// Exponential backoff with bounded jitter. The jitter is deterministic
/// pseudo-noise from the seed, which desynchronizes retries across scopes
/// without an RNG dependency.
fn retry_backoff(
    base_delay_ms: u64,
    max_delay_ms: u64,
    attempt: u32,
    jitter_seed: u64,
) -> Duration {
    let exp = 1u64 << attempt.min(8);
    let without_jitter = base_delay_ms.saturating_mul(exp).min(max_delay_ms);
    let jitter = jitter_seed
        .wrapping_mul(6364136223846793005)
        .wrapping_add(u64::from(attempt).saturating_mul(0x9E3779B97F4A7C15));
    let jitter_ms = jitter % (without_jitter.saturating_div(4).max(1));
    Duration::from_millis(without_jitter.saturating_add(jitter_ms))
}

/// Calls the issuer until it succeeds, a rejection lands, attempts run out
/// or the deadline passes. Only transient failures are retried; the issuer
/// understanding the request and saying no is final on the first answer.
pub(crate) async fn issue_with_retry(
    issuer: &dyn CredentialIssuer,
    principal: &str,
    scope: &StorageScope,
    config: &BrokerConfig,
    jitter_seed: u64,
) -> Result<IssuedCredential, LakeguardError> {
    let deadline = Duration::from_millis(config.issue_timeout_ms);
    let attempts = attempt_loop(issuer, principal, scope, config, jitter_seed);
    match tokio::time::timeout(deadline, attempts).await {
        Ok(result) => result,
        Err(_) => Err(LakeguardError::Timeout {
            elapsed_ms: config.issue_timeout_ms,
        }),
    }
}

async fn attempt_loop(
    issuer: &dyn CredentialIssuer,
    principal: &str,
    scope: &StorageScope,
    config: &BrokerConfig,
    jitter_seed: u64,
) -> Result<IssuedCredential, LakeguardError> {
    let max_attempts = config.issue_max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        match issuer.issue(principal, scope).await {
            Ok(issued) => {
                if attempt > 0 {
                    tracing::debug!(
                        principal = principal,
                        attempt = attempt,
                        "credential issuance succeeded after retry"
                    );
                }
                return Ok(issued);
            }
            Err(err) if err.is_transient() => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(LakeguardError::CredentialUnavailable {
                        attempts: attempt,
                        reason: err.to_string(),
                    });
                }
                let delay = retry_backoff(
                    config.issue_retry_base_delay_ms,
                    config.issue_retry_max_delay_ms,
                    attempt - 1,
                    jitter_seed,
                );
                tracing::warn!(
                    principal = principal,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    reason = %err,
                    "transient issuance failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
