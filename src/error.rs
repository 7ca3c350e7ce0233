use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LakeguardErrorCode {
    PolicyUnavailable,
    PolicySource,
    StaleSnapshot,
    MalformedGrant,
    NotGranted,
    EmptyScope,
    ScopeResolution,
    CredentialUnavailable,
    UpstreamTransient,
    UpstreamRejected,
    Timeout,
    InvalidConfig,
    InvalidResource,
    Shutdown,
}

impl LakeguardErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            LakeguardErrorCode::PolicyUnavailable => "policy_unavailable",
            LakeguardErrorCode::PolicySource => "policy_source",
            LakeguardErrorCode::StaleSnapshot => "stale_snapshot",
            LakeguardErrorCode::MalformedGrant => "malformed_grant",
            LakeguardErrorCode::NotGranted => "not_granted",
            LakeguardErrorCode::EmptyScope => "empty_scope",
            LakeguardErrorCode::ScopeResolution => "scope_resolution",
            LakeguardErrorCode::CredentialUnavailable => "credential_unavailable",
            LakeguardErrorCode::UpstreamTransient => "upstream_transient",
            LakeguardErrorCode::UpstreamRejected => "upstream_rejected",
            LakeguardErrorCode::Timeout => "timeout",
            LakeguardErrorCode::InvalidConfig => "invalid_config",
            LakeguardErrorCode::InvalidResource => "invalid_resource",
            LakeguardErrorCode::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum LakeguardError {
    #[error("no policy snapshot loaded; denying by default")]
    PolicyUnavailable,
    #[error("policy source unreadable: {reason}")]
    PolicySource { reason: String },
    #[error("snapshot version {offered} is not newer than active version {active}")]
    StaleSnapshot { offered: u64, active: u64 },
    #[error("malformed grant pattern '{pattern}': {reason}")]
    MalformedGrant { pattern: String, reason: String },
    #[error("privilege {privilege} on '{resource}' is not granted to '{principal}'")]
    NotGranted {
        principal: String,
        resource: String,
        privilege: String,
    },
    #[error("no storage scope derivable from the requested resources")]
    EmptyScope,
    #[error("cannot resolve storage location for '{resource}': {reason}")]
    ScopeResolution { resource: String, reason: String },
    #[error("credential unavailable after {attempts} attempt(s): {reason}")]
    CredentialUnavailable { attempts: u32, reason: String },
    #[error("transient upstream failure: {0}")]
    UpstreamTransient(String),
    #[error("upstream issuer rejected the request: {0}")]
    UpstreamRejected(String),
    #[error("upstream issuance timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("invalid resource name '{name}': {reason}")]
    InvalidResource { name: String, reason: String },
    #[error("broker is shut down")]
    Shutdown,
}

impl LakeguardError {
    pub fn code(&self) -> LakeguardErrorCode {
        match self {
            LakeguardError::PolicyUnavailable => LakeguardErrorCode::PolicyUnavailable,
            LakeguardError::PolicySource { .. } => LakeguardErrorCode::PolicySource,
            LakeguardError::StaleSnapshot { .. } => LakeguardErrorCode::StaleSnapshot,
            LakeguardError::MalformedGrant { .. } => LakeguardErrorCode::MalformedGrant,
            LakeguardError::NotGranted { .. } => LakeguardErrorCode::NotGranted,
            LakeguardError::EmptyScope => LakeguardErrorCode::EmptyScope,
            LakeguardError::ScopeResolution { .. } => LakeguardErrorCode::ScopeResolution,
            LakeguardError::CredentialUnavailable { .. } => {
                LakeguardErrorCode::CredentialUnavailable
            }
            LakeguardError::UpstreamTransient(_) => LakeguardErrorCode::UpstreamTransient,
            LakeguardError::UpstreamRejected(_) => LakeguardErrorCode::UpstreamRejected,
            LakeguardError::Timeout { .. } => LakeguardErrorCode::Timeout,
            LakeguardError::InvalidConfig { .. } => LakeguardErrorCode::InvalidConfig,
            LakeguardError::InvalidResource { .. } => LakeguardErrorCode::InvalidResource,
            LakeguardError::Shutdown => LakeguardErrorCode::Shutdown,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// True when the failure class is worth another attempt against the
    /// upstream issuer. Rejections are terminal: the issuer understood the
    /// request and said no.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LakeguardError::UpstreamTransient(_) | LakeguardError::Timeout { .. }
        )
    }
}
