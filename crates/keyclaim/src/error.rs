//! error types for keyclaim

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    // === configuration errors ===
    #[error("no signing secret available for identity")]
    IdentityUnavailable,

    #[error("invalid secret: {0}")]
    InvalidSecret(String),

    #[error("invalid scope request: {0}")]
    InvalidScopeRequest(String),

    #[error("invalid delegation params: {0}")]
    InvalidDelegationParams(String),

    #[error("invalid network config: {0}")]
    InvalidConfig(String),

    // === connectivity errors ===
    #[error("network unreachable: {responsive} of {required} nodes responded")]
    NetworkUnreachable { responsive: usize, required: usize },

    #[error("not connected to network")]
    NotConnected,

    #[error("transport error: {0}")]
    Transport(String),

    // === quorum errors ===
    #[error("quorum not reached: {agreeing} of {required} nodes answered")]
    QuorumNotReached { agreeing: usize, required: usize },

    #[error("session issuance failed: {accepted} of {required} nodes accepted")]
    SessionIssuanceFailed { accepted: usize, required: usize },

    #[error("claim deadline elapsed after {0}s")]
    ClaimDeadlineElapsed(u64),

    #[error("delegation rejected by all nodes")]
    DelegationRejected,

    // === consistency errors ===
    #[error("nodes disagree on derived key id: {0}")]
    InconsistentResult(String),

    // === registry errors ===
    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("claim rejected by registry: {0}")]
    ClaimRejected(String),

    #[error("registry returned inconsistent key record: {0}")]
    BadKeyRecord(String),

    // === signing errors ===
    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("signature does not verify against {address}")]
    BadSignature { address: String },

    #[error("session credentials expired at {0}")]
    SessionExpired(String),
}

/// error taxonomy used by the orchestrator's retry policy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// caller error, never retried
    Configuration,
    /// connect / transport / timeout, retryable with backoff
    Connectivity,
    /// insufficient agreeing nodes, retryable with fresh credentials
    Quorum,
    /// nodes disagree on the derived identifier, fatal
    Consistency,
    /// registry mint/finalize failure
    Registry,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::IdentityUnavailable
            | Error::InvalidSecret(_)
            | Error::InvalidScopeRequest(_)
            | Error::InvalidDelegationParams(_)
            | Error::InvalidConfig(_) => ErrorKind::Configuration,

            Error::NetworkUnreachable { .. }
            | Error::NotConnected
            | Error::Transport(_) => ErrorKind::Connectivity,

            Error::QuorumNotReached { .. }
            | Error::SessionIssuanceFailed { .. }
            | Error::ClaimDeadlineElapsed(_)
            | Error::DelegationRejected => ErrorKind::Quorum,

            Error::InconsistentResult(_) => ErrorKind::Consistency,

            Error::RegistryUnavailable(_)
            | Error::ClaimRejected(_)
            | Error::BadKeyRecord(_) => ErrorKind::Registry,

            Error::SigningFailed(_)
            | Error::BadSignature { .. }
            | Error::SessionExpired(_) => ErrorKind::Configuration,
        }
    }

    /// whether the orchestrator may retry after this error
    ///
    /// registry transport failures retry, validity rejections never do.
    /// the overall claim deadline is terminal for the current run.
    pub fn retryable(&self) -> bool {
        match self {
            Error::ClaimDeadlineElapsed(_) => false,
            Error::RegistryUnavailable(_) => true,
            _ => matches!(self.kind(), ErrorKind::Connectivity | ErrorKind::Quorum),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(Error::IdentityUnavailable.kind(), ErrorKind::Configuration);
        assert_eq!(
            Error::NetworkUnreachable { responsive: 1, required: 2 }.kind(),
            ErrorKind::Connectivity
        );
        assert_eq!(
            Error::QuorumNotReached { agreeing: 1, required: 3 }.kind(),
            ErrorKind::Quorum
        );
        assert_eq!(
            Error::InconsistentResult("abc != def".into()).kind(),
            ErrorKind::Consistency
        );
        assert_eq!(Error::ClaimRejected("bad sigs".into()).kind(), ErrorKind::Registry);
    }

    #[test]
    fn test_retry_policy() {
        assert!(Error::NetworkUnreachable { responsive: 0, required: 2 }.retryable());
        assert!(Error::QuorumNotReached { agreeing: 1, required: 3 }.retryable());
        assert!(Error::RegistryUnavailable("refused".into()).retryable());

        assert!(!Error::InconsistentResult("split".into()).retryable());
        assert!(!Error::ClaimRejected("invalid".into()).retryable());
        assert!(!Error::InvalidScopeRequest("empty".into()).retryable());
        assert!(!Error::ClaimDeadlineElapsed(30).retryable());
    }
}
