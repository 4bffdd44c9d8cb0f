use thiserror::Error;

pub type Result<T, E = AuthError> = std::result::Result<T, E>;

/// Failures surfaced by the authentication core.
///
/// Signature and chain failures are never downgraded: callers must treat
/// `InvalidSignature` and `UntrustedChain` as fatal for the operation.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("untrusted certificate chain: {0}")]
    UntrustedChain(String),
    #[error("challenge without the publicKey field")]
    MissingPublicKeyField,
    #[error("malformed challenge: {0}")]
    ChallengeMalformed(String),
    #[error("authentication rejected")]
    AuthenticationRejected,
    #[error("security device interaction failed: {0}")]
    HardwareInteractionFailed(String),
    #[error("request timed out: {0}")]
    NetworkTimeout(String),
    #[error("disconnected: {0}")]
    Disconnected(String),
    #[error("mismatch: {0}")]
    Mismatch(String),
    #[error("unknown response type: {0}")]
    UnknownResponseType(String),
    #[error("encrypted responses are not supported")]
    UnsupportedEncryptedPayload,
    #[error("registration failed: {0}")]
    Registration(String),
    #[error("no usable certificate for {0}, manual authentication required")]
    MustManuallyAuthenticate(String),
    #[error("invalid code: {0}")]
    InvalidCode(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("key generation failed: {0}")]
    KeyGeneration(String),
    #[error("invalid encoding: {0}")]
    Encoding(String),
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    InvalidTransition(#[from] crate::auth::InvalidTransition),
}

impl AuthError {
    /// Transport and device failures may be retried by the caller; everything
    /// else is terminal for the attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkTimeout(_) | Self::Disconnected(_) | Self::HardwareInteractionFailed(_)
        )
    }

    /// True for the failure classes that indicate a forged or misrouted response.
    #[must_use]
    pub fn is_security_failure(&self) -> bool {
        matches!(
            self,
            Self::InvalidSignature(_) | Self::UntrustedChain(_) | Self::Mismatch(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_are_retryable() {
        assert!(AuthError::NetworkTimeout("get_usager".into()).is_retryable());
        assert!(AuthError::Disconnected("socket closed".into()).is_retryable());
        assert!(AuthError::HardwareInteractionFailed("cancelled".into()).is_retryable());
        assert!(!AuthError::AuthenticationRejected.is_retryable());
        assert!(!AuthError::InvalidSignature("tampered".into()).is_retryable());
    }

    #[test]
    fn security_failures_are_flagged() {
        assert!(AuthError::UntrustedChain("unknown ca".into()).is_security_failure());
        assert!(AuthError::Mismatch("fingerprint".into()).is_security_failure());
        assert!(!AuthError::MissingPublicKeyField.is_security_failure());
    }
}
