//! Error types for proxy delegation

/// Result type for delegation operations
pub type Result<T> = std::result::Result<T, DelegationError>;

/// Delegation-specific errors
#[derive(Debug, thiserror::Error)]
pub enum DelegationError {
    /// Signing credential has no private key or is outside its validity window
    #[error("Signer not usable: {0}")]
    SignerNotUsable(String),

    /// Digest name not in the allow-list
    #[error("Unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Session identifier unknown, already finalized or purged
    #[error("Unknown delegation session: {0}")]
    UnknownSession(String),

    /// Returned certificate does not carry the session's public key
    #[error("Certificate public key does not match the generated key pair")]
    KeyMismatch,

    /// Chain verification failed
    #[error("Invalid certificate chain: {0}")]
    InvalidChain(String),

    /// Credential or session has expired
    #[error("Credential expired: {0}")]
    CredentialExpired(String),

    /// Cache cannot admit another session
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Passphrase could not be read or did not decrypt the key
    #[error("Passphrase failure: {0}")]
    PassphraseFailure(String),

    /// Unparseable CSR, certificate or bundle
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// Requested policy would grant more than a limited issuer holds
    #[error("Policy escalation rejected: {0}")]
    PolicyEscalation(String),

    /// Peer produced no response
    #[error("No response received: {0}")]
    NoResponse(String),

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DelegationError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DelegationError::NoResponse(_)
                | DelegationError::CapacityExceeded(_)
                | DelegationError::Internal(_)
        )
    }

    /// A lost response leaves the pending session to expire, so callers treat
    /// it like an unknown session.
    pub fn is_unknown_session(&self) -> bool {
        matches!(
            self,
            DelegationError::UnknownSession(_) | DelegationError::NoResponse(_)
        )
    }

    /// Get HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            DelegationError::SignerNotUsable(_) => 403,
            DelegationError::UnsupportedAlgorithm(_) => 400,
            DelegationError::UnknownSession(_) => 404,
            DelegationError::KeyMismatch => 400,
            DelegationError::InvalidChain(_) => 401,
            DelegationError::CredentialExpired(_) => 410,
            DelegationError::CapacityExceeded(_) => 503,
            DelegationError::PassphraseFailure(_) => 401,
            DelegationError::MalformedRequest(_) => 400,
            DelegationError::PolicyEscalation(_) => 403,
            DelegationError::NoResponse(_) => 502,
            DelegationError::Crypto(_) => 500,
            DelegationError::Config(_) => 500,
            DelegationError::Io(_) => 500,
            DelegationError::Internal(_) => 500,
        }
    }

    /// Stable fault name used on the wire
    pub fn fault_code(&self) -> &'static str {
        match self {
            DelegationError::SignerNotUsable(_) => "signer_not_usable",
            DelegationError::UnsupportedAlgorithm(_) => "unsupported_algorithm",
            DelegationError::UnknownSession(_) => "unknown_session",
            DelegationError::KeyMismatch => "key_mismatch",
            DelegationError::InvalidChain(_) => "invalid_chain",
            DelegationError::CredentialExpired(_) => "credential_expired",
            DelegationError::CapacityExceeded(_) => "capacity_exceeded",
            DelegationError::PassphraseFailure(_) => "passphrase_failure",
            DelegationError::MalformedRequest(_) => "malformed_request",
            DelegationError::PolicyEscalation(_) => "policy_escalation",
            DelegationError::NoResponse(_) => "no_response",
            DelegationError::Crypto(_) => "crypto_error",
            DelegationError::Config(_) => "config_error",
            DelegationError::Io(_) => "io_error",
            DelegationError::Internal(_) => "internal_error",
        }
    }
}

// Conversions from common error types
impl From<der::Error> for DelegationError {
    fn from(err: der::Error) -> Self {
        DelegationError::MalformedRequest(format!("DER: {}", err))
    }
}

impl From<pem::PemError> for DelegationError {
    fn from(err: pem::PemError) -> Self {
        DelegationError::MalformedRequest(format!("PEM: {}", err))
    }
}

impl From<rsa::Error> for DelegationError {
    fn from(err: rsa::Error) -> Self {
        DelegationError::Crypto(err.to_string())
    }
}

impl From<rsa::signature::Error> for DelegationError {
    fn from(err: rsa::signature::Error) -> Self {
        DelegationError::Crypto(format!("signature: {}", err))
    }
}

impl From<spki::Error> for DelegationError {
    fn from(err: spki::Error) -> Self {
        DelegationError::MalformedRequest(format!("public key: {}", err))
    }
}

impl From<serde_json::Error> for DelegationError {
    fn from(err: serde_json::Error) -> Self {
        DelegationError::MalformedRequest(format!("JSON error: {}", err))
    }
}

impl From<reqwest::Error> for DelegationError {
    fn from(err: reqwest::Error) -> Self {
        DelegationError::NoResponse(err.to_string())
    }
}
