//! Delegation Service
//!
//! Server side of network delegation. The service is the consumer: on
//! `DelegateCredentialsInit` it generates a key pair and hands out a request,
//! on `UpdateCredentials` it accepts the signed proxy for that session.

use crate::cache::{DelegationSessionCache, SessionId, SessionInfo, SweepReport};
use crate::config::{DelegationConfig, KeyConfig};
use crate::credential::Credential;
use crate::crypto::DigestChoice;
use crate::error::{DelegationError, Result};
use crate::name::DistinguishedName;
use crate::request::{CredentialRequest, ProxyRequest, RequestParams};
use crate::verification::TrustStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// `DelegateCredentialsInit` request body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitRequest {
    /// Key size for the generated pair
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_bits: Option<usize>,

    /// Lifetime to ask the signer for
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub lifetime: Option<Duration>,

    /// Digest to ask the signer for
    #[serde(default)]
    pub signing_algorithm: DigestChoice,
}

/// `DelegateCredentialsInit` response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitResponse {
    /// Session the signed proxy must be returned to
    pub session_id: SessionId,

    /// Request to sign
    pub request: ProxyRequest,
}

/// `UpdateCredentials` request body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequest {
    /// Session returned by init
    pub session_id: SessionId,

    /// Signed proxy followed by the signer's chain, PEM
    pub bundle: String,
}

/// `UpdateCredentials` response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResponse {
    /// Session now holding the proxy
    pub session_id: SessionId,

    /// Base identity of the stored proxy
    pub identity: DistinguishedName,

    /// When the session stops being usable
    pub expires_at: DateTime<Utc>,
}

impl From<SessionInfo> for UpdateResponse {
    fn from(info: SessionInfo) -> Self {
        Self {
            session_id: info.session_id,
            identity: info.identity.unwrap_or_default(),
            expires_at: info.expires_at,
        }
    }
}

/// Application-level fault carried back to the peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationFault {
    /// Stable fault name, see [`DelegationError::fault_code`]
    pub code: String,

    /// Human-readable detail
    pub message: String,
}

impl From<&DelegationError> for DelegationFault {
    fn from(err: &DelegationError) -> Self {
        Self {
            code: err.fault_code().to_string(),
            message: err.to_string(),
        }
    }
}

impl DelegationFault {
    /// Rebuild the error a fault was made from. Variants carrying a
    /// detail string get the fault message; unknown codes become `Internal`.
    pub fn into_error(self) -> DelegationError {
        let message = self.message;
        match self.code.as_str() {
            "signer_not_usable" => DelegationError::SignerNotUsable(message),
            "unsupported_algorithm" => DelegationError::UnsupportedAlgorithm(message),
            "unknown_session" => DelegationError::UnknownSession(message),
            "key_mismatch" => DelegationError::KeyMismatch,
            "invalid_chain" => DelegationError::InvalidChain(message),
            "credential_expired" => DelegationError::CredentialExpired(message),
            "capacity_exceeded" => DelegationError::CapacityExceeded(message),
            "passphrase_failure" => DelegationError::PassphraseFailure(message),
            "malformed_request" => DelegationError::MalformedRequest(message),
            "policy_escalation" => DelegationError::PolicyEscalation(message),
            "no_response" => DelegationError::NoResponse(message),
            "crypto_error" => DelegationError::Crypto(message),
            "config_error" => DelegationError::Config(message),
            _ => DelegationError::Internal(message),
        }
    }
}

/// Delegation endpoint logic, independent of transport
#[derive(Debug, Clone)]
pub struct DelegationService {
    cache: Arc<DelegationSessionCache>,
    trust: Arc<TrustStore>,
    keys: KeyConfig,
}

impl DelegationService {
    /// Service over an existing cache and trust store
    pub fn new(cache: Arc<DelegationSessionCache>, trust: Arc<TrustStore>, keys: KeyConfig) -> Self {
        Self { cache, trust, keys }
    }

    /// Service built from configuration: loads the trust anchors and creates
    /// a fresh cache
    pub fn from_config(config: &DelegationConfig) -> Result<Self> {
        let trust = config.trust.trust_store()?;
        if trust.is_empty() {
            warn!("No trust anchors loaded; every UpdateCredentials will fail");
        }
        Ok(Self::new(
            Arc::new(DelegationSessionCache::new(config.cache.clone())),
            Arc::new(trust),
            config.keys.clone(),
        ))
    }

    /// Shared session cache
    pub fn cache(&self) -> &Arc<DelegationSessionCache> {
        &self.cache
    }

    /// Trust anchors used to verify returned chains
    pub fn trust(&self) -> &TrustStore {
        &self.trust
    }

    /// Generate a key pair and open a `Pending` session for it
    pub fn delegate_credentials_init(&self, request: &InitRequest) -> Result<InitResponse> {
        let params = RequestParams {
            not_before: None,
            lifetime: request.lifetime,
            key_bits: request.key_bits,
            signing_algorithm: request.signing_algorithm,
        };
        let pending = CredentialRequest::generate(&params, &self.keys)?;
        let proxy_request = pending.request().clone();
        let session_id = self.cache.insert_pending(pending)?;
        Ok(InitResponse {
            session_id,
            request: proxy_request,
        })
    }

    /// Accept the signed proxy for a `Pending` session
    pub fn update_credentials(&self, update: &UpdateRequest) -> Result<UpdateResponse> {
        let pending = self.cache.pending_request(&update.session_id)?;
        let credential = match pending.complete(update.bundle.as_bytes(), &self.trust) {
            Ok(credential) => credential,
            Err(e) => {
                warn!(
                    "Rejected credentials for session {}: {}",
                    update.session_id, e
                );
                return Err(e);
            }
        };
        let info = self.cache.activate(&update.session_id, credential)?;
        info!(
            "Stored delegated credential for {:?} in session {}",
            info.identity, info.session_id
        );
        Ok(info.into())
    }

    /// Revoke a session
    pub fn revoke(&self, session_id: &str) -> Result<()> {
        self.cache.revoke(session_id)
    }

    /// Stored credential of an active session
    pub fn credential(&self, session_id: &str) -> Result<Credential> {
        self.cache.get_by_id(session_id)
    }

    /// Every usable credential delegated by `identity`, newest first
    pub fn credentials_for(&self, identity: &DistinguishedName) -> Vec<Credential> {
        self.cache.get_by_identity(identity)
    }

    /// Run one cache sweep
    pub fn sweep(&self) -> SweepReport {
        self.cache.sweep()
    }
}
