//! Proxy Requests
//!
//! The requester's half of proxy creation: a fresh key pair plus a PKCS#10
//! request, and the signer-side constraints applied when it is signed.

use crate::config::{KeyConfig, ProxyConfig};
use crate::credential::Credential;
use crate::crypto::{self, DigestChoice, SigningAlgorithm};
use crate::error::{DelegationError, Result};
use crate::policy::PolicyRequest;
use crate::verification::TrustStore;
use crate::voms::VomsAcSequence;
use crate::x509;
use chrono::{DateTime, Utc};
use der::Encode;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use spki::SubjectPublicKeyInfoOwned;
use std::fmt;
use std::time::Duration;
use tracing::debug;
use x509_cert::request::CertReq;
use zeroize::Zeroizing;

/// What the requester asks for
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestParams {
    /// Start of validity; signing time when absent
    pub not_before: Option<DateTime<Utc>>,
    /// Requested lifetime; signer default when absent
    pub lifetime: Option<Duration>,
    /// Key size; configured default when absent
    pub key_bits: Option<usize>,
    /// Digest for the signed proxy
    pub signing_algorithm: DigestChoice,
}

/// A certificate request as it travels to the signer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRequest {
    /// PEM `CERTIFICATE REQUEST`
    pub csr: String,

    /// Requested start of validity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,

    /// Requested lifetime
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub lifetime: Option<Duration>,

    /// Requested digest
    #[serde(default)]
    pub signing_algorithm: DigestChoice,
}

impl ProxyRequest {
    /// Wrap a bare PEM request with no validity or digest preferences
    pub fn from_csr(csr: impl Into<String>) -> Self {
        Self {
            csr: csr.into(),
            not_before: None,
            lifetime: None,
            signing_algorithm: DigestChoice::Inherit,
        }
    }

    /// Parse the request and check its self-signature
    pub fn parse_csr(&self) -> Result<CertReq> {
        let csr = x509::request_from_pem(&self.csr)?;
        x509::verify_request(&csr)?;
        Ok(csr)
    }

    /// Public key being certified
    pub fn public_key_info(&self) -> Result<SubjectPublicKeyInfoOwned> {
        Ok(self.parse_csr()?.info.public_key)
    }
}

/// Freshly generated key pair awaiting its signed certificate
pub struct CredentialRequest {
    key: RsaPrivateKey,
    request: ProxyRequest,
}

impl fmt::Debug for CredentialRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRequest")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

impl CredentialRequest {
    /// Generate a key pair and a request for it
    pub fn generate(params: &RequestParams, keys: &KeyConfig) -> Result<Self> {
        let bits = keys.key_bits(params.key_bits)?;
        let key = crypto::generate_key(bits)?;
        debug!("Generated {}-bit request key", bits);
        Self::with_key(key, params, keys)
    }

    /// Build a request around an existing key
    pub fn with_key(key: RsaPrivateKey, params: &RequestParams, keys: &KeyConfig) -> Result<Self> {
        let csr_algorithm = params
            .signing_algorithm
            .resolve(None, keys.default_signing_algorithm);
        let csr = x509::build_request(&key, csr_algorithm)?;
        let request = ProxyRequest {
            csr: x509::request_to_pem(&csr)?,
            not_before: params.not_before,
            lifetime: params.lifetime,
            signing_algorithm: params.signing_algorithm,
        };
        Ok(Self { key, request })
    }

    /// The request to hand to the signer
    pub fn request(&self) -> &ProxyRequest {
        &self.request
    }

    /// Public key of the generated pair
    pub fn public_key_info(&self) -> Result<SubjectPublicKeyInfoOwned> {
        crypto::public_key_info(&self.key.to_public_key())
    }

    /// Accept the signer's bundle: the certificate must carry this request's
    /// key and the whole chain must verify.
    pub fn complete(&self, bundle: &[u8], trust: &TrustStore) -> Result<Credential> {
        let received = Credential::from_pem(bundle)?;
        let (certificate, _, chain) = received.into_parts();

        let expected = self.public_key_info()?.to_der()?;
        if certificate.tbs_certificate.subject_public_key_info.to_der()? != expected {
            return Err(DelegationError::KeyMismatch);
        }

        let credential = Credential::from_parts(certificate, Some(self.key.clone()), chain)?;
        credential.verify(trust)?;
        Ok(credential)
    }

    /// Private key as unencrypted PKCS#8 PEM, for persisting a pending request
    pub fn backup(&self) -> Result<Zeroizing<String>> {
        self.key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| DelegationError::Crypto(format!("encode key: {}", e)))
    }

    /// Rebuild from a backed-up key and the request it produced
    pub fn restore(key_pem: &str, request: ProxyRequest) -> Result<Self> {
        let key = RsaPrivateKey::from_pkcs8_pem(key_pem)
            .map_err(|e| DelegationError::MalformedRequest(format!("backup key: {}", e)))?;
        let restored = Self { key, request };
        if restored.request.public_key_info()?.to_der()? != restored.public_key_info()?.to_der()? {
            return Err(DelegationError::KeyMismatch);
        }
        Ok(restored)
    }
}

/// Limits the signer puts on a proxy it issues
#[derive(Debug, Clone)]
pub struct DelegationConstraints {
    /// Fixed start, overriding the request
    pub not_before: Option<DateTime<Utc>>,
    /// Fixed end, overriding the computed one
    pub not_after: Option<DateTime<Utc>>,
    /// Lifetime overriding the request
    pub lifetime: Option<Duration>,
    /// Lifetime when neither side names one
    pub default_lifetime: Duration,
    /// Upper bound on the lifetime
    pub max_lifetime: Option<Duration>,
    /// Policy of the new proxy
    pub policy: PolicyRequest,
    /// VOMS attribute certificates to embed
    pub voms: Option<VomsAcSequence>,
    /// Digest overriding the request
    pub signing_algorithm: Option<DigestChoice>,
    /// Digest used when `inherit` cannot be resolved
    pub fallback_algorithm: SigningAlgorithm,
    /// Smallest requester key accepted
    pub min_key_bits: usize,
}

impl Default for DelegationConstraints {
    fn default() -> Self {
        Self {
            not_before: None,
            not_after: None,
            lifetime: None,
            default_lifetime: Duration::from_secs(crate::DEFAULT_PROXY_LIFETIME_HOURS * 3600),
            max_lifetime: None,
            policy: PolicyRequest::default(),
            voms: None,
            signing_algorithm: None,
            fallback_algorithm: SigningAlgorithm::Sha256,
            min_key_bits: 1024,
        }
    }
}

impl DelegationConstraints {
    /// Constraints taken from configuration
    pub fn from_config(keys: &KeyConfig, proxy: &ProxyConfig) -> Self {
        Self {
            default_lifetime: proxy.default_lifetime,
            max_lifetime: proxy.max_lifetime,
            fallback_algorithm: keys.default_signing_algorithm,
            min_key_bits: keys.min_bits,
            ..Self::default()
        }
    }

    /// Set the policy request
    pub fn with_policy(mut self, policy: PolicyRequest) -> Self {
        self.policy = policy;
        self
    }

    /// Set the lifetime
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    /// Embed VOMS attribute certificates
    pub fn with_voms(mut self, voms: VomsAcSequence) -> Self {
        self.voms = Some(voms);
        self
    }

    /// Validity window before clipping to the issuer's
    pub fn window(
        &self,
        request: &ProxyRequest,
        now: DateTime<Utc>,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let start = self.not_before.or(request.not_before).unwrap_or(now);
        let mut lifetime = self.lifetime.or(request.lifetime).unwrap_or(self.default_lifetime);
        if let Some(max) = self.max_lifetime {
            lifetime = lifetime.min(max);
        }
        let lifetime = chrono::Duration::from_std(lifetime)
            .map_err(|_| DelegationError::MalformedRequest("lifetime out of range".to_string()))?;
        let computed_end = start.checked_add_signed(lifetime).ok_or_else(|| {
            DelegationError::MalformedRequest(format!(
                "lifetime {}s from {} is past the representable range",
                lifetime.num_seconds(),
                start
            ))
        })?;
        let end = match self.not_after {
            Some(end) => end.min(computed_end),
            None => computed_end,
        };
        Ok((start, end))
    }
}
