//! Proxy Delegation
//!
//! The two halves of a delegation handshake without any transport:
//! a [`DelegationConsumer`] generates the key pair and request, a
//! [`DelegationProvider`] signs it with its own credential and returns the
//! PEM bundle the consumer turns into a usable proxy.

use crate::config::KeyConfig;
use crate::credential::Credential;
use crate::error::{DelegationError, Result};
use crate::request::{CredentialRequest, DelegationConstraints, ProxyRequest, RequestParams};
use crate::verification::TrustStore;
use tracing::info;
use zeroize::Zeroizing;

/// Requesting side: holds the generated key until the signed proxy arrives
#[derive(Debug)]
pub struct DelegationConsumer {
    pending: CredentialRequest,
}

impl DelegationConsumer {
    /// Generate a key pair and request
    pub fn new(params: &RequestParams, keys: &KeyConfig) -> Result<Self> {
        Ok(Self {
            pending: CredentialRequest::generate(params, keys)?,
        })
    }

    /// The request to send to the provider
    pub fn request(&self) -> &ProxyRequest {
        self.pending.request()
    }

    /// Accept the provider's bundle
    pub fn acquire(&self, bundle: &str, trust: &TrustStore) -> Result<Credential> {
        let credential = self.pending.complete(bundle.as_bytes(), trust)?;
        info!(
            "Acquired proxy {} for {}",
            credential.subject(),
            credential.identity_name()
        );
        Ok(credential)
    }

    /// Pending key as PEM, to survive a restart between request and response
    pub fn backup(&self) -> Result<Zeroizing<String>> {
        self.pending.backup()
    }

    /// Rebuild a consumer from [`backup`](Self::backup) output
    pub fn restore(key_pem: &str, request: ProxyRequest) -> Result<Self> {
        Ok(Self {
            pending: CredentialRequest::restore(key_pem, request)?,
        })
    }
}

/// Signing side: a credential with its private key
#[derive(Debug, Clone)]
pub struct DelegationProvider {
    credential: Credential,
}

impl DelegationProvider {
    /// Wrap a signing credential
    pub fn new(credential: Credential) -> Result<Self> {
        if !credential.has_private_key() {
            return Err(DelegationError::SignerNotUsable(format!(
                "{} has no private key",
                credential.subject()
            )));
        }
        Ok(Self { credential })
    }

    /// The signing credential
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Sign `request` and return the new certificate followed by this
    /// provider's certificate and chain
    pub fn delegate(
        &self,
        request: &ProxyRequest,
        constraints: &DelegationConstraints,
    ) -> Result<String> {
        let signed = self.credential.sign_request(request, constraints)?;
        Ok(format!("{}{}", signed, self.credential.certificate_chain_pem()?))
    }
}
