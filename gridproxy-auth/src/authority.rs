//! Minimal Certificate Authority
//!
//! Enough CA to bootstrap a trust anchor and end-entity certificates for
//! testing and small deployments. Not a PKI: no revocation, no databases.

use crate::credential::Credential;
use crate::crypto::{self, SigningAlgorithm};
use crate::error::Result;
use crate::name::DistinguishedName;
use crate::verification::TrustStore;
use crate::x509::{self, CertificateTemplate, BASIC_CONSTRAINTS, KEY_USAGE};
use chrono::{DateTime, Duration, Utc};
use der::asn1::OctetString;
use der::Encode;
use rand::Rng;
use spki::SubjectPublicKeyInfoOwned;
use tracing::info;
use x509_cert::ext::pkix::{BasicConstraints, KeyUsage, KeyUsages};
use x509_cert::ext::Extension;

/// Self-signed CA credential
#[derive(Debug, Clone)]
pub struct CertificateAuthority {
    credential: Credential,
    algorithm: SigningAlgorithm,
}

impl CertificateAuthority {
    /// Create a CA with a fresh key, valid from now for `lifetime`
    pub fn self_signed(subject: &DistinguishedName, lifetime: Duration, key_bits: usize) -> Result<Self> {
        let key = crypto::generate_key(key_bits)?;
        let name = subject.to_x509()?;
        let now = Utc::now();
        let template = CertificateTemplate {
            serial: random_serial(),
            issuer: name.clone(),
            subject: name,
            not_before: now,
            not_after: now + lifetime,
            public_key: crypto::public_key_info(&key.to_public_key())?,
            extensions: vec![
                basic_constraints(true)?,
                key_usage(KeyUsage(
                    KeyUsages::KeyCertSign | KeyUsages::CRLSign | KeyUsages::DigitalSignature,
                ))?,
            ],
        };
        let algorithm = SigningAlgorithm::Sha256;
        let certificate = template.sign(&key, algorithm)?;
        info!("Created CA {}", subject);
        Ok(Self {
            credential: Credential::from_parts(certificate, Some(key), Vec::new())?,
            algorithm,
        })
    }

    /// Wrap an existing CA credential
    pub fn from_credential(credential: Credential) -> Self {
        Self {
            credential,
            algorithm: SigningAlgorithm::Sha256,
        }
    }

    /// The CA credential
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Trust store holding just this CA
    pub fn trust_store(&self) -> TrustStore {
        let mut store = TrustStore::new();
        store.add(self.credential.certificate().clone());
        store
    }

    /// Issue an end-entity credential with a fresh key, valid from now
    pub fn issue_end_entity(
        &self,
        subject: &DistinguishedName,
        lifetime: Duration,
        key_bits: usize,
    ) -> Result<Credential> {
        let now = Utc::now();
        self.issue_end_entity_window(subject, now, now + lifetime, key_bits)
    }

    /// Issue an end-entity credential with a fresh key and explicit window
    pub fn issue_end_entity_window(
        &self,
        subject: &DistinguishedName,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
        key_bits: usize,
    ) -> Result<Credential> {
        let key = crypto::generate_key(key_bits)?;
        let public_key = crypto::public_key_info(&key.to_public_key())?;
        let certificate = self.certify(subject, public_key, not_before, not_after)?;
        Credential::from_parts(
            certificate,
            Some(key),
            vec![self.credential.certificate().clone()],
        )
    }

    /// Certify someone else's public key as an end entity
    pub fn certify(
        &self,
        subject: &DistinguishedName,
        public_key: SubjectPublicKeyInfoOwned,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Result<x509_cert::certificate::Certificate> {
        let signer = self.credential.private_key().ok_or_else(|| {
            crate::error::DelegationError::SignerNotUsable("CA key not held".to_string())
        })?;
        let template = CertificateTemplate {
            serial: random_serial(),
            issuer: self.credential.certificate().tbs_certificate.subject.clone(),
            subject: subject.to_x509()?,
            not_before,
            not_after,
            public_key,
            extensions: vec![
                basic_constraints(false)?,
                key_usage(KeyUsage(
                    KeyUsages::DigitalSignature
                        | KeyUsages::NonRepudiation
                        | KeyUsages::KeyEncipherment,
                ))?,
            ],
        };
        let certificate = template.sign(signer, self.algorithm)?;
        info!(
            "Issued end-entity certificate {} fingerprint {}",
            subject,
            x509::fingerprint(&certificate)?
        );
        Ok(certificate)
    }
}

fn random_serial() -> u32 {
    rand::thread_rng().gen_range(1..(1u32 << 31))
}

fn basic_constraints(ca: bool) -> Result<Extension> {
    let value = BasicConstraints {
        ca,
        path_len_constraint: None,
    };
    Ok(Extension {
        extn_id: BASIC_CONSTRAINTS,
        critical: true,
        extn_value: OctetString::new(value.to_der()?)?,
    })
}

fn key_usage(usage: KeyUsage) -> Result<Extension> {
    Ok(Extension {
        extn_id: KEY_USAGE,
        critical: true,
        extn_value: OctetString::new(usage.to_der()?)?,
    })
}
