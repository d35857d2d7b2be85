//! X.509 plumbing
//!
//! Building, signing and inspecting certificates and PKCS#10 requests.

use crate::crypto::{self, SigningAlgorithm};
use crate::error::{DelegationError, Result};
use crate::policy::{ProxyPolicy, PROXY_CERT_INFO};
use chrono::{DateTime, Datelike, Utc};
use der::asn1::{BitString, GeneralizedTime, ObjectIdentifier, SetOfVec, UtcTime};
use der::{Decode, DecodePem, Encode, EncodePem};
use rsa::pkcs8::LineEnding;
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use spki::SubjectPublicKeyInfoOwned;
use std::time::Duration;
use x509_cert::certificate::{Certificate, TbsCertificate, Version};
use x509_cert::ext::pkix::BasicConstraints;
use x509_cert::ext::Extension;
use x509_cert::name::{Name, RdnSequence};
use x509_cert::request::{CertReq, CertReqInfo};
use x509_cert::serial_number::SerialNumber;
use x509_cert::time::{Time, Validity};

/// `id-ce-basicConstraints`
pub const BASIC_CONSTRAINTS: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.19");

/// `id-ce-keyUsage`
pub const KEY_USAGE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.15");

/// `id-ce-extKeyUsage`
pub const EXT_KEY_USAGE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.37");

/// Role of a certificate in a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    /// Certificate authority
    #[serde(rename = "ca")]
    CA,
    /// End-entity certificate
    #[serde(rename = "eec")]
    EEC,
    /// Proxy certificate
    Proxy,
}

impl std::fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CredentialKind::CA => "CA",
            CredentialKind::EEC => "EEC",
            CredentialKind::Proxy => "proxy",
        };
        f.write_str(name)
    }
}

/// Find an extension by OID
pub fn extension<'a>(cert: &'a Certificate, oid: &ObjectIdentifier) -> Option<&'a Extension> {
    cert.tbs_certificate
        .extensions
        .as_ref()?
        .iter()
        .find(|ext| ext.extn_id == *oid)
}

/// Classify a certificate
pub fn kind_of(cert: &Certificate) -> CredentialKind {
    if extension(cert, &PROXY_CERT_INFO).is_some() {
        return CredentialKind::Proxy;
    }
    match basic_constraints(cert) {
        Some(bc) if bc.ca => CredentialKind::CA,
        _ => CredentialKind::EEC,
    }
}

/// Decoded basic constraints, if present and well formed
pub fn basic_constraints(cert: &Certificate) -> Option<BasicConstraints> {
    let ext = extension(cert, &BASIC_CONSTRAINTS)?;
    BasicConstraints::from_der(ext.extn_value.as_bytes()).ok()
}

/// Proxy policy of a proxy certificate
pub fn proxy_policy(cert: &Certificate) -> Result<Option<ProxyPolicy>> {
    extension(cert, &PROXY_CERT_INFO)
        .map(|ext| ProxyPolicy::from_der(ext.extn_value.as_bytes()))
        .transpose()
}

/// Digest that signed this certificate
pub fn signature_algorithm(cert: &Certificate) -> Option<SigningAlgorithm> {
    SigningAlgorithm::from_oid(&cert.signature_algorithm.oid)
}

/// Validity window as UTC timestamps
pub fn validity(cert: &Certificate) -> (DateTime<Utc>, DateTime<Utc>) {
    let v = &cert.tbs_certificate.validity;
    (from_x509_time(&v.not_before), from_x509_time(&v.not_after))
}

/// True when `now` lies inside the certificate's validity window
pub fn is_current(cert: &Certificate, now: DateTime<Utc>) -> bool {
    let (not_before, not_after) = validity(cert);
    not_before <= now && now <= not_after
}

/// Convert an X.509 time
pub fn from_x509_time(time: &Time) -> DateTime<Utc> {
    let secs = time.to_unix_duration().as_secs();
    DateTime::from_timestamp(i64::try_from(secs).unwrap_or(i64::MAX), 0).unwrap_or_default()
}

/// Convert to an X.509 time, using UTCTime before 2050
pub fn to_x509_time(time: DateTime<Utc>) -> Result<Time> {
    let secs = u64::try_from(time.timestamp()).map_err(|_| {
        DelegationError::MalformedRequest(format!("time before the epoch: {}", time))
    })?;
    let duration = Duration::from_secs(secs);
    if time.year() < 2050 {
        Ok(Time::UtcTime(UtcTime::from_unix_duration(duration)?))
    } else {
        Ok(Time::GeneralTime(GeneralizedTime::from_unix_duration(duration)?))
    }
}

/// SHA-256 fingerprint of the DER certificate, hex encoded
pub fn fingerprint(cert: &Certificate) -> Result<String> {
    use sha2::{Digest, Sha256};
    Ok(hex::encode(Sha256::digest(cert.to_der()?)))
}

/// Check `cert` was signed by the holder of `issuer_key`
pub fn verify_signature(cert: &Certificate, issuer_key: &SubjectPublicKeyInfoOwned) -> Result<()> {
    let algorithm = signature_algorithm(cert).ok_or_else(|| {
        DelegationError::UnsupportedAlgorithm(cert.signature_algorithm.oid.to_string())
    })?;
    let signature = cert.signature.as_bytes().ok_or_else(|| {
        DelegationError::MalformedRequest("certificate signature has unused bits".to_string())
    })?;
    let public_key = crypto::rsa_public_key(issuer_key)?;
    algorithm.verify(&public_key, &cert.tbs_certificate.to_der()?, signature)
}

/// Fields of a certificate still to be signed
#[derive(Debug, Clone)]
pub struct CertificateTemplate {
    /// Serial number
    pub serial: u32,
    /// Issuer name, copied from the signer's subject
    pub issuer: Name,
    /// Subject name
    pub subject: Name,
    /// Start of validity
    pub not_before: DateTime<Utc>,
    /// End of validity
    pub not_after: DateTime<Utc>,
    /// Public key being certified
    pub public_key: SubjectPublicKeyInfoOwned,
    /// Extensions, in order
    pub extensions: Vec<Extension>,
}

impl CertificateTemplate {
    /// Add an extension, replacing any with the same OID
    pub fn push_extension(&mut self, ext: Extension) {
        self.extensions.retain(|e| e.extn_id != ext.extn_id);
        self.extensions.push(ext);
    }

    /// Sign the template. The result is immutable; nothing can be added to
    /// a certificate once this returns.
    pub fn sign(self, key: &RsaPrivateKey, algorithm: SigningAlgorithm) -> Result<Certificate> {
        if self.not_after <= self.not_before {
            return Err(DelegationError::SignerNotUsable(format!(
                "empty validity window {} .. {}",
                self.not_before, self.not_after
            )));
        }

        let signature_algorithm = algorithm.algorithm_identifier()?;
        let tbs_certificate = TbsCertificate {
            version: Version::V3,
            serial_number: SerialNumber::new(&crypto::serial_bytes(self.serial))?,
            signature: signature_algorithm.clone(),
            issuer: self.issuer,
            validity: Validity {
                not_before: to_x509_time(self.not_before)?,
                not_after: to_x509_time(self.not_after)?,
            },
            subject: self.subject,
            subject_public_key_info: self.public_key,
            issuer_unique_id: None,
            subject_unique_id: None,
            extensions: if self.extensions.is_empty() {
                None
            } else {
                Some(self.extensions)
            },
        };

        let signature = algorithm.sign(key, &tbs_certificate.to_der()?)?;
        Ok(Certificate {
            tbs_certificate,
            signature_algorithm,
            signature: BitString::from_bytes(&signature)?,
        })
    }
}

/// Build a PKCS#10 request with an empty subject, self-signed by `key`
pub fn build_request(key: &RsaPrivateKey, algorithm: SigningAlgorithm) -> Result<CertReq> {
    let info = CertReqInfo {
        version: x509_cert::request::Version::V1,
        subject: RdnSequence(Vec::new()),
        public_key: crypto::public_key_info(&key.to_public_key())?,
        attributes: SetOfVec::new(),
    };
    let algorithm_id = algorithm.algorithm_identifier()?;
    let signature = algorithm.sign(key, &info.to_der()?)?;
    Ok(CertReq {
        info,
        algorithm: algorithm_id,
        signature: BitString::from_bytes(&signature)?,
    })
}

/// Check the self-signature of a PKCS#10 request
pub fn verify_request(request: &CertReq) -> Result<()> {
    let algorithm = SigningAlgorithm::from_oid(&request.algorithm.oid)
        .ok_or_else(|| DelegationError::UnsupportedAlgorithm(request.algorithm.oid.to_string()))?;
    let signature = request.signature.as_bytes().ok_or_else(|| {
        DelegationError::MalformedRequest("request signature has unused bits".to_string())
    })?;
    let public_key = crypto::rsa_public_key(&request.info.public_key)?;
    algorithm
        .verify(&public_key, &request.info.to_der()?, signature)
        .map_err(|e| DelegationError::MalformedRequest(format!("request self-signature: {}", e)))
}

/// PEM encode a request
pub fn request_to_pem(request: &CertReq) -> Result<String> {
    Ok(request.to_pem(LineEnding::LF)?)
}

/// Parse a PEM request
pub fn request_from_pem(pem: &str) -> Result<CertReq> {
    CertReq::from_pem(pem.as_bytes())
        .map_err(|e| DelegationError::MalformedRequest(format!("certificate request: {}", e)))
}

/// PEM encode a certificate
pub fn certificate_to_pem(cert: &Certificate) -> Result<String> {
    Ok(cert.to_pem(LineEnding::LF)?)
}
