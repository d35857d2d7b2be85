//! Credentials
//!
//! One X.509 certificate (CA, end-entity or proxy), the private key if it is
//! held, and the issuer chain above it. Proxies are created by signing a
//! [`ProxyRequest`] with a credential that holds its key.

use crate::crypto::{self, SigningAlgorithm};
use crate::error::{DelegationError, Result};
use crate::name::{self, DistinguishedName};
use crate::passphrase::{NoPassphrase, PassphraseSource};
use crate::policy::ProxyPolicy;
use crate::request::{DelegationConstraints, ProxyRequest};
use crate::verification::{self, ChainReport, TrustStore};
use crate::voms::{VomsAcSequence, VOMS_ACSEQ};
use crate::x509::{self, CertificateTemplate, CredentialKind, EXT_KEY_USAGE, KEY_USAGE};
use chrono::{DateTime, Utc};
use der::asn1::{ObjectIdentifier, OctetString};
use der::{Decode, Encode};
use flagset::FlagSet;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use std::fmt;
use std::path::Path;
use tracing::info;
use x509_cert::certificate::Certificate;
use x509_cert::ext::pkix::{KeyUsage, KeyUsages};
use x509_cert::ext::Extension;
use zeroize::Zeroizing;

/// Certificate, optional private key and issuer chain
#[derive(Clone)]
pub struct Credential {
    certificate: Certificate,
    key: Option<RsaPrivateKey>,
    chain: Vec<Certificate>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("subject", &self.subject().to_string())
            .field("kind", &self.kind())
            .field("has_private_key", &self.key.is_some())
            .field("chain_len", &self.chain.len())
            .finish()
    }
}

impl Credential {
    /// Assemble a credential, checking the key belongs to the certificate and
    /// that a proxy comes with its signer.
    pub fn from_parts(
        certificate: Certificate,
        key: Option<RsaPrivateKey>,
        chain: Vec<Certificate>,
    ) -> Result<Self> {
        if let Some(key) = &key {
            let expected = crypto::public_key_info(&key.to_public_key())?.to_der()?;
            if certificate.tbs_certificate.subject_public_key_info.to_der()? != expected {
                return Err(DelegationError::KeyMismatch);
            }
        }

        if x509::kind_of(&certificate) == CredentialKind::Proxy {
            // Rejects malformed ProxyCertInfo up front
            x509::proxy_policy(&certificate)?;
            let signer = chain.first().ok_or_else(|| {
                DelegationError::InvalidChain("proxy certificate without its issuer".to_string())
            })?;
            if signer.tbs_certificate.subject != certificate.tbs_certificate.issuer {
                return Err(DelegationError::InvalidChain(
                    "first chain element is not the proxy's issuer".to_string(),
                ));
            }
        }

        Ok(Self {
            certificate,
            key,
            chain,
        })
    }

    /// Parse a PEM bundle whose key, if any, is unencrypted
    pub fn from_pem(data: &[u8]) -> Result<Self> {
        Self::from_pem_with(data, &NoPassphrase)
    }

    /// Parse a PEM bundle: the first certificate is the credential, later
    /// certificates are its chain in order, and at most one private key may
    /// appear anywhere.
    pub fn from_pem_with(data: &[u8], passphrase: &dyn PassphraseSource) -> Result<Self> {
        let mut certificates = Vec::new();
        let mut key = None;

        for block in pem::parse_many(data)? {
            match block.tag() {
                "CERTIFICATE" => certificates.push(Certificate::from_der(block.contents())?),
                "PRIVATE KEY" | "RSA PRIVATE KEY" | "ENCRYPTED PRIVATE KEY" => {
                    if key.is_some() {
                        return Err(DelegationError::MalformedRequest(
                            "bundle holds more than one private key".to_string(),
                        ));
                    }
                    key = Some(decode_key(&block, passphrase)?);
                }
                _ => {}
            }
        }

        if certificates.is_empty() {
            return Err(DelegationError::MalformedRequest(
                "no certificate in bundle".to_string(),
            ));
        }
        let certificate = certificates.remove(0);
        Self::from_parts(certificate, key, certificates)
    }

    /// Load a certificate file and optionally a separate key file
    pub fn load(
        cert_path: &Path,
        key_path: Option<&Path>,
        passphrase: &dyn PassphraseSource,
    ) -> Result<Self> {
        let mut data = std::fs::read(cert_path)?;
        if let Some(key_path) = key_path {
            data.push(b'\n');
            data.extend_from_slice(&std::fs::read(key_path)?);
        }
        Self::from_pem_with(&data, passphrase)
    }

    /// Split into certificate, key and chain
    pub fn into_parts(self) -> (Certificate, Option<RsaPrivateKey>, Vec<Certificate>) {
        (self.certificate, self.key, self.chain)
    }

    /// The certificate
    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// Issuer chain, direct signer first
    pub fn chain(&self) -> &[Certificate] {
        &self.chain
    }

    /// Private key, if held
    pub fn private_key(&self) -> Option<&RsaPrivateKey> {
        self.key.as_ref()
    }

    /// Whether the private key is held
    pub fn has_private_key(&self) -> bool {
        self.key.is_some()
    }

    /// Subject name
    pub fn subject(&self) -> DistinguishedName {
        DistinguishedName::from_x509(&self.certificate.tbs_certificate.subject)
    }

    /// Issuer name
    pub fn issuer(&self) -> DistinguishedName {
        DistinguishedName::from_x509(&self.certificate.tbs_certificate.issuer)
    }

    /// CA, EEC or proxy
    pub fn kind(&self) -> CredentialKind {
        x509::kind_of(&self.certificate)
    }

    /// Proxy policy; `None` for non-proxies
    pub fn policy(&self) -> Option<ProxyPolicy> {
        x509::proxy_policy(&self.certificate).ok().flatten()
    }

    /// Start of validity
    pub fn start_time(&self) -> DateTime<Utc> {
        x509::validity(&self.certificate).0
    }

    /// End of validity
    pub fn end_time(&self) -> DateTime<Utc> {
        x509::validity(&self.certificate).1
    }

    /// Whether the certificate is inside its validity window now
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    /// Whether the certificate is inside its validity window at `now`
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        x509::is_current(&self.certificate, now)
    }

    /// Serial number, hex encoded
    pub fn serial(&self) -> String {
        hex::encode(self.certificate.tbs_certificate.serial_number.as_bytes())
    }

    /// Digest that signed the certificate
    pub fn signing_algorithm(&self) -> Option<SigningAlgorithm> {
        x509::signature_algorithm(&self.certificate)
    }

    /// Size of the certified public key
    pub fn key_bits(&self) -> Result<usize> {
        let key = crypto::rsa_public_key(&self.certificate.tbs_certificate.subject_public_key_info)?;
        Ok(crypto::key_bits(&key))
    }

    /// Extensions as `(oid, critical, DER value)`
    pub fn extensions(&self) -> Vec<(ObjectIdentifier, bool, Vec<u8>)> {
        self.certificate
            .tbs_certificate
            .extensions
            .iter()
            .flatten()
            .map(|ext| (ext.extn_id, ext.critical, ext.extn_value.as_bytes().to_vec()))
            .collect()
    }

    /// DER value of one extension
    pub fn extension(&self, oid: &ObjectIdentifier) -> Option<&[u8]> {
        x509::extension(&self.certificate, oid).map(|ext| ext.extn_value.as_bytes())
    }

    /// Embedded VOMS attribute certificates
    pub fn voms_attributes(&self) -> Option<VomsAcSequence> {
        self.extension(&VOMS_ACSEQ)
            .and_then(|der| VomsAcSequence::from_der(der.to_vec()).ok())
    }

    /// Base identity: the subject of the first non-proxy certificate in the
    /// chain, or the leaf subject with proxy components stripped when the
    /// chain stops short of it
    pub fn identity_name(&self) -> DistinguishedName {
        verification::chain_identity(&self.certificate, &self.chain)
    }

    /// Verify the chain against `trust` now
    pub fn verify(&self, trust: &TrustStore) -> Result<ChainReport> {
        self.verify_at(trust, Utc::now())
    }

    /// Verify the chain against `trust` at `now`
    pub fn verify_at(&self, trust: &TrustStore, now: DateTime<Utc>) -> Result<ChainReport> {
        verification::verify_chain(&self.certificate, &self.chain, trust, now)
    }

    /// Boolean form of [`Credential::verify`]
    pub fn get_verification(&self, trust: &TrustStore) -> bool {
        self.verify(trust).is_ok()
    }

    /// Certificate as PEM
    pub fn certificate_pem(&self) -> Result<String> {
        x509::certificate_to_pem(&self.certificate)
    }

    /// Chain as concatenated PEM, direct signer first
    pub fn chain_pem(&self) -> Result<String> {
        let mut out = String::new();
        for cert in &self.chain {
            out.push_str(&x509::certificate_to_pem(cert)?);
        }
        Ok(out)
    }

    /// Certificate followed by the chain, without the key
    pub fn certificate_chain_pem(&self) -> Result<String> {
        Ok(self.certificate_pem()? + &self.chain_pem()?)
    }

    /// Private key as unencrypted PKCS#8 PEM
    pub fn private_key_pem(&self) -> Result<Option<Zeroizing<String>>> {
        self.key
            .as_ref()
            .map(|key| {
                key.to_pkcs8_pem(LineEnding::LF)
                    .map_err(|e| DelegationError::Crypto(format!("encode key: {}", e)))
            })
            .transpose()
    }

    /// Certificate, unencrypted key if held, then the chain
    pub fn output_bundle(&self) -> Result<Zeroizing<String>> {
        let mut out = Zeroizing::new(self.certificate_pem()?);
        if let Some(key) = self.private_key_pem()? {
            out.push_str(&key);
        }
        out.push_str(&self.chain_pem()?);
        Ok(out)
    }

    /// Like [`output_bundle`](Self::output_bundle) with the key as an
    /// `ENCRYPTED PRIVATE KEY` under `passphrase`
    pub fn output_bundle_encrypted(&self, passphrase: &str) -> Result<Zeroizing<String>> {
        let key = self.key.as_ref().ok_or_else(|| {
            DelegationError::SignerNotUsable("no private key to encrypt".to_string())
        })?;
        let encrypted = key
            .to_pkcs8_encrypted_pem(&mut rand::thread_rng(), passphrase, LineEnding::LF)
            .map_err(|e| DelegationError::Crypto(format!("encrypt key: {}", e)))?;
        let mut out = Zeroizing::new(self.certificate_pem()?);
        out.push_str(&encrypted);
        out.push_str(&self.chain_pem()?);
        Ok(out)
    }

    /// Sign a proxy request with this credential, returning the new
    /// certificate as PEM.
    pub fn sign_request(
        &self,
        request: &ProxyRequest,
        constraints: &DelegationConstraints,
    ) -> Result<String> {
        let key = self.key.as_ref().ok_or_else(|| {
            DelegationError::SignerNotUsable("credential holds no private key".to_string())
        })?;
        let now = Utc::now();
        if !self.is_valid_at(now) {
            return Err(DelegationError::SignerNotUsable(format!(
                "{} is outside its validity window {} .. {}",
                self.subject(),
                self.start_time(),
                self.end_time()
            )));
        }
        if self.kind() == CredentialKind::CA {
            return Err(DelegationError::SignerNotUsable(
                "CA credentials do not issue proxies".to_string(),
            ));
        }

        let csr = request.parse_csr()?;
        let requested_key = crypto::rsa_public_key(&csr.info.public_key)?;
        let bits = crypto::key_bits(&requested_key);
        if bits < constraints.min_key_bits {
            return Err(DelegationError::MalformedRequest(format!(
                "{}-bit request key is below the {}-bit minimum",
                bits, constraints.min_key_bits
            )));
        }

        let policy = constraints.policy.resolve(self.policy().as_ref())?;

        let (start, end) = constraints.window(request, now)?;
        let not_before = start.max(self.start_time());
        let not_after = end.min(self.end_time());

        let serial = crypto::proxy_serial(&csr.info.public_key)?;
        let subject = name::append_common_name(
            &self.certificate.tbs_certificate.subject,
            &serial.to_string(),
        )?;

        let mut template = CertificateTemplate {
            serial,
            issuer: self.certificate.tbs_certificate.subject.clone(),
            subject,
            not_before,
            not_after,
            public_key: csr.info.public_key,
            extensions: Vec::new(),
        };
        template.push_extension(policy.to_extension()?);
        if let Some(usage) = self.proxy_key_usage()? {
            template.push_extension(usage);
        }
        if let Some(eku) = x509::extension(&self.certificate, &EXT_KEY_USAGE) {
            template.push_extension(eku.clone());
        }
        if let Some(voms) = &constraints.voms {
            voms.embed(&mut template)?;
        }

        let algorithm = constraints
            .signing_algorithm
            .unwrap_or(request.signing_algorithm)
            .resolve(self.signing_algorithm(), constraints.fallback_algorithm);
        let proxy = template.sign(key, algorithm)?;
        x509::verify_signature(&proxy, &self.certificate.tbs_certificate.subject_public_key_info)?;

        info!(
            "Issued {} proxy {} serial {} valid until {}",
            policy.language,
            DistinguishedName::from_x509(&proxy.tbs_certificate.subject),
            serial,
            not_after
        );
        x509::certificate_to_pem(&proxy)
    }

    /// Key usage for a child proxy: the issuer's, without non-repudiation or
    /// certificate signing
    fn proxy_key_usage(&self) -> Result<Option<Extension>> {
        let Some(ext) = x509::extension(&self.certificate, &KEY_USAGE) else {
            return Ok(None);
        };
        let usage = KeyUsage::from_der(ext.extn_value.as_bytes())?;
        if !usage.digital_signature() {
            return Err(DelegationError::SignerNotUsable(
                "issuer key usage does not allow digital signatures".to_string(),
            ));
        }

        let mut flags = FlagSet::from(KeyUsages::DigitalSignature);
        if usage.key_encipherment() {
            flags |= KeyUsages::KeyEncipherment;
        }
        if usage.data_encipherment() {
            flags |= KeyUsages::DataEncipherment;
        }
        if usage.key_agreement() {
            flags |= KeyUsages::KeyAgreement;
        }
        Ok(Some(Extension {
            extn_id: KEY_USAGE,
            critical: ext.critical,
            extn_value: OctetString::new(KeyUsage(flags).to_der()?)?,
        }))
    }
}

fn decode_key(block: &pem::Pem, passphrase: &dyn PassphraseSource) -> Result<RsaPrivateKey> {
    match block.tag() {
        "PRIVATE KEY" => RsaPrivateKey::from_pkcs8_der(block.contents())
            .map_err(|e| DelegationError::MalformedRequest(format!("private key: {}", e))),
        "RSA PRIVATE KEY" => {
            if block.headers().get("Proc-Type").is_some() {
                return Err(DelegationError::PassphraseFailure(
                    "legacy PEM-encrypted keys are not supported; convert to PKCS#8".to_string(),
                ));
            }
            RsaPrivateKey::from_pkcs1_der(block.contents())
                .map_err(|e| DelegationError::MalformedRequest(format!("private key: {}", e)))
        }
        _ => {
            let secret = passphrase.passphrase("Enter passphrase for private key: ")?;
            RsaPrivateKey::from_pkcs8_encrypted_der(block.contents(), secret.as_bytes())
                .map_err(|e| DelegationError::PassphraseFailure(format!("cannot decrypt key: {}", e)))
        }
    }
}
