//! RSA and digest primitives
//!
//! Key generation, PKCS#1 v1.5 signing over the allow-listed digests, and
//! public key encoding helpers.

use crate::error::{DelegationError, Result};
use const_oid::AssociatedOid;
use der::asn1::ObjectIdentifier;
use der::{Any, Decode, Encode, Tag};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use std::fmt;
use std::str::FromStr;

const SHA1_WITH_RSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.5");
const SHA224_WITH_RSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.14");
const SHA256_WITH_RSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11");
const SHA384_WITH_RSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.12");
const SHA512_WITH_RSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.13");

/// Digest used for a certificate or request signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningAlgorithm {
    /// SHA-1, legacy only
    Sha1,
    /// SHA-224
    Sha224,
    /// SHA-256
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
}

impl SigningAlgorithm {
    /// Every accepted algorithm
    pub const ALL: [SigningAlgorithm; 5] = [
        SigningAlgorithm::Sha1,
        SigningAlgorithm::Sha224,
        SigningAlgorithm::Sha256,
        SigningAlgorithm::Sha384,
        SigningAlgorithm::Sha512,
    ];

    /// Configuration name
    pub fn name(&self) -> &'static str {
        match self {
            SigningAlgorithm::Sha1 => "sha1",
            SigningAlgorithm::Sha224 => "sha224",
            SigningAlgorithm::Sha256 => "sha256",
            SigningAlgorithm::Sha384 => "sha384",
            SigningAlgorithm::Sha512 => "sha512",
        }
    }

    /// `shaNNNWithRSAEncryption` OID
    pub fn oid(&self) -> ObjectIdentifier {
        match self {
            SigningAlgorithm::Sha1 => SHA1_WITH_RSA,
            SigningAlgorithm::Sha224 => SHA224_WITH_RSA,
            SigningAlgorithm::Sha256 => SHA256_WITH_RSA,
            SigningAlgorithm::Sha384 => SHA384_WITH_RSA,
            SigningAlgorithm::Sha512 => SHA512_WITH_RSA,
        }
    }

    /// Map a signature OID back to its digest
    pub fn from_oid(oid: &ObjectIdentifier) -> Option<Self> {
        Self::ALL.into_iter().find(|alg| alg.oid() == *oid)
    }

    /// Algorithm identifier with the NULL parameters RSA signatures carry
    pub fn algorithm_identifier(&self) -> Result<AlgorithmIdentifierOwned> {
        Ok(AlgorithmIdentifierOwned {
            oid: self.oid(),
            parameters: Some(Any::new(Tag::Null, Vec::<u8>::new())?),
        })
    }

    /// Sign `message` with `key`
    pub fn sign(&self, key: &RsaPrivateKey, message: &[u8]) -> Result<Vec<u8>> {
        match self {
            SigningAlgorithm::Sha1 => sign_with::<Sha1>(key, message),
            SigningAlgorithm::Sha224 => sign_with::<Sha224>(key, message),
            SigningAlgorithm::Sha256 => sign_with::<Sha256>(key, message),
            SigningAlgorithm::Sha384 => sign_with::<Sha384>(key, message),
            SigningAlgorithm::Sha512 => sign_with::<Sha512>(key, message),
        }
    }

    /// Verify `signature` over `message`
    pub fn verify(&self, key: &RsaPublicKey, message: &[u8], signature: &[u8]) -> Result<()> {
        match self {
            SigningAlgorithm::Sha1 => verify_with::<Sha1>(key, message, signature),
            SigningAlgorithm::Sha224 => verify_with::<Sha224>(key, message, signature),
            SigningAlgorithm::Sha256 => verify_with::<Sha256>(key, message, signature),
            SigningAlgorithm::Sha384 => verify_with::<Sha384>(key, message, signature),
            SigningAlgorithm::Sha512 => verify_with::<Sha512>(key, message, signature),
        }
    }
}

impl fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SigningAlgorithm {
    type Err = DelegationError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|alg| alg.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| DelegationError::UnsupportedAlgorithm(s.to_string()))
    }
}

/// Digest requested by the party asking for a proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DigestChoice {
    /// Use whatever digest signed the issuer's certificate
    #[default]
    Inherit,
    /// Use this digest
    Explicit(SigningAlgorithm),
}

impl DigestChoice {
    /// Resolve against the issuer's own signature algorithm
    pub fn resolve(&self, issuer: Option<SigningAlgorithm>, fallback: SigningAlgorithm) -> SigningAlgorithm {
        match self {
            DigestChoice::Inherit => issuer.unwrap_or(fallback),
            DigestChoice::Explicit(alg) => *alg,
        }
    }
}

impl FromStr for DigestChoice {
    type Err = DelegationError;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().eq_ignore_ascii_case("inherit") {
            return Ok(DigestChoice::Inherit);
        }
        s.parse().map(DigestChoice::Explicit)
    }
}

impl TryFrom<String> for DigestChoice {
    type Error = DelegationError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DigestChoice> for String {
    fn from(choice: DigestChoice) -> Self {
        choice.to_string()
    }
}

impl fmt::Display for DigestChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DigestChoice::Inherit => f.write_str("inherit"),
            DigestChoice::Explicit(alg) => alg.fmt(f),
        }
    }
}

fn sign_with<D>(key: &RsaPrivateKey, message: &[u8]) -> Result<Vec<u8>>
where
    D: Digest + AssociatedOid,
{
    let signer = SigningKey::<D>::new(key.clone());
    let signature = signer.try_sign(message)?;
    Ok(signature.to_vec())
}

fn verify_with<D>(key: &RsaPublicKey, message: &[u8], signature: &[u8]) -> Result<()>
where
    D: Digest + AssociatedOid,
{
    let verifier = VerifyingKey::<D>::new(key.clone());
    let signature = Signature::try_from(signature)?;
    verifier
        .verify(message, &signature)
        .map_err(|e| DelegationError::InvalidChain(format!("signature check failed: {}", e)))
}

/// Generate an RSA key pair
pub fn generate_key(bits: usize) -> Result<RsaPrivateKey> {
    let mut rng = rand::thread_rng();
    Ok(RsaPrivateKey::new(&mut rng, bits)?)
}

/// Modulus size of a public key
pub fn key_bits(key: &RsaPublicKey) -> usize {
    key.n().bits()
}

/// SubjectPublicKeyInfo for an RSA public key
pub fn public_key_info(key: &RsaPublicKey) -> Result<SubjectPublicKeyInfoOwned> {
    let document = key
        .to_public_key_der()
        .map_err(|e| DelegationError::Crypto(format!("encode public key: {}", e)))?;
    Ok(SubjectPublicKeyInfoOwned::from_der(document.as_bytes())?)
}

/// RSA public key inside a SubjectPublicKeyInfo
pub fn rsa_public_key(info: &SubjectPublicKeyInfoOwned) -> Result<RsaPublicKey> {
    let der = info.to_der()?;
    RsaPublicKey::from_public_key_der(&der)
        .map_err(|e| DelegationError::MalformedRequest(format!("not an RSA public key: {}", e)))
}

/// Proxy serial derived from the public key.
///
/// The low 31 bits of the SHA-1 of the DER SubjectPublicKeyInfo, read
/// little-endian. Never zero.
pub fn proxy_serial(info: &SubjectPublicKeyInfoOwned) -> Result<u32> {
    let digest = Sha1::digest(info.to_der()?);
    let number = u32::from(digest[0])
        + (u32::from(digest[1]) + (u32::from(digest[2]) + u32::from(digest[3] >> 1) * 256) * 256)
            * 256;
    Ok(number.max(1))
}

/// Minimal big-endian encoding of a positive serial
pub fn serial_bytes(serial: u32) -> Vec<u8> {
    let bytes = serial.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
    let mut out = bytes[first..].to_vec();
    if out[0] & 0x80 != 0 {
        out.insert(0, 0);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_names() {
        assert_eq!("sha256".parse::<SigningAlgorithm>().unwrap(), SigningAlgorithm::Sha256);
        assert_eq!("SHA512".parse::<SigningAlgorithm>().unwrap(), SigningAlgorithm::Sha512);
        assert!(matches!(
            "md5".parse::<SigningAlgorithm>(),
            Err(DelegationError::UnsupportedAlgorithm(_))
        ));
        assert_eq!("inherit".parse::<DigestChoice>().unwrap(), DigestChoice::Inherit);
        assert!("sha3".parse::<DigestChoice>().is_err());

        let json = serde_json::to_string(&DigestChoice::Explicit(SigningAlgorithm::Sha384)).unwrap();
        assert_eq!(json, "\"sha384\"");
        let parsed: DigestChoice = serde_json::from_str("\"inherit\"").unwrap();
        assert_eq!(parsed, DigestChoice::Inherit);
    }

    #[test]
    fn test_oid_mapping() {
        for alg in SigningAlgorithm::ALL {
            assert_eq!(SigningAlgorithm::from_oid(&alg.oid()), Some(alg));
        }
    }

    #[test]
    fn test_inherit_resolution() {
        let choice = DigestChoice::Inherit;
        assert_eq!(
            choice.resolve(Some(SigningAlgorithm::Sha384), SigningAlgorithm::Sha256),
            SigningAlgorithm::Sha384
        );
        assert_eq!(choice.resolve(None, SigningAlgorithm::Sha256), SigningAlgorithm::Sha256);
        let explicit = DigestChoice::Explicit(SigningAlgorithm::Sha1);
        assert_eq!(
            explicit.resolve(Some(SigningAlgorithm::Sha512), SigningAlgorithm::Sha256),
            SigningAlgorithm::Sha1
        );
    }

    #[test]
    fn test_sign_and_verify() {
        let key = generate_key(1024).unwrap();
        let public = key.to_public_key();
        for alg in SigningAlgorithm::ALL {
            let signature = alg.sign(&key, b"payload").unwrap();
            alg.verify(&public, b"payload", &signature).unwrap();
            assert!(alg.verify(&public, b"tampered", &signature).is_err());
        }
    }

    #[test]
    fn test_serial_encoding() {
        assert_eq!(serial_bytes(1), vec![1]);
        assert_eq!(serial_bytes(0x80), vec![0, 0x80]);
        assert_eq!(serial_bytes(0x0102_0304), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_proxy_serial_is_stable() {
        let key = generate_key(1024).unwrap();
        let info = public_key_info(&key.to_public_key()).unwrap();
        let serial = proxy_serial(&info).unwrap();
        assert_eq!(serial, proxy_serial(&info).unwrap());
        assert!(serial < (1 << 31));
    }
}
