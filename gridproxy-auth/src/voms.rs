//! VOMS Attribute Certificate Embedding
//!
//! Attaches an already-issued VOMS attribute certificate sequence to a proxy
//! as a non-critical extension. Only DER well-formedness is checked here; the
//! AC's own issuer and signature are someone else's concern.

use crate::error::{DelegationError, Result};
use crate::x509::CertificateTemplate;
use der::asn1::{ObjectIdentifier, OctetString};
use der::{Any, Decode, Tag, Tagged};
use x509_cert::ext::Extension;

/// VOMS `acseq` extension
pub const VOMS_ACSEQ: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.8005.100.100.5");

/// DER `SEQUENCE OF AttributeCertificate`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VomsAcSequence {
    der: Vec<u8>,
}

impl VomsAcSequence {
    /// Accept a DER blob after checking it is a sequence of sequences
    pub fn from_der(der: impl Into<Vec<u8>>) -> Result<Self> {
        let der = der.into();
        let elements = Vec::<Any>::from_der(&der).map_err(|e| {
            DelegationError::MalformedRequest(format!("VOMS AC sequence is not DER: {}", e))
        })?;
        if elements.is_empty() {
            return Err(DelegationError::MalformedRequest(
                "VOMS AC sequence is empty".to_string(),
            ));
        }
        if let Some(bad) = elements.iter().find(|e| e.tag() != Tag::Sequence) {
            return Err(DelegationError::MalformedRequest(format!(
                "VOMS AC sequence element has tag {}",
                bad.tag()
            )));
        }
        Ok(Self { der })
    }

    /// Accept either raw DER or a PEM block of it
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        match pem::parse(bytes) {
            Ok(block) => Self::from_der(block.contents().to_vec()),
            Err(_) => Self::from_der(bytes.to_vec()),
        }
    }

    /// Raw DER
    pub fn as_der(&self) -> &[u8] {
        &self.der
    }

    /// Number of attribute certificates carried
    pub fn len(&self) -> usize {
        Vec::<Any>::from_der(&self.der).map(|v| v.len()).unwrap_or(0)
    }

    /// Always false for a validated sequence
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Non-critical extension carrying this sequence
    pub fn to_extension(&self) -> Result<Extension> {
        Ok(Extension {
            extn_id: VOMS_ACSEQ,
            critical: false,
            extn_value: OctetString::new(self.der.clone())?,
        })
    }

    /// Attach to a certificate that has not been signed yet
    pub fn embed(&self, template: &mut CertificateTemplate) -> Result<()> {
        template.push_extension(self.to_extension()?);
        Ok(())
    }
}
