//! Chain Verification
//!
//! Walks a certificate chain from the leaf towards a trust anchor, checking
//! signature linkage, validity windows, proxy naming, the escalation rule and
//! path length constraints at every hop.

use crate::error::{DelegationError, Result};
use crate::name::{is_proxy_subject_of, DistinguishedName};
use crate::policy::ProxyPolicy;
use crate::x509::{self, CredentialKind};
use chrono::{DateTime, Utc};
use der::DecodePem;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};
use x509_cert::certificate::Certificate;

/// Trusted CA certificates
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    anchors: Vec<Certificate>,
}

impl TrustStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one anchor
    pub fn add(&mut self, cert: Certificate) {
        if !self.contains(&cert) {
            self.anchors.push(cert);
        }
    }

    /// Load every certificate in a PEM file
    pub fn load_file(&mut self, path: &Path) -> Result<usize> {
        let data = std::fs::read(path)?;
        let mut added = 0;
        for block in pem::parse_many(&data)? {
            if block.tag() != "CERTIFICATE" {
                continue;
            }
            let cert = <Certificate as der::Decode>::from_der(block.contents())?;
            self.add(cert);
            added += 1;
        }
        Ok(added)
    }

    /// Load `*.pem`, `*.crt` and hashed `*.0` files from a CA directory.
    /// Unreadable files are skipped with a warning.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize> {
        let mut added = 0;
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let wanted = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| matches!(e, "pem" | "crt" | "0"))
                .unwrap_or(false);
            if !wanted || !path.is_file() {
                continue;
            }
            match self.load_file(&path) {
                Ok(n) => added += n,
                Err(e) => warn!("Skipping CA file {}: {}", path.display(), e),
            }
        }
        debug!("Loaded {} trust anchors from {}", added, dir.display());
        Ok(added)
    }

    /// Build from optional CA file and directory
    pub fn from_paths(ca_file: Option<&Path>, ca_dir: Option<&Path>) -> Result<Self> {
        let mut store = Self::new();
        if let Some(file) = ca_file {
            store.load_file(file)?;
        }
        if let Some(dir) = ca_dir {
            store.load_dir(dir)?;
        }
        Ok(store)
    }

    /// Store holding a single anchor
    pub fn from_pem(pem: &str) -> Result<Self> {
        let mut store = Self::new();
        store.add(Certificate::from_pem(pem.as_bytes())?);
        Ok(store)
    }

    /// Number of anchors
    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    /// True when no anchors are loaded
    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Whether this exact certificate is an anchor
    pub fn contains(&self, cert: &Certificate) -> bool {
        self.anchors.iter().any(|a| a == cert)
    }

    fn find_issuer(&self, cert: &Certificate) -> Option<&Certificate> {
        self.anchors.iter().find(|anchor| {
            anchor.tbs_certificate.subject == cert.tbs_certificate.issuer
                && x509::verify_signature(cert, &anchor.tbs_certificate.subject_public_key_info)
                    .is_ok()
        })
    }
}

/// Outcome of a successful chain walk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReport {
    /// Base identity of the chain
    pub identity: DistinguishedName,

    /// Number of proxy certificates in the chain
    pub proxy_depth: usize,

    /// Policies from leaf to the last proxy
    pub policies: Vec<ProxyPolicy>,

    /// Subject of the trust anchor that terminated the walk
    pub anchor: DistinguishedName,

    /// When the walk ran
    pub verified_at: DateTime<Utc>,
}

/// Verify `leaf` followed by its issuer `chain` against `trust` at `now`
pub fn verify_chain(
    leaf: &Certificate,
    chain: &[Certificate],
    trust: &TrustStore,
    now: DateTime<Utc>,
) -> Result<ChainReport> {
    let path: Vec<&Certificate> = std::iter::once(leaf).chain(chain.iter()).collect();
    let mut policies = Vec::new();
    let mut identity = None;

    for (depth, cert) in path.iter().enumerate() {
        let subject = DistinguishedName::from_x509(&cert.tbs_certificate.subject);
        debug!("Checking chain element {} {}", depth, subject);

        if !x509::is_current(cert, now) {
            let (not_before, not_after) = x509::validity(cert);
            return Err(DelegationError::InvalidChain(format!(
                "{} is outside its validity window {} .. {}",
                subject, not_before, not_after
            )));
        }

        let kind = x509::kind_of(cert);
        if kind == CredentialKind::Proxy {
            let policy = x509::proxy_policy(cert)?.ok_or_else(|| {
                DelegationError::InvalidChain(format!("{} has no proxy policy", subject))
            })?;
            // Every element below a proxy is itself a proxy
            if let Some(limit) = policy.path_length {
                if depth > limit as usize {
                    return Err(DelegationError::InvalidChain(format!(
                        "{} allows {} further proxies but {} follow",
                        subject, limit, depth
                    )));
                }
            }
            policies.push(policy);
        } else if identity.is_none() {
            identity = Some(subject.clone());
        }

        if trust.contains(cert) {
            return finish(identity, policies, subject, now);
        }

        let (parent, parent_is_anchor) = match path.get(depth + 1) {
            Some(parent) => (*parent, false),
            None => {
                let anchor = trust.find_issuer(cert).ok_or_else(|| {
                    DelegationError::InvalidChain(format!(
                        "no trusted issuer for {}",
                        DistinguishedName::from_x509(&cert.tbs_certificate.issuer)
                    ))
                })?;
                (anchor, true)
            }
        };

        check_link(cert, kind, parent)?;

        if parent_is_anchor {
            if !x509::is_current(parent, now) {
                return Err(DelegationError::InvalidChain(
                    "trust anchor is outside its validity window".to_string(),
                ));
            }
            let anchor = DistinguishedName::from_x509(&parent.tbs_certificate.subject);
            return finish(identity, policies, anchor, now);
        }
    }

    Err(DelegationError::InvalidChain("chain does not reach a trust anchor".to_string()))
}

fn check_link(cert: &Certificate, kind: CredentialKind, parent: &Certificate) -> Result<()> {
    let subject = DistinguishedName::from_x509(&cert.tbs_certificate.subject);
    if cert.tbs_certificate.issuer != parent.tbs_certificate.subject {
        return Err(DelegationError::InvalidChain(format!(
            "issuer of {} does not match the next certificate",
            subject
        )));
    }
    x509::verify_signature(cert, &parent.tbs_certificate.subject_public_key_info)
        .map_err(|e| DelegationError::InvalidChain(format!("{}: {}", subject, e)))?;

    let parent_kind = x509::kind_of(parent);
    match kind {
        CredentialKind::Proxy => {
            if parent_kind == CredentialKind::CA {
                return Err(DelegationError::InvalidChain(format!(
                    "proxy {} signed directly by a CA",
                    subject
                )));
            }
            if !is_proxy_subject_of(&cert.tbs_certificate.subject, &parent.tbs_certificate.subject) {
                return Err(DelegationError::InvalidChain(format!(
                    "proxy subject {} does not extend its issuer's subject",
                    subject
                )));
            }
            if parent_kind == CredentialKind::Proxy {
                let parent_policy = x509::proxy_policy(parent)?;
                let child_policy = x509::proxy_policy(cert)?;
                if let (Some(parent_policy), Some(child_policy)) = (parent_policy, child_policy) {
                    if !parent_policy.language.permits_child(&child_policy.language) {
                        return Err(DelegationError::InvalidChain(format!(
                            "{} proxy {} issued below a {} proxy",
                            child_policy.language, subject, parent_policy.language
                        )));
                    }
                }
            }
        }
        CredentialKind::EEC | CredentialKind::CA => {
            if parent_kind != CredentialKind::CA {
                return Err(DelegationError::InvalidChain(format!(
                    "{} {} is not issued by a CA",
                    kind, subject
                )));
            }
        }
    }
    Ok(())
}

fn finish(
    identity: Option<DistinguishedName>,
    policies: Vec<ProxyPolicy>,
    anchor: DistinguishedName,
    now: DateTime<Utc>,
) -> Result<ChainReport> {
    let identity = identity.ok_or_else(|| {
        DelegationError::InvalidChain("chain contains no end-entity certificate".to_string())
    })?;
    Ok(ChainReport {
        identity,
        proxy_depth: policies.len(),
        policies,
        anchor,
        verified_at: now,
    })
}

/// Identity of a chain without verifying it
pub fn chain_identity(leaf: &Certificate, chain: &[Certificate]) -> DistinguishedName {
    std::iter::once(leaf)
        .chain(chain.iter())
        .find(|cert| x509::kind_of(cert) != CredentialKind::Proxy)
        .map(|cert| DistinguishedName::from_x509(&cert.tbs_certificate.subject))
        .unwrap_or_else(|| {
            DistinguishedName::from_x509(&leaf.tbs_certificate.subject).strip_proxy_components()
        })
}
