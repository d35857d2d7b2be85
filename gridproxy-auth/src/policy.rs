//! Proxy Policy
//!
//! The authority restriction carried by a proxy certificate in its
//! ProxyCertInfo extension, and the escalation rule that binds a child's
//! policy to its issuer's.

use crate::error::{DelegationError, Result};
use der::asn1::{ObjectIdentifier, OctetString};
use der::{Decode, Encode, Sequence};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use x509_cert::ext::Extension;

/// ProxyCertInfo extension (always critical)
pub const PROXY_CERT_INFO: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.1.14");

/// `id-ppl-inheritAll`
pub const PPL_INHERIT_ALL: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.21.1");

/// `id-ppl-independent`
pub const PPL_INDEPENDENT: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.21.2");

/// `id-ppl-anyLanguage`
pub const PPL_ANY_LANGUAGE: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.21.0");

/// Globus limited-proxy policy language
pub const PPL_LIMITED: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.3536.1.1.1.9");

/// Policy language of a proxy
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyLanguage {
    /// May not be used to acquire further unrestricted rights
    Limited,
    /// Carries none of the issuer's rights beyond its identity
    Independent,
    /// Carries all of the issuer's rights
    InheritAll,
    /// Custom policy, opaque to this crate
    AnyLanguage(Vec<u8>),
}

impl PolicyLanguage {
    /// OID written into the certificate
    pub fn oid(&self) -> ObjectIdentifier {
        match self {
            PolicyLanguage::Limited => PPL_LIMITED,
            PolicyLanguage::Independent => PPL_INDEPENDENT,
            PolicyLanguage::InheritAll => PPL_INHERIT_ALL,
            PolicyLanguage::AnyLanguage(_) => PPL_ANY_LANGUAGE,
        }
    }

    /// Short name
    pub fn name(&self) -> &'static str {
        match self {
            PolicyLanguage::Limited => "limited",
            PolicyLanguage::Independent => "independent",
            PolicyLanguage::InheritAll => "inheritAll",
            PolicyLanguage::AnyLanguage(_) => "anylanguage",
        }
    }

    /// Whether a proxy with this language may sign a child with `child`
    pub fn permits_child(&self, child: &PolicyLanguage) -> bool {
        match self {
            PolicyLanguage::Limited => {
                matches!(child, PolicyLanguage::Limited | PolicyLanguage::Independent)
            }
            _ => true,
        }
    }
}

impl fmt::Display for PolicyLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parses the three named languages. Custom policies carry content and are
/// built with [`PolicyLanguage::AnyLanguage`] directly.
impl FromStr for PolicyLanguage {
    type Err = DelegationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "limited" => Ok(PolicyLanguage::Limited),
            "independent" => Ok(PolicyLanguage::Independent),
            "inheritAll" | "inheritall" => Ok(PolicyLanguage::InheritAll),
            other => Err(DelegationError::MalformedRequest(format!(
                "unknown proxy policy language '{}'",
                other
            ))),
        }
    }
}

/// Policy attached to a proxy certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyPolicy {
    /// Policy language and, for custom policies, its content
    pub language: PolicyLanguage,

    /// Further proxy hops permitted below this one. `None` is unconstrained.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_length: Option<u32>,
}

impl ProxyPolicy {
    /// Unconstrained inheritAll policy
    pub fn inherit_all() -> Self {
        Self {
            language: PolicyLanguage::InheritAll,
            path_length: None,
        }
    }

    /// Unconstrained limited policy
    pub fn limited() -> Self {
        Self {
            language: PolicyLanguage::Limited,
            path_length: None,
        }
    }

    /// Policy with the given language and no path length
    pub fn with_language(language: PolicyLanguage) -> Self {
        Self {
            language,
            path_length: None,
        }
    }

    /// Set the path length constraint
    pub fn path_length(mut self, path_length: Option<u32>) -> Self {
        self.path_length = path_length;
        self
    }

    /// DER encoding of the ProxyCertInfo value
    pub fn to_der(&self) -> Result<Vec<u8>> {
        let policy = match &self.language {
            PolicyLanguage::AnyLanguage(content) => Some(OctetString::new(content.clone())?),
            _ => None,
        };
        let info = ProxyCertInfoSyntax {
            path_len_constraint: self.path_length,
            proxy_policy: ProxyPolicySyntax {
                policy_language: self.language.oid(),
                policy,
            },
        };
        Ok(info.to_der()?)
    }

    /// Decode a ProxyCertInfo value
    pub fn from_der(bytes: &[u8]) -> Result<Self> {
        let info = ProxyCertInfoSyntax::from_der(bytes)?;
        let oid = info.proxy_policy.policy_language;
        let language = if oid == PPL_LIMITED {
            PolicyLanguage::Limited
        } else if oid == PPL_INDEPENDENT {
            PolicyLanguage::Independent
        } else if oid == PPL_INHERIT_ALL {
            PolicyLanguage::InheritAll
        } else {
            // Any other language is treated as a custom policy
            let content = info
                .proxy_policy
                .policy
                .map(|p| p.as_bytes().to_vec())
                .unwrap_or_default();
            PolicyLanguage::AnyLanguage(content)
        };
        Ok(Self {
            language,
            path_length: info.path_len_constraint,
        })
    }

    /// Critical certificate extension carrying this policy
    pub fn to_extension(&self) -> Result<Extension> {
        Ok(Extension {
            extn_id: PROXY_CERT_INFO,
            critical: true,
            extn_value: OctetString::new(self.to_der()?)?,
        })
    }
}

impl fmt::Display for ProxyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.path_length {
            Some(len) => write!(f, "{} (path length {})", self.language, len),
            None => write!(f, "{}", self.language),
        }
    }
}

/// What the caller asks of a newly signed proxy's policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRequest {
    /// Custom policy content, issued under anylanguage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<u8>>,

    /// Named language
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<PolicyLanguage>,

    /// Requested path length
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_length: Option<u32>,
}

impl PolicyRequest {
    /// Resolve the child's policy against the issuer's.
    ///
    /// Custom content wins, then an explicit language, then `limited` below a
    /// limited issuer, then `inheritAll`. The child's path length never exceeds
    /// the hops the issuer still has.
    pub fn resolve(&self, issuer: Option<&ProxyPolicy>) -> Result<ProxyPolicy> {
        let issuer_language = issuer.map(|p| &p.language);

        let language = if let Some(content) = &self.content {
            PolicyLanguage::AnyLanguage(content.clone())
        } else if let Some(language) = &self.language {
            language.clone()
        } else if issuer_language == Some(&PolicyLanguage::Limited) {
            PolicyLanguage::Limited
        } else {
            PolicyLanguage::InheritAll
        };

        if let Some(parent) = issuer_language {
            if !parent.permits_child(&language) {
                return Err(DelegationError::PolicyEscalation(format!(
                    "a {} proxy cannot issue a {} proxy",
                    parent, language
                )));
            }
        }

        let remaining = match issuer.and_then(|p| p.path_length) {
            Some(0) => {
                return Err(DelegationError::SignerNotUsable(
                    "issuer path length allows no further proxies".to_string(),
                ))
            }
            Some(n) => Some(n - 1),
            None => None,
        };
        let path_length = match (self.path_length, remaining) {
            (Some(requested), Some(limit)) => Some(requested.min(limit)),
            (requested, limit) => requested.or(limit),
        };

        Ok(ProxyPolicy {
            language,
            path_length,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
struct ProxyCertInfoSyntax {
    path_len_constraint: Option<u32>,
    proxy_policy: ProxyPolicySyntax,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
struct ProxyPolicySyntax {
    policy_language: ObjectIdentifier,
    policy: Option<OctetString>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_names() {
        assert_eq!("limited".parse::<PolicyLanguage>().unwrap(), PolicyLanguage::Limited);
        assert_eq!("inheritAll".parse::<PolicyLanguage>().unwrap(), PolicyLanguage::InheritAll);
        assert_eq!(
            "independent".parse::<PolicyLanguage>().unwrap(),
            PolicyLanguage::Independent
        );
        assert!("everything".parse::<PolicyLanguage>().is_err());
    }

    #[test]
    fn test_der_encoding() {
        let policy = ProxyPolicy::limited().path_length(Some(2));
        let decoded = ProxyPolicy::from_der(&policy.to_der().unwrap()).unwrap();
        assert_eq!(decoded, policy);

        let custom = ProxyPolicy::with_language(PolicyLanguage::AnyLanguage(b"allow:read".to_vec()));
        let decoded = ProxyPolicy::from_der(&custom.to_der().unwrap()).unwrap();
        assert_eq!(decoded, custom);
    }

    #[test]
    fn test_known_inherit_all_encoding() {
        // SEQUENCE { SEQUENCE { OID 1.3.6.1.5.5.7.21.1 } }
        let expected = [
            0x30, 0x0c, 0x30, 0x0a, 0x06, 0x08, 0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x15, 0x01,
        ];
        assert_eq!(ProxyPolicy::inherit_all().to_der().unwrap(), expected);
    }

    #[test]
    fn test_extension_is_critical() {
        let ext = ProxyPolicy::inherit_all().to_extension().unwrap();
        assert!(ext.critical);
        assert_eq!(ext.extn_id, PROXY_CERT_INFO);
    }

    #[test]
    fn test_default_resolution() {
        let request = PolicyRequest::default();
        assert_eq!(request.resolve(None).unwrap(), ProxyPolicy::inherit_all());
        assert_eq!(
            request.resolve(Some(&ProxyPolicy::inherit_all())).unwrap(),
            ProxyPolicy::inherit_all()
        );
        assert_eq!(
            request.resolve(Some(&ProxyPolicy::limited())).unwrap(),
            ProxyPolicy::limited()
        );
    }

    #[test]
    fn test_limited_issuer_never_yields_inherit_all() {
        let limited = ProxyPolicy::limited();
        let escalate = PolicyRequest {
            language: Some(PolicyLanguage::InheritAll),
            ..Default::default()
        };
        assert!(matches!(
            escalate.resolve(Some(&limited)),
            Err(DelegationError::PolicyEscalation(_))
        ));

        let custom = PolicyRequest {
            content: Some(b"anything".to_vec()),
            ..Default::default()
        };
        assert!(matches!(
            custom.resolve(Some(&limited)),
            Err(DelegationError::PolicyEscalation(_))
        ));

        let independent = PolicyRequest {
            language: Some(PolicyLanguage::Independent),
            ..Default::default()
        };
        assert_eq!(
            independent.resolve(Some(&limited)).unwrap().language,
            PolicyLanguage::Independent
        );
    }

    #[test]
    fn test_custom_content_wins() {
        let request = PolicyRequest {
            content: Some(b"policy".to_vec()),
            language: Some(PolicyLanguage::Limited),
            path_length: None,
        };
        assert_eq!(
            request.resolve(None).unwrap().language,
            PolicyLanguage::AnyLanguage(b"policy".to_vec())
        );
    }

    #[test]
    fn test_path_length_narrows() {
        let issuer = ProxyPolicy::inherit_all().path_length(Some(2));
        let request = PolicyRequest {
            path_length: Some(5),
            ..Default::default()
        };
        assert_eq!(request.resolve(Some(&issuer)).unwrap().path_length, Some(1));
        assert_eq!(
            PolicyRequest::default().resolve(Some(&issuer)).unwrap().path_length,
            Some(1)
        );

        let exhausted = ProxyPolicy::inherit_all().path_length(Some(0));
        assert!(matches!(
            PolicyRequest::default().resolve(Some(&exhausted)),
            Err(DelegationError::SignerNotUsable(_))
        ));
    }
}
