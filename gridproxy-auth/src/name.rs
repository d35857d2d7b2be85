//! Distinguished Names
//!
//! Slash-separated, most-significant-first names (`/O=Org/CN=Alice`) as used
//! by grid tooling, convertible to and from X.509 RDN sequences.

use crate::error::{DelegationError, Result};
use der::asn1::{ObjectIdentifier, SetOfVec};
use der::{Any, Tag};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use x509_cert::attr::AttributeTypeAndValue;
use x509_cert::name::{Name, RdnSequence, RelativeDistinguishedName};

const ATTRIBUTES: &[(&str, &str)] = &[
    ("C", "2.5.4.6"),
    ("ST", "2.5.4.8"),
    ("L", "2.5.4.7"),
    ("O", "2.5.4.10"),
    ("OU", "2.5.4.11"),
    ("CN", "2.5.4.3"),
    ("serialNumber", "2.5.4.5"),
    ("DC", "0.9.2342.19200300.100.1.25"),
    ("UID", "0.9.2342.19200300.100.1.1"),
    ("emailAddress", "1.2.840.113549.1.9.1"),
];

/// Common name attribute
pub const COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");

/// One `attribute=value` component of a name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NameComponent {
    /// Short attribute name (`CN`, `O`, ...) or dotted OID
    pub attribute: String,

    /// Attribute value
    pub value: String,
}

/// Distinguished name in slash form
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DistinguishedName {
    components: Vec<NameComponent>,
}

impl DistinguishedName {
    /// Build a name from its components
    pub fn new(components: Vec<NameComponent>) -> Self {
        Self { components }
    }

    /// Components, most significant first
    pub fn components(&self) -> &[NameComponent] {
        &self.components
    }

    /// Number of components
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// True for the empty name
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Value of the last component
    pub fn last_value(&self) -> Option<&str> {
        self.components.last().map(|c| c.value.as_str())
    }

    /// Copy of this name with one more `CN` appended
    pub fn with_common_name(&self, value: impl Into<String>) -> Self {
        let mut components = self.components.clone();
        components.push(NameComponent {
            attribute: "CN".to_string(),
            value: value.into(),
        });
        Self { components }
    }

    /// Drop the trailing `CN` components that proxy issuance adds.
    ///
    /// Recognized are decimal serial-style names as well as the legacy
    /// `proxy` and `limited proxy` values.
    pub fn strip_proxy_components(&self) -> Self {
        let mut components = self.components.clone();
        while components.len() > 1 {
            let last = &components[components.len() - 1];
            if last.attribute != "CN" || !is_proxy_common_name(&last.value) {
                break;
            }
            components.pop();
        }
        Self { components }
    }

    /// Decode an X.509 name
    pub fn from_x509(name: &Name) -> Self {
        let components = name
            .0
            .iter()
            .flat_map(|rdn| rdn.0.iter())
            .map(|atv| NameComponent {
                attribute: attribute_name(&atv.oid),
                value: attribute_value(&atv.value),
            })
            .collect();
        Self { components }
    }

    /// Encode as an X.509 name, one RDN per component
    pub fn to_x509(&self) -> Result<Name> {
        let mut rdns = Vec::with_capacity(self.components.len());
        for component in &self.components {
            let oid = attribute_oid(&component.attribute)?;
            let tag = match component.attribute.as_str() {
                "C" => Tag::PrintableString,
                "DC" | "emailAddress" => Tag::Ia5String,
                _ => Tag::Utf8String,
            };
            let value = Any::new(tag, component.value.as_bytes().to_vec())?;
            let atv = AttributeTypeAndValue { oid, value };
            rdns.push(RelativeDistinguishedName(SetOfVec::try_from(vec![atv])?));
        }
        Ok(RdnSequence(rdns))
    }
}

/// Slash form. A `/` or `\` inside a value is written with a leading `\`.
impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for component in &self.components {
            write!(f, "/{}=", component.attribute)?;
            for c in component.value.chars() {
                if matches!(c, '/' | '\\') {
                    f.write_str("\\")?;
                }
                write!(f, "{}", c)?;
            }
        }
        Ok(())
    }
}

impl FromStr for DistinguishedName {
    type Err = DelegationError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let body = trimmed.strip_prefix('/').ok_or_else(|| {
            DelegationError::MalformedRequest(format!("name must start with '/': {}", s))
        })?;

        let mut components = Vec::new();
        let mut attribute = String::new();
        let mut value: Option<String> = None;
        let mut chars = body.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    let escaped = chars.next().ok_or_else(|| {
                        DelegationError::MalformedRequest(format!("trailing '\\' in name {}", s))
                    })?;
                    value.as_mut().unwrap_or(&mut attribute).push(escaped);
                }
                '/' => push_component(&mut components, &mut attribute, &mut value)?,
                '=' if value.is_none() => value = Some(String::new()),
                c => value.as_mut().unwrap_or(&mut attribute).push(c),
            }
        }
        push_component(&mut components, &mut attribute, &mut value)?;
        Ok(Self { components })
    }
}

fn push_component(
    components: &mut Vec<NameComponent>,
    attribute: &mut String,
    value: &mut Option<String>,
) -> Result<()> {
    let attribute = std::mem::take(attribute);
    let Some(value) = value.take() else {
        if attribute.is_empty() {
            return Ok(());
        }
        return Err(DelegationError::MalformedRequest(format!(
            "missing '=' in name component {}",
            attribute
        )));
    };
    attribute_oid(&attribute)?;
    components.push(NameComponent { attribute, value });
    Ok(())
}

impl TryFrom<String> for DistinguishedName {
    type Error = DelegationError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DistinguishedName> for String {
    fn from(name: DistinguishedName) -> Self {
        name.to_string()
    }
}

/// Copy of `name` with a trailing `CN=value` RDN
pub fn append_common_name(name: &Name, value: &str) -> Result<Name> {
    let atv = AttributeTypeAndValue {
        oid: COMMON_NAME,
        value: Any::new(Tag::Utf8String, value.as_bytes().to_vec())?,
    };
    let mut rdns = name.0.clone();
    rdns.push(RelativeDistinguishedName(SetOfVec::try_from(vec![atv])?));
    Ok(RdnSequence(rdns))
}

/// True when `child` is `parent` plus exactly one trailing `CN` RDN
pub fn is_proxy_subject_of(child: &Name, parent: &Name) -> bool {
    let (Some((last, prefix)), parent_rdns) = (child.0.split_last(), &parent.0) else {
        return false;
    };
    prefix == parent_rdns.as_slice()
        && last.0.len() == 1
        && last.0.iter().all(|atv| atv.oid == COMMON_NAME)
}

fn is_proxy_common_name(value: &str) -> bool {
    value == "proxy"
        || value == "limited proxy"
        || (!value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()))
}

fn attribute_name(oid: &ObjectIdentifier) -> String {
    let dotted = oid.to_string();
    ATTRIBUTES
        .iter()
        .find(|(_, o)| *o == dotted)
        .map(|(name, _)| name.to_string())
        .unwrap_or(dotted)
}

fn attribute_oid(attribute: &str) -> Result<ObjectIdentifier> {
    let dotted = ATTRIBUTES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(attribute))
        .map(|(_, oid)| *oid)
        .unwrap_or(attribute);
    ObjectIdentifier::new(dotted).map_err(|_| {
        DelegationError::MalformedRequest(format!("unknown name attribute {}", attribute))
    })
}

fn attribute_value(value: &Any) -> String {
    String::from_utf8_lossy(value.value()).into_owned()
}
