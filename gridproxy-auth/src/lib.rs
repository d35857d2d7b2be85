//! # gridproxy-auth: X.509 Proxy Certificate Delegation
//!
//! Creation, signing and verification of RFC 3820 proxy certificates, and the
//! two-phase protocol that moves a proxy from one party to another without
//! the private key ever leaving the party that will use it.
//!
//! ## Features
//!
//! - **Proxy signing**: derive a proxy from an end-entity certificate or from
//!   another proxy, with `inheritAll`, `limited`, `independent` or custom
//!   policies and optional path length limits
//! - **Chain verification**: name linkage, signatures, validity, the limited
//!   escalation rule and path lengths, against a CA directory
//! - **VOMS embedding**: carry an attribute certificate sequence in the proxy
//! - **Network delegation**: `DelegateCredentialsInit` / `UpdateCredentials`
//!   with a bounded, expiring session cache on the service side
//!
//! ## Architecture
//!
//! ```text
//!  Delegator (holds a credential)            Delegation service
//! ┌──────────────────────────────┐        ┌──────────────────────────────┐
//! │ DelegationEndpoint           │  Init  │ DelegationService            │
//! │                              │ ─────> │  generate key pair + CSR     │
//! │                              │ <───── │  session: Pending            │
//! │ DelegationProvider           │        │                              │
//! │  Credential::sign_request    │ Update │                              │
//! │                              │ ─────> │  key match + chain verify    │
//! │                              │ <───── │  session: Active             │
//! └──────────────────────────────┘        │ DelegationSessionCache       │
//!                                         └──────────────────────────────┘
//! ```

#![warn(missing_docs)]

pub mod authority;
pub mod cache;
pub mod config;
pub mod credential;
pub mod crypto;
pub mod delegation;
pub mod endpoint;
pub mod error;
pub mod name;
pub mod passphrase;
pub mod policy;
pub mod request;
pub mod service;
pub mod verification;
pub mod voms;
pub mod x509;

// Re-exports for convenience
pub use authority::CertificateAuthority;
pub use cache::{Clock, DelegationSessionCache, ManualClock, SessionState, SystemClock};
pub use config::DelegationConfig;
pub use credential::Credential;
pub use crypto::{DigestChoice, SigningAlgorithm};
pub use delegation::{DelegationConsumer, DelegationProvider};
pub use endpoint::{DelegationEndpoint, DelegationTransport, HttpTransport, LocalTransport};
pub use error::{DelegationError, Result};
pub use name::DistinguishedName;
pub use passphrase::{FixedPassphrase, NoPassphrase, PassphraseSource};
pub use policy::{PolicyLanguage, PolicyRequest, ProxyPolicy};
pub use request::{CredentialRequest, DelegationConstraints, ProxyRequest, RequestParams};
pub use service::{DelegationFault, DelegationService};
pub use verification::{ChainReport, TrustStore};
pub use voms::VomsAcSequence;
pub use x509::CredentialKind;

/// Delegation wire protocol version
pub const PROTOCOL_VERSION: &str = "gridproxy-delegation/1";

/// Default proxy lifetime (12 hours)
pub const DEFAULT_PROXY_LIFETIME_HOURS: u64 = 12;
