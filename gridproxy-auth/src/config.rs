//! Configuration for delegation
//!
//! Loaded from TOML, then overridden from `GRIDPROXY_*` environment
//! variables.

use crate::crypto::SigningAlgorithm;
use crate::error::{DelegationError, Result};
use crate::verification::TrustStore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;
use validator::{Validate, ValidationError};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct DelegationConfig {
    /// Trust anchors
    #[serde(default)]
    #[validate(nested)]
    pub trust: TrustConfig,
    /// Key generation
    #[serde(default)]
    #[validate(nested)]
    pub keys: KeyConfig,
    /// Proxy issuance
    #[serde(default)]
    #[validate(nested)]
    pub proxy: ProxyConfig,
    /// Session cache bounds
    #[serde(default)]
    #[validate(nested)]
    pub cache: CacheConfig,
    /// Delegation daemon
    #[serde(default)]
    #[validate(nested)]
    pub server: ServerConfig,
}

/// Where trust anchors live
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TrustConfig {
    /// Directory of CA certificates
    pub ca_dir: Option<PathBuf>,
    /// Single file of CA certificates
    pub ca_file: Option<PathBuf>,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            ca_dir: Some(PathBuf::from("/etc/grid-security/certificates")),
            ca_file: None,
        }
    }
}

impl TrustConfig {
    /// Load the configured anchors. A CA directory that does not exist
    /// yields no anchors rather than an error; a missing CA file is an error.
    pub fn trust_store(&self) -> Result<TrustStore> {
        let ca_dir = match self.ca_dir.as_deref() {
            Some(dir) if !dir.exists() => {
                warn!(
                    "CA directory {} does not exist; no anchors loaded from it",
                    dir.display()
                );
                None
            }
            dir => dir,
        };
        TrustStore::from_paths(self.ca_file.as_deref(), ca_dir)
    }
}

/// Key sizes and digests
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct KeyConfig {
    /// Size used when a request does not name one
    #[validate(range(min = 1024, max = 16384))]
    pub default_bits: usize,
    /// Smallest key accepted or generated
    #[validate(range(min = 512, max = 16384))]
    pub min_bits: usize,
    /// Largest key generated
    #[validate(range(min = 1024, max = 16384))]
    pub max_bits: usize,
    /// Digest used when `inherit` cannot be resolved
    pub default_signing_algorithm: SigningAlgorithm,
    /// Whether proxies may be written with an encrypted key
    pub allow_encrypted_proxies: bool,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            default_bits: 2048,
            min_bits: 1024,
            max_bits: 8192,
            default_signing_algorithm: SigningAlgorithm::Sha256,
            allow_encrypted_proxies: false,
        }
    }
}

impl KeyConfig {
    /// Resolve a requested key size. Requests below the minimum are raised to it.
    pub fn key_bits(&self, requested: Option<usize>) -> Result<usize> {
        let bits = requested.unwrap_or(self.default_bits).max(self.min_bits);
        if bits > self.max_bits {
            return Err(DelegationError::MalformedRequest(format!(
                "key size {} exceeds the maximum of {}",
                bits, self.max_bits
            )));
        }
        Ok(bits)
    }
}

/// Proxy lifetimes on the signing side
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ProxyConfig {
    /// Lifetime when the request names none
    #[serde(with = "humantime_serde")]
    pub default_lifetime: Duration,
    /// Hard upper bound on any proxy this signer issues
    #[serde(with = "humantime_serde")]
    pub max_lifetime: Option<Duration>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            default_lifetime: Duration::from_secs(crate::DEFAULT_PROXY_LIFETIME_HOURS * 3600),
            max_lifetime: None,
        }
    }
}

/// Session cache bounds
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CacheConfig {
    /// Active sessions kept per identity
    #[validate(range(min = 1))]
    pub max_credentials_per_identity: usize,
    /// Active sessions kept overall
    #[validate(range(min = 1))]
    pub max_active_sessions: Option<usize>,
    /// Pending sessions admitted at once
    #[validate(range(min = 1))]
    pub max_pending_sessions: usize,
    /// Longest an active session is kept, whatever its certificate says
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "non_zero_duration"))]
    pub max_credential_lifetime: Duration,
    /// How long a pending session waits for its certificate
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "non_zero_duration"))]
    pub pending_timeout: Duration,
    /// How long an expired session is remembered as expired
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "non_zero_duration"))]
    pub tombstone_retention: Duration,
    /// Background sweep period
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "non_zero_duration"))]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_credentials_per_identity: 10,
            max_active_sessions: None,
            max_pending_sessions: 1024,
            max_credential_lifetime: Duration::from_secs(crate::DEFAULT_PROXY_LIFETIME_HOURS * 3600),
            pending_timeout: Duration::from_secs(300),
            tombstone_retention: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Delegation daemon
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    #[validate(length(min = 1))]
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8443".to_string(),
        }
    }
}

impl DelegationConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DelegationError::Config(format!("Failed to read config: {}", e)))?;

        let config: DelegationConfig = toml::from_str(&content)
            .map_err(|e| DelegationError::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Load from `path` if given, otherwise defaults, then apply the
    /// environment and validate
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.check()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DelegationError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| DelegationError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| DelegationError::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Apply `GRIDPROXY_*` overrides read through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("GRIDPROXY_CA_DIR") {
            self.trust.ca_dir = Some(PathBuf::from(dir));
        }
        if let Some(file) = lookup("GRIDPROXY_CA_FILE") {
            self.trust.ca_file = Some(PathBuf::from(file));
        }
        if let Some(bits) = lookup("GRIDPROXY_KEY_BITS") {
            self.keys.default_bits = parse_number("GRIDPROXY_KEY_BITS", &bits)?;
        }
        if let Some(alg) = lookup("GRIDPROXY_SIGNING_ALGORITHM") {
            self.keys.default_signing_algorithm = alg.parse()?;
        }
        if let Some(max) = lookup("GRIDPROXY_MAX_CREDENTIALS_PER_IDENTITY") {
            self.cache.max_credentials_per_identity =
                parse_number("GRIDPROXY_MAX_CREDENTIALS_PER_IDENTITY", &max)?;
        }
        if let Some(lifetime) = lookup("GRIDPROXY_MAX_CREDENTIAL_LIFETIME") {
            self.cache.max_credential_lifetime =
                parse_duration("GRIDPROXY_MAX_CREDENTIAL_LIFETIME", &lifetime)?;
        }
        if let Some(addr) = lookup("GRIDPROXY_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }
        Ok(())
    }

    /// Validate field ranges and cross-field constraints
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| DelegationError::Config(e.to_string()))?;
        let keys = &self.keys;
        if keys.min_bits > keys.default_bits || keys.default_bits > keys.max_bits {
            return Err(DelegationError::Config(format!(
                "key sizes must satisfy min <= default <= max, got {} / {} / {}",
                keys.min_bits, keys.default_bits, keys.max_bits
            )));
        }
        Ok(())
    }
}

fn non_zero_duration(value: &Duration) -> std::result::Result<(), ValidationError> {
    if value.is_zero() {
        return Err(ValidationError::new("zero_duration")
            .with_message("duration must be greater than zero".into()));
    }
    Ok(())
}

fn parse_number(name: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| DelegationError::Config(format!("{} is not a number: {}", name, value)))
}

fn parse_duration(name: &str, value: &str) -> Result<Duration> {
    humantime_serde::re::humantime::parse_duration(value.trim())
        .map_err(|e| DelegationError::Config(format!("{} is not a duration: {}", name, e)))
}
