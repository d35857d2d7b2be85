//! CLI command implementations

use crate::prompt::TerminalPrompt;
use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use gridproxy_auth::{
    service::InitRequest, Credential, DelegationConfig, DelegationConstraints,
    DelegationConsumer, DelegationEndpoint, DelegationProvider, DigestChoice, HttpTransport,
    PassphraseSource, PolicyLanguage, PolicyRequest, RequestParams, VomsAcSequence,
};
use serde_json::json;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Policy and lifetime options shared by `create` and `delegate`
#[derive(Debug, Clone, Default)]
pub struct ProxyOptions {
    /// Requested lifetime
    pub lifetime: Option<Duration>,
    /// Shorthand for `--policy-language limited`
    pub limited: bool,
    /// Explicit policy language
    pub policy_language: Option<String>,
    /// File whose contents become the policy text
    pub policy_file: Option<PathBuf>,
    /// Further proxies allowed below the new one
    pub path_length: Option<u32>,
    /// VOMS AC sequence to embed, PEM or DER
    pub voms_file: Option<PathBuf>,
    /// Digest name, or `inherit`
    pub digest: Option<String>,
}

impl ProxyOptions {
    /// Signer-side constraints for these options
    pub fn constraints(&self, config: &DelegationConfig) -> Result<DelegationConstraints> {
        let mut language = self
            .policy_language
            .as_deref()
            .map(str::parse::<PolicyLanguage>)
            .transpose()?;
        if self.limited {
            if language.as_ref().is_some_and(|l| *l != PolicyLanguage::Limited) {
                bail!("--limited conflicts with --policy-language");
            }
            language = Some(PolicyLanguage::Limited);
        }
        let content = match &self.policy_file {
            Some(path) => Some(
                std::fs::read(path)
                    .with_context(|| format!("reading policy file {}", path.display()))?,
            ),
            None => None,
        };

        let mut constraints = DelegationConstraints::from_config(&config.keys, &config.proxy)
            .with_policy(PolicyRequest {
                content,
                language,
                path_length: self.path_length,
            });
        if let Some(lifetime) = self.lifetime {
            constraints = constraints.with_lifetime(lifetime);
        }
        if let Some(path) = &self.voms_file {
            let bytes = std::fs::read(path)
                .with_context(|| format!("reading VOMS attributes {}", path.display()))?;
            constraints = constraints.with_voms(VomsAcSequence::from_bytes(&bytes)?);
        }
        if let Some(digest) = &self.digest {
            constraints.signing_algorithm = Some(digest.parse::<DigestChoice>()?);
        }
        Ok(constraints)
    }
}

/// Load the signing credential, prompting for a passphrase if the key is
/// encrypted
pub fn load_signer(cert: &Path, key: Option<&Path>) -> Result<Credential> {
    let credential = Credential::load(cert, key, &TerminalPrompt)
        .with_context(|| format!("loading credential {}", cert.display()))?;
    if !credential.has_private_key() {
        bail!("{} holds no private key; pass --key", cert.display());
    }
    Ok(credential)
}

/// Create a proxy from a local credential and write it to `out`
pub fn execute_create(
    config: &DelegationConfig,
    cert: &Path,
    key: Option<&Path>,
    out: &Path,
    options: &ProxyOptions,
    bits: Option<usize>,
    encrypt: bool,
) -> Result<()> {
    if encrypt && !config.keys.allow_encrypted_proxies {
        bail!("encrypted proxies are disabled by configuration (keys.allow_encrypted_proxies)");
    }

    let trust = config.trust.trust_store()?;
    let signer = load_signer(cert, key)?;
    let constraints = options.constraints(config)?;
    let params = RequestParams {
        key_bits: bits,
        lifetime: options.lifetime,
        ..RequestParams::default()
    };

    let consumer = DelegationConsumer::new(&params, &config.keys)?;
    let bundle = DelegationProvider::new(signer)?.delegate(consumer.request(), &constraints)?;

    let proxy = if trust.is_empty() {
        warn!("No trust anchors configured; writing proxy without chain verification");
        let key = consumer.backup()?;
        Credential::from_pem(format!("{}{}", bundle, key.as_str()).as_bytes())?
    } else {
        consumer.acquire(&bundle, &trust)?
    };

    let contents = if encrypt {
        let passphrase = TerminalPrompt.passphrase("Passphrase for the new proxy")?;
        proxy.output_bundle_encrypted(&passphrase)?
    } else {
        proxy.output_bundle()?
    };
    write_private(out, contents.as_bytes())?;

    info!("Wrote proxy {} to {}", proxy.subject(), out.display());
    println!("Proxy written to {}", out.display());
    println!("  subject:  {}", proxy.subject());
    println!("  valid to: {}", proxy.end_time());
    Ok(())
}

/// Print what a credential file holds
pub fn execute_info(config: &DelegationConfig, file: &Path, as_json: bool) -> Result<()> {
    let credential = Credential::load(file, None, &TerminalPrompt)
        .with_context(|| format!("loading {}", file.display()))?;
    let trust = config.trust.trust_store()?;
    let verification = if trust.is_empty() {
        Err(anyhow!("no trust anchors configured"))
    } else {
        credential.verify(&trust).map_err(anyhow::Error::from)
    };

    let policy = credential.policy();
    let remaining = (credential.end_time() - Utc::now()).max(chrono::Duration::zero());
    let summary = json!({
        "subject": credential.subject().to_string(),
        "issuer": credential.issuer().to_string(),
        "identity": credential.identity_name().to_string(),
        "kind": credential.kind(),
        "serial": credential.serial(),
        "policy": policy.as_ref().map(|p| p.language.name()),
        "path_length": policy.as_ref().and_then(|p| p.path_length),
        "not_before": credential.start_time(),
        "not_after": credential.end_time(),
        "remaining_seconds": remaining.num_seconds(),
        "key_bits": credential.key_bits().ok(),
        "has_private_key": credential.has_private_key(),
        "signing_algorithm": credential.signing_algorithm().map(|a| a.name()),
        "voms_attributes": credential.voms_attributes().map(|v| v.len()).unwrap_or(0),
        "chain_length": credential.chain().len(),
        "verified": verification.is_ok(),
    });

    if as_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("subject   : {}", credential.subject());
    println!("issuer    : {}", credential.issuer());
    println!("identity  : {}", credential.identity_name());
    println!("type      : {}", credential.kind());
    if let Some(policy) = &policy {
        println!("policy    : {}", policy.language.name());
        match policy.path_length {
            Some(n) => println!("path len  : {}", n),
            None => println!("path len  : unlimited"),
        }
    }
    println!("valid from: {}", credential.start_time());
    println!("valid to  : {}", credential.end_time());
    println!("time left : {}h {:02}m", remaining.num_hours(), remaining.num_minutes() % 60);
    if let Ok(bits) = credential.key_bits() {
        println!("strength  : {} bits", bits);
    }
    if let Some(voms) = credential.voms_attributes() {
        println!("VOMS ACs  : {}", voms.len());
    }
    match verification {
        Ok(report) => println!("verified  : yes (anchor {})", report.anchor),
        Err(e) => println!("verified  : no ({})", e),
    }
    Ok(())
}

/// Delegate a local proxy to a remote delegation service
pub async fn execute_delegate(
    config: &DelegationConfig,
    file: &Path,
    url: &str,
    options: &ProxyOptions,
    bits: Option<usize>,
    timeout: Duration,
) -> Result<()> {
    let signer = load_signer(file, None)?;
    let constraints = options.constraints(config)?;
    let init = InitRequest {
        key_bits: bits,
        lifetime: options.lifetime,
        signing_algorithm: DigestChoice::Inherit,
    };

    let endpoint = DelegationEndpoint::new(HttpTransport::new(url, timeout)?);
    debug!("Delegating {} to {}", signer.subject(), url);
    let response = endpoint
        .delegate(&DelegationProvider::new(signer)?, &init, &constraints)
        .await
        .with_context(|| format!("delegating to {}", url))?;

    println!("session   : {}", response.session_id);
    println!("identity  : {}", response.identity);
    println!("expires   : {}", response.expires_at);
    Ok(())
}

/// Write `contents` readable only by the owner. The data goes to a temporary
/// file in the same directory which is then renamed over `path`, so a failed
/// write never leaves a partial file behind.
pub fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let name = path
        .file_name()
        .ok_or_else(|| anyhow!("{} is not a file path", path.display()))?;
    let tmp = dir.join(format!(".{}.{}.tmp", name.to_string_lossy(), std::process::id()));

    let result = (|| -> Result<()> {
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(&tmp)
            .with_context(|| format!("creating {}", tmp.display()))?;
        file.write_all(contents)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
        Ok(())
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}
