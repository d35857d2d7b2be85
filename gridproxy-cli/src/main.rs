mod commands;
mod prompt;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use commands::ProxyOptions;
use gridproxy_auth::DelegationConfig;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "gridproxy")]
#[command(about = "Create, inspect and delegate X.509 proxy certificates")]
#[command(version)]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct PolicyArgs {
    /// Proxy lifetime, e.g. `12h` or `90m`
    #[arg(short, long, value_parser = humantime_serde::re::humantime::parse_duration)]
    pub lifetime: Option<Duration>,

    /// Issue a limited proxy
    #[arg(long)]
    pub limited: bool,

    /// Policy language (limited, independent, inheritAll)
    #[arg(long)]
    pub policy_language: Option<String>,

    /// File holding policy text; marks the proxy as carrying a custom policy
    #[arg(long)]
    pub policy_file: Option<PathBuf>,

    /// Number of further delegations allowed
    #[arg(long)]
    pub path_length: Option<u32>,

    /// VOMS attribute certificate sequence to embed (PEM or DER)
    #[arg(long)]
    pub voms: Option<PathBuf>,

    /// Signing digest (sha1, sha224, sha256, sha384, sha512, inherit)
    #[arg(long)]
    pub digest: Option<String>,

    /// Key size for the new proxy
    #[arg(short, long)]
    pub bits: Option<usize>,
}

impl PolicyArgs {
    fn options(&self) -> ProxyOptions {
        ProxyOptions {
            lifetime: self.lifetime,
            limited: self.limited,
            policy_language: self.policy_language.clone(),
            policy_file: self.policy_file.clone(),
            path_length: self.path_length,
            voms_file: self.voms.clone(),
            digest: self.digest.clone(),
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a proxy from a local certificate and key
    Create {
        /// Signing certificate (may also contain the key and chain)
        #[arg(long)]
        cert: PathBuf,

        /// Signing key, if not in the certificate file
        #[arg(long)]
        key: Option<PathBuf>,

        /// Where to write the proxy
        #[arg(short, long)]
        out: PathBuf,

        /// Encrypt the proxy key (needs keys.allow_encrypted_proxies)
        #[arg(long)]
        encrypt: bool,

        #[command(flatten)]
        policy: PolicyArgs,
    },
    /// Show what a certificate or proxy file holds
    Info {
        /// Credential file
        file: PathBuf,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },
    /// Delegate a proxy to a remote delegation service
    Delegate {
        /// Proxy (or certificate with key) to delegate from
        #[arg(short, long)]
        file: PathBuf,

        /// Service base URL
        #[arg(short, long)]
        url: String,

        /// Request timeout in seconds
        #[arg(short, long, default_value_t = 30)]
        timeout: u64,

        #[command(flatten)]
        policy: PolicyArgs,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default.into()),
        )
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = DelegationConfig::resolve(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Create {
            cert,
            key,
            out,
            encrypt,
            policy,
        } => commands::execute_create(
            &config,
            &cert,
            key.as_deref(),
            &out,
            &policy.options(),
            policy.bits,
            encrypt,
        ),
        Commands::Info { file, json } => commands::execute_info(&config, &file, json),
        Commands::Delegate {
            file,
            url,
            timeout,
            policy,
        } => {
            commands::execute_delegate(
                &config,
                &file,
                &url,
                &policy.options(),
                policy.bits,
                Duration::from_secs(timeout),
            )
            .await
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("gridproxy: {:#}", e);
        std::process::exit(1);
    }
}
