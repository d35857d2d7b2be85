//! Passphrase sources for encrypted private keys

use crate::error::{DelegationError, Result};
use zeroize::Zeroizing;

/// Supplies the passphrase for an encrypted key
pub trait PassphraseSource {
    /// Return the passphrase, prompting with `prompt` if interactive
    fn passphrase(&self, prompt: &str) -> Result<Zeroizing<String>>;
}

/// Refuses every request; for keys that must not be encrypted
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPassphrase;

impl PassphraseSource for NoPassphrase {
    fn passphrase(&self, _prompt: &str) -> Result<Zeroizing<String>> {
        Err(DelegationError::PassphraseFailure(
            "key is encrypted and no passphrase source is available".to_string(),
        ))
    }
}

/// A passphrase known up front
pub struct FixedPassphrase(Zeroizing<String>);

impl FixedPassphrase {
    /// Wrap a passphrase
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self(Zeroizing::new(passphrase.into()))
    }
}

impl PassphraseSource for FixedPassphrase {
    fn passphrase(&self, _prompt: &str) -> Result<Zeroizing<String>> {
        Ok(self.0.clone())
    }
}
