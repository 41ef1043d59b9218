//! Secure secret storage using the OS keyring.
//!
//! Passwords never fall back to the metadata store. When no keyring is
//! available, storing a secret fails and the caller reports it.

use super::SecretStore;
use crate::error::{ConduitError, Result};
use keyring::Entry;
use tracing::warn;

const SERVICE_NAME: &str = "db-conduit";

/// Status of the secure storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretStorageStatus {
    /// OS keyring is available and working.
    Secure,
    /// No usable keyring on this system.
    Unavailable,
}

/// Keyring-backed [`SecretStore`].
#[derive(Debug, Clone)]
pub struct SecretStorage {
    keyring_available: bool,
}

impl Default for SecretStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretStorage {
    /// Creates a new secret storage instance, probing keyring availability.
    pub fn new() -> Self {
        Self {
            keyring_available: Self::probe_keyring(),
        }
    }

    fn probe_keyring() -> bool {
        let test_entry = match Entry::new(SERVICE_NAME, "__probe__") {
            Ok(e) => e,
            Err(_) => return false,
        };

        match test_entry.set_password("test") {
            Ok(()) => {
                let _ = test_entry.delete_credential();
                true
            }
            Err(_) => false,
        }
    }

    /// Returns the current status of secret storage.
    pub fn status(&self) -> SecretStorageStatus {
        if self.keyring_available {
            SecretStorageStatus::Secure
        } else {
            SecretStorageStatus::Unavailable
        }
    }

    /// Returns whether secure storage (keyring) is available.
    pub fn is_secure(&self) -> bool {
        self.keyring_available
    }

    fn entry(key: &str) -> Result<Entry> {
        Entry::new(SERVICE_NAME, key)
            .map_err(|e| ConduitError::persistence(format!("Failed to access keyring: {e}")))
    }
}

impl SecretStore for SecretStorage {
    fn store(&self, key: &str, secret: &str) -> Result<()> {
        if !self.keyring_available {
            return Err(ConduitError::persistence(
                "OS keyring unavailable; cannot store the connection password",
            ));
        }

        Self::entry(key)?
            .set_password(secret)
            .map_err(|e| ConduitError::persistence(format!("Failed to store secret: {e}")))
    }

    fn retrieve(&self, key: &str) -> Result<Option<String>> {
        if !self.keyring_available {
            return Ok(None);
        }

        match Self::entry(key)?.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(ConduitError::persistence(format!(
                "Failed to retrieve secret: {e}"
            ))),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        if !self.keyring_available {
            return Ok(());
        }

        match Self::entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => {
                warn!("Failed to delete secret from keyring: {e}");
                Ok(())
            }
        }
    }
}

/// Generates the secret-store key for a connection password.
pub fn connection_password_key(connection_id: &str) -> String {
    format!("conn:{connection_id}")
}

/// Masks a secret for display, showing only the last 4 characters.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 4 {
        "*".repeat(chars.len())
    } else {
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("****...{tail}")
    }
}
