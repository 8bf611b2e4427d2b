//! Named HMAC secrets with one active key id.
//!
//! Mutex-free: a keyring is immutable once constructed. Rotation publishes a
//! whole new keyring through a snapshot cell so the active id change is
//! atomic with the new key material.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;

/// Maximum number of keys a keyring may hold.
pub const MAX_KEYRING_KEYS: usize = 32;

/// Maximum length of a key id.
pub const MAX_KID_LEN: usize = 128;

/// Errors produced while constructing or loading a keyring.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KeyringError {
    /// The keyring document could not be read.
    #[error("failed to read keyring file: {0}")]
    Io(#[from] std::io::Error),

    /// The keyring document could not be parsed.
    #[error("failed to parse keyring document: {0}")]
    Parse(#[from] serde_json::Error),

    /// The keyring holds no keys.
    #[error("keyring must hold at least one key")]
    Empty,

    /// The active key id is not present in the key map.
    #[error("active kid '{active_kid}' is not present in the keyring")]
    ActiveKidMissing {
        /// The offending active key id.
        active_kid: String,
    },

    /// A key id exceeds the allowed length or is empty.
    #[error("invalid kid '{kid}': ids must be 1..={max} characters", max = MAX_KID_LEN)]
    InvalidKid {
        /// The offending key id.
        kid: String,
    },

    /// Too many keys.
    #[error("keyring holds {count} keys, maximum is {max}", max = MAX_KEYRING_KEYS)]
    TooManyKeys {
        /// Number of keys in the document.
        count: usize,
    },
}

/// On-disk keyring document: `{"active_kid": "k1", "keys": {"k1": "secret"}}`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct KeyringDocument {
    active_kid: String,
    keys: HashMap<String, String>,
}

/// A named set of HMAC secrets with one active id.
///
/// The active key signs new material; every key in the ring verifies. A key
/// removed from the ring immediately stops verifying documents signed under
/// it, which is the revocation path for rotation.
pub struct Keyring {
    active_kid: String,
    keys: HashMap<String, SecretString>,
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyring")
            .field("active_kid", &self.active_kid)
            .field("kids", &self.kids())
            .finish_non_exhaustive()
    }
}

impl Keyring {
    /// Creates a keyring from an active id and a key map.
    ///
    /// # Errors
    ///
    /// Returns an error if the map is empty, oversized, contains an invalid
    /// id, or does not contain `active_kid`.
    pub fn new(
        active_kid: impl Into<String>,
        keys: HashMap<String, SecretString>,
    ) -> Result<Self, KeyringError> {
        let active_kid = active_kid.into();
        if keys.is_empty() {
            return Err(KeyringError::Empty);
        }
        if keys.len() > MAX_KEYRING_KEYS {
            return Err(KeyringError::TooManyKeys { count: keys.len() });
        }
        for kid in keys.keys() {
            if kid.is_empty() || kid.len() > MAX_KID_LEN {
                return Err(KeyringError::InvalidKid { kid: kid.clone() });
            }
        }
        if !keys.contains_key(&active_kid) {
            return Err(KeyringError::ActiveKidMissing { active_kid });
        }
        Ok(Self { active_kid, keys })
    }

    /// Creates a degenerate single-key keyring (legacy static-key mode).
    ///
    /// # Errors
    ///
    /// Returns an error if the kid is invalid.
    pub fn single(kid: impl Into<String>, secret: SecretString) -> Result<Self, KeyringError> {
        let kid = kid.into();
        let mut keys = HashMap::new();
        keys.insert(kid.clone(), secret);
        Self::new(kid, keys)
    }

    /// Loads a keyring from a JSON document string.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be parsed or violates the
    /// keyring invariants.
    pub fn from_json_str(raw: &str) -> Result<Self, KeyringError> {
        let doc: KeyringDocument = serde_json::from_str(raw)?;
        let keys = doc
            .keys
            .into_iter()
            .map(|(kid, secret)| (kid, SecretString::from(secret)))
            .collect();
        Self::new(doc.active_kid, keys)
    }

    /// Loads a keyring from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_path(path: &Path) -> Result<Self, KeyringError> {
        Self::from_json_str(&fs::read_to_string(path)?)
    }

    /// Returns the active key id.
    #[must_use]
    pub fn active_kid(&self) -> &str {
        &self.active_kid
    }

    /// Returns the secret for a key id, if present.
    #[must_use]
    pub fn secret(&self, kid: &str) -> Option<&SecretString> {
        self.keys.get(kid)
    }

    /// Returns the secret for the active key id.
    #[must_use]
    pub fn active_secret(&self) -> &SecretString {
        // Constructor invariant: active_kid is always present.
        &self.keys[&self.active_kid]
    }

    /// Returns `true` if the keyring holds the given key id.
    #[must_use]
    pub fn contains(&self, kid: &str) -> bool {
        self.keys.contains_key(kid)
    }

    /// Returns all key ids, sorted.
    #[must_use]
    pub fn kids(&self) -> Vec<&str> {
        let mut kids: Vec<&str> = self.keys.keys().map(String::as_str).collect();
        kids.sort_unstable();
        kids
    }

    /// Returns a copy of this keyring with one key added (or replaced).
    ///
    /// Used by the rotation path: add the new key, publish, re-sign, then
    /// switch the active id and finally remove the old key.
    ///
    /// # Errors
    ///
    /// Returns an error if the result would violate keyring invariants.
    pub fn with_key(
        &self,
        kid: impl Into<String>,
        secret: SecretString,
    ) -> Result<Self, KeyringError> {
        let mut keys = self.keys.clone();
        keys.insert(kid.into(), secret);
        Self::new(self.active_kid.clone(), keys)
    }

    /// Returns a copy of this keyring with a different active id.
    ///
    /// # Errors
    ///
    /// Returns an error if `kid` is not in the ring.
    pub fn with_active(&self, kid: impl Into<String>) -> Result<Self, KeyringError> {
        Self::new(kid.into(), self.keys.clone())
    }

    /// Returns a copy of this keyring with one key removed.
    ///
    /// # Errors
    ///
    /// Returns an error if removing the key would empty the ring or remove
    /// the active id.
    pub fn without_key(&self, kid: &str) -> Result<Self, KeyringError> {
        let mut keys = self.keys.clone();
        keys.remove(kid);
        Self::new(self.active_kid.clone(), keys)
    }
}
