//! Credential ring with pluggable selection strategy.
//!
//! The cursor is the only piece of state shared across executions that
//! point at the same provider; it sits behind a mutex.

use std::sync::{Arc, Mutex};

use secrecy::SecretString;

use straylight_common::config::KeyStrategy;

/// A rotating set of credentials for one provider.
#[derive(Clone)]
pub struct KeyRing {
    keys: Arc<Vec<SecretString>>,
    strategy: KeyStrategy,
    cursor: Arc<Mutex<usize>>,
}

impl std::fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRing")
            .field("keys", &format!("[{} redacted]", self.keys.len()))
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

impl KeyRing {
    /// Builds a ring over the provider's key set.
    #[must_use]
    pub fn new(keys: Vec<SecretString>, strategy: KeyStrategy) -> Self {
        Self {
            keys: Arc::new(keys),
            strategy,
            cursor: Arc::new(Mutex::new(0)),
        }
    }

    /// Number of configured keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the ring holds no keys at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Selects a key index for a fresh outbound request.
    ///
    /// Round-robin advances the shared cursor; random ignores it. Returns
    /// `None` when no keys are configured.
    #[must_use]
    pub fn select(&self) -> Option<usize> {
        if self.keys.is_empty() {
            return None;
        }
        match self.strategy {
            KeyStrategy::RoundRobin => {
                let mut cursor = self.cursor.lock().ok()?;
                let index = *cursor % self.keys.len();
                *cursor = (*cursor + 1) % self.keys.len();
                Some(index)
            }
            KeyStrategy::Random => {
                // uuid v4 is the crate's only entropy source; plenty here.
                let entropy = uuid::Uuid::new_v4().as_u128();
                #[allow(clippy::cast_possible_truncation)]
                Some((entropy % self.keys.len() as u128) as usize)
            }
        }
    }

    /// The key at an index, if it exists.
    #[must_use]
    pub fn key_at(&self, index: usize) -> Option<&SecretString> {
        self.keys.get(index)
    }

    /// The index after `index`, wrapping. Used for 401-driven rotation.
    #[must_use]
    pub fn next_after(&self, index: usize) -> usize {
        if self.keys.is_empty() {
            0
        } else {
            (index + 1) % self.keys.len()
        }
    }
}
