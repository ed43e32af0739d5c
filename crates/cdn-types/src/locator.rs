use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Number of leading locator characters forming the shard directory.
///
/// Three hex characters bound per-directory fan-out to 4096 buckets.
pub const SHARD_PREFIX_LEN: usize = 3;

/// Content-derived address of an item.
///
/// A locator is computed upstream from the item's content hash; this type
/// only validates it and exposes the sharding rule. Identical content always
/// yields the same locator, on every backend.
///
/// Locators are restricted to ASCII alphanumerics so that joining one onto a
/// root path can never escape that root.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Locator(String);

impl Locator {
    /// Validate and wrap a locator string.
    pub fn new(value: impl Into<String>) -> Result<Self, TypeError> {
        let value = value.into();
        if value.len() < SHARD_PREFIX_LEN {
            return Err(TypeError::InvalidLocator {
                value,
                reason: "shorter than the shard prefix",
            });
        }
        if !value.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(TypeError::InvalidLocator {
                value,
                reason: "must be ASCII alphanumeric",
            });
        }
        Ok(Self(value))
    }

    /// Locator for a raw 32-byte content digest (lowercase hex).
    pub fn from_digest(digest: &[u8; 32]) -> Self {
        Self(hex::encode(digest))
    }

    /// The shard directory: exactly the first [`SHARD_PREFIX_LEN`] characters.
    pub fn shard_prefix(&self) -> &str {
        &self.0[..SHARD_PREFIX_LEN]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl TryFrom<String> for Locator {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Locator> for String {
    fn from(loc: Locator) -> Self {
        loc.0
    }
}

impl fmt::Debug for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = &self.0[..self.0.len().min(12)];
        write!(f, "Locator({short})")
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
