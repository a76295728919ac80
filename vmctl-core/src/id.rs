use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::CoreError;

/// User-supplied name of a VM snapshot.
///
/// Only emptiness is checked here; format and uniqueness belong to the
/// snapshot store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SnapshotTag(String);

impl SnapshotTag {
    /// Creates a tag, rejecting the empty string.
    ///
    /// # Errors
    /// Returns [`CoreError::EmptyTag`] if `tag` is empty.
    pub fn new(tag: impl Into<String>) -> Result<Self, CoreError> {
        let tag = tag.into();
        if tag.is_empty() {
            return Err(CoreError::EmptyTag);
        }
        Ok(Self(tag))
    }

    /// Returns the tag as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SnapshotTag {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<SnapshotTag> for String {
    fn from(tag: SnapshotTag) -> Self {
        tag.0
    }
}

/// Locally administered prefix shared by every derived guest MAC.
const MAC_PREFIX: [u8; 3] = [0x52, 0x55, 0x55];

/// Hardware address of a guest NIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Derives the stable MAC address of an instance from its directory.
    ///
    /// `52:55:55` followed by the first three bytes of `SHA-256(dir)`.
    #[must_use]
    pub fn for_instance_dir(dir: &Path) -> Self {
        let digest = Sha256::digest(dir.as_os_str().as_encoded_bytes());
        let mut bytes = [0u8; 6];
        bytes[..3].copy_from_slice(&MAC_PREFIX);
        bytes[3..].copy_from_slice(&digest[..3]);
        Self(bytes)
    }

    /// Returns the raw octets.
    #[must_use]
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddress {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| CoreError::InvalidMacAddress {
            value: s.to_owned(),
            reason: reason.to_owned(),
        };
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in &mut bytes {
            let part = parts.next().ok_or_else(|| invalid("expected 6 octets"))?;
            if part.len() != 2 {
                return Err(invalid("octets must be two hex digits"));
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| invalid("non-hex octet"))?;
        }
        if parts.next().is_some() {
            return Err(invalid("expected 6 octets"));
        }
        Ok(Self(bytes))
    }
}
