//! Strongly-typed identifiers.
//!
//! Account ids and regions appear in almost every routing decision, so they are
//! validated once at the boundary and carried as newtypes afterwards.
//!
//! # Example
//!
//! ```rust
//! use lakeshare_core::id::{AccountId, EventId, Region};
//!
//! let account: AccountId = "222222222222".parse().unwrap();
//! let region: Region = "us-east-1".parse().unwrap();
//! let event = EventId::generate();
//! assert_eq!(account.as_str(), "222222222222");
//! assert_eq!(region.as_str(), "us-east-1");
//! assert!(!event.to_string().is_empty());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// Identifier of a bus envelope.
///
/// Inbound envelopes carry whatever id the upstream bus assigned, so this is a
/// string; locally produced envelopes use ULIDs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Generates a new ULID-based event id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::generate()
    }
}

impl From<&str> for EventId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A twelve-digit cloud account id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountId(String);

impl AccountId {
    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for AccountId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 12 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidInput(format!(
                "account id must be 12 digits, got '{s}'"
            )));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for AccountId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<AccountId> for String {
    fn from(value: AccountId) -> Self {
        value.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A region name such as `us-east-1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Region(String);

impl Region {
    /// Returns the region as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Region {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        // Shape: <area>-<direction>-<number>, e.g. us-east-1, ap-southeast-2.
        let parts: Vec<&str> = s.split('-').collect();
        let valid = parts.len() >= 3
            && parts[..parts.len() - 1]
                .iter()
                .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_lowercase()))
            && parts
                .last()
                .is_some_and(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()));
        if !valid {
            return Err(Error::InvalidInput(format!("invalid region '{s}'")));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for Region {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Region> for String {
    fn from(value: Region) -> Self {
        value.0
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_id_requires_twelve_digits() {
        assert!("222222222222".parse::<AccountId>().is_ok());
        assert!("22222222222".parse::<AccountId>().is_err());
        assert!("22222222222a".parse::<AccountId>().is_err());
    }

    #[test]
    fn account_id_serde_validates() {
        let ok: serde_json::Result<AccountId> = serde_json::from_str("\"111111111111\"");
        assert!(ok.is_ok());
        let bad: serde_json::Result<AccountId> = serde_json::from_str("\"abc\"");
        assert!(bad.is_err());
    }

    #[test]
    fn region_shapes() {
        for ok in ["us-east-1", "eu-west-3", "ap-southeast-2", "us-gov-west-1"] {
            assert!(ok.parse::<Region>().is_ok(), "{ok} should parse");
        }
        for bad in ["", "us-east", "US-EAST-1", "us--1", "useast1"] {
            assert!(bad.parse::<Region>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn event_ids_are_unique() {
        assert_ne!(EventId::generate(), EventId::generate());
    }
}
