//! Event bus addresses.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use lakeshare_core::{AccountId, Error, Region, Result};

/// Fully qualified address of a regional event bus.
///
/// Rendered as `arn:aws:events:<region>:<account>:event-bus/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventBusAddress {
    /// Owning account.
    pub account: AccountId,
    /// Region of the bus.
    pub region: Region,
    /// Bus name within the account and region.
    pub name: String,
}

impl EventBusAddress {
    /// Creates a bus address.
    #[must_use]
    pub fn new(account: AccountId, region: Region, name: impl Into<String>) -> Self {
        Self {
            account,
            region,
            name: name.into(),
        }
    }

    /// Returns the bus ARN.
    #[must_use]
    pub fn arn(&self) -> String {
        format!(
            "arn:aws:events:{}:{}:event-bus/{}",
            self.region, self.account, self.name
        )
    }
}

impl FromStr for EventBusAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidInput(format!("invalid event bus ARN '{s}'"));
        let rest = s.strip_prefix("arn:aws:events:").ok_or_else(invalid)?;
        let mut parts = rest.splitn(3, ':');
        let (Some(region), Some(account), Some(resource)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        let name = resource
            .strip_prefix("event-bus/")
            .filter(|name| !name.is_empty())
            .ok_or_else(invalid)?;
        Ok(Self::new(account.parse()?, region.parse()?, name))
    }
}

impl TryFrom<String> for EventBusAddress {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<EventBusAddress> for String {
    fn from(value: EventBusAddress) -> Self {
        value.arn()
    }
}

impl fmt::Display for EventBusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.arn())
    }
}
