//! Principal identities (ARNs) used as grant targets and administrators.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::id::AccountId;

/// An IAM principal ARN such as `arn:aws:iam::222222222222:role/consumer`.
///
/// Only the structure needed for routing and policy attachment is interpreted:
/// the account id and, for roles, the role name. Everything else is opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PrincipalArn(String);

impl PrincipalArn {
    /// Builds the ARN of a role in an account.
    #[must_use]
    pub fn role(account_id: &AccountId, role_name: &str) -> Self {
        Self(format!("arn:aws:iam::{account_id}:role/{role_name}"))
    }

    /// Returns the ARN as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the account segment of the ARN, if it is a valid account id.
    #[must_use]
    pub fn account_id(&self) -> Option<AccountId> {
        self.0.split(':').nth(4).and_then(|s| s.parse().ok())
    }

    /// Returns the role name for role ARNs (the last path segment).
    ///
    /// `arn:aws:iam::123456789012:role/service/my-role` yields `my-role`.
    #[must_use]
    pub fn role_name(&self) -> Option<&str> {
        let resource = self.resource()?;
        let rest = resource.strip_prefix("role/")?;
        rest.rsplit('/').next().filter(|name| !name.is_empty())
    }

    /// Returns true if this principal is an IAM role.
    #[must_use]
    pub fn is_role(&self) -> bool {
        self.role_name().is_some()
    }

    fn resource(&self) -> Option<&str> {
        self.0.splitn(6, ':').nth(5)
    }
}

impl FromStr for PrincipalArn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.splitn(6, ':').collect();
        if parts.len() != 6 || parts[0] != "arn" || parts[1].is_empty() || parts[2].is_empty() {
            return Err(Error::InvalidInput(format!(
                "principal must be an ARN, got '{s}'"
            )));
        }
        if parts[5].is_empty() {
            return Err(Error::InvalidInput(format!(
                "principal ARN has no resource segment: '{s}'"
            )));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for PrincipalArn {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PrincipalArn> for String {
    fn from(value: PrincipalArn) -> Self {
        value.0
    }
}

impl fmt::Display for PrincipalArn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_arn_parts() {
        let arn: PrincipalArn = "arn:aws:iam::222222222222:role/consumer".parse().unwrap();
        assert_eq!(arn.account_id().unwrap().as_str(), "222222222222");
        assert_eq!(arn.role_name(), Some("consumer"));
        assert!(arn.is_role());
    }

    #[test]
    fn role_constructor() {
        let account: AccountId = "222222222222".parse().unwrap();
        let arn = PrincipalArn::role(&account, "lakeshare-grant");
        assert_eq!(arn.as_str(), "arn:aws:iam::222222222222:role/lakeshare-grant");
        assert_eq!(arn.account_id(), Some(account));
    }

    #[test]
    fn role_with_path_uses_last_segment() {
        let arn: PrincipalArn = "arn:aws:iam::222222222222:role/service-role/datazone_usr_abc"
            .parse()
            .unwrap();
        assert_eq!(arn.role_name(), Some("datazone_usr_abc"));
    }

    #[test]
    fn user_arn_is_not_role() {
        let arn: PrincipalArn = "arn:aws:iam::222222222222:user/alice".parse().unwrap();
        assert!(!arn.is_role());
        assert_eq!(arn.role_name(), None);
    }

    #[test]
    fn rejects_non_arns() {
        assert!("consumer".parse::<PrincipalArn>().is_err());
        assert!("arn:aws:iam::222222222222:".parse::<PrincipalArn>().is_err());
        assert!("urn:aws:iam::222222222222:role/x".parse::<PrincipalArn>().is_err());
    }
}
