//! Runtime configuration.
//!
//! Loaded from `LAKESHARE_*` environment variables by [`Config::from_env`], or
//! deserialized from a scenario file by the CLI. Either way, call
//! [`Config::validate`] before use.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use lakeshare_bus::EventBusAddress;
use lakeshare_core::event::custom_source;
use lakeshare_core::{AccountId, Error, LogFormat, PrincipalArn, Region, Result};

/// Smallest accepted stale-claim timeout, in seconds.
pub const MIN_STALE_CLAIM_TIMEOUT_SECS: u64 = 10;

/// Largest accepted stale-claim timeout, in seconds.
pub const MAX_STALE_CLAIM_TIMEOUT_SECS: u64 = 3600;

/// Largest accepted number of admin reconcile attempts.
pub const MAX_ADMIN_RECONCILE_ATTEMPTS: u32 = 10;

/// Configuration shared by the dispatcher, grant handler and admin bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Account this process runs in.
    pub account_id: AccountId,

    /// Region this process runs in.
    pub region: Region,

    /// Account hosting the governance domain (publisher of forwarded events).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_account_id: Option<AccountId>,

    /// Governance domain used when an event does not name one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_id: Option<String>,

    /// Bus name used in every account and region.
    #[serde(default = "default_event_bus_name")]
    pub event_bus_name: String,

    /// Namespace of forwarded events (`custom.<namespace>`).
    #[serde(default = "default_event_namespace")]
    pub event_namespace: String,

    /// Role the grant handler runs as; must be a data-lake administrator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_role_arn: Option<PrincipalArn>,

    /// Managed policy granting cross-account catalog read access.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_policy_arn: Option<String>,

    /// Consumer database used when the event carries no environment context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_consumer_database: Option<String>,

    /// Age after which an in-progress claim may be taken over.
    #[serde(default = "default_stale_claim_timeout_secs")]
    pub stale_claim_timeout_secs: u64,

    /// Consecutive failures of one grant key that raise an operator alert.
    #[serde(default = "default_failure_alert_threshold")]
    pub failure_alert_threshold: u32,

    /// Publish an `UnmanagedAssetGranted` event after a first successful grant.
    #[serde(default)]
    pub announce_grants: bool,

    /// Bound on admin read-merge-write rounds.
    #[serde(default = "default_admin_reconcile_attempts")]
    pub admin_reconcile_attempts: u32,

    /// Administrators the bootstrap declares.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub declared_admins: Vec<PrincipalArn>,

    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Config {
    /// Creates a configuration with defaults for everything but the location.
    #[must_use]
    pub fn new(account_id: AccountId, region: Region) -> Self {
        Self {
            account_id,
            region,
            domain_account_id: None,
            domain_id: None,
            event_bus_name: default_event_bus_name(),
            event_namespace: default_event_namespace(),
            execution_role_arn: None,
            read_policy_arn: None,
            default_consumer_database: None,
            stale_claim_timeout_secs: default_stale_claim_timeout_secs(),
            failure_alert_threshold: default_failure_alert_threshold(),
            announce_grants: false,
            admin_reconcile_attempts: default_admin_reconcile_attempts(),
            declared_admins: Vec::new(),
            log_format: LogFormat::default(),
        }
    }

    /// Loads configuration from `LAKESHARE_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if a required variable is missing or a
    /// value does not parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through a variable lookup function.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if a required variable is missing or a
    /// value does not parse.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let account_id = env.require("LAKESHARE_ACCOUNT_ID")?;
        let region = env.require("LAKESHARE_REGION")?;
        let mut config = Self::new(account_id, region);

        config.domain_account_id = env.parse("LAKESHARE_DOMAIN_ACCOUNT_ID")?;
        config.domain_id = env.string("LAKESHARE_DOMAIN_ID");
        if let Some(name) = env.string("LAKESHARE_EVENT_BUS_NAME") {
            config.event_bus_name = name;
        }
        if let Some(namespace) = env.string("LAKESHARE_EVENT_NAMESPACE") {
            config.event_namespace = namespace;
        }
        config.execution_role_arn = env.parse("LAKESHARE_EXECUTION_ROLE_ARN")?;
        config.read_policy_arn = env.string("LAKESHARE_READ_POLICY_ARN");
        config.default_consumer_database = env.string("LAKESHARE_DEFAULT_CONSUMER_DATABASE");
        if let Some(secs) = env.u64("LAKESHARE_STALE_CLAIM_TIMEOUT_SECS")? {
            config.stale_claim_timeout_secs = secs;
        }
        if let Some(threshold) = env.u32("LAKESHARE_FAILURE_ALERT_THRESHOLD")? {
            config.failure_alert_threshold = threshold;
        }
        if let Some(announce) = env.bool("LAKESHARE_ANNOUNCE_GRANTS")? {
            config.announce_grants = announce;
        }
        if let Some(attempts) = env.u32("LAKESHARE_ADMIN_RECONCILE_ATTEMPTS")? {
            config.admin_reconcile_attempts = attempts;
        }
        if let Some(admins) = env.string("LAKESHARE_DECLARED_ADMINS") {
            config.declared_admins = parse_list("LAKESHARE_DECLARED_ADMINS", &admins)?;
        }
        if let Some(format) = env.parse("LAKESHARE_LOG_FORMAT")? {
            config.log_format = format;
        }

        Ok(config)
    }

    /// Validates value ranges and names.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_STALE_CLAIM_TIMEOUT_SECS..=MAX_STALE_CLAIM_TIMEOUT_SECS)
            .contains(&self.stale_claim_timeout_secs)
        {
            return Err(Error::InvalidInput(format!(
                "LAKESHARE_STALE_CLAIM_TIMEOUT_SECS must be between {MIN_STALE_CLAIM_TIMEOUT_SECS} and {MAX_STALE_CLAIM_TIMEOUT_SECS} (got {})",
                self.stale_claim_timeout_secs
            )));
        }
        if self.failure_alert_threshold == 0 {
            return Err(Error::InvalidInput(
                "LAKESHARE_FAILURE_ALERT_THRESHOLD must be at least 1".to_string(),
            ));
        }
        if !(1..=MAX_ADMIN_RECONCILE_ATTEMPTS).contains(&self.admin_reconcile_attempts) {
            return Err(Error::InvalidInput(format!(
                "LAKESHARE_ADMIN_RECONCILE_ATTEMPTS must be between 1 and {MAX_ADMIN_RECONCILE_ATTEMPTS} (got {})",
                self.admin_reconcile_attempts
            )));
        }
        validate_name("LAKESHARE_EVENT_BUS_NAME", &self.event_bus_name)?;
        validate_name("LAKESHARE_EVENT_NAMESPACE", &self.event_namespace)?;
        if let Some(policy) = &self.read_policy_arn {
            if !policy.starts_with("arn:") {
                return Err(Error::InvalidInput(format!(
                    "LAKESHARE_READ_POLICY_ARN must be an ARN (got {policy})"
                )));
            }
        }
        if self
            .default_consumer_database
            .as_deref()
            .is_some_and(|db| db.contains('.'))
        {
            return Err(Error::InvalidInput(
                "LAKESHARE_DEFAULT_CONSUMER_DATABASE must not contain dots".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the stale-claim timeout. Values beyond what a duration can hold
    /// saturate to the largest duration.
    #[must_use]
    pub fn stale_claim_timeout(&self) -> chrono::Duration {
        i64::try_from(self.stale_claim_timeout_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }

    /// Returns the source identity of forwarded events.
    #[must_use]
    pub fn event_source(&self) -> String {
        custom_source(&self.event_namespace)
    }

    /// Returns the bus of this account and region.
    #[must_use]
    pub fn local_bus(&self) -> EventBusAddress {
        self.bus_in(self.account_id.clone(), self.region.clone())
    }

    /// Returns the bus with the configured name in another account and region.
    #[must_use]
    pub fn bus_in(&self, account_id: AccountId, region: Region) -> EventBusAddress {
        EventBusAddress::new(account_id, region, self.event_bus_name.clone())
    }

    /// Returns the account forwarded events are published from.
    #[must_use]
    pub fn domain_account(&self) -> &AccountId {
        self.domain_account_id.as_ref().unwrap_or(&self.account_id)
    }

    /// Returns the execution role.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if no execution role is configured.
    pub fn execution_role(&self) -> Result<&PrincipalArn> {
        self.execution_role_arn.as_ref().ok_or_else(|| {
            Error::InvalidInput("LAKESHARE_EXECUTION_ROLE_ARN is required".to_string())
        })
    }
}

fn default_event_bus_name() -> String {
    "default".to_string()
}

fn default_event_namespace() -> String {
    "lakeshare".to_string()
}

const fn default_stale_claim_timeout_secs() -> u64 {
    300
}

const fn default_failure_alert_threshold() -> u32 {
    3
}

const fn default_admin_reconcile_attempts() -> u32 {
    3
}

fn validate_name(name: &str, value: &str) -> Result<()> {
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "{name} must be non-empty and contain only [A-Za-z0-9._-] (got {value:?})"
        )))
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<T>()
            .map(Some)
            .map_err(|e| Error::InvalidInput(format!("{name}: {e}")))
    }

    fn require<T>(&self, name: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.parse(name)?
            .ok_or_else(|| Error::InvalidInput(format!("{name} is required")))
    }

    fn u64(&self, name: &str) -> Result<Option<u64>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u64>()
            .map(Some)
            .map_err(|e| Error::InvalidInput(format!("{name} must be a u64: {e}")))
    }

    fn u32(&self, name: &str) -> Result<Option<u32>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u32>()
            .map(Some)
            .map_err(|e| Error::InvalidInput(format!("{name} must be a u32: {e}")))
    }

    fn bool(&self, name: &str) -> Result<Option<bool>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        parse_bool(name, &v).map(Some)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::InvalidInput(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}

fn parse_list<T>(name: &str, value: &str) -> Result<Vec<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<T>()
                .map_err(|e| Error::InvalidInput(format!("{name}: {e}")))
        })
        .collect()
}
