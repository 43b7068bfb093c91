//! Check-config command - validate `LAKESHARE_*` configuration.

use anyhow::{Context, Result, bail};
use clap::{Args, ValueEnum};
use serde::Serialize;

use lakeshare_bus::RuleTarget;
use lakeshare_flow::{BusDeployment, Config, DeploymentPlan};

use crate::OutputFormat;

/// Component whose requirements are checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Component {
    /// Dispatcher in the domain account.
    Dispatcher,
    /// Grant handler in a producer account.
    GrantHandler,
    /// Admin bootstrap in a producer account.
    AdminBootstrap,
    /// Only the shared settings.
    #[default]
    All,
}

/// Arguments for the check-config command.
#[derive(Debug, Args)]
pub struct CheckConfigArgs {
    /// Component to check requirements for.
    #[arg(long, value_enum, default_value = "all")]
    pub component: Component,
}

/// Validated configuration and what it deploys locally.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigReport {
    /// Effective configuration.
    pub config: Config,
    /// Source identity of forwarded events.
    pub event_source: String,
    /// Account forwarded events are published from.
    pub domain_account: String,
    /// Buses and rules of this account and region.
    pub buses: Vec<BusDeployment>,
}

/// Validates a configuration for a component and describes its local buses.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or misses a value the
/// component requires.
pub fn describe(config: Config, component: Component) -> Result<ConfigReport> {
    config.validate().context("Invalid configuration")?;
    match component {
        Component::Dispatcher => {
            if config.domain_id.is_none() {
                bail!("The dispatcher requires LAKESHARE_DOMAIN_ID");
            }
        }
        Component::GrantHandler => {
            config.execution_role()?;
            if config.domain_account() == &config.account_id {
                tracing::warn!(
                    "LAKESHARE_DOMAIN_ACCOUNT_ID is unset; only this account may publish to the producer bus"
                );
            }
        }
        Component::AdminBootstrap => {
            if config.declared_admins.is_empty() {
                bail!("The admin bootstrap requires LAKESHARE_DECLARED_ADMINS");
            }
        }
        Component::All => {}
    }

    let plan = DeploymentPlan::local(&config);
    Ok(ConfigReport {
        event_source: config.event_source(),
        domain_account: config.domain_account().to_string(),
        buses: plan.buses,
        config,
    })
}

/// Execute the check-config command.
///
/// # Errors
///
/// Returns an error if the environment does not hold a valid configuration.
pub fn execute(args: &CheckConfigArgs, format: &OutputFormat) -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration from environment")?;
    let report = describe(config, args.component)?;

    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("Failed to serialize report")?
            );
        }
        OutputFormat::Text => {
            println!("Configuration is valid.");
            println!();
            println!("  Account:         {}", report.config.account_id);
            println!("  Region:          {}", report.config.region);
            println!("  Domain account:  {}", report.domain_account);
            println!(
                "  Domain:          {}",
                report.config.domain_id.as_deref().unwrap_or("-")
            );
            println!("  Event source:    {}", report.event_source);
            println!(
                "  Stale claims:    {}s",
                report.config.stale_claim_timeout_secs
            );
            for bus in &report.buses {
                println!();
                println!("  Bus {}", bus.address.arn());
                let allowed: Vec<String> =
                    bus.policy.principals().iter().map(ToString::to_string).collect();
                println!("    publishers: {}", allowed.join(", "));
                for rule in &bus.rules {
                    let targets: Vec<String> = rule.targets.iter().map(target_label).collect();
                    println!("    rule {} -> {}", rule.name, targets.join(", "));
                }
            }
        }
    }
    Ok(())
}

fn target_label(target: &RuleTarget) -> String {
    match target {
        RuleTarget::Bus(address) => address.arn(),
        RuleTarget::Handler(name) => name.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::from_lookup(|name| match name {
            "LAKESHARE_ACCOUNT_ID" => Some("222222222222".into()),
            "LAKESHARE_REGION" => Some("us-east-1".into()),
            "LAKESHARE_DOMAIN_ACCOUNT_ID" => Some("111111111111".into()),
            _ => None,
        })
        .expect("config")
    }

    #[test]
    fn producer_config_describes_local_bus() {
        let report = describe(config(), Component::All).expect("describe");
        assert_eq!(report.event_source, "custom.lakeshare");
        assert_eq!(report.buses.len(), 1);

        let bus = &report.buses[0];
        assert!(bus.policy.permits(&"111111111111".parse().unwrap()));
        assert_eq!(bus.rules[0].name, "unmanaged-acceptance");
        assert_eq!(target_label(&bus.rules[0].targets[0]), "grant-handler");
    }

    #[test]
    fn grant_handler_requires_execution_role() {
        let err = describe(config(), Component::GrantHandler).expect_err("no role");
        assert!(err.to_string().contains("LAKESHARE_EXECUTION_ROLE_ARN"));
    }

    #[test]
    fn dispatcher_requires_domain() {
        let err = describe(config(), Component::Dispatcher).expect_err("no domain");
        assert!(err.to_string().contains("LAKESHARE_DOMAIN_ID"));
    }

    #[test]
    fn bootstrap_requires_declared_admins() {
        let mut config = config();
        assert!(describe(config.clone(), Component::AdminBootstrap).is_err());
        config.declared_admins = vec!["arn:aws:iam::222222222222:role/admin".parse().unwrap()];
        describe(config, Component::AdminBootstrap).expect("declared");
    }

    #[test]
    fn report_serializes() {
        let report = describe(config(), Component::All).expect("describe");
        let json = serde_json::to_value(&report).expect("json");
        assert_eq!(json["domainAccount"], "111111111111");
        assert_eq!(json["config"]["eventBusName"], "default");
    }
}
