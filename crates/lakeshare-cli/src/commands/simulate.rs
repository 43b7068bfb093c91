//! Simulate command - replay a scenario against an in-memory deployment.
//!
//! The deployment is built the way a real one is: buses and rules come from
//! the deployment plan, every producer account is bootstrapped before any
//! event is replayed, and events travel dispatcher → producer bus → grant
//! handler through the in-memory bus.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;

use lakeshare_bus::EventChannel;
use lakeshare_bus::memory::InMemoryEventBus;
use lakeshare_core::{AccountId, MemoryBackend, Region, SubscriptionEvent};
use lakeshare_flow::deployment::{DISPATCHER, GRANT_HANDLER};
use lakeshare_flow::directory::memory::InMemoryDirectory;
use lakeshare_flow::ports::TableInfo;
use lakeshare_flow::ports::memory::InMemoryAccount;
use lakeshare_flow::{
    AdminBootstrap, DeploymentPlan, DispatchError, DispatchOutcome, Dispatcher, GrantError,
    GrantHandler, GrantOutcome, GrantPorts,
};
use lakeshare_ledger::GrantLedger;

use crate::OutputFormat;
use crate::scenario::{AccountSetup, Scenario};

/// Bound on delivery rounds per replayed event.
const MAX_ROUNDS: usize = 16;

/// Arguments for the simulate command.
#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// Path to scenario file (JSON).
    #[arg(long, short = 's')]
    pub scenario: PathBuf,
}

/// Bootstrap result of one producer account.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapSummary {
    /// Account id.
    pub account_id: String,
    /// `merged`, `unchanged` or `error`.
    pub outcome: String,
    /// Administrators added.
    pub added: Vec<String>,
    /// Declared roles that do not exist.
    pub skipped: Vec<String>,
    /// Failure message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Grant handler result for one delivery.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantSummary {
    /// Account whose handler received the delivery.
    pub account_id: String,
    /// Outcome label, or `failed` / `error`.
    pub outcome: String,
    /// Steps as `step:action`.
    pub steps: Vec<String>,
    /// Resource share carrying the grant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share_id: Option<String>,
    /// Failure message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Failure class.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<&'static str>,
}

/// Everything that happened to one replayed event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSummary {
    /// Envelope id.
    pub event_id: String,
    /// Listing the event names.
    pub listing_id: String,
    /// Dispatch outcome label, or `unresolved` / `error`.
    pub dispatch: String,
    /// Destination bus, when published.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    /// Dispatch failure or ignore reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Grant deliveries triggered by the event.
    pub grants: Vec<GrantSummary>,
}

/// Final ledger state of one grant key.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    /// Producer account holding the ledger.
    pub account_id: String,
    /// Principal receiving access.
    pub principal: String,
    /// Qualified asset name.
    pub asset: String,
    /// Ledger status.
    pub status: String,
    /// Approval generation.
    pub generation: u64,
    /// Resource share carrying the grant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share_id: Option<String>,
    /// Step of the last failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    /// Failed attempts since the last success.
    pub consecutive_failures: u32,
}

/// Result of a simulation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationReport {
    /// Buses deployed.
    pub buses: Vec<String>,
    /// Bootstrap results, per account.
    pub bootstrap: Vec<BootstrapSummary>,
    /// Replayed events.
    pub events: Vec<EventSummary>,
    /// Final ledger records.
    pub ledger: Vec<LedgerEntry>,
}

struct Producer {
    account_id: AccountId,
    handler: GrantHandler<MemoryBackend>,
}

/// Runs a scenario to completion.
///
/// # Errors
///
/// Returns an error if the deployment cannot be built. Failures of
/// individual events are reported, not returned.
pub async fn simulate(scenario: &Scenario) -> Result<SimulationReport> {
    let directory = Arc::new(InMemoryDirectory::new());
    for environment in &scenario.environments {
        directory.put_environment(environment.clone())?;
    }
    for listing in &scenario.listings {
        directory.put_listing(listing.clone())?;
    }

    let bus = Arc::new(InMemoryEventBus::new());
    let plan = DeploymentPlan::plan(&scenario.config, directory.as_ref())
        .await
        .context("Failed to plan deployment")?;
    plan.apply(&bus)?;
    let mut buses: Vec<String> = plan.buses.iter().map(|b| b.address.arn()).collect();

    let mut producers: BTreeMap<(AccountId, Region), Producer> = BTreeMap::new();
    let mut bootstrap = Vec::with_capacity(scenario.accounts.len());
    for setup in &scenario.accounts {
        let (producer, summary) = provision(scenario, setup, &bus).await?;
        let local_bus = scenario.producer_config(setup).local_bus();
        if plan.bus(&local_bus).is_none() {
            // No environment lives here, so nothing planned this bus.
            DeploymentPlan::local(&scenario.producer_config(setup)).apply(&bus)?;
            buses.push(local_bus.arn());
        }
        bootstrap.push(summary);
        producers.insert((setup.account_id.clone(), setup.region.clone()), producer);
    }

    let dispatcher = Dispatcher::new(&scenario.config, directory.clone(), bus.clone());
    let domain_bus = scenario.config.bus_in(
        scenario.config.domain_account().clone(),
        scenario.config.region.clone(),
    );

    let mut events = Vec::with_capacity(scenario.events.len());
    for event in &scenario.events {
        bus.publish(&domain_bus, scenario.config.domain_account(), event)
            .await
            .with_context(|| format!("Failed to publish event {} to the domain bus", event.id))?;
        events.push(replay(event, &bus, &dispatcher, &producers).await?);
    }

    let mut ledger = Vec::new();
    for producer in producers.values() {
        let records = producer
            .handler
            .ledger()
            .list()
            .await
            .context("Failed to list ledger records")?;
        ledger.extend(records.into_iter().map(|record| LedgerEntry {
            account_id: producer.account_id.to_string(),
            principal: record.key.principal_arn.to_string(),
            asset: record.key.asset.clone(),
            status: record.status.to_string(),
            generation: record.generation,
            share_id: record.share_id.clone(),
            failed_step: record.failed_step.map(|s| s.to_string()),
            consecutive_failures: record.consecutive_failures,
        }));
    }

    Ok(SimulationReport {
        buses,
        bootstrap,
        events,
        ledger,
    })
}

async fn provision(
    scenario: &Scenario,
    setup: &AccountSetup,
    bus: &Arc<InMemoryEventBus>,
) -> Result<(Producer, BootstrapSummary)> {
    let config = scenario.producer_config(setup);
    let account = Arc::new(InMemoryAccount::new(setup.account_id.clone()));
    for role in &setup.roles {
        account.add_role(role)?;
    }
    for table in &setup.tables {
        account.add_database(&table.database)?;
        account.add_table(
            &table.database,
            TableInfo::physical(table.table.clone()),
        )?;
    }
    account.set_admins(setup.admins.clone())?;

    let summary = match AdminBootstrap::new(&config, account.clone(), account.clone())
        .reconcile(&config.declared_admins)
        .await
    {
        Ok(report) => BootstrapSummary {
            account_id: setup.account_id.to_string(),
            outcome: if report.changed() { "merged" } else { "unchanged" }.to_string(),
            added: report.added.iter().map(ToString::to_string).collect(),
            skipped: report.skipped.iter().map(ToString::to_string).collect(),
            error: None,
        },
        Err(e) => BootstrapSummary {
            account_id: setup.account_id.to_string(),
            outcome: "error".to_string(),
            added: Vec::new(),
            skipped: Vec::new(),
            error: Some(e.to_string()),
        },
    };

    let ledger = GrantLedger::new(Arc::new(MemoryBackend::new()))
        .with_stale_timeout(config.stale_claim_timeout());
    let handler = GrantHandler::new(&config, ledger, GrantPorts::single(&account))?
        .with_channel(bus.clone());

    Ok((
        Producer {
            account_id: setup.account_id.clone(),
            handler,
        },
        summary,
    ))
}

async fn replay(
    event: &SubscriptionEvent,
    bus: &InMemoryEventBus,
    dispatcher: &Dispatcher,
    producers: &BTreeMap<(AccountId, Region), Producer>,
) -> Result<EventSummary> {
    let mut summary = EventSummary {
        event_id: event.id.to_string(),
        listing_id: event.detail.listing_id.clone(),
        dispatch: "not_routed".to_string(),
        destination: None,
        detail: None,
        grants: Vec::new(),
    };

    for _ in 0..MAX_ROUNDS {
        let dispatches = bus.drain(DISPATCHER)?;
        let grants = bus.drain(GRANT_HANDLER)?;
        if dispatches.is_empty() && grants.is_empty() {
            break;
        }
        for delivery in dispatches {
            match dispatcher.dispatch(&delivery.event).await {
                Ok(outcome) => {
                    summary.dispatch = outcome.as_str().to_string();
                    match outcome {
                        DispatchOutcome::Published {
                            bus: destination, ..
                        } => summary.destination = Some(destination.arn()),
                        DispatchOutcome::Ignored { reason } => summary.detail = Some(reason),
                    }
                }
                Err(e) => {
                    summary.dispatch = if matches!(e, DispatchError::UnresolvedDestination { .. }) {
                        "unresolved"
                    } else {
                        "error"
                    }
                    .to_string();
                    summary.detail = Some(e.to_string());
                }
            }
        }
        for delivery in grants {
            let key = (delivery.bus.account.clone(), delivery.bus.region.clone());
            let Some(producer) = producers.get(&key) else {
                tracing::warn!(bus = %delivery.bus, "no grant handler for bus; delivery dropped");
                continue;
            };
            summary
                .grants
                .push(grant_summary(producer, producer.handler.grant(&delivery.event).await));
        }
    }
    Ok(summary)
}

fn grant_summary(
    producer: &Producer,
    result: Result<GrantOutcome, GrantError>,
) -> GrantSummary {
    let mut summary = GrantSummary {
        account_id: producer.account_id.to_string(),
        outcome: String::new(),
        steps: Vec::new(),
        share_id: None,
        error: None,
        error_class: None,
    };
    match result {
        Ok(outcome) => {
            summary.outcome = outcome.as_str().to_string();
            if let GrantOutcome::Granted(report) = outcome {
                summary.steps = report
                    .steps
                    .iter()
                    .map(|s| format!("{}:{}", s.step, s.action.as_str()))
                    .collect();
                summary.share_id = report.share_id;
            }
        }
        Err(e) => {
            summary.outcome = if e.step().is_some() { "failed" } else { "error" }.to_string();
            summary.error_class = Some(e.class().as_str());
            summary.error = Some(e.to_string());
        }
    }
    summary
}

/// Execute the simulate command.
///
/// # Errors
///
/// Returns an error if the scenario file is invalid or the deployment cannot
/// be built.
pub async fn execute(args: SimulateArgs, format: &OutputFormat) -> Result<()> {
    let scenario = Scenario::load(&args.scenario)?;
    let report = simulate(&scenario).await?;

    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("Failed to serialize report")?
            );
        }
        OutputFormat::Text => print_text(&report),
    }
    Ok(())
}

fn print_text(report: &SimulationReport) {
    println!("Buses:");
    for bus in &report.buses {
        println!("  {bus}");
    }

    println!();
    println!("Admin bootstrap:");
    for b in &report.bootstrap {
        println!("  {}  {}", b.account_id, b.outcome);
        for added in &b.added {
            println!("    + {added}");
        }
        for skipped in &b.skipped {
            println!("    ! skipped {skipped}");
        }
        if let Some(error) = &b.error {
            println!("    error: {error}");
        }
    }

    println!();
    println!("Events:");
    for event in &report.events {
        println!("  {}  listing={}  dispatch={}", event.event_id, event.listing_id, event.dispatch);
        if let Some(destination) = &event.destination {
            println!("    -> {destination}");
        }
        if let Some(detail) = &event.detail {
            println!("    {detail}");
        }
        for grant in &event.grants {
            println!("    grant@{}  {}", grant.account_id, grant.outcome);
            if !grant.steps.is_empty() {
                println!("      steps: {}", grant.steps.join(", "));
            }
            if let Some(error) = &grant.error {
                println!("      error: {error}");
            }
        }
    }

    println!();
    println!("Ledger:");
    for entry in &report.ledger {
        println!(
            "  {}  {} on {}  {} (generation {})",
            entry.account_id, entry.principal, entry.asset, entry.status, entry.generation
        );
        if let Some(step) = &entry.failed_step {
            println!("    failed at {step} ({} consecutive)", entry.consecutive_failures);
        }
    }
}
