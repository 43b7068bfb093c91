//! # lakeshare-flow
//!
//! Event-driven cross-account grant orchestration.
//!
//! This crate provides:
//!
//! - [`dispatcher::Dispatcher`]: routes accepted subscriptions from the domain
//!   account to the producer account's regional bus
//! - [`grant::GrantHandler`]: runs the producer-side grant sequence under the
//!   ledger's idempotency guard
//! - [`bootstrap::AdminBootstrap`]: merge-only maintenance of the data-lake
//!   administrator list
//! - [`deployment::DeploymentPlan`]: buses, allow-lists and routing rules
//! - [`directory`] and [`ports`]: collaborator traits with in-memory
//!   implementations
//! - [`views::ViewResolver`]: tables a granted view reads from
//!
//! ## Flow
//!
//! ```text
//! catalog ──▶ domain bus ──▶ Dispatcher ──▶ producer bus ──▶ GrantHandler ──▶ ledger
//!                               │                                │
//!                          DirectoryClient              catalog / shares / permissions / IAM
//! ```
//!
//! Delivery is at-least-once and unordered. The dispatcher publishes exactly
//! once per invocation and never retries; the grant handler absorbs
//! duplicates through the ledger.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod bootstrap;
pub mod config;
pub mod deployment;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod grant;
pub mod metrics;
pub mod ports;
pub mod views;

pub use bootstrap::{AdminBootstrap, ReconcileReport};
pub use config::Config;
pub use deployment::{BusDeployment, DeploymentPlan};
pub use directory::{DirectoryClient, EnvironmentInfo, ListingInfo};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use error::{DispatchError, GrantError, ReconcileError};
pub use grant::{GrantHandler, GrantOutcome, GrantPorts, GrantReport, StepAction, StepReport};
