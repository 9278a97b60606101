//! keyward-core: reconciliation workflows for SSH authorized keys
//!
//! Deploy, audit, bootstrap and decommission accounts across a fleet. Every
//! workflow is built from an `Arc<dyn Store>` and an
//! `Arc<dyn TransportFactory>`; fleet-wide runs fan out one task per account
//! through [`fleet::FleetRunner`]. Abandoned bootstrap sessions are collected
//! by the [`reaper::ReaperActor`].

pub mod audit;
pub mod bootstrap;
pub mod config;
mod connect;
pub mod decommission;
pub mod deploy;
pub mod error;
pub mod fleet;
pub mod reaper;
pub mod results;
pub mod telemetry;
pub mod trust;

pub use audit::AuditEngine;
pub use bootstrap::{BootstrapTicket, BootstrapWorkflow};
pub use config::{
    BootstrapConfig, EngineConfig, FleetConfig, LogFormat, LoggingConfig, TransportConfig,
};
pub use decommission::{DecommissionOptions, DecommissionWorkflow};
pub use deploy::DeployWorkflow;
pub use error::CoreError;
pub use fleet::FleetRunner;
pub use reaper::{
    BootstrapReaper, ReapAll, ReapExpired, ReapReport, ReaperActor, ReaperActorArgs,
    ReaperHandle, run_until_shutdown, shutdown_signal, spawn_reaper,
};
pub use results::{
    AccountRef, AuditMode, AuditResult, BatchSummary, DecommissionResult, DeployResult, Outcome,
    OutcomeStatus, Reporter, TracingReporter, report_batch,
};
pub use telemetry::init_tracing;
pub use trust::{HostTrust, TrustOutcome};
