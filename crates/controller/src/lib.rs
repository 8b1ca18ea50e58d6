//! Keel controller: the outer call contract around the engine and the
//! teardown orchestrator. Owners are reconciled level-triggered; blueprints
//! run in dependency order; deletion goes through the finalizer steps.

#![forbid(unsafe_code)]

use std::str::FromStr;

pub mod blueprint;
pub mod controller;

pub use blueprint::{order, Blueprint, BlueprintError, Placement};
pub use controller::{ClusterController, ControllerConfig, ControllerError, Next};

/// Install a fmt subscriber filtered by `KEEL_LOG` (default `info`). Safe to
/// call more than once.
pub fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(true).try_init();
}
