//! HTTP facade, persistence, and the virtualization control-plane logic
//! built on top of `esxi_client`. See `virtualization` for the reconciler,
//! clone orchestrator, power controller, and guest IP configurator.

pub mod config;
pub mod credential;
pub mod error;
pub mod host;
pub mod schema;
pub mod secret_store;
pub mod serve;
pub mod task;
pub mod virtualization;
