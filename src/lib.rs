//! berth: a single-node application hosting orchestrator.
//!
//! Projects are registered with a git source, an encrypted env-var set, and
//! a claimed subdomain; deploys walk a persisted state machine
//! (QUEUED -> BUILDING -> DEPLOYING -> HEALTHY/FAILED/STOPPED), build an
//! image from source, run it on a shared container network, and route the
//! subdomain to the live container with zero-downtime supersession.

pub mod api;
pub mod auth;
pub mod build;
pub mod config;
pub mod db;
pub mod deploy;
pub mod errors;
pub mod logs;
pub mod models;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod server;
pub mod vault;
