//! Swarmgate - an API gateway for function containers on Docker Swarm
//!
//! This library provides a gateway that:
//! - Routes `/function/{name}` (or `POST /` with `X-Function`) to the named function's service
//! - Deploys, updates, lists and removes functions through the orchestrator
//! - Tracks running replicas per function in a background watcher
//! - Scales functions from Alertmanager webhooks
//! - Publishes invocation and replica metrics in the Prometheus text format

pub mod config;
pub mod credential;
pub mod dispatch;
pub mod docker;
pub mod error;
pub mod function;
pub mod lifecycle;
pub mod metrics;
pub mod orchestrator;
pub mod pool;
pub mod server;
pub mod watcher;
