//! Supervisor for a cluster of Sidekiq worker processes.
//!
//! The `sidekiq-cluster` binary resolves queue groups, starts one worker
//! per group, optionally starts the `metrics-server` exporter, and then
//! watches them all until the cluster is told to stop or a worker dies.

pub mod app;
pub mod catalog;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod errors;
pub mod exporter;
pub mod logging;
pub mod metrics_server;
pub mod process_management;
pub mod queues;
pub mod selector;
pub mod settings;
pub mod signals;
pub mod supervisor;
