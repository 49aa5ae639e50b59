//! ExecuStack Worker Pool
//!
//! Runs deferred executions published by the control plane.
//!
//! This crate provides:
//! - NATS JetStream consumer for queued executions and a fanout subscription
//!   for broadcast ones
//! - Deferred-execution runner with ack / retry / dead-letter decisions

pub mod config;
pub mod nats;
pub mod runner;
pub mod worker;

pub use config::WorkerConfig;
pub use runner::DeferredRunner;
pub use worker::Worker;
