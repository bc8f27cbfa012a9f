//! thread-worker - per-thread job consumer for agent sessions

pub mod commands;
pub mod config;
pub mod consumer;
pub mod error;
pub mod subprocess;
pub mod telemetry;
