//! muxd: a local multi-service process supervisor.
//!
//! One instance per socket path acts as the master. It starts the configured
//! services in dependency order, probes their readiness, and records all output
//! in a shared `LogStore`. Further instances attach as clients and mirror that
//! store over a unix socket.

pub mod commands;
pub mod config;
pub mod events;
pub mod ipc;
pub mod log_store;
pub mod output;
pub mod process;
pub mod ready;
pub mod service;
pub mod supervisor;

pub use log_store::{LogEntry, LogStore};
pub use service::{ProcessState, ReadyCheck, ServiceDefinition, ServiceFlags};
pub use supervisor::{Supervisor, SupervisorOptions};
