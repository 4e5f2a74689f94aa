//! hive - filesystem-coordinated master/worker runner for LLM tasks

pub mod backend;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod heartbeat;
pub mod layout;
pub mod lease;
pub mod mailbox;
pub mod master;
pub mod shutdown;
pub mod status_log;
pub mod subprocess;
pub mod summary;
pub mod task_store;
pub mod telemetry;
pub mod worker;
