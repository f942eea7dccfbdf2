//! Supervision core of the crafteur daemon: per-server process wrappers, the
//! registry that owns them, and the cron-driven task scheduler.

pub mod bootstrap;
pub mod config;
pub mod console;
pub mod control;
pub mod error;
pub mod instance;
pub mod launch;
pub mod players;
pub mod properties;
pub mod registry;
pub mod sandbox;
pub mod schedule;
pub mod scheduler;
pub mod task_store;
pub mod trigger;

mod resources;
