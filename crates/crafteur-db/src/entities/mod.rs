pub mod scheduled_tasks;
pub mod servers;
