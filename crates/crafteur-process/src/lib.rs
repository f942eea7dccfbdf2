use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use specta::Type;

/// Lifecycle of one supervised process.
///
/// `Stopped -> Starting -> Running -> Stopping -> Stopped`, plus `Running -> Stopped`
/// when the process exits on its own and `Starting -> Stopped` when spawning fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ServerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerStatus::Stopped => "STOPPED",
            ServerStatus::Starting => "STARTING",
            ServerStatus::Running => "RUNNING",
            ServerStatus::Stopping => "STOPPING",
        }
    }

    pub fn can_transition_to(self, next: ServerStatus) -> bool {
        use ServerStatus::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Stopping)
                | (Running, Stopped)
                | (Stopping, Stopped)
        )
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One resource sample. `cpu` is a host share (0-100, already divided by core count).
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize, Type)]
pub struct ServerStats {
    pub cpu: f64,
    /// Resident memory in bytes.
    pub ram: u64,
    /// Configured heap ceiling in bytes.
    pub ram_max: u64,
}

/// Envelope pushed to console subscribers: `{"type": "log"|"status"|"stats", "data": ...}`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Type)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ConsoleEvent {
    Log(String),
    Status(ServerStatus),
    Stats(ServerStats),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "lowercase")]
pub enum TaskAction {
    Start,
    Stop,
    Restart,
    Command,
}

impl TaskAction {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskAction::Start => "start",
            TaskAction::Stop => "stop",
            TaskAction::Restart => "restart",
            TaskAction::Command => "command",
        }
    }
}

impl fmt::Display for TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownAction(pub String);

impl fmt::Display for UnknownAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown action: {}", self.0)
    }
}

impl std::error::Error for UnknownAction {}

impl FromStr for TaskAction {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(TaskAction::Start),
            "stop" => Ok(TaskAction::Stop),
            "restart" => Ok(TaskAction::Restart),
            "command" => Ok(TaskAction::Command),
            _ => Err(UnknownAction(s.to_string())),
        }
    }
}

/// Persisted binding of a trigger expression to a lifecycle/command action.
///
/// `action` stays a raw string so rows written by older builds still load;
/// it is validated on create/update and again when the task fires.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub server_id: String,
    pub name: String,
    pub action: String,
    #[serde(default)]
    pub payload: String,
    /// e.g. `0 10 * * *` or `@every 1h`.
    pub cron_expression: String,
    #[serde(default)]
    pub one_shot: bool,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    /// Computed from the live trigger; never persisted.
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_event_envelope_shape() {
        let ev = ConsoleEvent::Stats(ServerStats {
            cpu: 12.5,
            ram: 1024,
            ram_max: 2048,
        });
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "stats");
        assert_eq!(v["data"]["cpu"], 12.5);
        assert_eq!(v["data"]["ram_max"], 2048);

        let v = serde_json::to_value(ConsoleEvent::Status(ServerStatus::Running)).unwrap();
        assert_eq!(v, serde_json::json!({"type": "status", "data": "RUNNING"}));

        let v = serde_json::to_value(ConsoleEvent::Log("hello".into())).unwrap();
        assert_eq!(v, serde_json::json!({"type": "log", "data": "hello"}));
    }

    #[test]
    fn status_edges() {
        use ServerStatus::*;
        assert!(Stopped.can_transition_to(Starting));
        assert!(Running.can_transition_to(Stopped));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Stopping.can_transition_to(Running));
        assert!(!Running.can_transition_to(Starting));
    }

    #[test]
    fn task_action_parses_case_insensitively() {
        assert_eq!("Restart".parse::<TaskAction>().unwrap(), TaskAction::Restart);
        assert_eq!(" command ".parse::<TaskAction>().unwrap(), TaskAction::Command);
        let err = "reboot".parse::<TaskAction>().unwrap_err();
        assert_eq!(err.to_string(), "unknown action: reboot");
    }

    #[test]
    fn scheduled_task_defaults_optional_fields() {
        let t: ScheduledTask = serde_json::from_value(serde_json::json!({
            "id": "t1",
            "server_id": "s1",
            "name": "nightly",
            "action": "restart",
            "cron_expression": "0 4 * * *"
        }))
        .unwrap();
        assert!(!t.one_shot);
        assert!(t.last_run.is_none());
        assert!(t.payload.is_empty());
    }
}
