use std::collections::BTreeMap;

use crate::schedule::ScheduleError;

const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_HINT_BYTES: usize = 8 * 1024;
const MAX_FIELD_ERROR_BYTES: usize = 4 * 1024;

/// Failures of a single Instance's lifecycle/console operations.
#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("server is already running")]
    AlreadyRunning,
    #[error("server is not running")]
    NotRunning,
    #[error("spawn server process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("server process has no {0} pipe")]
    Pipe(&'static str),
    #[error("write to server console: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("task already exists: {0}")]
    Duplicate(String),
    #[error("task not found: {0}")]
    NotFound(String),
}

/// Error surface of the control interface and the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("server not found: {0}")]
    ServerNotFound(String),
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("server already registered: {0}")]
    AlreadyRegistered(String),
    #[error("invalid {field}: {message}")]
    Validation { field: &'static str, message: String },
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error(transparent)]
    Instance(#[from] InstanceError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    Store(StoreError),
    #[error("{failed} of {attempted} commands failed; last error: {last}")]
    PartialFailure {
        attempted: usize,
        failed: usize,
        last: Box<ControlError>,
    },
    #[error("properties file: {0}")]
    Properties(#[source] std::io::Error),
}

impl From<StoreError> for ControlError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(id) => ControlError::TaskNotFound(id),
            other => ControlError::Store(other),
        }
    }
}

impl ControlError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        ControlError::Validation {
            field,
            message: message.into(),
        }
    }

    /// Stable machine-readable class of the failure.
    pub fn code(&self) -> &'static str {
        match self {
            ControlError::Validation { .. }
            | ControlError::UnknownAction(_)
            | ControlError::Schedule(_) => "invalid_param",
            ControlError::ServerNotFound(_) | ControlError::TaskNotFound(_) => "not_found",
            ControlError::AlreadyRegistered(_)
            | ControlError::Instance(InstanceError::AlreadyRunning)
            | ControlError::Instance(InstanceError::NotRunning) => "state_conflict",
            ControlError::Instance(_) => "process_error",
            ControlError::PartialFailure { .. } => "partial_failure",
            ControlError::Store(_) | ControlError::Properties(_) => "store_error",
        }
    }

    fn hint(&self) -> Option<String> {
        let hint = match self {
            ControlError::Instance(InstanceError::AlreadyRunning) => {
                "Stop the server first, or wait until it reports STOPPED."
            }
            ControlError::Instance(InstanceError::NotRunning) => "Start the server first.",
            ControlError::Instance(InstanceError::Spawn(_)) => {
                "Ensure Java is installed and the server directory is readable."
            }
            ControlError::Schedule(_) => {
                "Use a 5-field cron expression (e.g. `0 4 * * *`) or `@every 30m`."
            }
            ControlError::UnknownAction(_) => "Use one of: start, stop, restart, command.",
            _ => return None,
        };
        Some(hint.to_string())
    }

    pub fn payload(&self) -> ErrorPayload {
        let field_errors = match self {
            ControlError::Validation { field, message } => {
                let mut m = BTreeMap::new();
                m.insert(field.to_string(), message.clone());
                Some(m)
            }
            ControlError::Schedule(_) => {
                let mut m = BTreeMap::new();
                m.insert("cron_expression".to_string(), self.to_string());
                Some(m)
            }
            _ => None,
        };
        ErrorPayload::new(self.code(), self.to_string(), field_errors, self.hint())
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_errors: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorPayload {
    pub fn new(
        code: &str,
        message: impl Into<String>,
        field_errors: Option<BTreeMap<String, String>>,
        hint: Option<String>,
    ) -> Self {
        let field_errors = field_errors.map(|mut m| {
            for v in m.values_mut() {
                *v = truncate_utf8(v, MAX_FIELD_ERROR_BYTES);
            }
            m
        });

        Self {
            code: code.to_string(),
            message: truncate_utf8(&message.into(), MAX_MESSAGE_BYTES),
            field_errors,
            hint: hint.map(|h| truncate_utf8(&h, MAX_HINT_BYTES)),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| "{\"code\":\"internal\",\"message\":\"serialize_failed\"}".to_string())
    }
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}
