use std::{path::PathBuf, time::Duration};

use crate::instance::InstanceOptions;

const DEFAULT_SUBSCRIBER_CAPACITY: usize = 100;
const DEFAULT_STATS_INTERVAL_MS: u64 = 1000;
const DEFAULT_SHUTDOWN_GRACE_SEC: u64 = 30;

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub data_root: PathBuf,
    pub database_url: String,
    pub java_bin: String,
    pub subscriber_capacity: usize,
    pub stats_interval: Duration,
    pub shutdown_grace: Duration,
    pub log_dir: Option<PathBuf>,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let data_root = data_root(env_string("CRAFTEUR_DATA_ROOT"));
        let database_url = env_string("DATABASE_URL").unwrap_or_else(|| {
            format!(
                "sqlite://{}?mode=rwc",
                data_root.join("crafteur.db").display()
            )
        });

        Self {
            database_url,
            java_bin: env_string("CRAFTEUR_JAVA_BIN").unwrap_or_else(|| "java".to_string()),
            subscriber_capacity: env_usize("CRAFTEUR_SUBSCRIBER_CAPACITY")
                .map(|v| v.clamp(8, 10_000))
                .unwrap_or(DEFAULT_SUBSCRIBER_CAPACITY),
            stats_interval: Duration::from_millis(
                env_u64("CRAFTEUR_STATS_INTERVAL_MS")
                    .map(|v| v.clamp(250, 60_000))
                    .unwrap_or(DEFAULT_STATS_INTERVAL_MS),
            ),
            shutdown_grace: Duration::from_secs(
                env_u64("CRAFTEUR_SHUTDOWN_GRACE_SEC")
                    .map(|v| v.clamp(1, 600))
                    .unwrap_or(DEFAULT_SHUTDOWN_GRACE_SEC),
            ),
            log_dir: env_string("CRAFTEUR_LOG_DIR").map(PathBuf::from),
            data_root,
        }
    }

    /// Each server runs inside `<data_root>/servers/<id>`.
    pub fn servers_dir(&self) -> PathBuf {
        self.data_root.join("servers")
    }

    pub fn instance_options(&self) -> InstanceOptions {
        InstanceOptions {
            java_bin: self.java_bin.clone(),
            subscriber_capacity: self.subscriber_capacity,
            stats_interval: self.stats_interval,
        }
    }
}

fn data_root(raw: Option<String>) -> PathBuf {
    let p = PathBuf::from(raw.unwrap_or_else(|| "./data".to_string()));
    let abs = if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    };

    // Best-effort canonicalization: don't fail if the directory doesn't exist yet.
    std::fs::canonicalize(&abs).unwrap_or(abs)
}

pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}
