use std::sync::Arc;

use anyhow::Context;
use crafteur_agent::{
    bootstrap::{self, DbServerStore},
    config::{AgentConfig, format_error_chain},
    registry::Registry,
    scheduler::Scheduler,
    task_store::DbTaskStore,
};
use crafteur_migration::Migrator;
use sea_orm_migration::MigratorTrait;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(cfg: &AgentConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match &cfg.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create log dir {}", dir.display()))?;
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(7)
                .filename_prefix("crafteur-agent")
                .filename_suffix("log")
                .build(dir)
                .context("open log file")?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}

async fn run(cfg: AgentConfig) -> anyhow::Result<()> {
    let servers_dir = cfg.servers_dir();
    tokio::fs::create_dir_all(&servers_dir)
        .await
        .with_context(|| format!("create {}", servers_dir.display()))?;

    let db = crafteur_db::connect(&cfg.database_url)
        .await
        .context("connect database")?;
    Migrator::up(&db, None).await.context("run migrations")?;

    let registry = Arc::new(Registry::new(cfg.instance_options()));
    let records = DbServerStore::new(db.clone())
        .list()
        .await
        .context("read server records")?;
    bootstrap::load_servers(&registry, &records, &servers_dir).await;

    let scheduler = Scheduler::new(registry.clone(), Arc::new(DbTaskStore::new(db)));
    scheduler
        .load_tasks()
        .await
        .context("load scheduled tasks")?;

    tracing::info!(
        data_root = %cfg.data_root.display(),
        java = %cfg.java_bin,
        "crafteur-agent ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    tracing::info!(grace = ?cfg.shutdown_grace, "shutdown requested");

    scheduler.shutdown().await;
    registry.shutdown(cfg.shutdown_grace).await;
    tracing::info!("crafteur-agent stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AgentConfig::from_env();
    let _log_guard = init_tracing(&cfg)?;

    if let Err(err) = run(cfg).await {
        tracing::error!(error = %format_error_chain(&err), "crafteur-agent failed");
        return Err(err);
    }
    Ok(())
}
