//! Persisted server records and their registration at startup.

use std::path::Path;

use chrono::{DateTime, Utc};
use crafteur_db::{
    entities::servers,
    sea_orm::{DatabaseConnection, EntityTrait, QueryOrder, Set},
};

use crate::{
    error::{ControlError, StoreError},
    registry::{Registry, server_dir},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRecord {
    pub id: String,
    pub name: String,
    pub server_type: String,
    pub version: String,
    pub port: u16,
    pub ram_mb: u32,
    pub jar_name: String,
    pub created_at: DateTime<Utc>,
}

impl From<servers::Model> for ServerRecord {
    fn from(m: servers::Model) -> Self {
        Self {
            id: m.id,
            name: m.name,
            server_type: m.server_type,
            version: m.version,
            port: u16::try_from(m.port).unwrap_or(0),
            ram_mb: u32::try_from(m.ram_mb).unwrap_or(0),
            jar_name: m.jar_name,
            created_at: m.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DbServerStore {
    db: DatabaseConnection,
}

impl DbServerStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn list(&self) -> Result<Vec<ServerRecord>, StoreError> {
        let rows = servers::Entity::find()
            .order_by_asc(servers::Column::CreatedAt)
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().map(ServerRecord::from).collect())
    }

    pub async fn insert(&self, record: &ServerRecord) -> Result<(), StoreError> {
        if servers::Entity::find_by_id(record.id.clone())
            .one(&self.db)
            .await?
            .is_some()
        {
            return Err(StoreError::Duplicate(record.id.clone()));
        }
        let row = servers::ActiveModel {
            id: Set(record.id.clone()),
            name: Set(record.name.clone()),
            server_type: Set(record.server_type.clone()),
            version: Set(record.version.clone()),
            port: Set(i32::from(record.port)),
            ram_mb: Set(i32::try_from(record.ram_mb).unwrap_or(i32::MAX)),
            jar_name: Set(record.jar_name.clone()),
            created_at: Set(record.created_at),
        };
        servers::Entity::insert(row).exec(&self.db).await?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadReport {
    pub registered: usize,
    pub skipped: usize,
}

/// Registers an Instance for every record whose directory exists under `servers_root`.
///
/// Missing directories, ids that are already registered and invalid records are
/// logged and skipped; none of them aborts the load.
pub async fn load_servers(
    registry: &Registry,
    records: &[ServerRecord],
    servers_root: &Path,
) -> LoadReport {
    let mut report = LoadReport::default();
    for record in records {
        match load_one(registry, record, servers_root).await {
            Ok(true) => report.registered += 1,
            Ok(false) => report.skipped += 1,
            Err(err) => {
                tracing::warn!(server_id = %record.id, error = %err, "skipping server record");
                report.skipped += 1;
            }
        }
    }
    tracing::info!(
        registered = report.registered,
        skipped = report.skipped,
        "servers loaded"
    );
    report
}

async fn load_one(
    registry: &Registry,
    record: &ServerRecord,
    servers_root: &Path,
) -> Result<bool, ControlError> {
    if registry.contains(&record.id).await {
        tracing::debug!(server_id = %record.id, "already registered");
        return Ok(false);
    }

    let run_dir = server_dir(servers_root, &record.id)?;
    if !tokio::fs::metadata(&run_dir)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
    {
        tracing::warn!(server_id = %record.id, dir = %run_dir.display(), "server directory missing");
        return Ok(false);
    }

    match registry
        .add_instance(&record.id, run_dir, &record.jar_name)
        .await
    {
        Ok(_) => {}
        // Lost a race with a concurrent registration.
        Err(ControlError::AlreadyRegistered(_)) => return Ok(false),
        Err(err) => return Err(err),
    }
    if let Err(err) = registry.set_ram(&record.id, record.ram_mb).await {
        tracing::warn!(server_id = %record.id, error = %err, "stored ram_mb ignored; using default heap");
    }
    Ok(true)
}
