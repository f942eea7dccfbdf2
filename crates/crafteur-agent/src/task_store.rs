//! Persistence of scheduled task definitions.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crafteur_db::{
    entities::scheduled_tasks,
    sea_orm::{
        ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
        Set, sea_query::Expr,
    },
};
use crafteur_process::ScheduledTask;
use tokio::sync::RwLock;

use crate::error::StoreError;

/// CRUD over persisted tasks. `next_run` is never stored; implementations return it unset.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn list_tasks(&self) -> Result<Vec<ScheduledTask>, StoreError>;
    async fn tasks_by_server(&self, server_id: &str) -> Result<Vec<ScheduledTask>, StoreError>;
    async fn get_task(&self, id: &str) -> Result<Option<ScheduledTask>, StoreError>;
    async fn create_task(&self, task: &ScheduledTask) -> Result<(), StoreError>;
    async fn update_task(&self, task: &ScheduledTask) -> Result<(), StoreError>;
    /// Returns `false` if there was nothing to delete.
    async fn delete_task(&self, id: &str) -> Result<bool, StoreError>;
    async fn update_last_run(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<BTreeMap<String, ScheduledTask>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn stored(task: &ScheduledTask) -> ScheduledTask {
    ScheduledTask {
        next_run: None,
        ..task.clone()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn list_tasks(&self) -> Result<Vec<ScheduledTask>, StoreError> {
        Ok(self.tasks.read().await.values().cloned().collect())
    }

    async fn tasks_by_server(&self, server_id: &str) -> Result<Vec<ScheduledTask>, StoreError> {
        Ok(self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.server_id == server_id)
            .cloned()
            .collect())
    }

    async fn get_task(&self, id: &str) -> Result<Option<ScheduledTask>, StoreError> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn create_task(&self, task: &ScheduledTask) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(StoreError::Duplicate(task.id.clone()));
        }
        tasks.insert(task.id.clone(), stored(task));
        Ok(())
    }

    async fn update_task(&self, task: &ScheduledTask) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        let slot = tasks
            .get_mut(&task.id)
            .ok_or_else(|| StoreError::NotFound(task.id.clone()))?;
        *slot = stored(task);
        Ok(())
    }

    async fn delete_task(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.tasks.write().await.remove(id).is_some())
    }

    async fn update_last_run(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        task.last_run = Some(at);
        Ok(())
    }
}

/// `scheduled_tasks` table through sea-orm.
#[derive(Debug, Clone)]
pub struct DbTaskStore {
    db: DatabaseConnection,
}

impl DbTaskStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

fn from_model(m: scheduled_tasks::Model) -> ScheduledTask {
    ScheduledTask {
        id: m.id,
        server_id: m.server_id,
        name: m.name,
        action: m.action,
        payload: m.payload,
        cron_expression: m.cron_expression,
        one_shot: m.one_shot,
        last_run: m.last_run,
        next_run: None,
    }
}

#[async_trait]
impl TaskStore for DbTaskStore {
    async fn list_tasks(&self) -> Result<Vec<ScheduledTask>, StoreError> {
        let rows = scheduled_tasks::Entity::find()
            .order_by_asc(scheduled_tasks::Column::CreatedAt)
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().map(from_model).collect())
    }

    async fn tasks_by_server(&self, server_id: &str) -> Result<Vec<ScheduledTask>, StoreError> {
        let rows = scheduled_tasks::Entity::find()
            .filter(scheduled_tasks::Column::ServerId.eq(server_id))
            .order_by_asc(scheduled_tasks::Column::CreatedAt)
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().map(from_model).collect())
    }

    async fn get_task(&self, id: &str) -> Result<Option<ScheduledTask>, StoreError> {
        let row = scheduled_tasks::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await?;
        Ok(row.map(from_model))
    }

    async fn create_task(&self, task: &ScheduledTask) -> Result<(), StoreError> {
        if self.get_task(&task.id).await?.is_some() {
            return Err(StoreError::Duplicate(task.id.clone()));
        }
        let row = scheduled_tasks::ActiveModel {
            id: Set(task.id.clone()),
            server_id: Set(task.server_id.clone()),
            name: Set(task.name.clone()),
            action: Set(task.action.clone()),
            payload: Set(task.payload.clone()),
            cron_expression: Set(task.cron_expression.clone()),
            one_shot: Set(task.one_shot),
            last_run: Set(task.last_run),
            created_at: Set(Utc::now()),
        };
        scheduled_tasks::Entity::insert(row).exec(&self.db).await?;
        Ok(())
    }

    async fn update_task(&self, task: &ScheduledTask) -> Result<(), StoreError> {
        let Some(existing) = scheduled_tasks::Entity::find_by_id(task.id.clone())
            .one(&self.db)
            .await?
        else {
            return Err(StoreError::NotFound(task.id.clone()));
        };

        let mut row: scheduled_tasks::ActiveModel = existing.into();
        row.server_id = Set(task.server_id.clone());
        row.name = Set(task.name.clone());
        row.action = Set(task.action.clone());
        row.payload = Set(task.payload.clone());
        row.cron_expression = Set(task.cron_expression.clone());
        row.one_shot = Set(task.one_shot);
        row.last_run = Set(task.last_run);
        row.update(&self.db).await?;
        Ok(())
    }

    async fn delete_task(&self, id: &str) -> Result<bool, StoreError> {
        let res = scheduled_tasks::Entity::delete_by_id(id.to_string())
            .exec(&self.db)
            .await?;
        Ok(res.rows_affected > 0)
    }

    async fn update_last_run(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let res = scheduled_tasks::Entity::update_many()
            .col_expr(scheduled_tasks::Column::LastRun, Expr::value(at))
            .filter(scheduled_tasks::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        if res.rows_affected == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }
}
