use std::{
    collections::HashMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use crafteur_process::{ScheduledTask, TaskAction};
use tokio::sync::Mutex;

use crate::{
    control::ServerControl,
    error::ControlError,
    schedule::Schedule,
    task_store::TaskStore,
    trigger::{TriggerEngine, TriggerHandle},
};

/// Pause between the stop and start halves of a scheduled restart.
pub const RESTART_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Registration {
    generation: u64,
    handle: TriggerHandle,
}

/// Binds persisted tasks to live triggers and runs their actions through [`ServerControl`].
///
/// `registrations` is only held for map updates, never across a task run.
/// Firings of one task id are serialized through `run_locks`.
pub struct Scheduler {
    this: Weak<Scheduler>,
    control: Arc<dyn ServerControl>,
    store: Arc<dyn TaskStore>,
    engine: TriggerEngine,
    registrations: Mutex<HashMap<String, Registration>>,
    run_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    next_generation: AtomicU64,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(control: Arc<dyn ServerControl>, store: Arc<dyn TaskStore>) -> Arc<Self> {
        Self::with_engine(control, store, TriggerEngine::new())
    }

    pub fn with_engine(
        control: Arc<dyn ServerControl>,
        store: Arc<dyn TaskStore>,
        engine: TriggerEngine,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            control,
            store,
            engine,
            registrations: Mutex::new(HashMap::new()),
            run_locks: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        })
    }

    /// Registers every persisted task. Tasks with a bad expression are logged and skipped.
    pub async fn load_tasks(&self) -> Result<usize, ControlError> {
        let tasks = self.store.list_tasks().await?;
        let mut registered = 0;
        for task in &tasks {
            match self.schedule_task(task).await {
                Ok(()) => registered += 1,
                Err(err) => {
                    tracing::warn!(task_id = %task.id, server_id = %task.server_id, error = %err, "skipping scheduled task");
                }
            }
        }
        tracing::info!(total = tasks.len(), registered, "scheduled tasks loaded");
        Ok(registered)
    }

    /// Replaces any trigger for `task.id`. On a parse error nothing stays registered for it.
    pub async fn schedule_task(&self, task: &ScheduledTask) -> Result<(), ControlError> {
        self.unschedule_task(&task.id).await;
        let schedule = Schedule::parse(&task.cron_expression)?;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let this = self.this.clone();
        let fired = Arc::new(task.clone());
        let handle = self.engine.register(schedule, move || {
            let this = this.clone();
            let task = fired.clone();
            async move {
                if let Some(scheduler) = this.upgrade() {
                    scheduler.fire(&task, generation).await;
                }
            }
        });

        tracing::debug!(task_id = %task.id, next_run = ?handle.next_run(), "task scheduled");
        self.registrations
            .lock()
            .await
            .insert(task.id.clone(), Registration { generation, handle });
        Ok(())
    }

    /// Returns whether a trigger was registered. Unknown ids are fine.
    pub async fn unschedule_task(&self, id: &str) -> bool {
        self.registrations.lock().await.remove(id).is_some()
    }

    pub async fn next_run(&self, id: &str) -> Option<DateTime<Utc>> {
        self.registrations
            .lock()
            .await
            .get(id)
            .and_then(|r| r.handle.next_run())
    }

    async fn is_current(&self, id: &str, generation: u64) -> bool {
        self.registrations
            .lock()
            .await
            .get(id)
            .is_some_and(|r| r.generation == generation)
    }

    async fn run_lock(&self, id: &str) -> Arc<Mutex<()>> {
        self.run_locks
            .lock()
            .await
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    async fn fire(&self, task: &ScheduledTask, generation: u64) {
        let lock = self.run_lock(&task.id).await;
        let _running = lock.lock().await;
        // A firing that waited behind a previous run may belong to a replaced registration.
        if !self.is_current(&task.id, generation).await {
            tracing::debug!(task_id = %task.id, "stale firing dropped");
            return;
        }

        tracing::info!(task_id = %task.id, server_id = %task.server_id, action = %task.action, "running scheduled task");
        match self.execute_task(task).await {
            Ok(()) => tracing::info!(task_id = %task.id, "scheduled task finished"),
            Err(err) => {
                tracing::warn!(task_id = %task.id, server_id = %task.server_id, error = %err, "scheduled task failed");
            }
        }

        if let Err(err) = self.store.update_last_run(&task.id, Utc::now()).await {
            tracing::warn!(task_id = %task.id, error = %err, "failed to record last run");
        }

        if task.one_shot {
            let mut registrations = self.registrations.lock().await;
            if registrations
                .get(&task.id)
                .is_some_and(|r| r.generation == generation)
            {
                registrations.remove(&task.id);
                drop(registrations);
                self.run_locks.lock().await.remove(&task.id);
                if let Err(err) = self.store.delete_task(&task.id).await {
                    tracing::warn!(task_id = %task.id, error = %err, "failed to delete one-shot task");
                }
                tracing::info!(task_id = %task.id, "one-shot task removed");
            }
        }
    }

    /// Runs the task's action once against the control surface.
    pub async fn execute_task(&self, task: &ScheduledTask) -> Result<(), ControlError> {
        let action: TaskAction = task
            .action
            .parse()
            .map_err(|_| ControlError::UnknownAction(task.action.clone()))?;

        match action {
            TaskAction::Start => self.control.start(&task.server_id).await,
            TaskAction::Stop => self.control.stop(&task.server_id).await,
            TaskAction::Restart => {
                let stopped = self.control.stop(&task.server_id).await;
                if let Err(err) = &stopped {
                    tracing::warn!(server_id = %task.server_id, error = %err, "stop before restart failed; starting anyway");
                }
                tokio::time::sleep(RESTART_DELAY).await;
                self.control.start(&task.server_id).await?;
                stopped
            }
            TaskAction::Command => self.send_lines(&task.server_id, &task.payload).await,
        }
    }

    async fn send_lines(&self, server_id: &str, payload: &str) -> Result<(), ControlError> {
        let mut attempted = 0;
        let mut failed = 0;
        let mut last = None;
        for line in payload.lines().map(str::trim).filter(|l| !l.is_empty()) {
            attempted += 1;
            if let Err(err) = self.control.send_command(server_id, line).await {
                tracing::warn!(server_id = %server_id, command = %line, error = %err, "scheduled command failed");
                failed += 1;
                last = Some(err);
            }
        }
        match last {
            None => Ok(()),
            Some(last) => Err(ControlError::PartialFailure {
                attempted,
                failed,
                last: Box::new(last),
            }),
        }
    }

    fn validate(task: &ScheduledTask) -> Result<(), ControlError> {
        if task.name.trim().is_empty() {
            return Err(ControlError::validation("name", "must not be empty"));
        }
        if task.server_id.trim().is_empty() {
            return Err(ControlError::validation("server_id", "must not be empty"));
        }
        task.action
            .parse::<TaskAction>()
            .map_err(|_| ControlError::UnknownAction(task.action.clone()))?;
        Schedule::parse(&task.cron_expression)?;
        Ok(())
    }

    async fn with_next_run(&self, mut task: ScheduledTask) -> ScheduledTask {
        task.next_run = self.next_run(&task.id).await;
        task
    }

    /// Validates, persists and registers a new task. An empty id gets a fresh uuid.
    pub async fn create_task(&self, mut task: ScheduledTask) -> Result<ScheduledTask, ControlError> {
        Self::validate(&task)?;
        if task.id.trim().is_empty() {
            task.id = uuid::Uuid::new_v4().to_string();
        }
        task.action = task.action.trim().to_ascii_lowercase();
        task.next_run = None;

        self.store.create_task(&task).await?;
        self.schedule_task(&task).await?;
        tracing::info!(task_id = %task.id, server_id = %task.server_id, "task created");
        Ok(self.with_next_run(task).await)
    }

    /// Replaces a task's definition and trigger; `last_run` is kept from storage.
    pub async fn update_task(&self, mut task: ScheduledTask) -> Result<ScheduledTask, ControlError> {
        Self::validate(&task)?;
        let existing = self
            .store
            .get_task(&task.id)
            .await?
            .ok_or_else(|| ControlError::TaskNotFound(task.id.clone()))?;
        task.action = task.action.trim().to_ascii_lowercase();
        task.last_run = existing.last_run;
        task.next_run = None;

        self.store.update_task(&task).await?;
        self.schedule_task(&task).await?;
        tracing::info!(task_id = %task.id, "task updated");
        Ok(self.with_next_run(task).await)
    }

    pub async fn delete_task(&self, id: &str) -> Result<(), ControlError> {
        self.unschedule_task(id).await;
        let deleted = self.store.delete_task(id).await?;
        self.run_locks.lock().await.remove(id);
        if !deleted {
            return Err(ControlError::TaskNotFound(id.to_string()));
        }
        tracing::info!(task_id = %id, "task deleted");
        Ok(())
    }

    pub async fn get_task(&self, id: &str) -> Result<ScheduledTask, ControlError> {
        let task = self
            .store
            .get_task(id)
            .await?
            .ok_or_else(|| ControlError::TaskNotFound(id.to_string()))?;
        Ok(self.with_next_run(task).await)
    }

    pub async fn list_tasks(&self) -> Result<Vec<ScheduledTask>, ControlError> {
        let tasks = self.store.list_tasks().await?;
        Ok(self.fill_next_runs(tasks).await)
    }

    pub async fn get_tasks_by_server(&self, server_id: &str) -> Result<Vec<ScheduledTask>, ControlError> {
        let tasks = self.store.tasks_by_server(server_id).await?;
        Ok(self.fill_next_runs(tasks).await)
    }

    async fn fill_next_runs(&self, mut tasks: Vec<ScheduledTask>) -> Vec<ScheduledTask> {
        let registrations = self.registrations.lock().await;
        for task in &mut tasks {
            task.next_run = registrations.get(&task.id).and_then(|r| r.handle.next_run());
        }
        tasks
    }

    pub async fn registered_count(&self) -> usize {
        self.registrations.lock().await.len()
    }

    /// Stops all triggers. Runs already in progress finish on their own.
    pub async fn shutdown(&self) {
        self.engine.shutdown();
        let dropped = {
            let mut registrations = self.registrations.lock().await;
            std::mem::take(&mut *registrations)
        };
        self.run_locks.lock().await.clear();
        tracing::info!(triggers = dropped.len(), "scheduler stopped");
    }
}
