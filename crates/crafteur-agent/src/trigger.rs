//! Timer tasks that fire callbacks on a [`Schedule`].

use std::{fmt, future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, Local, Utc};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::schedule::Schedule;

/// Longest single sleep; the wall clock is re-read after each one so clock
/// adjustments are picked up.
const MAX_SLEEP: Duration = Duration::from_secs(60);

pub type Clock = Arc<dyn Fn() -> DateTime<Local> + Send + Sync>;

#[derive(Clone)]
pub struct TriggerEngine {
    clock: Clock,
    shutdown: CancellationToken,
}

impl fmt::Debug for TriggerEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerEngine")
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Default for TriggerEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TriggerEngine {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(Local::now))
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self {
            clock,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn now(&self) -> DateTime<Local> {
        (self.clock)()
    }

    /// Starts a timer task firing `callback` at every occurrence of `schedule`.
    ///
    /// Each firing runs on its own spawned task; a slow callback never delays the
    /// next occurrence. Dropping the handle stops future firings but not one already running.
    pub fn register<F, Fut>(&self, schedule: Schedule, callback: F) -> TriggerHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let first = schedule.next_after(&self.now());
        let (next_tx, next_rx) = watch::channel(first.as_ref().map(|t| t.with_timezone(&Utc)));
        let cancel = self.shutdown.child_token();
        let task = tokio::spawn(run_trigger(
            schedule,
            first,
            callback,
            self.clock.clone(),
            next_tx,
            cancel.clone(),
        ));
        TriggerHandle {
            next_run: next_rx,
            cancel,
            task,
        }
    }

    /// Stops every trigger registered through this engine.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[derive(Debug)]
pub struct TriggerHandle {
    next_run: watch::Receiver<Option<DateTime<Utc>>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TriggerHandle {
    /// Upcoming firing; `None` once the schedule is exhausted or the trigger stopped.
    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        *self.next_run.borrow()
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && !self.task.is_finished()
    }
}

impl Drop for TriggerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

async fn run_trigger<F, Fut>(
    schedule: Schedule,
    first: Option<DateTime<Local>>,
    callback: F,
    clock: Clock,
    next_tx: watch::Sender<Option<DateTime<Utc>>>,
    cancel: CancellationToken,
) where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut next = first;
    while let Some(at) = next {
        loop {
            let now = clock();
            if now >= at {
                break;
            }
            let wait = (at - now).to_std().unwrap_or_default().min(MAX_SLEEP);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        if cancel.is_cancelled() {
            return;
        }

        tokio::spawn(callback());

        // Never compute from a point before the firing we just did.
        let after = at.max(clock());
        next = schedule.next_after(&after);
        next_tx.send_replace(next.as_ref().map(|t| t.with_timezone(&Utc)));
    }
    tracing::debug!("trigger schedule exhausted");
}

#[cfg(test)]
pub(crate) fn paused_clock() -> Clock {
    use chrono::Timelike;

    // Anchored on a whole second and driven by tokio's (pausable) clock.
    let base = Local::now().with_nanosecond(0).unwrap_or_else(Local::now);
    let started = tokio::time::Instant::now();
    Arc::new(move || {
        base + chrono::Duration::from_std(started.elapsed()).unwrap_or_default()
    })
}
