//! Bounded task pool: at most `limit` units in flight, results in completion order.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub enum TaskOutcome<T> {
    Finished(T),
    /// Cancelled while still waiting for a slot; the unit never ran.
    NotStarted,
    Panicked(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

pub struct BoundedTaskPool<T> {
    join_set: JoinSet<TaskOutcome<T>>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    limit: usize,
    submitted: usize,
    completed: usize,
}

impl<T: Send + 'static> BoundedTaskPool<T> {
    pub fn new(limit: usize, cancel: CancellationToken) -> Self {
        let limit = limit.max(1);
        Self {
            join_set: JoinSet::new(),
            permits: Arc::new(Semaphore::new(limit)),
            cancel,
            limit,
            submitted: 0,
            completed: 0,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Queues `unit`. It starts once a slot is free and receives the pool's
    /// cancellation token; observing it after start is the unit's job.
    pub fn submit<F, Fut>(&mut self, unit: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let cancel = self.cancel.clone();
        self.join_set.spawn(async move {
            let _permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return TaskOutcome::NotStarted,
                permit = permits.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return TaskOutcome::NotStarted,
                },
            };
            TaskOutcome::Finished(unit(cancel).await)
        });
        self.submitted += 1;
    }

    /// Next finished unit, or `None` once every submitted unit is accounted for.
    pub async fn next(&mut self) -> Option<TaskOutcome<T>> {
        let joined = self.join_set.join_next().await?;
        self.completed += 1;
        Some(match joined {
            Ok(outcome) => outcome,
            Err(err) => TaskOutcome::Panicked(err.to_string()),
        })
    }

    pub fn progress(&self) -> Progress {
        Progress {
            completed: self.completed,
            total: self.submitted,
        }
    }
}

/// Emits a progress event at most every interval, plus once at the end.
pub struct ProgressLog {
    stage: &'static str,
    started_at: Instant,
    last_logged_at: Instant,
    interval: Duration,
}

impl ProgressLog {
    pub fn new(stage: &'static str) -> Self {
        let now = Instant::now();
        Self {
            stage,
            started_at: now,
            last_logged_at: now,
            interval: Duration::from_secs(2),
        }
    }

    pub fn observe(&mut self, progress: Progress, failed: usize) {
        let finished = progress.completed == progress.total;
        if !finished && self.last_logged_at.elapsed() < self.interval {
            return;
        }
        tracing::info!(
            stage = self.stage,
            done = progress.completed,
            total = progress.total,
            failed,
            elapsed_ms = self.started_at.elapsed().as_millis() as u64,
            "progress"
        );
        self.last_logged_at = Instant::now();
    }
}
