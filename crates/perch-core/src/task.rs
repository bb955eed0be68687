//! Recurring units of work with their own scheduler.
//!
//! A [`PeriodicTask`] owns exactly one spawned tokio task driven by a
//! private interval. The first failed run ends that worker; the task is
//! then "done" and a supervisor is expected to replace it with
//! [`PeriodicTask::get_instance`]. A cancelled or shut down task is never
//! resumed.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{RecordKind, ResultBatch};
use crate::traits::{EventBus, Subscriber};

/// How long `shutdown` waits for an in-flight run before aborting it.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

/// Initial delay and repeat period of a recurring job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionSchedule {
    initial_delay: Duration,
    period: Duration,
}

impl ExecutionSchedule {
    pub fn new(initial_delay: Duration, period: Duration) -> Result<Self, AppError> {
        if period.is_zero() {
            return Err(AppError::SchedulingError(
                "Schedule period must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            initial_delay,
            period,
        })
    }

    /// Repeats every `period_ms` milliseconds, starting immediately.
    pub fn every_millis(period_ms: u64) -> Result<Self, AppError> {
        Self::new(Duration::ZERO, Duration::from_millis(period_ms))
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// A fresh interval honoring the initial delay.
    pub(crate) fn interval(&self) -> tokio::time::Interval {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.initial_delay, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }
}

impl Default for ExecutionSchedule {
    /// No delay, every three seconds.
    fn default() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            period: Duration::from_secs(3),
        }
    }
}

/// A unit of work run on every tick of a [`PeriodicTask`].
pub trait Task: Send + Sync + 'static {
    /// Produces the batch to publish for this tick.
    ///
    /// Returning `Err` ends the worker; the owning task then reports done.
    fn run(&self) -> impl Future<Output = Result<ResultBatch, AppError>> + Send;

    /// A fresh value with the same configuration and no execution history.
    fn spawn_replacement(&self) -> Self
    where
        Self: Sized;
}

/// Observable lifecycle of a [`PeriodicTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created, not yet started.
    Idle,
    Scheduled,
    /// The worker ended on its own (failed run or panic).
    Done,
    Cancelled,
    ShutDown,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Idle => write!(f, "idle"),
            TaskState::Scheduled => write!(f, "scheduled"),
            TaskState::Done => write!(f, "done"),
            TaskState::Cancelled => write!(f, "cancelled"),
            TaskState::ShutDown => write!(f, "shut-down"),
        }
    }
}

type Channels = Arc<Mutex<BTreeSet<String>>>;

pub struct PeriodicTask<T> {
    id: Uuid,
    task: Arc<T>,
    schedule: ExecutionSchedule,
    bus: Arc<dyn EventBus>,
    /// Channels published to; cleared on shutdown.
    channels: Channels,
    /// Every channel ever subscribed, carried over to replacements.
    configured_channels: BTreeSet<String>,
    cancel_token: CancellationToken,
    handle: Option<JoinHandle<()>>,
    shut_down: bool,
    shutdown_grace: Duration,
}

impl<T: Task> PeriodicTask<T> {
    pub fn new(task: T, schedule: ExecutionSchedule, bus: Arc<dyn EventBus>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task: Arc::new(task),
            schedule,
            bus,
            channels: Arc::new(Mutex::new(BTreeSet::new())),
            configured_channels: BTreeSet::new(),
            cancel_token: CancellationToken::new(),
            handle: None,
            shut_down: false,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn schedule(&self) -> ExecutionSchedule {
        self.schedule
    }

    pub fn task(&self) -> &T {
        &self.task
    }

    pub fn channels(&self) -> BTreeSet<String> {
        lock_channels(&self.channels).clone()
    }

    /// Schedules the unit of work at the initial delay, then every period.
    ///
    /// Fails if the task was already started or shut down, or if no tokio
    /// runtime is available.
    pub fn start(&mut self) -> Result<(), AppError> {
        if self.shut_down {
            return Err(AppError::SchedulingError(format!(
                "Task {} was shut down and cannot be restarted",
                self.id
            )));
        }
        if self.handle.is_some() {
            return Err(AppError::SchedulingError(format!(
                "Task {} is already started",
                self.id
            )));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| AppError::SchedulingError(format!("No runtime to schedule on: {e}")))?;

        let worker = Worker {
            id: self.id,
            task: Arc::clone(&self.task),
            bus: Arc::clone(&self.bus),
            channels: Arc::clone(&self.channels),
            cancel_token: self.cancel_token.clone(),
        };
        let ticker = self.schedule.interval();
        self.handle = Some(runtime.spawn(worker.run(ticker)));

        tracing::debug!(
            task_id = %self.id,
            delay_ms = self.schedule.initial_delay.as_millis() as u64,
            period_ms = self.schedule.period.as_millis() as u64,
            "Periodic task scheduled"
        );
        Ok(())
    }

    /// A new, unstarted task with the same unit of work, schedule, event
    /// bus and channels.
    pub fn get_instance(&self) -> PeriodicTask<T> {
        let mut replacement = PeriodicTask::new(
            self.task.spawn_replacement(),
            self.schedule,
            Arc::clone(&self.bus),
        )
        .with_shutdown_grace(self.shutdown_grace);

        *lock_channels(&replacement.channels) = self.configured_channels.clone();
        replacement.configured_channels = self.configured_channels.clone();
        replacement
    }

    /// Requests cancellation of the scheduled work.
    ///
    /// Returns true if the task is (now) cancelled; false if it was never
    /// started or already finished on its own.
    pub fn cancel(&self) -> bool {
        if self.is_cancelled() {
            return true;
        }
        match &self.handle {
            Some(handle) if !handle.is_finished() => {
                self.cancel_token.cancel();
                tracing::debug!(task_id = %self.id, "Periodic task cancelled");
                true
            }
            _ => false,
        }
    }

    /// Cancels, waits up to the grace period for the worker to exit, then
    /// releases it and clears the channel set. Idempotent.
    pub async fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.cancel_token.cancel();

        if let Some(handle) = self.handle.as_mut() {
            match tokio::time::timeout(self.shutdown_grace, &mut *handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_panic() => {
                    tracing::warn!(task_id = %self.id, "Periodic task worker panicked");
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    tracing::warn!(
                        task_id = %self.id,
                        grace_ms = self.shutdown_grace.as_millis() as u64,
                        "Periodic task did not stop in time, aborting"
                    );
                    handle.abort();
                }
            }
        }

        lock_channels(&self.channels).clear();
        self.shut_down = true;
        tracing::debug!(task_id = %self.id, "Periodic task shut down");
    }

    /// Registers `subscribers` for batches of `kind` published on `channel`.
    pub fn subscribe<I>(&mut self, channel: &str, kind: RecordKind, subscribers: I) -> Result<(), AppError>
    where
        I: IntoIterator<Item = Arc<dyn Subscriber>>,
    {
        if channel.trim().is_empty() {
            return Err(AppError::ConfigError(
                "Channel name must not be empty".to_string(),
            ));
        }
        let subscribers: Vec<_> = subscribers.into_iter().collect();
        if subscribers.is_empty() {
            return Err(AppError::ConfigError(format!(
                "No subscribers given for channel '{channel}'"
            )));
        }

        for subscriber in subscribers {
            self.bus.subscribe(channel, kind, subscriber)?;
        }
        lock_channels(&self.channels).insert(channel.to_string());
        self.configured_channels.insert(channel.to_string());
        Ok(())
    }

    /// Sends `batch` to every subscribed channel.
    pub fn publish(&self, batch: ResultBatch) -> usize {
        publish_to(self.bus.as_ref(), &self.channels, Arc::new(batch))
    }

    /// True once the worker has ended, for any reason.
    pub fn is_done(&self) -> bool {
        match &self.handle {
            Some(handle) => handle.is_finished() || self.cancel_token.is_cancelled(),
            None => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_some() && self.cancel_token.is_cancelled()
    }

    pub fn state(&self) -> TaskState {
        if self.shut_down {
            TaskState::ShutDown
        } else if self.handle.is_none() {
            TaskState::Idle
        } else if self.cancel_token.is_cancelled() {
            TaskState::Cancelled
        } else if self.is_done() {
            TaskState::Done
        } else {
            TaskState::Scheduled
        }
    }
}

impl<T> fmt::Debug for PeriodicTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("id", &self.id)
            .field("schedule", &self.schedule)
            .field("configured_channels", &self.configured_channels)
            .field("started", &self.handle.is_some())
            .field("shut_down", &self.shut_down)
            .finish()
    }
}

impl<T> Drop for PeriodicTask<T> {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

fn lock_channels(channels: &Mutex<BTreeSet<String>>) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
    channels.lock().unwrap_or_else(PoisonError::into_inner)
}

fn publish_to(bus: &dyn EventBus, channels: &Mutex<BTreeSet<String>>, batch: Arc<ResultBatch>) -> usize {
    let targets = lock_channels(channels).clone();
    targets
        .iter()
        .map(|channel| bus.publish(channel, Arc::clone(&batch)))
        .sum()
}

/// State moved into the spawned worker.
struct Worker<T> {
    id: Uuid,
    task: Arc<T>,
    bus: Arc<dyn EventBus>,
    channels: Channels,
    cancel_token: CancellationToken,
}

impl<T: Task> Worker<T> {
    async fn run(self, mut ticker: tokio::time::Interval) {
        let mut ticks: u64 = 0;
        loop {
            tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // Dropping the run future abandons any in-flight provider call.
            let outcome = tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => break,
                outcome = self.task.run() => outcome,
            };
            ticks += 1;

            match outcome {
                Ok(batch) => {
                    let records: usize = batch.kinds().map(|k| batch.len(k)).sum();
                    let deliveries = publish_to(self.bus.as_ref(), &self.channels, Arc::new(batch));
                    tracing::debug!(task_id = %self.id, tick = ticks, records, deliveries, "Tick completed");
                }
                Err(e) => {
                    tracing::warn!(task_id = %self.id, tick = ticks, error = %e, "Periodic task failed, worker exiting");
                    break;
                }
            }
        }
        tracing::debug!(task_id = %self.id, ticks, "Periodic task worker stopped");
    }
}
