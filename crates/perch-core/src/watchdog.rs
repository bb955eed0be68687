//! Supervision of a single [`PeriodicTask`].
//!
//! The watchdog polls on its own interval. Each tick is one bounded
//! check-and-act step: if the supervised task has died it is force-stopped
//! and, unless the supervision budget has run out, replaced by a fresh
//! instance. Once the budget is exhausted the watchdog stops for good.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AppError;
use crate::task::{ExecutionSchedule, PeriodicTask, Task};

/// Default overall supervision budget.
pub const DEFAULT_SUPERVISION_BUDGET: Duration = Duration::from_secs(12 * 60);

/// Events emitted by the watchdog for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WatchdogEvent<'a> {
    Started {
        watchdog_id: Uuid,
        task_id: Uuid,
        budget: Duration,
    },
    TaskAlive {
        task_id: Uuid,
    },
    TaskDied {
        task_id: Uuid,
    },
    TaskRestarted {
        previous_id: Uuid,
        task_id: Uuid,
        restarts: u64,
    },
    BudgetExhausted {
        watchdog_id: Uuid,
        restarts: u64,
    },
    TickFailed {
        error: &'a str,
    },
    Stopped {
        watchdog_id: Uuid,
    },
}

/// Trait for receiving watchdog events (decoupled logging).
pub trait WatchdogReporter: Send + Sync + 'static {
    fn report(&self, event: WatchdogEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWatchdogReporter;

impl WatchdogReporter for TracingWatchdogReporter {
    fn report(&self, event: WatchdogEvent<'_>) {
        match event {
            WatchdogEvent::Started {
                watchdog_id,
                task_id,
                budget,
            } => {
                tracing::info!(
                    %watchdog_id,
                    %task_id,
                    budget_secs = budget.as_secs(),
                    "Watchdog started"
                );
            }
            WatchdogEvent::TaskAlive { task_id } => {
                tracing::trace!(%task_id, "Supervised task alive");
            }
            WatchdogEvent::TaskDied { task_id } => {
                tracing::warn!(%task_id, "Supervised task stopped");
            }
            WatchdogEvent::TaskRestarted {
                previous_id,
                task_id,
                restarts,
            } => {
                tracing::info!(%previous_id, %task_id, restarts, "Task restarted");
            }
            WatchdogEvent::BudgetExhausted {
                watchdog_id,
                restarts,
            } => {
                tracing::info!(%watchdog_id, restarts, "Supervision budget exhausted, quitting watching duties");
            }
            WatchdogEvent::TickFailed { error } => {
                tracing::error!(%error, "Watchdog tick failed");
            }
            WatchdogEvent::Stopped { watchdog_id } => {
                tracing::info!(%watchdog_id, "Watchdog stopped");
            }
        }
    }
}

/// Outcome of one supervision tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The task is still scheduled.
    Alive,
    /// The task had died and a replacement was started.
    Restarted,
    /// The watchdog is no longer watching.
    Stopped,
}

struct Shared<T, R> {
    id: Uuid,
    task: AsyncMutex<PeriodicTask<T>>,
    schedule: ExecutionSchedule,
    budget: Duration,
    deadline: OnceLock<Instant>,
    started: AtomicBool,
    done: AtomicBool,
    restarts: AtomicU64,
    cancel_token: CancellationToken,
    reporter: R,
}

pub struct Watchdog<T, R = TracingWatchdogReporter> {
    shared: Arc<Shared<T, R>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Task> Watchdog<T, TracingWatchdogReporter> {
    /// Watches `task`, polling every 500ms with the default budget.
    pub fn new(task: PeriodicTask<T>) -> Self {
        Self::with_reporter(
            task,
            ExecutionSchedule::new(Duration::ZERO, Duration::from_millis(500))
                .unwrap_or_default(),
            DEFAULT_SUPERVISION_BUDGET,
            TracingWatchdogReporter,
        )
    }

    pub fn with_schedule(task: PeriodicTask<T>, schedule: ExecutionSchedule, budget: Duration) -> Self {
        Self::with_reporter(task, schedule, budget, TracingWatchdogReporter)
    }
}

impl<T: Task, R: WatchdogReporter> Watchdog<T, R> {
    pub fn with_reporter(
        task: PeriodicTask<T>,
        schedule: ExecutionSchedule,
        budget: Duration,
        reporter: R,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                task: AsyncMutex::new(task),
                schedule,
                budget,
                deadline: OnceLock::new(),
                started: AtomicBool::new(false),
                done: AtomicBool::new(false),
                restarts: AtomicU64::new(0),
                cancel_token: CancellationToken::new(),
                reporter,
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn schedule(&self) -> ExecutionSchedule {
        self.shared.schedule
    }

    pub fn budget(&self) -> Duration {
        self.shared.budget
    }

    /// The give-up-by instant, once watching has started.
    pub fn deadline(&self) -> Option<Instant> {
        self.shared.deadline.get().copied()
    }

    /// Number of replacement tasks started so far.
    pub fn restarts(&self) -> u64 {
        self.shared.restarts.load(Ordering::SeqCst)
    }

    /// Id of the task currently under supervision.
    pub async fn task_id(&self) -> Uuid {
        self.shared.task.lock().await.id()
    }

    /// Sets the deadline, starts the supervised task, then begins polling.
    ///
    /// A watchdog watches once; starting it again, or after it stopped, is
    /// a scheduling error.
    pub async fn start_watching(&self) -> Result<(), AppError> {
        if self.has_stopped_watching() {
            return Err(AppError::SchedulingError(format!(
                "Watchdog {} has stopped and cannot be restarted",
                self.shared.id
            )));
        }
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Err(AppError::SchedulingError(format!(
                "Watchdog {} is already watching",
                self.shared.id
            )));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| AppError::SchedulingError(format!("No runtime to supervise on: {e}")))?;

        let _ = self
            .shared
            .deadline
            .set(Instant::now() + self.shared.budget);

        let task_id = {
            let mut task = self.shared.task.lock().await;
            task.start()?;
            task.id()
        };

        self.shared.reporter.report(WatchdogEvent::Started {
            watchdog_id: self.shared.id,
            task_id,
            budget: self.shared.budget,
        });

        let shared = Arc::clone(&self.shared);
        let handle = runtime.spawn(async move { shared.supervise().await });
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Stops polling. Idempotent; the supervised task is left as is.
    pub fn stop_watching(&self) {
        self.shared.stop_watching();
    }

    pub fn has_stopped_watching(&self) -> bool {
        self.shared.done.load(Ordering::SeqCst)
    }

    /// A fresh, unstarted instance of the supervised task.
    pub async fn retry(&self) -> PeriodicTask<T> {
        self.shared.task.lock().await.get_instance()
    }

    /// Ends the current task instance so the next tick treats it as dead.
    ///
    /// Lets a consumer close out a healthy task's run, which in turn lets
    /// the supervision budget take effect. Returns false when the task was
    /// not running.
    pub async fn recycle(&self) -> bool {
        let task = self.shared.task.lock().await;
        tracing::debug!(task_id = %task.id(), "Recycling supervised task");
        task.cancel()
    }

    /// Runs a single supervision step immediately.
    pub async fn tick(&self) -> Result<Verdict, AppError> {
        self.shared.tick().await
    }

    /// Stops watching, waits for the polling loop to exit, then shuts the
    /// supervised task down.
    pub async fn shutdown(&self) {
        self.stop_watching();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
            && e.is_panic()
        {
            tracing::warn!(watchdog_id = %self.shared.id, "Watchdog loop panicked");
        }
        self.shared.task.lock().await.shutdown().await;
    }
}

impl<T: Task, R: WatchdogReporter> Shared<T, R> {
    async fn supervise(self: Arc<Self>) {
        let mut ticker = self.schedule.interval();
        loop {
            tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.tick().await {
                Ok(Verdict::Stopped) => break,
                Ok(_) => {}
                Err(e) => {
                    let error = e.to_string();
                    self.reporter.report(WatchdogEvent::TickFailed { error: &error });
                }
            }
        }
    }

    async fn tick(&self) -> Result<Verdict, AppError> {
        if self.done.load(Ordering::SeqCst) {
            return Ok(Verdict::Stopped);
        }

        let mut task = self.task.lock().await;
        if !task.is_done() {
            self.reporter.report(WatchdogEvent::TaskAlive { task_id: task.id() });
            return Ok(Verdict::Alive);
        }

        let previous_id = task.id();
        self.reporter.report(WatchdogEvent::TaskDied {
            task_id: previous_id,
        });
        task.cancel();
        task.shutdown().await;

        if self.deadline_passed() {
            self.reporter.report(WatchdogEvent::BudgetExhausted {
                watchdog_id: self.id,
                restarts: self.restarts.load(Ordering::SeqCst),
            });
            self.stop_watching();
            return Ok(Verdict::Stopped);
        }

        let mut replacement = task.get_instance();
        replacement.start()?;
        *task = replacement;
        let restarts = self.restarts.fetch_add(1, Ordering::SeqCst) + 1;

        self.reporter.report(WatchdogEvent::TaskRestarted {
            previous_id,
            task_id: task.id(),
            restarts,
        });
        Ok(Verdict::Restarted)
    }

    fn deadline_passed(&self) -> bool {
        self.deadline
            .get()
            .is_some_and(|deadline| Instant::now() >= *deadline)
    }

    fn stop_watching(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_token.cancel();
        self.reporter.report(WatchdogEvent::Stopped {
            watchdog_id: self.id,
        });
    }
}

impl<T, R> fmt::Debug for Watchdog<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watchdog")
            .field("id", &self.shared.id)
            .field("watching", &!self.shared.done.load(Ordering::SeqCst))
            .field("schedule", &self.shared.schedule)
            .field("budget", &self.shared.budget)
            .field("restarts", &self.shared.restarts.load(Ordering::SeqCst))
            .finish()
    }
}

impl<T, R> Drop for Watchdog<T, R> {
    fn drop(&mut self) {
        self.shared.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::bus::LocalEventBus;
    use crate::testutil::ScriptedTask;
    use crate::traits::EventBus;

    #[derive(Clone, Default)]
    struct CountingReporter {
        stopped: Arc<StdMutex<u32>>,
        restarted: Arc<StdMutex<u32>>,
    }

    impl WatchdogReporter for CountingReporter {
        fn report(&self, event: WatchdogEvent<'_>) {
            match event {
                WatchdogEvent::Stopped { .. } => *self.stopped.lock().unwrap() += 1,
                WatchdogEvent::TaskRestarted { .. } => *self.restarted.lock().unwrap() += 1,
                _ => {}
            }
        }
    }

    fn periodic(script: ScriptedTask) -> PeriodicTask<ScriptedTask> {
        let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
        PeriodicTask::new(script, ExecutionSchedule::every_millis(20).unwrap(), bus)
    }

    fn watchdog_with(
        script: ScriptedTask,
        budget: Duration,
        reporter: CountingReporter,
    ) -> Watchdog<ScriptedTask, CountingReporter> {
        Watchdog::with_reporter(
            periodic(script),
            // Only manual ticks during these tests.
            ExecutionSchedule::new(Duration::from_secs(3600), Duration::from_secs(3600)).unwrap(),
            budget,
            reporter,
        )
    }

    async fn wait_for_death(watchdog: &Watchdog<ScriptedTask, CountingReporter>) {
        for _ in 0..100 {
            if watchdog.shared.task.lock().await.is_done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("supervised task never died");
    }

    #[tokio::test]
    async fn tick_reports_alive_task_promptly() {
        let watchdog = watchdog_with(
            ScriptedTask::succeeding(),
            Duration::from_secs(60),
            CountingReporter::default(),
        );
        watchdog.start_watching().await.unwrap();

        let verdict = tokio::time::timeout(Duration::from_millis(200), watchdog.tick())
            .await
            .expect("tick should be bounded")
            .unwrap();
        assert_eq!(verdict, Verdict::Alive);
        assert_eq!(watchdog.restarts(), 0);
        watchdog.shutdown().await;
    }

    #[tokio::test]
    async fn dead_task_is_replaced_within_budget() {
        let script = ScriptedTask::failing(AppError::Timeout(1));
        let reporter = CountingReporter::default();
        let watchdog = watchdog_with(script.clone(), Duration::from_secs(60), reporter.clone());
        watchdog.start_watching().await.unwrap();
        let first_id = watchdog.task_id().await;
        wait_for_death(&watchdog).await;

        assert_eq!(watchdog.tick().await.unwrap(), Verdict::Restarted);
        assert_eq!(watchdog.restarts(), 1);
        assert_eq!(script.replacements(), 1);
        assert_ne!(watchdog.task_id().await, first_id);
        assert_eq!(*reporter.restarted.lock().unwrap(), 1);
        assert!(!watchdog.has_stopped_watching());
        watchdog.shutdown().await;
    }

    #[tokio::test]
    async fn dead_task_after_deadline_stops_watching() {
        let script = ScriptedTask::failing(AppError::Timeout(1));
        let watchdog = watchdog_with(script.clone(), Duration::ZERO, CountingReporter::default());
        watchdog.start_watching().await.unwrap();
        wait_for_death(&watchdog).await;

        assert_eq!(watchdog.tick().await.unwrap(), Verdict::Stopped);
        assert!(watchdog.has_stopped_watching());
        assert_eq!(watchdog.restarts(), 0);
        assert_eq!(script.replacements(), 0);

        // Stopped is terminal.
        assert_eq!(watchdog.tick().await.unwrap(), Verdict::Stopped);
    }

    #[tokio::test]
    async fn recycled_task_is_replaced_within_budget() {
        let script = ScriptedTask::succeeding();
        let watchdog = watchdog_with(script.clone(), Duration::from_secs(60), CountingReporter::default());
        watchdog.start_watching().await.unwrap();
        let first_id = watchdog.task_id().await;

        assert!(watchdog.recycle().await);
        assert_eq!(watchdog.tick().await.unwrap(), Verdict::Restarted);
        assert_ne!(watchdog.task_id().await, first_id);
        assert_eq!(script.replacements(), 1);
        assert!(!watchdog.has_stopped_watching());
        watchdog.shutdown().await;
    }

    #[tokio::test]
    async fn recycled_healthy_task_after_deadline_stops_watching() {
        let watchdog = watchdog_with(
            ScriptedTask::succeeding(),
            Duration::ZERO,
            CountingReporter::default(),
        );
        watchdog.start_watching().await.unwrap();
        assert_eq!(watchdog.tick().await.unwrap(), Verdict::Alive);

        assert!(watchdog.recycle().await);
        assert_eq!(watchdog.tick().await.unwrap(), Verdict::Stopped);
        assert!(watchdog.has_stopped_watching());
        assert_eq!(watchdog.restarts(), 0);
        watchdog.shutdown().await;
    }

    #[tokio::test]
    async fn recycle_before_start_is_a_no_op() {
        let watchdog = watchdog_with(
            ScriptedTask::succeeding(),
            Duration::from_secs(60),
            CountingReporter::default(),
        );
        assert!(!watchdog.recycle().await);
    }

    #[tokio::test]
    async fn stop_watching_is_idempotent() {
        let reporter = CountingReporter::default();
        let watchdog = watchdog_with(
            ScriptedTask::succeeding(),
            Duration::from_secs(60),
            reporter.clone(),
        );
        watchdog.start_watching().await.unwrap();

        watchdog.stop_watching();
        watchdog.stop_watching();

        assert!(watchdog.has_stopped_watching());
        assert_eq!(*reporter.stopped.lock().unwrap(), 1);
        watchdog.shutdown().await;
        assert_eq!(*reporter.stopped.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn stopped_watchdog_cannot_start_again() {
        let watchdog = watchdog_with(
            ScriptedTask::succeeding(),
            Duration::from_secs(60),
            CountingReporter::default(),
        );
        watchdog.stop_watching();
        assert!(matches!(
            watchdog.start_watching().await,
            Err(AppError::SchedulingError(_))
        ));
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let watchdog = watchdog_with(
            ScriptedTask::succeeding(),
            Duration::from_secs(60),
            CountingReporter::default(),
        );
        watchdog.start_watching().await.unwrap();
        assert!(matches!(
            watchdog.start_watching().await,
            Err(AppError::SchedulingError(_))
        ));
        watchdog.shutdown().await;
    }

    #[tokio::test]
    async fn retry_returns_unstarted_instance() {
        let script = ScriptedTask::succeeding();
        let watchdog = watchdog_with(script.clone(), Duration::from_secs(60), CountingReporter::default());

        let fresh = watchdog.retry().await;
        assert_ne!(fresh.id(), watchdog.task_id().await);
        assert!(!fresh.is_done());
        assert_eq!(script.replacements(), 1);
        assert_eq!(watchdog.restarts(), 0);
    }

    #[tokio::test]
    async fn deadline_is_set_on_start() {
        let watchdog = watchdog_with(
            ScriptedTask::succeeding(),
            Duration::from_secs(60),
            CountingReporter::default(),
        );
        assert!(watchdog.deadline().is_none());

        let before = Instant::now();
        watchdog.start_watching().await.unwrap();
        let deadline = watchdog.deadline().unwrap();
        assert!(deadline >= before + Duration::from_secs(60));
        watchdog.shutdown().await;
    }
}
