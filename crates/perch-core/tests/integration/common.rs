use std::sync::Arc;
use std::time::Duration;

use perch_core::bus::LocalEventBus;
use perch_core::task::{ExecutionSchedule, PeriodicTask, Task};
use perch_core::traits::EventBus;

/// Watchdog polling period used throughout the supervision tests.
pub const TICK: Duration = Duration::from_millis(500);

pub fn bus() -> Arc<LocalEventBus> {
    Arc::new(LocalEventBus::new())
}

pub fn every(period: Duration) -> ExecutionSchedule {
    ExecutionSchedule::new(Duration::ZERO, period).unwrap()
}

pub fn periodic<T: Task>(task: T, bus: Arc<LocalEventBus>) -> PeriodicTask<T> {
    let bus: Arc<dyn EventBus> = bus;
    PeriodicTask::new(task, every(Duration::from_millis(50)), bus)
}

/// Polls `condition` every 20ms until it holds or `limit` elapses.
pub async fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
