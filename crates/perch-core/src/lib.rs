pub mod bus;
pub mod circuit_breaker;
pub mod collector;
pub mod config;
pub mod entities;
pub mod error;
pub mod keywords;
pub mod models;
pub mod task;
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;
pub mod throttle;
pub mod traits;
pub mod watchdog;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use collector::{CollectionTask, PeriodicSearch};
pub use config::Settings;
pub use error::AppError;
pub use models::{ExtractedRecord, RecordKind, ResultBatch};
pub use task::{ExecutionSchedule, PeriodicTask, Task};
pub use traits::{EventBus, Provider, Search, Subscriber};
pub use watchdog::{Verdict, Watchdog};
