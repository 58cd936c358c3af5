//! Leaf building blocks shared by the bucket engine and the store facade.

pub mod clock;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod sequence;
pub mod single_flight;

pub use clock::{Clock, ManualClock, QuantaClock, StoreClock, SystemClock};
pub use error::{Error, Result};
pub use metrics::{InMemoryMetrics, MetricsSink, NoopMetrics};
pub use scheduler::{PeriodicScheduler, PeriodicTask, TaskContext, TaskId, ThreadScheduler};
pub use sequence::{IdBound, SequenceId, SequenceIdGenerator};
pub use single_flight::SingleFlight;
