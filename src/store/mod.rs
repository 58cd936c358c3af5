//! The queue-facing layer: id issuing and visibility, retention, named
//! readers and the per-process store registry.

pub mod queue;
pub mod registry;
pub mod retention;
mod tracker;

pub use queue::{QueueStore, StoreReader};
pub use registry::StoreRegistry;
pub use retention::{clean_level, CleanupReport, RetentionConfig};
pub use tracker::LastAvailableTracker;
