// src/pipeline/mod.rs

pub mod context;
pub mod metrics;
pub mod task;

pub use context::{CancelFlag, Clock, SystemClock};
pub use metrics::SnippetMetrics;
pub use task::{SnippetGenerator, TaskPlanner};
