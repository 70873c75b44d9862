//! Metric logging for training runs.
//!
//! The trainer receives a `MetricLogger` at construction and reports every
//! optimization step and learning phase through it:
//! - `ConsoleLogger` - metrics as `tracing` events
//! - `TensorBoardLogger` - event files (feature `tensorboard`)
//! - `CompositeLogger` - fan out to several loggers
//! - `RecordingLogger` - keep every value in memory

mod console;
mod logger;
#[cfg(feature = "tensorboard")]
mod tensorboard;

pub use console::ConsoleLogger;
pub use logger::{CompositeLogger, MetricLogger, NoOpLogger, RecordingLogger};
#[cfg(feature = "tensorboard")]
pub use tensorboard::TensorBoardLogger;
