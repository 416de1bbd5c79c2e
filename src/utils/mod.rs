//! Utilities: errors, logging, metrics and diagnostics

pub mod diagnostics;
pub mod error;
pub mod logging;
pub mod metrics;

pub use diagnostics::{DiagnosticHook, RunSnapshot, TracingDiagnostics};
pub use error::{Result, SslError};
pub use logging::{LogConfig, LogLevel, RunLogger};
pub use metrics::{ConfusionMatrix, MetricLogger, RunningAverage};
