//! Per-run diagnostic dumps
//!
//! A [`DiagnosticHook`] is handed to the driver and the epoch policy when a run
//! starts. It is invoked with the latest [`RunSnapshot`] when the run hits a
//! fatal condition.

use std::backtrace::Backtrace;
use std::collections::BTreeMap;

use serde::Serialize;
use tracing::error;

/// State of the run at the time of a dump
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSnapshot {
    pub epoch: usize,
    pub step: usize,
    pub consecutive_non_finite: usize,
    pub learning_rate: f64,
    pub loss_scale: f64,
    /// Last computed value of every loss term
    pub last_losses: BTreeMap<String, f64>,
}

pub trait DiagnosticHook: Send + Sync {
    fn dump(&self, reason: &str, snapshot: &RunSnapshot);
}

/// Logs the snapshot and a backtrace at error level
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDiagnostics;

impl DiagnosticHook for TracingDiagnostics {
    fn dump(&self, reason: &str, snapshot: &RunSnapshot) {
        let state = serde_json::to_string(snapshot).unwrap_or_else(|e| format!("<{}>", e));
        error!("Diagnostic dump: {}", reason);
        error!("Run state: {}", state);
        error!("Backtrace:\n{}", Backtrace::force_capture());
    }
}
