//! Progress reporting for EM levels.
//!
//! Every level reports its start, one [`IterationInfo`] per EM iteration,
//! its completion and any error. Callbacks are shared between levels, so
//! they carry the level name in every notification.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// State of one EM iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationInfo {
    /// Level name, `"1"` for the root and `"<parent>-<child index>"` below.
    pub level: String,
    /// One-based iteration number.
    pub iteration: usize,
    pub max_iterations: usize,
    /// Convergence measure of this iteration (label changes or percent
    /// responsibility change, depending on the stopping type).
    pub measure: f64,
    /// Time since the level started.
    pub elapsed: Duration,
}

impl IterationInfo {
    pub fn new(
        level: impl Into<String>,
        iteration: usize,
        max_iterations: usize,
        measure: f64,
        elapsed: Duration,
    ) -> Self {
        Self {
            level: level.into(),
            iteration,
            max_iterations,
            measure,
            elapsed,
        }
    }

    pub fn progress_percent(&self) -> f64 {
        if self.max_iterations == 0 {
            return 100.0;
        }
        self.iteration as f64 / self.max_iterations as f64 * 100.0
    }
}

/// Observer of EM progress.
pub trait ProgressCallback: Send + Sync {
    fn on_iteration(&self, info: &IterationInfo);

    fn on_start(&self, _level: &str) {}

    fn on_complete(&self, _info: &IterationInfo) {}

    fn on_error(&self, _level: &str, _error: &str) {}
}

/// Logs progress through `tracing`.
#[derive(Debug, Clone)]
pub struct TracingProgress {
    /// Log every `log_interval` iterations (and the last one).
    pub log_interval: usize,
}

impl Default for TracingProgress {
    fn default() -> Self {
        Self { log_interval: 1 }
    }
}

impl TracingProgress {
    pub fn new(log_interval: usize) -> Self {
        Self {
            log_interval: log_interval.max(1),
        }
    }
}

impl ProgressCallback for TracingProgress {
    fn on_iteration(&self, info: &IterationInfo) {
        if info.iteration % self.log_interval == 0 || info.iteration == info.max_iterations {
            tracing::debug!(
                level = %info.level,
                "iteration {}/{} ({:.1}%) | measure: {:.6} | elapsed: {:.2}s",
                info.iteration,
                info.max_iterations,
                info.progress_percent(),
                info.measure,
                info.elapsed.as_secs_f64()
            );
        }
    }

    fn on_start(&self, level: &str) {
        tracing::info!(level = %level, "segmenting level");
    }

    fn on_complete(&self, info: &IterationInfo) {
        tracing::info!(
            level = %info.level,
            "level finished after {} iterations in {:.2}s, final measure {:.6}",
            info.iteration,
            info.elapsed.as_secs_f64(),
            info.measure
        );
    }

    fn on_error(&self, level: &str, error: &str) {
        tracing::error!(level = %level, "level failed: {}", error);
    }
}

/// Records every iteration and error in memory.
#[derive(Debug, Clone, Default)]
pub struct HistoryProgress {
    history: Arc<Mutex<Vec<IterationInfo>>>,
    errors: Arc<Mutex<Vec<(String, String)>>>,
}

impl HistoryProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> Vec<IterationInfo> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Measures recorded for `level`, in iteration order.
    pub fn measures(&self, level: &str) -> Vec<f64> {
        self.history()
            .into_iter()
            .filter(|info| info.level == level)
            .map(|info| info.measure)
            .collect()
    }

    pub fn errors(&self) -> Vec<(String, String)> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl ProgressCallback for HistoryProgress {
    fn on_iteration(&self, info: &IterationInfo) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(info.clone());
    }

    fn on_error(&self, level: &str, error: &str) {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((level.to_string(), error.to_string()));
    }
}

/// Fans notifications out to every registered callback.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    callbacks: Vec<Arc<dyn ProgressCallback>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_callback(&mut self, callback: Arc<dyn ProgressCallback>) {
        self.callbacks.push(callback);
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn start(&self, level: &str) {
        for callback in &self.callbacks {
            callback.on_start(level);
        }
    }

    pub fn iteration(&self, info: &IterationInfo) {
        for callback in &self.callbacks {
            callback.on_iteration(info);
        }
    }

    pub fn complete(&self, info: &IterationInfo) {
        for callback in &self.callbacks {
            callback.on_complete(info);
        }
    }

    pub fn error(&self, level: &str, error: &str) {
        for callback in &self.callbacks {
            callback.on_error(level, error);
        }
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}
