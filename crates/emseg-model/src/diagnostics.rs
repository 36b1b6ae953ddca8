//! Error and warning accumulators.
//!
//! Every EM level owns a [`Diagnostics`] pair. Child levels merge theirs into
//! the parent after recursion so the caller sees one combined report.

use emseg_core::SegmentationError;
use serde::{Deserialize, Serialize};

/// Ordered list of messages with a raised/not-raised flag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageLog {
    messages: Vec<String>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    /// All messages joined by newlines.
    pub fn messages(&self) -> String {
        self.messages.join("\n")
    }

    /// Whether at least one message was recorded.
    pub fn flag(&self) -> bool {
        !self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.messages.iter().map(String::as_str)
    }

    /// Append every message of `other`.
    pub fn merge(&mut self, other: &MessageLog) {
        self.messages.extend(other.messages.iter().cloned());
    }
}

/// Error and warning accumulators of one hierarchy level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub errors: MessageLog,
    pub warnings: MessageLog,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a warning and mirror it to `tracing`.
    pub fn warn(&mut self, level: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(level = %level, "{}", message);
        self.warnings.add(format!("{}: {}", level, message));
    }

    /// Record an error and mirror it to `tracing`.
    pub fn error(&mut self, level: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(level = %level, "{}", message);
        self.errors.add(format!("{}: {}", level, message));
    }

    /// Record a [`SegmentationError`] in the matching accumulator.
    ///
    /// Configuration problems are downgradable and land in the warnings.
    pub fn record(&mut self, level: &str, error: &SegmentationError) {
        if error.is_fatal() {
            self.error(level, error.to_string());
        } else {
            self.warn(level, error.to_string());
        }
    }

    pub fn has_errors(&self) -> bool {
        self.errors.flag()
    }

    pub fn merge(&mut self, other: &Diagnostics) {
        self.errors.merge(&other.errors);
        self.warnings.merge(&other.warnings);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_log() {
        let mut log = MessageLog::new();
        assert!(!log.flag());
        assert_eq!(log.messages(), "");
        log.add("first");
        log.add("second");
        assert!(log.flag());
        assert_eq!(log.messages(), "first\nsecond");
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_merge_keeps_order() {
        let mut parent = Diagnostics::new();
        parent.warn("root", "a");
        let mut child = Diagnostics::new();
        child.error("root-1", "b");
        child.warn("root-1", "c");
        parent.merge(&child);
        assert_eq!(parent.warnings.messages(), "root: a\nroot-1: c");
        assert!(parent.has_errors());
    }

    #[test]
    fn test_record_splits_by_fatality() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.record("x", &SegmentationError::invalid_configuration("downgraded"));
        diagnostics.record("x", &SegmentationError::numerical("singular"));
        assert_eq!(diagnostics.warnings.len(), 1);
        assert_eq!(diagnostics.errors.len(), 1);
        assert!(diagnostics.errors.messages().contains("singular"));
    }
}
