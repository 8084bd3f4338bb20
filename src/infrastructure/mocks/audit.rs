//! Mock audit sinks for testing.

use crate::application::ports::{AuditEvent, AuditSink};
use std::sync::{Arc, Mutex};

/// Audit sink that keeps every event in memory.
///
/// Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct CaptureAuditSink {
    captured: Arc<Mutex<Vec<AuditEvent>>>,
}

impl CaptureAuditSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all captured events.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.captured
            .lock()
            .expect("CaptureAuditSink mutex poisoned - a test thread panicked while holding the lock")
            .clone()
    }

    /// Names of captured events, in order.
    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(AuditEvent::name).collect()
    }

    /// Get the count of captured events.
    pub fn count(&self) -> usize {
        self.captured
            .lock()
            .expect("CaptureAuditSink mutex poisoned - a test thread panicked while holding the lock")
            .len()
    }

    /// Clear all captured events.
    pub fn clear(&self) {
        self.captured
            .lock()
            .expect("CaptureAuditSink mutex poisoned - a test thread panicked while holding the lock")
            .clear();
    }
}

impl AuditSink for CaptureAuditSink {
    fn log_event(&self, event: &AuditEvent) {
        self.captured
            .lock()
            .expect("CaptureAuditSink mutex poisoned - a test thread panicked while holding the lock")
            .push(event.clone());
    }
}

/// Audit sink that panics on every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct PanickingAuditSink;

impl AuditSink for PanickingAuditSink {
    fn log_event(&self, event: &AuditEvent) {
        panic!("audit sink exploded on {}", event.name());
    }
}
