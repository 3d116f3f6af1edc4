//! Injected logging collaborator
//!
//! The estimation core never writes to a process-wide logger. An
//! [`InteractingMultipleModel`](crate::filters::imm::InteractingMultipleModel)
//! receives an `Arc<dyn ImmLogger>` at construction and reports through it.

use std::sync::{Arc, Mutex};

/// A sink for diagnostic messages from the estimation core.
pub trait ImmLogger: Send + Sync {
    fn log(&self, message: &str);
}

/// Discards every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLogger;

impl ImmLogger for NullLogger {
    fn log(&self, _message: &str) {}
}

/// Forwards messages to `tracing` at DEBUG level.
#[derive(Debug, Clone)]
pub struct TracingLogger {
    component: String,
}

impl TracingLogger {
    /// Creates a logger tagging every event with `component`.
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }
}

impl Default for TracingLogger {
    fn default() -> Self {
        Self::new("imm")
    }
}

impl ImmLogger for TracingLogger {
    fn log(&self, message: &str) {
        tracing::debug!(component = %self.component, "{}", message);
    }
}

/// Keeps messages in memory.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    messages: Mutex<Vec<String>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies of all messages logged so far.
    pub fn messages(&self) -> Vec<String> {
        match self.messages.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl ImmLogger for MemoryLogger {
    fn log(&self, message: &str) {
        let mut guard = match self.messages.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push(message.to_string());
    }
}

/// Shared handle to the no-op logger.
pub fn null_logger() -> Arc<dyn ImmLogger> {
    Arc::new(NullLogger)
}
