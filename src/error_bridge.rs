//! Folds the VM's per-line error callbacks into one [`VmError`] per call.
//!
//! The VM reports a compile failure with a single callback, and a runtime
//! failure with one callback for the message followed by one per stack frame.

use tracing::{debug, warn};

use crate::error::{StackFrame, VmError};
use crate::types::ErrorType;

/// One raw error callback, as delivered to `on_error` subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub kind: ErrorType,
    pub module: Option<String>,
    pub line: i32,
    pub message: String,
}

impl ErrorEvent {
    fn frame(&self) -> StackFrame {
        StackFrame::new(self.kind, self.module.as_deref(), self.line, &self.message)
    }
}

#[derive(Debug, Default)]
pub struct ErrorBridge {
    pending: Option<VmError>,
}

impl ErrorBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&mut self, event: &ErrorEvent) {
        match event.kind {
            ErrorType::Compile => match &self.pending {
                // The compiler keeps going after the first error; the first
                // one is the error of the call.
                Some(pending) if pending.is_compile_error() => {
                    debug!(message = %event.message, "additional compile error");
                }
                _ => self.pending = Some(VmError::from_primary(event.frame())),
            },
            ErrorType::Runtime => {
                self.pending = Some(VmError::from_primary(event.frame()));
            }
            ErrorType::StackTrace => match &mut self.pending {
                Some(pending) if pending.is_runtime_error() => pending.push_frame(event.frame()),
                _ => warn!(
                    module = event.module.as_deref(),
                    line = event.line,
                    "stack frame reported with no runtime error pending; dropping it"
                ),
            },
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Take the error captured since the last call, leaving the bridge idle.
    pub fn take(&mut self) -> Option<VmError> {
        self.pending.take()
    }
}
