use std::ffi::NulError;
use std::fmt;
use thiserror::Error;

use crate::types::{ErrorType, ValueType};

pub type WrenResult<T> = Result<T, WrenError>;

/// Errors surfaced to host code.
///
/// Everything except [`WrenError::Vm`] is a host-side usage error: the
/// embedding code asked for something the slot window, the handle registry or
/// the binder cannot do.
#[derive(Error, Debug)]
pub enum WrenError {
    #[error(transparent)]
    Vm(#[from] VmError),

    #[error("slot {slot} is outside the current window of {count} slots")]
    SlotOutOfRange { slot: usize, count: usize },

    #[error("slot {slot} holds a {actual} value, expected {expected}")]
    SlotTypeMismatch {
        slot: usize,
        expected: &'static str,
        actual: ValueType,
    },

    #[error("list index {index} is outside a list of {count} elements")]
    ListIndexOutOfRange { index: isize, count: usize },

    #[error("slot 0 holds the class being allocated and cannot be written by an allocator")]
    AllocatorSlot,

    #[error("values of kind {kind} cannot be written through the generic slot writer")]
    UnsupportedValue { kind: &'static str },

    #[error("handle has already been released")]
    HandleReleased,

    #[error("handle belongs to a different virtual machine")]
    ForeignHandle,

    #[error("handle refers to a value, not a method; create one with make_call_handle")]
    NotACallHandle,

    #[error("call needs the receiver and {arity} arguments in slots, but the window holds {count} slots")]
    MissingCallArguments { arity: usize, count: usize },

    #[error("'{signature}' is not a method signature")]
    InvalidSignature { signature: String },

    #[error("the VM could not create a call handle for '{signature}'")]
    CallHandleFailed { signature: String },

    #[error("foreign class '{class_name}' is already bound in module '{module}'")]
    AlreadyBound { module: String, class_name: String },

    #[error("foreign class '{class_name}' exposes '{signature}' more than once")]
    DuplicateSignature {
        class_name: &'static str,
        signature: String,
    },

    #[error("virtual machine has been disposed")]
    Disposed,

    #[error("failed to create the virtual machine")]
    FailedToCreateVm,

    #[error("string conversion error: {0}")]
    StringConversion(#[from] NulError),
}

/// One entry of a [`VmError`] trace, as delivered by the VM's error callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub kind: ErrorType,
    pub module: Option<String>,
    pub line: i32,
    pub message: String,
}

impl StackFrame {
    pub fn new(kind: ErrorType, module: Option<&str>, line: i32, message: &str) -> Self {
        Self {
            kind,
            module: module.map(str::to_owned),
            line,
            message: message.to_owned(),
        }
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.module {
            Some(module) => write!(f, "[{} line {}] {}", module, self.line, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// A compile or runtime failure reported by the VM during one
/// `interpret`/`call`.
///
/// `stack_trace[0]` is always the primary report; for runtime errors the
/// frames the VM reported afterwards follow in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmError {
    stack_trace: Vec<StackFrame>,
}

impl VmError {
    pub(crate) fn from_primary(primary: StackFrame) -> Self {
        Self {
            stack_trace: vec![primary],
        }
    }

    pub(crate) fn push_frame(&mut self, frame: StackFrame) {
        self.stack_trace.push(frame);
    }

    fn primary(&self) -> &StackFrame {
        &self.stack_trace[0]
    }

    pub fn kind(&self) -> ErrorType {
        self.primary().kind
    }

    pub fn module(&self) -> Option<&str> {
        self.primary().module.as_deref()
    }

    pub fn line(&self) -> i32 {
        self.primary().line
    }

    pub fn message(&self) -> &str {
        &self.primary().message
    }

    pub fn stack_trace(&self) -> &[StackFrame] {
        &self.stack_trace
    }

    pub fn is_compile_error(&self) -> bool {
        self.kind() == ErrorType::Compile
    }

    pub fn is_runtime_error(&self) -> bool {
        self.kind() == ErrorType::Runtime
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.primary())?;
        for frame in &self.stack_trace[1..] {
            write!(f, "\n  at {frame}")?;
        }
        Ok(())
    }
}

impl std::error::Error for VmError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_error_displays_location() {
        let error = VmError::from_primary(StackFrame::new(
            ErrorType::Compile,
            Some("my_module"),
            1,
            "Error at 'foo': Variable is used but not defined.",
        ));

        assert!(error.is_compile_error());
        assert_eq!(error.module(), Some("my_module"));
        assert_eq!(error.line(), 1);
        assert_eq!(
            error.to_string(),
            "[my_module line 1] Error at 'foo': Variable is used but not defined."
        );
    }

    #[test]
    fn runtime_error_lists_frames() {
        let mut error = VmError::from_primary(StackFrame::new(
            ErrorType::Runtime,
            None,
            -1,
            "Cannot write to a closed file.",
        ));
        error.push_frame(StackFrame::new(ErrorType::StackTrace, Some("io"), 3, "(script)"));

        assert!(error.is_runtime_error());
        assert_eq!(error.stack_trace().len(), 2);
        assert_eq!(
            error.to_string(),
            "Cannot write to a closed file.\n  at [io line 3] (script)"
        );
    }

    #[test]
    fn usage_errors_describe_the_slot() {
        let error = WrenError::SlotTypeMismatch {
            slot: 2,
            expected: "String",
            actual: ValueType::Num,
        };
        assert_eq!(error.to_string(), "slot 2 holds a Num value, expected String");
    }
}
