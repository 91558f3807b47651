use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};
use std::fmt;

/// The tag of the value currently held by a slot.
///
/// Discriminants match `WrenType` in `wren.h` (0.4), so a raw tag coming back
/// from the VM converts with [`ValueType::from`]. Anything the binding does not
/// know about collapses into [`ValueType::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum ValueType {
    Bool = 0,
    Num = 1,
    Foreign = 2,
    List = 3,
    Map = 4,
    Null = 5,
    String = 6,
    #[num_enum(default)]
    Unknown = 7,
}

impl ValueType {
    /// Name used when a value of this kind is reported back to a script.
    pub fn name(self) -> &'static str {
        match self {
            ValueType::Bool => "Bool",
            ValueType::Num => "Num",
            ValueType::Foreign => "Foreign",
            ValueType::List => "List",
            ValueType::Map => "Map",
            ValueType::Null => "Null",
            ValueType::String => "String",
            ValueType::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind of an error reported through the VM's error callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum ErrorType {
    /// A syntax or resolution error detected while compiling a module.
    Compile = 0,
    /// The primary message of a runtime error (an aborted fiber).
    Runtime = 1,
    /// One line of the stack trace following a runtime error.
    StackTrace = 2,
}

/// Outcome of [`interpret`](crate::VirtualMachine::interpret) and
/// [`call`](crate::VirtualMachine::call).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum InterpretResult {
    Success = 0,
    CompileError = 1,
    RuntimeError = 2,
}

impl InterpretResult {
    pub fn is_success(self) -> bool {
        self == InterpretResult::Success
    }
}
