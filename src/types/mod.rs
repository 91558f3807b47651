//! Enumerations shared between the VM boundary and the public API.

mod enums;

pub use enums::{ErrorType, InterpretResult, ValueType};
