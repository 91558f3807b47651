//! Host bindings for the Wren scripting VM.
//!
//! The crate sits between host code and an embedded VM:
//!
//! - [`marshal`] converts between Rust values and the VM's tagged slots.
//! - [`binder`] exposes host types as foreign classes. `#[foreign]` generates
//!   the description; [`binder::ForeignBinding`] turns it into a dispatch
//!   table and coerces slot windows at call time.
//! - [`registry`] keeps host objects behind foreign instances and VM handles
//!   alive until they are finalized or released.
//! - [`VirtualMachine`] drives one VM and owns everything created against it.
//!
//! The VM itself is reached through the traits in [`backend`]. With the `ffi`
//! feature, [`Wren`] runs scripts on libwren.
//!
//! # Example
//!
//! ```ignore
//! use wren::prelude::*;
//!
//! pub struct Calculator;
//!
//! #[foreign]
//! impl Calculator {
//!     pub fn new() -> Self {
//!         Calculator
//!     }
//!
//!     pub fn add_ints(&self, a: i32, b: i32) -> i32 {
//!         a + b
//!     }
//! }
//!
//! let mut vm = Wren::new(Configuration::default().with_raise_on_error(true))?;
//! vm.bind_foreign::<Calculator>("main")?;
//! vm.interpret("main", r#"
//!     foreign class Calculator {
//!         construct new() {}
//!         foreign addInts(a, b)
//!     }
//!     System.print(Calculator.new().addInts(1, 2))
//! "#)?;
//! ```

extern crate self as wren;

pub mod backend;
pub mod binder;
pub mod error;
pub mod error_bridge;
pub mod marshal;
pub mod registry;
pub mod types;
pub mod vm;

#[cfg(test)]
mod testing;

pub use wren_macros::foreign;

pub use binder::{CallContext, ForeignClass, ForeignError};
pub use error::{StackFrame, VmError, WrenError, WrenResult};
pub use error_bridge::ErrorEvent;
pub use marshal::Value;
pub use registry::{ForeignObject, Handle, HandleKind, HandleRef};
pub use types::{ErrorType, InterpretResult, ValueType};
pub use vm::{Configuration, VirtualMachine};

/// The façade over libwren.
#[cfg(feature = "ffi")]
pub type Wren = VirtualMachine<backend::ffi::WrenVm>;

pub mod prelude {
    pub use crate::binder::{CallContext, ForeignClass, ForeignClassMethods, ForeignError, ForeignMethodFn};
    pub use crate::error::{VmError, WrenError, WrenResult};
    pub use crate::error_bridge::ErrorEvent;
    pub use crate::foreign;
    pub use crate::marshal::{FromSlot, IntoSlot, Value};
    pub use crate::registry::{ForeignObject, Handle, HandleKind};
    pub use crate::types::{ErrorType, InterpretResult, ValueType};
    pub use crate::vm::{Configuration, VirtualMachine};

    #[cfg(feature = "ffi")]
    pub use crate::Wren;
}
