//! Lifetimes of everything the VM and the host share: persistent handles into
//! VM memory and host objects behind foreign instances.

mod foreign;
mod handle;
mod object_heap;

pub use foreign::{Finalizer, ForeignObject, ForeignRegistry};
pub use handle::{Handle, HandleKind, HandleRef, HandleRegistry};
pub use object_heap::{ForeignToken, ObjectHeap};

pub(crate) use handle::SharedHandles;
