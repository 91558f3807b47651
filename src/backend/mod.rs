//! The boundary with the embedded VM.
//!
//! The binding layer never talks to the interpreter directly. It drives a
//! [`Backend`] (lifecycle and entry points), reads and writes the per-call
//! window through [`Slots`], and receives callbacks from the VM through the
//! [`Host`] it hands to [`Backend::create`].

use std::fmt;
use std::num::NonZeroUsize;
use std::rc::Rc;

use crate::error::WrenResult;
use crate::registry::ForeignToken;
use crate::types::{ErrorType, InterpretResult, ValueType};
use crate::vm::Configuration;

#[cfg(feature = "ffi")]
pub mod ffi;

/// A VM-owned persistent reference, as handed out by the backend.
///
/// Only the backend that produced a raw handle can interpret it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(NonZeroUsize);

impl RawHandle {
    pub fn new(bits: NonZeroUsize) -> Self {
        Self(bits)
    }

    /// Wrap a pointer; a null pointer has no handle.
    pub fn from_ptr<T>(ptr: *mut T) -> Option<Self> {
        NonZeroUsize::new(ptr as usize).map(Self)
    }

    pub fn as_ptr<T>(self) -> *mut T {
        self.0.get() as *mut T
    }

    pub fn bits(self) -> usize {
        self.0.get()
    }
}

impl fmt::Debug for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawHandle({:#x})", self.0)
    }
}

/// Id the host returns when the VM binds a foreign method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodId(pub usize);

/// Id the host returns when the VM binds a foreign class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(pub usize);

/// The VM's per-call slot window.
///
/// Calls are meant for indices inside the window sized by the last
/// [`ensure_slots`](Slots::ensure_slots), and getters for slots holding the
/// matching tag. The safe methods must stay memory safe outside that
/// contract: a getter then returns a default and a setter does nothing. The
/// layer that reports such calls as errors is [`crate::marshal`].
///
/// The `unsafe` methods take inputs an implementation cannot validate, and
/// spell out what the caller must guarantee.
pub trait Slots {
    fn ensure_slots(&mut self, count: usize);
    fn slot_count(&self) -> usize;
    fn slot_type(&self, slot: usize) -> ValueType;

    fn get_slot_bool(&self, slot: usize) -> bool;
    fn get_slot_double(&self, slot: usize) -> f64;
    /// Copy of the slot's bytes; the VM memory may move once control returns.
    fn get_slot_bytes(&self, slot: usize) -> Vec<u8>;
    fn get_slot_string(&self, slot: usize) -> String;
    fn get_slot_handle(&mut self, slot: usize) -> Option<RawHandle>;
    /// Token stored in a foreign instance created by this layer, `None` for
    /// any other value.
    fn get_slot_foreign(&self, slot: usize) -> Option<ForeignToken>;

    fn set_slot_bool(&mut self, slot: usize, value: bool);
    fn set_slot_double(&mut self, slot: usize, value: f64);
    /// Copies `bytes` into VM memory before returning.
    fn set_slot_bytes(&mut self, slot: usize, bytes: &[u8]);
    fn set_slot_string(&mut self, slot: usize, text: &str);
    /// # Safety
    ///
    /// `handle` must be a live handle produced by this VM and not yet
    /// released.
    unsafe fn set_slot_handle(&mut self, slot: usize, handle: RawHandle);
    fn set_slot_null(&mut self, slot: usize);
    fn set_slot_new_list(&mut self, slot: usize);
    /// Create an instance of the foreign class held in `class_slot`, with
    /// `token` written into its raw storage.
    ///
    /// # Safety
    ///
    /// `class_slot` must hold a foreign class. The VM guarantees that for
    /// slot 0 on entry to an allocator.
    unsafe fn set_slot_new_foreign(&mut self, slot: usize, class_slot: usize, token: ForeignToken);

    fn list_count(&self, slot: usize) -> usize;
    fn get_list_element(&mut self, list_slot: usize, index: usize, element_slot: usize);
    /// Negative indices count from the end; `-1` appends.
    fn insert_in_list(&mut self, list_slot: usize, index: isize, element_slot: usize);

    fn get_variable(&mut self, module: &str, name: &str, slot: usize) -> WrenResult<()>;

    /// Abort the running fiber with the value in `slot` as the error.
    fn abort_fiber(&mut self, slot: usize);
}

/// Lifecycle and entry points of one VM instance.
///
/// Dropping the backend frees the VM; the VM may call
/// [`Host::finalize_foreign`] for every live foreign instance while doing so.
pub trait Backend: Sized {
    fn create(host: Rc<dyn Host>, config: &Configuration) -> WrenResult<Self>;

    fn slots(&mut self) -> &mut dyn Slots;

    fn interpret(&mut self, module: &str, source: &str) -> WrenResult<InterpretResult>;

    fn make_call_handle(&mut self, signature: &str) -> WrenResult<RawHandle>;

    /// Invoke a call handle; the receiver and arguments are already in slots.
    ///
    /// # Safety
    ///
    /// `method` must be a live handle from this backend's
    /// [`make_call_handle`](Backend::make_call_handle), and the slot window
    /// must hold the receiver plus one slot per placeholder of its signature.
    unsafe fn call(&mut self, method: RawHandle) -> InterpretResult;

    /// # Safety
    ///
    /// `handle` must be a live handle produced by this backend. It is dead
    /// afterwards.
    unsafe fn release_handle(&mut self, handle: RawHandle);

    fn collect_garbage(&mut self);
}

/// Callbacks the VM makes into the binding layer.
///
/// All of them run synchronously on the stack of the `interpret`/`call` that
/// triggered them. [`finalize_foreign`](Host::finalize_foreign) runs during
/// collection and gets no slot access.
pub trait Host {
    fn bind_foreign_method(
        &self,
        module: &str,
        class_name: &str,
        is_static: bool,
        signature: &str,
    ) -> Option<MethodId>;

    fn bind_foreign_class(&self, module: &str, class_name: &str) -> Option<ClassId>;

    fn invoke_foreign_method(&self, method: MethodId, slots: &mut dyn Slots);

    /// Slot 0 holds the class on entry and must hold the new instance on exit.
    fn allocate_foreign(&self, class: ClassId, slots: &mut dyn Slots);

    fn finalize_foreign(&self, token: ForeignToken);

    fn write(&self, text: &str);

    fn report_error(&self, kind: ErrorType, module: Option<&str>, line: i32, message: &str);
}
