//! The VM façade.
//!
//! [`VirtualMachine`] owns one VM instance together with everything created
//! against it: bound classes, dispatch targets, foreign objects and handles.
//! Nothing is shared between instances.

mod config;
mod host;

use std::rc::Rc;

use tracing::debug;

use crate::backend::{Backend, Host, Slots};
use crate::binder::{ForeignBinding, ForeignClass, call_arity};
use crate::error::{WrenError, WrenResult};
use crate::error_bridge::ErrorEvent;
use crate::marshal::{FromSlot, IntoSlot, Value, check_slot, write_owned_value};
use crate::registry::{Handle, HandleKind, HandleRegistry};
use crate::types::{InterpretResult, ValueType};

pub use config::{BindForeignClassFn, BindForeignMethodFn, Configuration};

use host::HostState;

/// A VM instance driven through backend `B`.
///
/// Lifecycle: created by [`new`](Self::new), used through any number of
/// [`interpret`](Self::interpret)/[`call`](Self::call) cycles, then disposed
/// explicitly or on drop. Every operation after disposal fails with
/// [`WrenError::Disposed`].
///
/// Not `Send`: one instance belongs to one thread, and callers serialize their
/// use of it.
pub struct VirtualMachine<B: Backend> {
    backend: Option<B>,
    host: Rc<HostState>,
    raise_on_error: bool,
}

impl<B: Backend> VirtualMachine<B> {
    pub fn new(config: Configuration) -> WrenResult<Self> {
        let host = Rc::new(HostState::new(&config));
        let callbacks: Rc<dyn Host> = host.clone();
        let backend = B::create(callbacks, &config)?;
        debug!(?config, "created virtual machine");
        Ok(Self {
            backend: Some(backend),
            host,
            raise_on_error: config.raise_on_error,
        })
    }

    fn backend(&mut self) -> WrenResult<&mut B> {
        self.backend.as_mut().ok_or(WrenError::Disposed)
    }

    /// Backend access for a VM entry point; releases handles dropped since the
    /// previous one first.
    fn enter(&mut self) -> WrenResult<&mut B> {
        let backend = self.backend.as_mut().ok_or(WrenError::Disposed)?;
        let pending = self.host.handles.borrow_mut().take_pending();
        for raw in pending {
            // SAFETY: the registry hands out each raw handle of this VM once,
            // on drop or removal.
            unsafe { backend.release_handle(raw) };
        }
        Ok(backend)
    }

    fn slots(&mut self) -> WrenResult<&mut dyn Slots> {
        Ok(self.backend()?.slots())
    }

    fn finish(&mut self, result: InterpretResult) -> WrenResult<InterpretResult> {
        match self.host.take_error() {
            Some(error) if self.raise_on_error => Err(WrenError::Vm(error)),
            _ => Ok(result),
        }
    }

    fn check_owned(&self, handle: &Handle) -> WrenResult<()> {
        if handle.belongs_to(&self.host.handles) {
            Ok(())
        } else {
            Err(WrenError::ForeignHandle)
        }
    }

    /// Expose `T`'s constructors and methods to `foreign class` declarations
    /// named `T::CLASS_NAME` in `module`.
    ///
    /// Binding happens when the script declaring the class is interpreted, so
    /// call this first.
    ///
    /// On libwren every foreign method and class declaration bound by a VM
    /// takes one entry of a fixed dispatch table, at most
    /// [`MAX_FOREIGN_METHODS`] methods and [`MAX_FOREIGN_CLASSES`] classes.
    /// Declarations beyond that are left unbound (with a `warn!`), and the
    /// script fails where it declares or constructs them.
    ///
    /// [`MAX_FOREIGN_METHODS`]: crate::backend::ffi::MAX_FOREIGN_METHODS
    /// [`MAX_FOREIGN_CLASSES`]: crate::backend::ffi::MAX_FOREIGN_CLASSES
    pub fn bind_foreign<T: ForeignClass>(&mut self, module: &str) -> WrenResult<()> {
        self.backend()?;
        let binding = ForeignBinding::of::<T>()?;
        if !self.host.add_binding(module, binding) {
            return Err(WrenError::AlreadyBound {
                module: module.to_owned(),
                class_name: T::CLASS_NAME.to_owned(),
            });
        }
        debug!(module, class_name = T::CLASS_NAME, "registered foreign class");
        Ok(())
    }

    /// Compile and run `source` as module `module`.
    ///
    /// Errors the VM reports go to `on_error` subscribers first. With
    /// `raise_on_error` the error of this call is then returned as
    /// [`WrenError::Vm`].
    pub fn interpret(&mut self, module: &str, source: &str) -> WrenResult<InterpretResult> {
        let result = self.enter()?.interpret(module, source)?;
        self.finish(result)
    }

    /// Invoke a call handle. The receiver must be in slot 0 and the arguments
    /// in the slots after it.
    ///
    /// Fails with [`WrenError::NotACallHandle`] for handles to values and
    /// with [`WrenError::MissingCallArguments`] when the window is smaller
    /// than the receiver plus one slot per `_` in the signature.
    pub fn call(&mut self, method: &Handle) -> WrenResult<InterpretResult> {
        self.backend()?;
        self.check_owned(method)?;
        let (raw, kind) = {
            let handles = self.host.handles.borrow();
            let raw = handles.raw(method.id()).ok_or(WrenError::HandleReleased)?;
            (raw, handles.kind(method.id()).ok_or(WrenError::HandleReleased)?)
        };
        let HandleKind::Call { arity } = kind else {
            return Err(WrenError::NotACallHandle);
        };
        let backend = self.enter()?;
        let count = backend.slots().slot_count();
        if count <= arity {
            return Err(WrenError::MissingCallArguments { arity, count });
        }
        // SAFETY: `raw` is a live call handle of this VM (checked above) and
        // the window holds the receiver and `arity` arguments.
        let result = unsafe { backend.call(raw) };
        self.finish(result)
    }

    /// Handle for calling methods with `signature`, e.g. `write(_)`.
    pub fn make_call_handle(&mut self, signature: &str) -> WrenResult<Handle> {
        self.backend()?;
        if signature.is_empty() {
            return Err(WrenError::InvalidSignature {
                signature: signature.to_owned(),
            });
        }
        let raw = self.enter()?.make_call_handle(signature)?;
        let kind = HandleKind::Call {
            arity: call_arity(signature),
        };
        Ok(HandleRegistry::adopt(&self.host.handles, raw, kind))
    }

    /// Persistent handle to the value in `slot`.
    pub fn get_slot_handle(&mut self, slot: usize) -> WrenResult<Handle> {
        let slots = self.slots()?;
        check_slot(slots, slot)?;
        let raw = slots
            .get_slot_handle(slot)
            .ok_or_else(|| WrenError::SlotTypeMismatch {
                slot,
                expected: "a value",
                actual: slots.slot_type(slot),
            })?;
        Ok(HandleRegistry::adopt(&self.host.handles, raw, HandleKind::Value))
    }

    /// Store the value `handle` refers to in `slot`. The handle stays live.
    pub fn set_slot_handle(&mut self, slot: usize, handle: &Handle) -> WrenResult<()> {
        self.set_slot_value(slot, &Value::Handle(handle.reference()))
    }

    /// Release `handle` now. Releasing twice is an error.
    pub fn release_handle(&mut self, handle: &Handle) -> WrenResult<()> {
        self.backend()?;
        self.check_owned(handle)?;
        let raw = self
            .host
            .handles
            .borrow_mut()
            .remove(handle.id())
            .ok_or(WrenError::HandleReleased)?;
        let backend = self.enter()?;
        // SAFETY: removal succeeded, so `raw` was live and is now forgotten by
        // the registry.
        unsafe { backend.release_handle(raw) };
        Ok(())
    }

    pub fn ensure_slots(&mut self, count: usize) -> WrenResult<()> {
        self.slots()?.ensure_slots(count);
        Ok(())
    }

    pub fn slot_count(&mut self) -> WrenResult<usize> {
        Ok(self.slots()?.slot_count())
    }

    pub fn slot_type(&mut self, slot: usize) -> WrenResult<ValueType> {
        let slots = self.slots()?;
        check_slot(slots, slot)?;
        Ok(slots.slot_type(slot))
    }

    pub fn get_slot<T: FromSlot>(&mut self, slot: usize) -> WrenResult<T> {
        T::from_slot(self.slots()?, slot)
    }

    pub fn set_slot<T: IntoSlot>(&mut self, slot: usize, value: T) -> WrenResult<()> {
        value.into_slot(self.slots()?, slot)
    }

    /// Write a dynamically typed value; see [`write_value`].
    ///
    /// Handles must belong to this VM.
    ///
    /// [`write_value`]: crate::marshal::write_value
    pub fn set_slot_value(&mut self, slot: usize, value: &Value) -> WrenResult<()> {
        let owner = Rc::clone(&self.host.handles);
        write_owned_value(self.slots()?, slot, value, &owner)
    }

    pub fn set_slot_null(&mut self, slot: usize) -> WrenResult<()> {
        self.set_slot(slot, ())
    }

    pub fn set_slot_new_list(&mut self, slot: usize) -> WrenResult<()> {
        let slots = self.slots()?;
        check_slot(slots, slot)?;
        slots.set_slot_new_list(slot);
        Ok(())
    }

    pub fn list_count(&mut self, slot: usize) -> WrenResult<usize> {
        let slots = self.slots()?;
        expect_list(slots, slot)?;
        Ok(slots.list_count(slot))
    }

    pub fn get_list_element(&mut self, list_slot: usize, index: usize, element_slot: usize) -> WrenResult<()> {
        let slots = self.slots()?;
        expect_list(slots, list_slot)?;
        check_slot(slots, element_slot)?;
        let count = slots.list_count(list_slot);
        if index >= count {
            return Err(WrenError::ListIndexOutOfRange {
                index: isize::try_from(index).unwrap_or(isize::MAX),
                count,
            });
        }
        slots.get_list_element(list_slot, index, element_slot);
        Ok(())
    }

    /// Insert the value in `element_slot` at `index`.
    ///
    /// `index` ranges over `0..=count`, or `-(count + 1)..=-1` counting from
    /// the end, so `-1` appends.
    pub fn insert_in_list(&mut self, list_slot: usize, index: isize, element_slot: usize) -> WrenResult<()> {
        let slots = self.slots()?;
        expect_list(slots, list_slot)?;
        check_slot(slots, element_slot)?;
        let count = slots.list_count(list_slot);
        let len = isize::try_from(count).unwrap_or(isize::MAX);
        if index > len || index < -len - 1 {
            return Err(WrenError::ListIndexOutOfRange { index, count });
        }
        slots.insert_in_list(list_slot, index, element_slot);
        Ok(())
    }

    /// Load the top-level variable `name` of `module` into `slot`.
    pub fn get_variable(&mut self, module: &str, name: &str, slot: usize) -> WrenResult<()> {
        let slots = self.slots()?;
        check_slot(slots, slot)?;
        slots.get_variable(module, name, slot)
    }

    pub fn abort_fiber(&mut self, slot: usize) -> WrenResult<()> {
        let slots = self.slots()?;
        check_slot(slots, slot)?;
        slots.abort_fiber(slot);
        Ok(())
    }

    pub fn collect_garbage(&mut self) -> WrenResult<()> {
        self.enter()?.collect_garbage();
        Ok(())
    }

    /// Subscribe to script output (`System.print` and friends).
    pub fn on_write(&mut self, handler: impl Fn(&str) + 'static) -> WrenResult<()> {
        self.backend()?;
        self.host.add_write_handler(Rc::new(handler));
        Ok(())
    }

    /// Subscribe to every error callback the VM makes, frame by frame.
    pub fn on_error(&mut self, handler: impl Fn(&ErrorEvent) + 'static) -> WrenResult<()> {
        self.backend()?;
        self.host.add_error_handler(Rc::new(handler));
        Ok(())
    }

    /// Number of host objects currently behind foreign instances.
    pub fn foreign_object_count(&self) -> usize {
        self.host.foreign.borrow().len()
    }

    /// Number of handles neither released nor dropped.
    pub fn live_handle_count(&self) -> usize {
        self.host.handles.borrow().live_count()
    }

    /// Number of foreign methods bound so far.
    pub fn bound_method_count(&self) -> usize {
        self.host.bound_method_count()
    }

    /// Release everything created against this VM, then the VM itself.
    ///
    /// Order: foreign objects (their finalizers run), method and class
    /// bindings, outstanding handles, the VM. Idempotent.
    pub fn dispose(&mut self) {
        let Some(mut backend) = self.backend.take() else {
            return;
        };
        self.host.clear_foreign_objects();
        self.host.clear_bindings();
        let handles = self.host.handles.borrow_mut().drain_all();
        let released = handles.len();
        for raw in handles {
            // SAFETY: drained from the registry, which holds each live raw
            // handle once.
            unsafe { backend.release_handle(raw) };
        }
        drop(backend);
        debug!(released_handles = released, "disposed virtual machine");
    }

    pub fn is_disposed(&self) -> bool {
        self.backend.is_none()
    }

    #[cfg(test)]
    pub(crate) fn backend_mut(&mut self) -> &mut B {
        match self.backend.as_mut() {
            Some(backend) => backend,
            None => panic!("virtual machine is disposed"),
        }
    }
}

impl<B: Backend> Drop for VirtualMachine<B> {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn expect_list(slots: &dyn Slots, slot: usize) -> WrenResult<()> {
    check_slot(slots, slot)?;
    match slots.slot_type(slot) {
        ValueType::List => Ok(()),
        actual => Err(WrenError::SlotTypeMismatch {
            slot,
            expected: "List",
            actual,
        }),
    }
}
