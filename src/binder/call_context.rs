//! Context handed to hand-written foreign methods and allocators.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;

use crate::backend::Slots;
use crate::error::{WrenError, WrenResult};
use crate::marshal::{FromSlot, IntoSlot, Value, check_slot, write_owned_value};
use crate::registry::{ForeignObject, ForeignRegistry, SharedHandles};
use crate::types::ValueType;

use super::abort_with;

/// The slot window of one foreign call plus the VM's foreign objects.
///
/// Slot 0 holds the receiver (or the class, inside an allocator) on entry and
/// the return value on exit; arguments start at slot 1. An allocator returns
/// its object instead, so inside one slot 0 cannot be written.
///
/// ```ignore
/// let add: ForeignMethodFn = Rc::new(|ctx: &mut CallContext| {
///     let a: f64 = ctx.get(1).unwrap_or_default();
///     let b: f64 = ctx.get(2).unwrap_or_default();
///     let _ = ctx.set_return(a + b);
/// });
/// ```
pub struct CallContext<'vm> {
    slots: &'vm mut dyn Slots,
    foreign: &'vm RefCell<ForeignRegistry>,
    handles: &'vm SharedHandles,
    allocating: bool,
    aborted: bool,
}

impl<'vm> CallContext<'vm> {
    pub(crate) fn new(
        slots: &'vm mut dyn Slots,
        foreign: &'vm RefCell<ForeignRegistry>,
        handles: &'vm SharedHandles,
    ) -> Self {
        Self {
            slots,
            foreign,
            handles,
            allocating: false,
            aborted: false,
        }
    }

    /// Context for an allocator: slot 0 holds the class until the object is
    /// placed.
    pub(crate) fn for_allocator(
        slots: &'vm mut dyn Slots,
        foreign: &'vm RefCell<ForeignRegistry>,
        handles: &'vm SharedHandles,
    ) -> Self {
        Self {
            allocating: true,
            ..Self::new(slots, foreign, handles)
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.slot_count()
    }

    /// Number of arguments, not counting slot 0.
    pub fn arg_count(&self) -> usize {
        self.slot_count().saturating_sub(1)
    }

    pub fn slot_type(&self, slot: usize) -> WrenResult<ValueType> {
        check_slot(&*self.slots, slot)?;
        Ok(self.slots.slot_type(slot))
    }

    pub fn get<T: FromSlot>(&self, slot: usize) -> WrenResult<T> {
        T::from_slot(&*self.slots, slot)
    }

    fn check_writable(&self, slot: usize) -> WrenResult<()> {
        if self.allocating && slot == 0 {
            return Err(WrenError::AllocatorSlot);
        }
        Ok(())
    }

    pub fn set<T: IntoSlot>(&mut self, slot: usize, value: T) -> WrenResult<()> {
        self.check_writable(slot)?;
        value.into_slot(&mut *self.slots, slot)
    }

    /// Write a dynamically typed value, handles of this VM included.
    pub fn set_value(&mut self, slot: usize, value: &Value) -> WrenResult<()> {
        self.check_writable(slot)?;
        write_owned_value(&mut *self.slots, slot, value, self.handles)
    }

    pub fn set_return<T: IntoSlot>(&mut self, value: T) -> WrenResult<()> {
        self.set(0, value)
    }

    /// The host object behind the foreign instance in `slot`.
    pub fn foreign(&self, slot: usize) -> Option<ForeignObject> {
        if slot >= self.slot_count() {
            return None;
        }
        let token = self.slots.get_slot_foreign(slot)?;
        self.foreign.borrow().resolve(token)
    }

    /// Run `f` against the `T` behind the foreign instance in `slot`.
    ///
    /// `None` if the slot holds no live `T` or the object is already borrowed
    /// further up the stack.
    pub fn with_foreign<T: Any, R>(&self, slot: usize, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let cell = self.foreign(slot)?.downcast::<T>()?;
        let mut object = cell.try_borrow_mut().ok()?;
        Some(f(&mut object))
    }

    /// Detach the host object from the instance in `slot` ahead of
    /// collection. Later calls on that instance see no receiver.
    pub fn release_foreign(&mut self, slot: usize) -> Option<ForeignObject> {
        if slot >= self.slot_count() {
            return None;
        }
        let token = self.slots.get_slot_foreign(slot)?;
        self.foreign.borrow_mut().release(token)
    }

    /// Abort the calling fiber with `message`.
    pub fn abort(&mut self, message: &str) {
        abort_with(&mut *self.slots, message);
        self.aborted = true;
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }
}

impl fmt::Debug for CallContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("slot_count", &self.slot_count())
            .field("aborted", &self.aborted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{HandleKind, HandleRegistry};
    use crate::testing::FakeVm;

    struct Buffer {
        bytes: Vec<u8>,
    }

    #[test]
    fn typed_access_and_return() {
        let foreign = RefCell::new(ForeignRegistry::new());
        let handles = SharedHandles::default();
        let mut vm = FakeVm::new();
        vm.ensure_slots(3);
        vm.set_slot_double(1, 2.0);
        vm.set_slot_double(2, 3.5);

        let mut ctx = CallContext::new(&mut vm, &foreign, &handles);
        assert_eq!(ctx.arg_count(), 2);
        let sum = ctx.get::<f64>(1).unwrap() + ctx.get::<f64>(2).unwrap();
        ctx.set_return(sum).unwrap();
        assert!(ctx.get::<String>(1).is_err());

        assert_eq!(vm.get_slot_double(0), 5.5);
    }

    #[test]
    fn with_foreign_mutates_registered_object() {
        let foreign = RefCell::new(ForeignRegistry::new());
        let handles = SharedHandles::default();
        let token = foreign
            .borrow_mut()
            .register(ForeignObject::new(Buffer { bytes: vec![] }), None);
        let mut vm = FakeVm::new();
        vm.ensure_slots(1);
        vm.set_slot_foreign_token(0, token);

        let ctx = CallContext::new(&mut vm, &foreign, &handles);
        let len = ctx.with_foreign(0, |buffer: &mut Buffer| {
            buffer.bytes.push(1);
            buffer.bytes.len()
        });
        assert_eq!(len, Some(1));
        assert_eq!(ctx.with_foreign(0, |_: &mut String| ()), None);
    }

    #[test]
    fn release_foreign_detaches_object() {
        let foreign = RefCell::new(ForeignRegistry::new());
        let handles = SharedHandles::default();
        let token = foreign.borrow_mut().register(ForeignObject::new(1u8), None);
        let mut vm = FakeVm::new();
        vm.ensure_slots(1);
        vm.set_slot_foreign_token(0, token);

        let mut ctx = CallContext::new(&mut vm, &foreign, &handles);
        assert!(ctx.release_foreign(0).is_some());
        assert!(ctx.foreign(0).is_none());
        assert!(foreign.borrow().is_empty());
    }

    #[test]
    fn abort_sets_message() {
        let foreign = RefCell::new(ForeignRegistry::new());
        let handles = SharedHandles::default();
        let mut vm = FakeVm::new();
        vm.ensure_slots(1);

        let mut ctx = CallContext::new(&mut vm, &foreign, &handles);
        ctx.abort("Cannot write to a closed file.");
        assert!(ctx.is_aborted());
        assert_eq!(vm.abort_message().as_deref(), Some("Cannot write to a closed file."));
    }

    #[test]
    fn mismatched_reads_are_errors() {
        let foreign = RefCell::new(ForeignRegistry::new());
        let handles = SharedHandles::default();
        let mut vm = FakeVm::new();
        vm.ensure_slots(2);
        vm.set_slot_double(1, 1.0);

        let ctx = CallContext::new(&mut vm, &foreign, &handles);
        assert_eq!(ctx.slot_type(1).unwrap(), ValueType::Num);
        assert!(matches!(ctx.slot_type(2), Err(WrenError::SlotOutOfRange { slot: 2, count: 2 })));
        assert!(matches!(
            ctx.get::<String>(1),
            Err(WrenError::SlotTypeMismatch {
                slot: 1,
                actual: ValueType::Num,
                ..
            })
        ));
        assert!(matches!(ctx.get::<bool>(9), Err(WrenError::SlotOutOfRange { .. })));
    }

    #[test]
    fn allocator_cannot_write_the_class_slot() {
        let foreign = RefCell::new(ForeignRegistry::new());
        let handles = SharedHandles::default();
        let mut vm = FakeVm::new();
        vm.ensure_slots(2);
        vm.set_slot_double(0, 7.0);

        let mut ctx = CallContext::for_allocator(&mut vm, &foreign, &handles);
        assert!(matches!(ctx.set_return(1.0), Err(WrenError::AllocatorSlot)));
        assert!(matches!(ctx.set_value(0, &Value::Null), Err(WrenError::AllocatorSlot)));
        ctx.set(1, "scratch").unwrap();

        assert_eq!(vm.get_slot_double(0), 7.0);
        assert_eq!(vm.get_slot_string(1), "scratch");
    }

    #[test]
    fn set_value_writes_only_own_handles() {
        let foreign = RefCell::new(ForeignRegistry::new());
        let handles = SharedHandles::default();
        let other = SharedHandles::default();
        let mut vm = FakeVm::new();
        vm.ensure_slots(2);
        vm.set_slot_string(0, "kept");
        let raw = vm.get_slot_handle(0).unwrap();
        let own = HandleRegistry::adopt(&handles, raw, HandleKind::Value);
        let stray = HandleRegistry::adopt(&other, raw, HandleKind::Value);

        let mut ctx = CallContext::new(&mut vm, &foreign, &handles);
        ctx.set_value(1, &Value::Handle(own.reference())).unwrap();
        assert!(matches!(
            ctx.set_value(1, &Value::Handle(stray.reference())),
            Err(WrenError::ForeignHandle)
        ));
        assert!(matches!(
            ctx.set(1, Value::Handle(own.reference())),
            Err(WrenError::UnsupportedValue { kind: "Handle" })
        ));

        assert_eq!(vm.get_slot_string(1), "kept");
    }
}
