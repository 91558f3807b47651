//! Checked conversions between host values and VM slots.
//!
//! [`FromSlot`] reads a Rust value out of a slot and [`IntoSlot`] writes one
//! in. Both validate the slot index against the current window and, for reads,
//! the slot's tag against the requested kind. Text and bytes read from a slot
//! are copies: the VM may reclaim its memory once control returns to it.
//!
//! ## Supported types
//!
//! - `bool`, `f64`
//! - `i32`, `i64` (numbers truncate toward zero and saturate)
//! - `String`, `&str` (text), `Vec<u8>`, `&[u8]` (byte sequences)
//! - `()` and `Option<T>` (null)
//! - [`Value`], the dynamically typed union of the above

use std::fmt;

use crate::backend::Slots;
use crate::error::{WrenError, WrenResult};
use crate::registry::{HandleRef, SharedHandles};
use crate::types::ValueType;

/// A dynamically typed slot value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Handle(HandleRef),
}

impl Value {
    /// Name of the kind, as used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::Text(_) => "String",
            Value::Bytes(_) => "Bytes",
            Value::Handle(_) => "Handle",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Numeric view; integers widen to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(value) => Some(*value as f64),
            Value::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(value) => write!(f, "{value}"),
            Value::Int(value) => write!(f, "{value}"),
            Value::Float(value) => write!(f, "{value}"),
            Value::Text(text) => f.write_str(text),
            Value::Bytes(bytes) => write!(f, "<{} bytes>", bytes.len()),
            Value::Handle(_) => f.write_str("<handle>"),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value as i64)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_owned())
    }
}

impl From<HandleRef> for Value {
    fn from(value: HandleRef) -> Self {
        Value::Handle(value)
    }
}

/// Read a Rust value out of a slot.
pub trait FromSlot: Sized {
    fn from_slot(slots: &dyn Slots, slot: usize) -> WrenResult<Self>;
}

/// Write a Rust value into a slot.
pub trait IntoSlot {
    fn into_slot(self, slots: &mut dyn Slots, slot: usize) -> WrenResult<()>;
}

pub(crate) fn check_slot(slots: &dyn Slots, slot: usize) -> WrenResult<()> {
    let count = slots.slot_count();
    if slot < count {
        Ok(())
    } else {
        Err(WrenError::SlotOutOfRange { slot, count })
    }
}

fn expect_type(
    slots: &dyn Slots,
    slot: usize,
    wanted: ValueType,
    expected: &'static str,
) -> WrenResult<()> {
    check_slot(slots, slot)?;
    let actual = slots.slot_type(slot);
    if actual == wanted {
        Ok(())
    } else {
        Err(WrenError::SlotTypeMismatch {
            slot,
            expected,
            actual,
        })
    }
}

// ============================================================================
// Reads
// ============================================================================

impl FromSlot for bool {
    fn from_slot(slots: &dyn Slots, slot: usize) -> WrenResult<Self> {
        expect_type(slots, slot, ValueType::Bool, "Bool")?;
        Ok(slots.get_slot_bool(slot))
    }
}

impl FromSlot for f64 {
    fn from_slot(slots: &dyn Slots, slot: usize) -> WrenResult<Self> {
        expect_type(slots, slot, ValueType::Num, "Num")?;
        Ok(slots.get_slot_double(slot))
    }
}

macro_rules! impl_from_slot_int {
    ($($ty:ty),*) => {
        $(
            impl FromSlot for $ty {
                fn from_slot(slots: &dyn Slots, slot: usize) -> WrenResult<Self> {
                    expect_type(slots, slot, ValueType::Num, "Num")?;
                    // `as` truncates toward zero and saturates; NaN becomes 0.
                    Ok(slots.get_slot_double(slot) as $ty)
                }
            }
        )*
    };
}

impl_from_slot_int!(i32, i64);

impl FromSlot for String {
    fn from_slot(slots: &dyn Slots, slot: usize) -> WrenResult<Self> {
        expect_type(slots, slot, ValueType::String, "String")?;
        Ok(slots.get_slot_string(slot))
    }
}

impl FromSlot for Vec<u8> {
    fn from_slot(slots: &dyn Slots, slot: usize) -> WrenResult<Self> {
        expect_type(slots, slot, ValueType::String, "String")?;
        Ok(slots.get_slot_bytes(slot))
    }
}

impl FromSlot for () {
    fn from_slot(slots: &dyn Slots, slot: usize) -> WrenResult<Self> {
        expect_type(slots, slot, ValueType::Null, "Null")
    }
}

impl<T: FromSlot> FromSlot for Option<T> {
    fn from_slot(slots: &dyn Slots, slot: usize) -> WrenResult<Self> {
        check_slot(slots, slot)?;
        if slots.slot_type(slot) == ValueType::Null {
            Ok(None)
        } else {
            T::from_slot(slots, slot).map(Some)
        }
    }
}

impl FromSlot for Value {
    fn from_slot(slots: &dyn Slots, slot: usize) -> WrenResult<Self> {
        read_value(slots, slot)
    }
}

/// Read whatever the slot holds as a [`Value`].
///
/// Numbers come back as [`Value::Float`]. Lists, maps, foreign instances and
/// unknown values have no [`Value`] form and are a usage error.
pub fn read_value(slots: &dyn Slots, slot: usize) -> WrenResult<Value> {
    check_slot(slots, slot)?;
    match slots.slot_type(slot) {
        ValueType::Bool => Ok(Value::Bool(slots.get_slot_bool(slot))),
        ValueType::Num => Ok(Value::Float(slots.get_slot_double(slot))),
        ValueType::String => Ok(Value::Text(slots.get_slot_string(slot))),
        ValueType::Null => Ok(Value::Null),
        actual => Err(WrenError::SlotTypeMismatch {
            slot,
            expected: "Bool, Num, String or Null",
            actual,
        }),
    }
}

// ============================================================================
// Writes
// ============================================================================

impl IntoSlot for bool {
    fn into_slot(self, slots: &mut dyn Slots, slot: usize) -> WrenResult<()> {
        check_slot(slots, slot)?;
        slots.set_slot_bool(slot, self);
        Ok(())
    }
}

macro_rules! impl_into_slot_num {
    ($($ty:ty),*) => {
        $(
            impl IntoSlot for $ty {
                fn into_slot(self, slots: &mut dyn Slots, slot: usize) -> WrenResult<()> {
                    check_slot(slots, slot)?;
                    slots.set_slot_double(slot, self as f64);
                    Ok(())
                }
            }
        )*
    };
}

impl_into_slot_num!(i32, i64, f64);

impl IntoSlot for &str {
    fn into_slot(self, slots: &mut dyn Slots, slot: usize) -> WrenResult<()> {
        check_slot(slots, slot)?;
        slots.set_slot_string(slot, self);
        Ok(())
    }
}

impl IntoSlot for String {
    fn into_slot(self, slots: &mut dyn Slots, slot: usize) -> WrenResult<()> {
        self.as_str().into_slot(slots, slot)
    }
}

impl IntoSlot for &[u8] {
    fn into_slot(self, slots: &mut dyn Slots, slot: usize) -> WrenResult<()> {
        check_slot(slots, slot)?;
        slots.set_slot_bytes(slot, self);
        Ok(())
    }
}

impl IntoSlot for Vec<u8> {
    fn into_slot(self, slots: &mut dyn Slots, slot: usize) -> WrenResult<()> {
        self.as_slice().into_slot(slots, slot)
    }
}

impl IntoSlot for () {
    fn into_slot(self, slots: &mut dyn Slots, slot: usize) -> WrenResult<()> {
        check_slot(slots, slot)?;
        slots.set_slot_null(slot);
        Ok(())
    }
}

impl<T: IntoSlot> IntoSlot for Option<T> {
    fn into_slot(self, slots: &mut dyn Slots, slot: usize) -> WrenResult<()> {
        match self {
            Some(value) => value.into_slot(slots, slot),
            None => ().into_slot(slots, slot),
        }
    }
}

impl IntoSlot for &Value {
    fn into_slot(self, slots: &mut dyn Slots, slot: usize) -> WrenResult<()> {
        write_value(slots, slot, self)
    }
}

impl IntoSlot for Value {
    fn into_slot(self, slots: &mut dyn Slots, slot: usize) -> WrenResult<()> {
        write_value(slots, slot, &self)
    }
}

/// Write a [`Value`] with the writer for its kind.
///
/// Byte sequences are rejected: they have no distinct slot tag, so callers
/// write them with the dedicated `&[u8]` writer instead. Handles are rejected
/// too, since a bare slot window cannot tell which VM a handle belongs to;
/// the façade's `set_slot_value` and [`CallContext::set_value`] write them.
///
/// [`CallContext::set_value`]: crate::binder::CallContext::set_value
pub fn write_value(slots: &mut dyn Slots, slot: usize, value: &Value) -> WrenResult<()> {
    match value {
        Value::Null => ().into_slot(slots, slot),
        Value::Bool(value) => value.into_slot(slots, slot),
        Value::Int(value) => value.into_slot(slots, slot),
        Value::Float(value) => value.into_slot(slots, slot),
        Value::Text(text) => text.as_str().into_slot(slots, slot),
        Value::Handle(_) | Value::Bytes(_) => Err(WrenError::UnsupportedValue {
            kind: value.kind_name(),
        }),
    }
}

/// [`write_value`] for a window of the VM whose handles live in `owner`.
pub(crate) fn write_owned_value(
    slots: &mut dyn Slots,
    slot: usize,
    value: &Value,
    owner: &SharedHandles,
) -> WrenResult<()> {
    let Value::Handle(handle) = value else {
        return write_value(slots, slot, value);
    };
    if !handle.belongs_to(owner) {
        return Err(WrenError::ForeignHandle);
    }
    check_slot(slots, slot)?;
    let raw = handle.resolve()?;
    // SAFETY: `raw` is live in `owner`, which holds the handles of the VM
    // behind `slots`; it is released only through that registry.
    unsafe { slots.set_slot_handle(slot, raw) };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{HandleKind, HandleRegistry};
    use crate::testing::FakeVm;

    fn vm_with_slots(count: usize) -> FakeVm {
        let mut vm = FakeVm::new();
        vm.ensure_slots(count);
        vm
    }

    #[test]
    fn bool_round_trip() {
        let mut vm = vm_with_slots(1);
        true.into_slot(&mut vm, 0).unwrap();
        assert_eq!(vm.slot_type(0), ValueType::Bool);
        assert!(bool::from_slot(&vm, 0).unwrap());
    }

    #[test]
    fn integer_reads_truncate_toward_zero() {
        let mut vm = vm_with_slots(2);
        (-2.9f64).into_slot(&mut vm, 0).unwrap();
        7.99f64.into_slot(&mut vm, 1).unwrap();

        assert_eq!(i32::from_slot(&vm, 0).unwrap(), -2);
        assert_eq!(i64::from_slot(&vm, 1).unwrap(), 7);
    }

    #[test]
    fn integer_reads_saturate() {
        let mut vm = vm_with_slots(1);
        1e12f64.into_slot(&mut vm, 0).unwrap();
        assert_eq!(i32::from_slot(&vm, 0).unwrap(), i32::MAX);
    }

    #[test]
    fn text_and_bytes() {
        let mut vm = vm_with_slots(2);
        "bar".into_slot(&mut vm, 0).unwrap();
        let buffer = vec![0u8, 159, 146, 150];
        buffer.as_slice().into_slot(&mut vm, 1).unwrap();
        drop(buffer);

        assert_eq!(String::from_slot(&vm, 0).unwrap(), "bar");
        assert_eq!(Vec::<u8>::from_slot(&vm, 1).unwrap(), vec![0u8, 159, 146, 150]);
    }

    #[test]
    fn read_with_wrong_tag_is_a_usage_error() {
        let mut vm = vm_with_slots(2);
        75.0f64.into_slot(&mut vm, 1).unwrap();

        let error = String::from_slot(&vm, 1).unwrap_err();
        assert!(matches!(
            error,
            WrenError::SlotTypeMismatch {
                slot: 1,
                expected: "String",
                actual: ValueType::Num
            }
        ));
    }

    #[test]
    fn slot_outside_window() {
        let mut vm = vm_with_slots(1);
        assert!(matches!(
            true.into_slot(&mut vm, 3),
            Err(WrenError::SlotOutOfRange { slot: 3, count: 1 })
        ));
        assert!(matches!(
            bool::from_slot(&vm, 1),
            Err(WrenError::SlotOutOfRange { slot: 1, count: 1 })
        ));
    }

    #[test]
    fn option_maps_null() {
        let mut vm = vm_with_slots(2);
        None::<bool>.into_slot(&mut vm, 0).unwrap();
        Some(3i32).into_slot(&mut vm, 1).unwrap();

        assert_eq!(Option::<f64>::from_slot(&vm, 0).unwrap(), None);
        assert_eq!(Option::<f64>::from_slot(&vm, 1).unwrap(), Some(3.0));
    }

    #[test]
    fn write_value_dispatches_by_kind() {
        let mut vm = vm_with_slots(4);
        write_value(&mut vm, 0, &Value::Null).unwrap();
        write_value(&mut vm, 1, &Value::Int(4)).unwrap();
        write_value(&mut vm, 2, &Value::from("text")).unwrap();
        write_value(&mut vm, 3, &Value::Bool(false)).unwrap();

        assert_eq!(read_value(&vm, 0).unwrap(), Value::Null);
        assert_eq!(read_value(&vm, 1).unwrap(), Value::Float(4.0));
        assert_eq!(read_value(&vm, 2).unwrap(), Value::Text("text".into()));
        assert_eq!(read_value(&vm, 3).unwrap(), Value::Bool(false));
    }

    #[test]
    fn write_value_rejects_bytes() {
        let mut vm = vm_with_slots(1);
        let error = write_value(&mut vm, 0, &Value::Bytes(vec![1])).unwrap_err();
        assert!(matches!(error, WrenError::UnsupportedValue { kind: "Bytes" }));
    }

    #[test]
    fn handles_need_their_owner() {
        let owner = SharedHandles::default();
        let mut vm = vm_with_slots(2);
        vm.set_slot_string(0, "bar");
        let raw = vm.get_slot_handle(0).unwrap();
        let handle = HandleRegistry::adopt(&owner, raw, HandleKind::Value);
        let value = Value::Handle(handle.reference());

        assert!(matches!(
            write_value(&mut vm, 1, &value),
            Err(WrenError::UnsupportedValue { kind: "Handle" })
        ));
        assert!(matches!(
            write_owned_value(&mut vm, 1, &value, &SharedHandles::default()),
            Err(WrenError::ForeignHandle)
        ));
        assert!(matches!(
            write_owned_value(&mut vm, 2, &value, &owner),
            Err(WrenError::SlotOutOfRange { slot: 2, count: 2 })
        ));

        write_owned_value(&mut vm, 1, &value, &owner).unwrap();
        assert_eq!(String::from_slot(&vm, 1).unwrap(), "bar");

        owner.borrow_mut().remove(handle.id());
        assert!(matches!(
            write_owned_value(&mut vm, 1, &value, &owner),
            Err(WrenError::HandleReleased)
        ));
    }

    #[test]
    fn read_value_rejects_lists() {
        let mut vm = vm_with_slots(1);
        vm.set_slot_new_list(0);
        assert!(matches!(
            read_value(&vm, 0),
            Err(WrenError::SlotTypeMismatch {
                actual: ValueType::List,
                ..
            })
        ));
    }
}
