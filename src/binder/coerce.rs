//! Call-time argument coercion and return conversion.

use std::fmt;

use crate::backend::Slots;
use crate::marshal::Value;
use crate::types::ValueType;

/// Static kind of a bound parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    Bool,
    /// Integer parameter; numbers are truncated toward zero and saturated.
    Int,
    Float,
    Text,
    /// Accepts any bool, number or text slot.
    Any,
}

/// Name and kind of one bound parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamMeta {
    pub name: &'static str,
    pub kind: ParamKind,
    /// Host type name shown in mismatch messages.
    pub type_name: &'static str,
}

impl ParamMeta {
    pub const fn new(name: &'static str, kind: ParamKind, type_name: &'static str) -> Self {
        Self {
            name,
            kind,
            type_name,
        }
    }

    pub fn of<T: FromArg>(name: &'static str) -> Self {
        Self::new(name, T::KIND, T::TYPE_NAME)
    }
}

/// A slot that could not be coerced to its parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Mismatch {
    pub slot: usize,
    pub actual: ValueType,
    /// Printable form of the value found, empty for kinds without one.
    pub observed: String,
}

/// Coerce the value in `slot` to `kind`.
///
/// | slot tag | accepted kinds             |
/// |----------|----------------------------|
/// | bool     | `Bool`, `Any`              |
/// | num      | `Int`, `Float`, `Any`      |
/// | string   | `Text`, `Any`              |
/// | other    | none                       |
pub fn coerce(slots: &dyn Slots, slot: usize, kind: ParamKind) -> Result<Value, Mismatch> {
    let actual = slots.slot_type(slot);
    let coerced = match (actual, kind) {
        (ValueType::Bool, ParamKind::Bool | ParamKind::Any) => {
            Some(Value::Bool(slots.get_slot_bool(slot)))
        }
        (ValueType::Num, ParamKind::Int) => Some(Value::Int(slots.get_slot_double(slot) as i64)),
        (ValueType::Num, ParamKind::Float | ParamKind::Any) => {
            Some(Value::Float(slots.get_slot_double(slot)))
        }
        (ValueType::String, ParamKind::Text | ParamKind::Any) => {
            Some(Value::Text(slots.get_slot_string(slot)))
        }
        _ => None,
    };
    coerced.ok_or_else(|| Mismatch {
        slot,
        actual,
        observed: observe(slots, slot, actual),
    })
}

fn observe(slots: &dyn Slots, slot: usize, actual: ValueType) -> String {
    match actual {
        ValueType::Bool => slots.get_slot_bool(slot).to_string(),
        ValueType::Num => slots.get_slot_double(slot).to_string(),
        ValueType::String => slots.get_slot_string(slot),
        ValueType::Null => "null".to_string(),
        _ => String::new(),
    }
}

/// Abort message for a parameter that failed coercion.
pub fn mismatch_message(method: &str, param: &ParamMeta, mismatch: &Mismatch) -> String {
    format!(
        "Foreign method '{}' parameter '{}' type mismatch given actual parameter of type {} ({} in slot {}), expected type {}",
        method, param.name, mismatch.actual, mismatch.observed, mismatch.slot, param.type_name
    )
}

/// Failure raised by a bound host function; it aborts the calling fiber with
/// its message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignError {
    message: String,
}

impl ForeignError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ForeignError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// A parameter type a bound host function can take.
pub trait FromArg: Sized {
    const KIND: ParamKind;
    const TYPE_NAME: &'static str;

    fn from_arg(value: Value) -> Option<Self>;
}

impl FromArg for bool {
    const KIND: ParamKind = ParamKind::Bool;
    const TYPE_NAME: &'static str = "Bool";

    fn from_arg(value: Value) -> Option<Self> {
        value.as_bool()
    }
}

impl FromArg for i32 {
    const KIND: ParamKind = ParamKind::Int;
    const TYPE_NAME: &'static str = "Int32";

    fn from_arg(value: Value) -> Option<Self> {
        match value {
            Value::Int(value) => Some(value.clamp(i32::MIN as i64, i32::MAX as i64) as i32),
            _ => None,
        }
    }
}

impl FromArg for i64 {
    const KIND: ParamKind = ParamKind::Int;
    const TYPE_NAME: &'static str = "Int64";

    fn from_arg(value: Value) -> Option<Self> {
        match value {
            Value::Int(value) => Some(value),
            _ => None,
        }
    }
}

impl FromArg for f64 {
    const KIND: ParamKind = ParamKind::Float;
    const TYPE_NAME: &'static str = "Double";

    fn from_arg(value: Value) -> Option<Self> {
        match value {
            Value::Float(value) => Some(value),
            _ => None,
        }
    }
}

impl FromArg for String {
    const KIND: ParamKind = ParamKind::Text;
    const TYPE_NAME: &'static str = "String";

    fn from_arg(value: Value) -> Option<Self> {
        match value {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl FromArg for Value {
    const KIND: ParamKind = ParamKind::Any;
    const TYPE_NAME: &'static str = "Object";

    fn from_arg(value: Value) -> Option<Self> {
        Some(value)
    }
}

/// Coerced arguments of one call, consumed in parameter order.
#[derive(Debug)]
pub struct Args {
    values: std::vec::IntoIter<Value>,
}

impl Args {
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            values: values.into_iter(),
        }
    }

    pub fn take<T: FromArg>(&mut self) -> Result<T, ForeignError> {
        let value = self
            .values
            .next()
            .ok_or_else(|| ForeignError::new("Foreign call received fewer arguments than it declares"))?;
        T::from_arg(value).ok_or_else(|| {
            ForeignError::new(format!("Foreign call argument is not a {}", T::TYPE_NAME))
        })
    }

    pub fn remaining(&self) -> usize {
        self.values.len()
    }
}

/// A return type a bound host function can produce.
///
/// `Ok(None)` leaves slot 0 untouched; `Err` aborts the fiber.
pub trait IntoReturn {
    fn into_return(self) -> Result<Option<Value>, ForeignError>;
}

impl IntoReturn for () {
    fn into_return(self) -> Result<Option<Value>, ForeignError> {
        Ok(None)
    }
}

macro_rules! impl_into_return {
    ($($ty:ty),*) => {
        $(
            impl IntoReturn for $ty {
                fn into_return(self) -> Result<Option<Value>, ForeignError> {
                    Ok(Some(Value::from(self)))
                }
            }
        )*
    };
}

impl_into_return!(bool, i32, i64, f64, String);

impl IntoReturn for Value {
    fn into_return(self) -> Result<Option<Value>, ForeignError> {
        Ok(Some(self))
    }
}

impl<T: IntoReturn, E: fmt::Display> IntoReturn for Result<T, E> {
    fn into_return(self) -> Result<Option<Value>, ForeignError> {
        match self {
            Ok(value) => value.into_return(),
            Err(error) => Err(ForeignError::new(error.to_string())),
        }
    }
}
