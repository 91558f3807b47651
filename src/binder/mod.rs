//! Binding host types as foreign classes.
//!
//! A host type describes its constructors and methods through
//! [`ForeignClass`], usually generated by `#[foreign]`. At bind time
//! [`ForeignBinding::of`] turns that description into an immutable table:
//! constructor candidates ordered by descending arity, and a dispatch map keyed
//! by `(is_static, signature)`. At call time the binding coerces the slot
//! window into arguments, invokes the host function and writes the result back
//! to slot 0. Every failure on that path becomes a fiber abort.

mod call_context;
mod coerce;
mod signature;

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::backend::Slots;
use crate::error::{WrenError, WrenResult};
use crate::marshal::{Value, write_value};
use crate::registry::{Finalizer, ForeignObject, ForeignRegistry};

pub use call_context::CallContext;
pub use coerce::{
    Args, ForeignError, FromArg, IntoReturn, Mismatch, ParamKind, ParamMeta, coerce,
    mismatch_message,
};
pub use signature::{call_arity, script_name, signature};

/// Result of a bound host function: an optional value for slot 0.
pub type ForeignReturn = Result<Option<Value>, ForeignError>;

/// A host type exposed to scripts as a foreign class.
///
/// Implemented by `#[foreign]` on an inherent `impl` block.
pub trait ForeignClass: Any + Sized {
    /// Class name the script declares with `foreign class`.
    const CLASS_NAME: &'static str;

    fn constructors() -> Vec<ConstructorMeta<Self>>;

    fn methods() -> Vec<MethodMeta<Self>>;
}

pub struct ConstructorMeta<T> {
    pub params: Vec<ParamMeta>,
    pub construct: fn(&mut Args) -> Result<T, ForeignError>,
}

pub enum Invoke<T> {
    Instance(fn(&mut T, &mut Args) -> ForeignReturn),
    Static(fn(&mut Args) -> ForeignReturn),
}

pub struct MethodMeta<T> {
    /// Host-side name, used in error messages.
    pub name: &'static str,
    /// Overrides the name derived with [`script_name`].
    pub script_name: Option<&'static str>,
    pub params: Vec<ParamMeta>,
    pub invoke: Invoke<T>,
}

/// A raw foreign method, for members bound by hand rather than through
/// [`ForeignClass`].
pub type ForeignMethodFn = Rc<dyn Fn(&mut CallContext<'_>)>;

/// Raw allocator: returns the object to place behind the new instance, or
/// `None` to leave slot 0 without one.
pub type AllocateFn = Rc<dyn Fn(&mut CallContext<'_>) -> Option<ForeignObject>>;

/// Hand-written allocator and finalizer for one foreign class.
#[derive(Clone)]
pub struct ForeignClassMethods {
    pub allocate: AllocateFn,
    pub finalize: Option<Finalizer>,
}

impl ForeignClassMethods {
    pub fn new(allocate: impl Fn(&mut CallContext<'_>) -> Option<ForeignObject> + 'static) -> Self {
        Self {
            allocate: Rc::new(allocate),
            finalize: None,
        }
    }

    pub fn with_finalizer(mut self, finalize: impl Fn(&ForeignObject) + 'static) -> Self {
        self.finalize = Some(Rc::new(finalize));
        self
    }
}

impl fmt::Debug for ForeignClassMethods {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignClassMethods")
            .field("finalize", &self.finalize.is_some())
            .finish_non_exhaustive()
    }
}

type ErasedConstruct = Box<dyn Fn(&mut Args) -> Result<ForeignObject, ForeignError>>;
type ErasedCall = Box<dyn Fn(Option<&ForeignObject>, &mut Args) -> ForeignReturn>;

struct BoundConstructor {
    params: Vec<ParamMeta>,
    construct: ErasedConstruct,
}

struct BoundMethod {
    name: &'static str,
    signature: String,
    is_static: bool,
    params: Vec<ParamMeta>,
    call: ErasedCall,
}

/// The immutable, type-erased binding table of one host type.
pub struct ForeignBinding {
    class_name: &'static str,
    type_id: TypeId,
    constructors: Vec<BoundConstructor>,
    methods: Vec<BoundMethod>,
    dispatch: FxHashMap<(bool, String), usize>,
}

impl ForeignBinding {
    pub fn of<T: ForeignClass>() -> WrenResult<Self> {
        let mut constructors: Vec<BoundConstructor> = T::constructors()
            .into_iter()
            .map(|meta| {
                let construct = meta.construct;
                BoundConstructor {
                    params: meta.params,
                    construct: Box::new(move |args| construct(args).map(ForeignObject::new)),
                }
            })
            .collect();
        // Stable: declaration order breaks ties between equal arities.
        constructors.sort_by(|a, b| b.params.len().cmp(&a.params.len()));

        let metas = T::methods();
        let mut methods = Vec::with_capacity(metas.len());
        let mut dispatch = FxHashMap::default();
        for meta in metas {
            let name = meta
                .script_name
                .map(str::to_owned)
                .unwrap_or_else(|| script_name(meta.name));
            let signature = signature(&name, meta.params.len());
            let (is_static, call) = erase::<T>(meta.invoke);

            let key = (is_static, signature.clone());
            if dispatch.contains_key(&key) {
                return Err(WrenError::DuplicateSignature {
                    class_name: T::CLASS_NAME,
                    signature,
                });
            }
            dispatch.insert(key, methods.len());
            methods.push(BoundMethod {
                name: meta.name,
                signature,
                is_static,
                params: meta.params,
                call,
            });
        }

        debug!(
            class_name = T::CLASS_NAME,
            constructors = constructors.len(),
            methods = methods.len(),
            "built foreign binding"
        );

        Ok(Self {
            class_name: T::CLASS_NAME,
            type_id: TypeId::of::<T>(),
            constructors,
            methods,
            dispatch,
        })
    }

    pub fn class_name(&self) -> &'static str {
        self.class_name
    }

    /// Dispatch index of the method bound to `signature`, if any.
    pub fn find_method(&self, is_static: bool, signature: &str) -> Option<usize> {
        self.dispatch.get(&(is_static, signature.to_owned())).copied()
    }

    /// Every bound `(is_static, signature)` pair, in declaration order.
    pub fn signatures(&self) -> impl Iterator<Item = (bool, &str)> + '_ {
        self.methods
            .iter()
            .map(|method| (method.is_static, method.signature.as_str()))
    }

    /// Constructor arities in the order they are tried.
    pub fn constructor_arities(&self) -> Vec<usize> {
        self.constructors.iter().map(|ctor| ctor.params.len()).collect()
    }

    /// Build the host object for a new instance from the constructor
    /// arguments in slots `1..`.
    ///
    /// The first candidate whose parameters all coerce wins. `None` if none
    /// does, or if the winning constructor failed (the fiber is then aborted).
    pub fn allocate(&self, slots: &mut dyn Slots) -> Option<ForeignObject> {
        let arg_count = slots.slot_count().saturating_sub(1);
        for ctor in &self.constructors {
            if ctor.params.len() > arg_count {
                continue;
            }
            let Ok(values) = ctor
                .params
                .iter()
                .enumerate()
                .map(|(i, param)| coerce(slots, i + 1, param.kind))
                .collect::<Result<Vec<_>, _>>()
            else {
                continue;
            };

            trace!(class_name = self.class_name, arity = ctor.params.len(), "constructing");
            return match (ctor.construct)(&mut Args::new(values)) {
                Ok(object) => Some(object),
                Err(error) => {
                    abort_with(slots, error.message());
                    None
                }
            };
        }

        debug!(
            class_name = self.class_name,
            arg_count, "no constructor matches the supplied arguments"
        );
        None
    }

    /// Run the method at `index` against the current slot window.
    pub fn invoke(&self, index: usize, slots: &mut dyn Slots, foreign: &RefCell<ForeignRegistry>) {
        let Some(method) = self.methods.get(index) else {
            return;
        };
        trace!(class_name = self.class_name, signature = %method.signature, "dispatching");

        let receiver = if method.is_static {
            None
        } else {
            // Clone the object out so the registry is not borrowed during the call.
            let object = slots
                .get_slot_foreign(0)
                .and_then(|token| foreign.borrow().resolve(token))
                .filter(|object| object.type_id() == self.type_id);
            match object {
                Some(object) => Some(object),
                None => {
                    abort_with(
                        slots,
                        &format!(
                            "Foreign method '{}' called on a receiver that is not a live '{}' instance",
                            method.name, self.class_name
                        ),
                    );
                    return;
                }
            }
        };

        let mut values = Vec::with_capacity(method.params.len());
        for (i, param) in method.params.iter().enumerate() {
            match coerce(slots, i + 1, param.kind) {
                Ok(value) => values.push(value),
                Err(mismatch) => {
                    abort_with(slots, &mismatch_message(method.name, param, &mismatch));
                    return;
                }
            }
        }

        match (method.call)(receiver.as_ref(), &mut Args::new(values)) {
            Ok(Some(value)) => {
                if let Err(error) = write_value(slots, 0, &value) {
                    abort_with(slots, &error.to_string());
                }
            }
            Ok(None) => {}
            Err(error) => abort_with(slots, error.message()),
        }
    }
}

impl fmt::Debug for ForeignBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignBinding")
            .field("class_name", &self.class_name)
            .field("constructors", &self.constructor_arities())
            .field("methods", &self.signatures().collect::<Vec<_>>())
            .finish()
    }
}

fn erase<T: ForeignClass>(invoke: Invoke<T>) -> (bool, ErasedCall) {
    match invoke {
        Invoke::Static(call) => (true, Box::new(move |_, args| call(args))),
        Invoke::Instance(call) => (
            false,
            Box::new(move |receiver, args| {
                let cell = receiver
                    .and_then(ForeignObject::downcast::<T>)
                    .ok_or_else(|| {
                        ForeignError::new(format!("receiver is not a '{}' instance", T::CLASS_NAME))
                    })?;
                let mut this = cell.try_borrow_mut().map_err(|_| {
                    ForeignError::new(format!("'{}' instance is already in use", T::CLASS_NAME))
                })?;
                call(&mut this, args)
            }),
        ),
    }
}

/// Abort the running fiber with `message` as its error.
pub(crate) fn abort_with(slots: &mut dyn Slots, message: &str) {
    if slots.slot_count() == 0 {
        slots.ensure_slots(1);
    }
    slots.set_slot_string(0, message);
    slots.abort_fiber(0);
}
