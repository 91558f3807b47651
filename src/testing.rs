//! In-memory stand-in for the VM, used by unit tests.
//!
//! `FakeVm` implements [`Slots`] and [`Backend`] over plain Rust values. It has
//! no compiler: `interpret` runs a closure registered for the exact source
//! text, and any other source fails to compile the way an undefined variable
//! does. Foreign instances are reference counted; `collect_garbage` finalizes
//! the ones nothing refers to any more.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::CString;
use std::num::NonZeroUsize;
use std::rc::{Rc, Weak};

use crate::backend::{Backend, ClassId, Host, MethodId, RawHandle, Slots};
use crate::error::{WrenError, WrenResult};
use crate::registry::ForeignToken;
use crate::types::{ErrorType, InterpretResult, ValueType};
use crate::vm::Configuration;

type Script = Rc<dyn Fn(&mut FakeVm, &str) -> InterpretResult>;
type ScriptMethod = Rc<dyn Fn(&mut FakeVm) -> InterpretResult>;

#[derive(Debug)]
pub(crate) struct FakeClass {
    pub name: String,
    allocator: Option<ClassId>,
    methods: HashMap<(bool, String), MethodId>,
}

#[derive(Debug)]
pub(crate) struct FakeForeign {
    pub token: ForeignToken,
    pub class: Rc<FakeClass>,
}

#[derive(Debug, Clone)]
pub(crate) enum FakeValue {
    Null,
    Bool(bool),
    Num(f64),
    Str(Vec<u8>),
    List(Rc<RefCell<Vec<FakeValue>>>),
    Foreign(Rc<FakeForeign>),
    Class(Rc<FakeClass>),
    CallHandle(String),
}

impl FakeValue {
    pub fn str(text: &str) -> Self {
        FakeValue::Str(text.as_bytes().to_vec())
    }

    fn class(&self) -> Option<&Rc<FakeClass>> {
        match self {
            FakeValue::Foreign(foreign) => Some(&foreign.class),
            FakeValue::Class(class) => Some(class),
            _ => None,
        }
    }
}

/// Observations that outlive the fake VM itself.
#[derive(Debug, Default)]
pub(crate) struct FakeTally {
    pub freed: Cell<bool>,
    pub leaked_handles: Cell<usize>,
    pub released_handles: Cell<usize>,
}

pub(crate) struct FakeVm {
    host: Option<Rc<dyn Host>>,
    slots: Vec<FakeValue>,
    handles: Vec<Option<FakeValue>>,
    variables: HashMap<(String, String), FakeValue>,
    scripts: HashMap<String, Script>,
    methods: HashMap<String, ScriptMethod>,
    instances: Vec<(Weak<FakeForeign>, ForeignToken)>,
    aborted: Option<FakeValue>,
    refuse_call_handles: bool,
    tally: Rc<FakeTally>,
}

impl FakeVm {
    pub fn new() -> Self {
        Self {
            host: None,
            slots: Vec::new(),
            handles: Vec::new(),
            variables: HashMap::new(),
            scripts: HashMap::new(),
            methods: HashMap::new(),
            instances: Vec::new(),
            aborted: None,
            refuse_call_handles: false,
            tally: Rc::default(),
        }
    }

    /// Make `make_call_handle` fail the way a VM out of memory does.
    pub fn refuse_call_handles(&mut self) {
        self.refuse_call_handles = true;
    }

    pub fn tally(&self) -> Rc<FakeTally> {
        Rc::clone(&self.tally)
    }

    fn host(&self) -> Rc<dyn Host> {
        match &self.host {
            Some(host) => Rc::clone(host),
            None => panic!("FakeVm was created without a host"),
        }
    }

    /// Run `script` whenever `source` is interpreted.
    pub fn on_source(&mut self, source: &str, script: impl Fn(&mut FakeVm, &str) -> InterpretResult + 'static) {
        self.scripts.insert(source.to_owned(), Rc::new(script));
    }

    /// Script-side method run by call handles whose receiver is not foreign.
    pub fn on_method(&mut self, signature: &str, method: impl Fn(&mut FakeVm) -> InterpretResult + 'static) {
        self.methods.insert(signature.to_owned(), Rc::new(method));
    }

    pub fn slot(&self, slot: usize) -> FakeValue {
        self.slots.get(slot).cloned().unwrap_or(FakeValue::Null)
    }

    pub fn set_slot(&mut self, slot: usize, value: FakeValue) {
        if self.slots.len() <= slot {
            self.slots.resize(slot + 1, FakeValue::Null);
        }
        self.slots[slot] = value;
    }

    pub fn define_variable(&mut self, module: &str, name: &str, value: FakeValue) {
        self.variables.insert((module.to_owned(), name.to_owned()), value);
    }

    pub fn variable(&self, module: &str, name: &str) -> FakeValue {
        self.variables
            .get(&(module.to_owned(), name.to_owned()))
            .cloned()
            .unwrap_or(FakeValue::Null)
    }

    /// Put a foreign instance carrying `token` into `slot`, as if the VM had
    /// allocated it.
    pub fn set_slot_foreign_token(&mut self, slot: usize, token: ForeignToken) {
        let class = Rc::new(FakeClass {
            name: "Foreign".to_owned(),
            allocator: None,
            methods: HashMap::new(),
        });
        let instance = self.new_instance(token, class);
        self.set_slot(slot, instance);
    }

    fn new_instance(&mut self, token: ForeignToken, class: Rc<FakeClass>) -> FakeValue {
        let instance = Rc::new(FakeForeign { token, class });
        self.instances.push((Rc::downgrade(&instance), token));
        FakeValue::Foreign(instance)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }

    pub fn abort_message(&self) -> Option<String> {
        match &self.aborted {
            Some(FakeValue::Str(bytes)) => Some(String::from_utf8_lossy(bytes).into_owned()),
            _ => None,
        }
    }

    fn take_abort(&mut self) -> Option<FakeValue> {
        self.aborted.take()
    }

    pub fn live_instances(&self) -> usize {
        self.instances
            .iter()
            .filter(|(instance, _)| instance.strong_count() > 0)
            .count()
    }

    /// `foreign class` declaration: binds the allocator and every listed
    /// `(is_static, signature)` method, then defines the class variable.
    ///
    /// Fails like the VM does when a foreign method has no host binding.
    pub fn declare_foreign_class(
        &mut self,
        module: &str,
        name: &str,
        methods: &[(bool, &str)],
    ) -> Result<FakeValue, InterpretResult> {
        let host = self.host();
        let allocator = host.bind_foreign_class(module, name);
        let mut bound = HashMap::new();
        for &(is_static, signature) in methods {
            match host.bind_foreign_method(module, name, is_static, signature) {
                Some(id) => {
                    bound.insert((is_static, signature.to_owned()), id);
                }
                None => {
                    let message =
                        format!("Could not find foreign method '{signature}' for class {name} in module '{module}'.");
                    return Err(self.raise(FakeValue::str(&message), &[(module, 1, "(script)")]));
                }
            }
        }
        let class = FakeValue::Class(Rc::new(FakeClass {
            name: name.to_owned(),
            allocator,
            methods: bound,
        }));
        self.define_variable(module, name, class.clone());
        Ok(class)
    }

    /// Run a foreign class's allocator with `args`.
    ///
    /// Returns whatever the allocator left in slot 0 (the class itself when
    /// it created no instance), or the abort value.
    pub fn construct(&mut self, class: &FakeValue, args: &[FakeValue]) -> Result<FakeValue, FakeValue> {
        let Some(allocator) = class.class().and_then(|class| class.allocator) else {
            return Err(FakeValue::str("Class does not have an allocator."));
        };
        self.slots = std::iter::once(class.clone()).chain(args.iter().cloned()).collect();
        let host = self.host();
        host.allocate_foreign(allocator, self);
        self.finish_call()
    }

    /// Call a foreign method on `receiver` (an instance, or a class for static
    /// methods).
    pub fn invoke(
        &mut self,
        receiver: &FakeValue,
        is_static: bool,
        signature: &str,
        args: &[FakeValue],
    ) -> Result<FakeValue, FakeValue> {
        let method = receiver
            .class()
            .and_then(|class| class.methods.get(&(is_static, signature.to_owned())).copied());
        let Some(method) = method else {
            return Err(FakeValue::str(&format!("Receiver does not implement '{signature}'.")));
        };
        self.slots = std::iter::once(receiver.clone()).chain(args.iter().cloned()).collect();
        let host = self.host();
        host.invoke_foreign_method(method, self);
        self.finish_call()
    }

    fn finish_call(&mut self) -> Result<FakeValue, FakeValue> {
        let result = self.slot(0);
        self.slots.clear();
        match self.take_abort() {
            Some(error) => Err(error),
            None => Ok(result),
        }
    }

    /// Report a runtime error the way the VM does: the message, then one
    /// callback per `(module, line, function)` frame.
    pub fn raise(&mut self, error: FakeValue, trace: &[(&str, i32, &str)]) -> InterpretResult {
        let message = match error {
            FakeValue::Str(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            _ => "Error".to_owned(),
        };
        let host = self.host();
        host.report_error(ErrorType::Runtime, None, -1, &message);
        for &(module, line, function) in trace {
            host.report_error(ErrorType::StackTrace, Some(module), line, function);
        }
        InterpretResult::RuntimeError
    }

    /// `System.print(text)`.
    pub fn print(&mut self, text: &str) {
        let host = self.host();
        host.write(text);
        host.write("\n");
    }

    fn raw_handle(index: usize) -> RawHandle {
        match NonZeroUsize::new(index + 1) {
            Some(bits) => RawHandle::new(bits),
            None => unreachable!(),
        }
    }

    fn push_handle(&mut self, value: FakeValue) -> RawHandle {
        self.handles.push(Some(value));
        Self::raw_handle(self.handles.len() - 1)
    }

    fn handle_value(&self, handle: RawHandle) -> Option<FakeValue> {
        self.handles.get(handle.bits() - 1).cloned().flatten()
    }

    fn sweep(&mut self) {
        let host = self.host.clone();
        let (dead, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.instances)
            .into_iter()
            .partition(|(instance, _)| instance.strong_count() == 0);
        self.instances = live;
        if let Some(host) = host {
            for (_, token) in dead {
                host.finalize_foreign(token);
            }
        }
    }
}

impl Slots for FakeVm {
    fn ensure_slots(&mut self, count: usize) {
        if self.slots.len() < count {
            self.slots.resize(count, FakeValue::Null);
        }
    }

    fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn slot_type(&self, slot: usize) -> ValueType {
        match self.slots.get(slot) {
            Some(FakeValue::Null) => ValueType::Null,
            Some(FakeValue::Bool(_)) => ValueType::Bool,
            Some(FakeValue::Num(_)) => ValueType::Num,
            Some(FakeValue::Str(_)) => ValueType::String,
            Some(FakeValue::List(_)) => ValueType::List,
            Some(FakeValue::Foreign(_)) => ValueType::Foreign,
            Some(FakeValue::Class(_) | FakeValue::CallHandle(_)) | None => ValueType::Unknown,
        }
    }

    fn get_slot_bool(&self, slot: usize) -> bool {
        matches!(self.slots.get(slot), Some(FakeValue::Bool(true)))
    }

    fn get_slot_double(&self, slot: usize) -> f64 {
        match self.slots.get(slot) {
            Some(FakeValue::Num(value)) => *value,
            _ => 0.0,
        }
    }

    fn get_slot_bytes(&self, slot: usize) -> Vec<u8> {
        match self.slots.get(slot) {
            Some(FakeValue::Str(bytes)) => bytes.clone(),
            _ => Vec::new(),
        }
    }

    fn get_slot_string(&self, slot: usize) -> String {
        String::from_utf8_lossy(&self.get_slot_bytes(slot)).into_owned()
    }

    fn get_slot_handle(&mut self, slot: usize) -> Option<RawHandle> {
        let value = self.slot(slot);
        Some(self.push_handle(value))
    }

    fn get_slot_foreign(&self, slot: usize) -> Option<ForeignToken> {
        match self.slots.get(slot) {
            Some(FakeValue::Foreign(foreign)) => Some(foreign.token),
            _ => None,
        }
    }

    fn set_slot_bool(&mut self, slot: usize, value: bool) {
        self.set_slot(slot, FakeValue::Bool(value));
    }

    fn set_slot_double(&mut self, slot: usize, value: f64) {
        self.set_slot(slot, FakeValue::Num(value));
    }

    fn set_slot_bytes(&mut self, slot: usize, bytes: &[u8]) {
        self.set_slot(slot, FakeValue::Str(bytes.to_vec()));
    }

    fn set_slot_string(&mut self, slot: usize, text: &str) {
        self.set_slot(slot, FakeValue::str(text));
    }

    unsafe fn set_slot_handle(&mut self, slot: usize, handle: RawHandle) {
        let value = self.handle_value(handle).unwrap_or(FakeValue::Null);
        self.set_slot(slot, value);
    }

    fn set_slot_null(&mut self, slot: usize) {
        self.set_slot(slot, FakeValue::Null);
    }

    fn set_slot_new_list(&mut self, slot: usize) {
        self.set_slot(slot, FakeValue::List(Rc::default()));
    }

    unsafe fn set_slot_new_foreign(&mut self, slot: usize, class_slot: usize, token: ForeignToken) {
        let class = match self.slot(class_slot) {
            FakeValue::Class(class) => class,
            other => panic!("slot {class_slot} does not hold a class: {other:?}"),
        };
        let instance = self.new_instance(token, class);
        self.set_slot(slot, instance);
    }

    fn list_count(&self, slot: usize) -> usize {
        match self.slots.get(slot) {
            Some(FakeValue::List(list)) => list.borrow().len(),
            _ => 0,
        }
    }

    fn get_list_element(&mut self, list_slot: usize, index: usize, element_slot: usize) {
        let element = match self.slots.get(list_slot) {
            Some(FakeValue::List(list)) => list.borrow().get(index).cloned(),
            _ => None,
        };
        self.set_slot(element_slot, element.unwrap_or(FakeValue::Null));
    }

    fn insert_in_list(&mut self, list_slot: usize, index: isize, element_slot: usize) {
        let element = self.slot(element_slot);
        if let Some(FakeValue::List(list)) = self.slots.get(list_slot) {
            let mut list = list.borrow_mut();
            let len = list.len() as isize;
            let at = if index < 0 { len + 1 + index } else { index };
            assert!((0..=len).contains(&at), "list index {index} outside a list of {len} elements");
            list.insert(at as usize, element);
        }
    }

    fn get_variable(&mut self, module: &str, name: &str, slot: usize) -> WrenResult<()> {
        CString::new(module)?;
        CString::new(name)?;
        let value = self.variable(module, name);
        self.set_slot(slot, value);
        Ok(())
    }

    fn abort_fiber(&mut self, slot: usize) {
        self.aborted = Some(self.slot(slot));
    }
}

impl Backend for FakeVm {
    fn create(host: Rc<dyn Host>, _config: &Configuration) -> WrenResult<Self> {
        let mut vm = FakeVm::new();
        vm.host = Some(host);
        Ok(vm)
    }

    fn slots(&mut self) -> &mut dyn Slots {
        self
    }

    fn interpret(&mut self, module: &str, source: &str) -> WrenResult<InterpretResult> {
        CString::new(module)?;
        CString::new(source)?;
        self.slots.clear();
        self.aborted = None;

        let result = match self.scripts.get(source).cloned() {
            Some(script) => script(self, module),
            None => {
                let message = format!("Error at '{source}': Variable is used but not defined.");
                self.host().report_error(ErrorType::Compile, Some(module), 1, &message);
                InterpretResult::CompileError
            }
        };
        self.slots.clear();
        Ok(result)
    }

    fn make_call_handle(&mut self, signature: &str) -> WrenResult<RawHandle> {
        CString::new(signature)?;
        assert!(!signature.is_empty(), "empty call handle signature");
        if self.refuse_call_handles {
            return Err(WrenError::CallHandleFailed {
                signature: signature.to_owned(),
            });
        }
        Ok(self.push_handle(FakeValue::CallHandle(signature.to_owned())))
    }

    unsafe fn call(&mut self, method: RawHandle) -> InterpretResult {
        let Some(FakeValue::CallHandle(signature)) = self.handle_value(method) else {
            return self.raise(FakeValue::str("Handle is not a call handle."), &[]);
        };
        let arity = crate::binder::call_arity(&signature);
        assert!(
            self.slots.len() > arity,
            "call of '{signature}' with {} slots",
            self.slots.len()
        );
        let receiver = self.slot(0);
        let args: Vec<FakeValue> = self.slots.iter().skip(1).take(arity).cloned().collect();

        if receiver.class().is_some() {
            let is_static = matches!(receiver, FakeValue::Class(_));
            return match self.invoke(&receiver, is_static, &signature, &args) {
                Ok(result) => {
                    self.slots = vec![result];
                    InterpretResult::Success
                }
                Err(error) => self.raise(error, &[("main", 1, signature.as_str())]),
            };
        }

        match self.methods.get(&signature).cloned() {
            Some(method) => {
                let result = method(self);
                self.slots.truncate(1);
                result
            }
            None => self.raise(
                FakeValue::str(&format!("Receiver does not implement '{signature}'.")),
                &[],
            ),
        }
    }

    unsafe fn release_handle(&mut self, handle: RawHandle) {
        if let Some(entry) = self.handles.get_mut(handle.bits() - 1) {
            *entry = None;
            self.tally.released_handles.set(self.tally.released_handles.get() + 1);
        }
    }

    fn collect_garbage(&mut self) {
        self.sweep();
    }
}

impl Drop for FakeVm {
    fn drop(&mut self) {
        let leaked = self.handles.iter().filter(|entry| entry.is_some()).count();
        self.tally.leaked_handles.set(leaked);
        // Freeing the VM finalizes every foreign instance, reachable or not.
        self.slots.clear();
        self.variables.clear();
        self.handles.clear();
        if let Some(host) = self.host.take() {
            for (_, token) in std::mem::take(&mut self.instances) {
                host.finalize_foreign(token);
            }
        }
        self.tally.freed.set(true);
    }
}
