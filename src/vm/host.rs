//! Per-VM state behind the callbacks the VM makes into the host.

use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::backend::{ClassId, Host, MethodId, Slots};
use crate::binder::{AllocateFn, CallContext, ForeignBinding, ForeignMethodFn};
use crate::error::VmError;
use crate::error_bridge::{ErrorBridge, ErrorEvent};
use crate::registry::{Finalizer, ForeignObject, ForeignRegistry, ForeignToken, SharedHandles};
use crate::types::ErrorType;

use super::config::{BindForeignClassFn, BindForeignMethodFn, Configuration};

pub(crate) type WriteHandler = Rc<dyn Fn(&str)>;
pub(crate) type ErrorHandler = Rc<dyn Fn(&ErrorEvent)>;

#[derive(Clone)]
enum MethodTarget {
    Bound { binding: Rc<ForeignBinding>, index: usize },
    Raw(ForeignMethodFn),
}

#[derive(Clone)]
enum ClassTarget {
    Bound(Rc<ForeignBinding>),
    Raw {
        allocate: AllocateFn,
        finalize: Option<Finalizer>,
    },
}

/// Everything one VM's callbacks touch.
///
/// Interior mutability only: the VM calls back while the façade is inside
/// `interpret`/`call`, so no borrow may be held across a call into the VM.
pub(crate) struct HostState {
    write_to_console: bool,
    bind_foreign_method: Option<BindForeignMethodFn>,
    bind_foreign_class: Option<BindForeignClassFn>,
    classes: RefCell<FxHashMap<(String, String), Rc<ForeignBinding>>>,
    methods: RefCell<Vec<MethodTarget>>,
    allocators: RefCell<Vec<ClassTarget>>,
    pub(crate) foreign: RefCell<ForeignRegistry>,
    pub(crate) handles: SharedHandles,
    errors: RefCell<ErrorBridge>,
    write_handlers: RefCell<Vec<WriteHandler>>,
    error_handlers: RefCell<Vec<ErrorHandler>>,
}

impl HostState {
    pub(crate) fn new(config: &Configuration) -> Self {
        Self {
            write_to_console: config.write_to_console,
            bind_foreign_method: config.bind_foreign_method.clone(),
            bind_foreign_class: config.bind_foreign_class.clone(),
            classes: RefCell::default(),
            methods: RefCell::default(),
            allocators: RefCell::default(),
            foreign: RefCell::default(),
            handles: SharedHandles::default(),
            errors: RefCell::default(),
            write_handlers: RefCell::default(),
            error_handlers: RefCell::default(),
        }
    }

    /// Returns false if `module`/`class_name` already has a binding.
    pub(crate) fn add_binding(&self, module: &str, binding: ForeignBinding) -> bool {
        let key = (module.to_owned(), binding.class_name().to_owned());
        let mut classes = self.classes.borrow_mut();
        if classes.contains_key(&key) {
            return false;
        }
        classes.insert(key, Rc::new(binding));
        true
    }

    fn binding(&self, module: &str, class_name: &str) -> Option<Rc<ForeignBinding>> {
        self.classes
            .borrow()
            .get(&(module.to_owned(), class_name.to_owned()))
            .cloned()
    }

    pub(crate) fn take_error(&self) -> Option<VmError> {
        self.errors.borrow_mut().take()
    }

    pub(crate) fn add_write_handler(&self, handler: WriteHandler) {
        self.write_handlers.borrow_mut().push(handler);
    }

    pub(crate) fn add_error_handler(&self, handler: ErrorHandler) {
        self.error_handlers.borrow_mut().push(handler);
    }

    /// Finalize every foreign object still registered.
    pub(crate) fn clear_foreign_objects(&self) {
        // Finalizers run outside the borrow.
        let mut registry = std::mem::take(&mut *self.foreign.borrow_mut());
        registry.clear();
    }

    /// Forget every bound class and dispatch target.
    pub(crate) fn clear_bindings(&self) {
        self.methods.borrow_mut().clear();
        self.allocators.borrow_mut().clear();
        self.classes.borrow_mut().clear();
    }

    pub(crate) fn bound_method_count(&self) -> usize {
        self.methods.borrow().len()
    }

    fn register_method(&self, target: MethodTarget) -> MethodId {
        let mut methods = self.methods.borrow_mut();
        methods.push(target);
        MethodId(methods.len() - 1)
    }

    fn register_class(&self, target: ClassTarget) -> ClassId {
        let mut allocators = self.allocators.borrow_mut();
        allocators.push(target);
        ClassId(allocators.len() - 1)
    }

    fn place_foreign(&self, slots: &mut dyn Slots, object: ForeignObject, finalizer: Option<Finalizer>) {
        // Registered before the VM allocates, so a collection triggered by the
        // allocation finds the registry free.
        let token = self.foreign.borrow_mut().register(object, finalizer);
        // SAFETY: the VM enters an allocator with the class in slot 0, and
        // allocators reach slot 0 only through checked writers that refuse it.
        unsafe { slots.set_slot_new_foreign(0, 0, token) };
    }
}

impl Host for HostState {
    fn bind_foreign_method(
        &self,
        module: &str,
        class_name: &str,
        is_static: bool,
        signature: &str,
    ) -> Option<MethodId> {
        if let Some(binding) = self.binding(module, class_name)
            && let Some(index) = binding.find_method(is_static, signature)
        {
            debug!(module, class_name, is_static, signature, "bound foreign method");
            return Some(self.register_method(MethodTarget::Bound { binding, index }));
        }

        if let Some(binder) = &self.bind_foreign_method
            && let Some(method) = binder(module, class_name, is_static, signature)
        {
            debug!(module, class_name, is_static, signature, "bound raw foreign method");
            return Some(self.register_method(MethodTarget::Raw(method)));
        }

        debug!(module, class_name, is_static, signature, "no host method for foreign method");
        None
    }

    fn bind_foreign_class(&self, module: &str, class_name: &str) -> Option<ClassId> {
        if let Some(binding) = self.binding(module, class_name) {
            debug!(module, class_name, "bound foreign class");
            return Some(self.register_class(ClassTarget::Bound(binding)));
        }

        if let Some(binder) = &self.bind_foreign_class
            && let Some(methods) = binder(module, class_name)
        {
            debug!(module, class_name, "bound raw foreign class");
            return Some(self.register_class(ClassTarget::Raw {
                allocate: methods.allocate,
                finalize: methods.finalize,
            }));
        }

        debug!(module, class_name, "no host type for foreign class");
        None
    }

    fn invoke_foreign_method(&self, method: MethodId, slots: &mut dyn Slots) {
        let target = self.methods.borrow().get(method.0).cloned();
        match target {
            Some(MethodTarget::Bound { binding, index }) => binding.invoke(index, slots, &self.foreign),
            Some(MethodTarget::Raw(method)) => {
                let mut ctx = CallContext::new(slots, &self.foreign, &self.handles);
                method(&mut ctx);
            }
            None => warn!(id = method.0, "foreign method invoked after its binding was cleared"),
        }
    }

    fn allocate_foreign(&self, class: ClassId, slots: &mut dyn Slots) {
        let target = self.allocators.borrow().get(class.0).cloned();
        match target {
            Some(ClassTarget::Bound(binding)) => {
                if let Some(object) = binding.allocate(slots) {
                    self.place_foreign(slots, object, None);
                }
            }
            Some(ClassTarget::Raw { allocate, finalize }) => {
                let (object, aborted) = {
                    let mut ctx = CallContext::for_allocator(&mut *slots, &self.foreign, &self.handles);
                    let object = allocate(&mut ctx);
                    (object, ctx.is_aborted())
                };
                match object {
                    Some(_) if aborted => debug!(id = class.0, "allocator aborted; dropping its object"),
                    Some(object) => self.place_foreign(slots, object, finalize),
                    None => {}
                }
            }
            None => warn!(id = class.0, "foreign class allocated after its binding was cleared"),
        }
    }

    fn finalize_foreign(&self, token: ForeignToken) {
        // Collection can start inside any VM allocation; a borrow held at that
        // point would be a bug in this crate, not in the script.
        match self.foreign.try_borrow_mut() {
            Ok(mut registry) => {
                registry.finalize(token);
            }
            Err(_) => warn!(?token, "finalizer ran while the foreign registry was busy"),
        }
    }

    fn write(&self, text: &str) {
        if self.write_to_console {
            print!("{text}");
        }
        let handlers = self.write_handlers.borrow().clone();
        for handler in handlers {
            handler(text);
        }
    }

    fn report_error(&self, kind: ErrorType, module: Option<&str>, line: i32, message: &str) {
        let event = ErrorEvent {
            kind,
            module: module.map(str::to_owned),
            line,
            message: message.to_owned(),
        };
        self.errors.borrow_mut().report(&event);

        let handlers = self.error_handlers.borrow().clone();
        for handler in handlers {
            handler(&event);
        }
    }
}
