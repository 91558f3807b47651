use std::fmt;
use std::rc::Rc;

use crate::binder::{ForeignClassMethods, ForeignMethodFn};

/// Raw method binder: `(module, class_name, is_static, signature)`.
pub type BindForeignMethodFn = Rc<dyn Fn(&str, &str, bool, &str) -> Option<ForeignMethodFn>>;

/// Raw class binder: `(module, class_name)`.
pub type BindForeignClassFn = Rc<dyn Fn(&str, &str) -> Option<ForeignClassMethods>>;

/// Options for a [`VirtualMachine`](crate::VirtualMachine).
///
/// # Example
///
/// ```ignore
/// let config = Configuration::default()
///     .with_raise_on_error(true)
///     .with_write_to_console(true);
/// ```
#[derive(Clone, Default)]
pub struct Configuration {
    /// Also print script output to stdout.
    pub write_to_console: bool,
    /// Return VM errors from `interpret`/`call` instead of only reporting them
    /// to `on_error` subscribers.
    pub raise_on_error: bool,
    /// Consulted for methods of classes not bound with `bind_foreign`.
    pub bind_foreign_method: Option<BindForeignMethodFn>,
    /// Consulted for classes not bound with `bind_foreign`.
    pub bind_foreign_class: Option<BindForeignClassFn>,
    pub initial_heap_size: Option<usize>,
    pub min_heap_size: Option<usize>,
    pub heap_growth_percent: Option<u32>,
}

impl Configuration {
    pub fn with_write_to_console(mut self, enabled: bool) -> Self {
        self.write_to_console = enabled;
        self
    }

    pub fn with_raise_on_error(mut self, enabled: bool) -> Self {
        self.raise_on_error = enabled;
        self
    }

    pub fn with_foreign_method_binder<F>(mut self, binder: F) -> Self
    where
        F: Fn(&str, &str, bool, &str) -> Option<ForeignMethodFn> + 'static,
    {
        self.bind_foreign_method = Some(Rc::new(binder));
        self
    }

    pub fn with_foreign_class_binder<F>(mut self, binder: F) -> Self
    where
        F: Fn(&str, &str) -> Option<ForeignClassMethods> + 'static,
    {
        self.bind_foreign_class = Some(Rc::new(binder));
        self
    }

    pub fn with_initial_heap_size(mut self, bytes: usize) -> Self {
        self.initial_heap_size = Some(bytes);
        self
    }

    pub fn with_min_heap_size(mut self, bytes: usize) -> Self {
        self.min_heap_size = Some(bytes);
        self
    }

    pub fn with_heap_growth_percent(mut self, percent: u32) -> Self {
        self.heap_growth_percent = Some(percent);
        self
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("write_to_console", &self.write_to_console)
            .field("raise_on_error", &self.raise_on_error)
            .field("bind_foreign_method", &self.bind_foreign_method.is_some())
            .field("bind_foreign_class", &self.bind_foreign_class.is_some())
            .field("initial_heap_size", &self.initial_heap_size)
            .field("min_heap_size", &self.min_heap_size)
            .field("heap_growth_percent", &self.heap_growth_percent)
            .finish()
    }
}
