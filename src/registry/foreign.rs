//! Host objects exposed to scripts as foreign-class instances.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use tracing::{debug, trace};

use super::object_heap::{ForeignToken, ObjectHeap};

/// Shared reference to a host object living behind a foreign instance.
///
/// The object sits in a `RefCell` so foreign methods can take `&mut self`
/// while the registry keeps its own reference.
#[derive(Clone)]
pub struct ForeignObject {
    cell: Rc<dyn Any>,
    type_id: TypeId,
    type_name: &'static str,
}

impl ForeignObject {
    pub fn new<T: Any>(value: T) -> Self {
        Self {
            cell: Rc::new(RefCell::new(value)),
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }

    pub fn is<T: Any>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    pub(crate) fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast<T: Any>(&self) -> Option<Rc<RefCell<T>>> {
        Rc::clone(&self.cell).downcast::<RefCell<T>>().ok()
    }

    /// Number of strong references, the registry's included.
    pub fn strong_count(&self) -> usize {
        Rc::strong_count(&self.cell)
    }
}

impl fmt::Debug for ForeignObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignObject")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Callback run when the VM collects the instance owning an entry.
pub type Finalizer = Rc<dyn Fn(&ForeignObject)>;

struct ForeignEntry {
    object: ForeignObject,
    finalizer: Option<Finalizer>,
}

impl ForeignEntry {
    fn finalize(self) {
        if let Some(finalizer) = &self.finalizer {
            finalizer(&self.object);
        }
    }
}

/// Table of live foreign objects, keyed by the token stored in VM memory.
///
/// The table, not the collector, owns the host objects. An entry leaves it
/// exactly once: when the VM finalizes the instance, when host code releases
/// it early, or when the VM is disposed.
#[derive(Default)]
pub struct ForeignRegistry {
    heap: ObjectHeap<ForeignEntry>,
}

impl ForeignRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, object: ForeignObject, finalizer: Option<Finalizer>) -> ForeignToken {
        let type_name = object.type_name();
        let token = self.heap.insert(ForeignEntry { object, finalizer });
        trace!(?token, type_name, "registered foreign object");
        token
    }

    pub fn resolve(&self, token: ForeignToken) -> Option<ForeignObject> {
        self.heap.get(token).map(|entry| entry.object.clone())
    }

    pub fn resolve_as<T: Any>(&self, token: ForeignToken) -> Option<Rc<RefCell<T>>> {
        self.heap.get(token)?.object.downcast::<T>()
    }

    pub fn contains(&self, token: ForeignToken) -> bool {
        self.heap.contains(token)
    }

    /// Remove an entry ahead of collection without running its finalizer.
    ///
    /// The VM instance stays alive but resolves to nothing from now on.
    pub fn release(&mut self, token: ForeignToken) -> Option<ForeignObject> {
        self.heap.remove(token).map(|entry| entry.object)
    }

    /// Collector path: drop the entry and run its finalizer.
    ///
    /// Returns false for tokens already released or never issued.
    pub fn finalize(&mut self, token: ForeignToken) -> bool {
        match self.heap.remove(token) {
            Some(entry) => {
                trace!(?token, type_name = entry.object.type_name(), "finalizing foreign object");
                entry.finalize();
                true
            }
            None => {
                debug!(?token, "finalize for a foreign object that is no longer registered");
                false
            }
        }
    }

    /// Finalize every entry. Used on disposal.
    pub fn clear(&mut self) {
        let entries = self.heap.drain();
        if !entries.is_empty() {
            debug!(count = entries.len(), "clearing foreign objects");
        }
        for entry in entries {
            entry.finalize();
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl fmt::Debug for ForeignRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignRegistry").field("heap", &self.heap).finish()
    }
}
