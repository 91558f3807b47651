//! Persistent VM handles.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use rustc_hash::FxHashMap;
use tracing::{trace, warn};

use crate::backend::RawHandle;
use crate::error::{WrenError, WrenResult};

/// Live handles of one VM, plus handles dropped since the last entry point.
///
/// The VM can only release a handle while nothing is running on it, so a
/// [`Handle`] dropped at an arbitrary point only queues its raw handle here.
/// The owner flushes the queue with [`take_pending`](Self::take_pending).
#[derive(Debug, Default)]
pub struct HandleRegistry {
    live: FxHashMap<u64, Entry>,
    pending_release: Vec<RawHandle>,
    next_id: u64,
}

pub(crate) type SharedHandles = Rc<RefCell<HandleRegistry>>;

/// What a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// A value taken from a slot.
    Value,
    /// A method signature, callable with `arity` arguments after the receiver.
    Call { arity: usize },
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    raw: RawHandle,
    kind: HandleKind,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a freshly acquired raw handle in an owning [`Handle`].
    pub(crate) fn adopt(registry: &SharedHandles, raw: RawHandle, kind: HandleKind) -> Handle {
        let mut this = registry.borrow_mut();
        let id = this.next_id;
        this.next_id += 1;
        this.live.insert(id, Entry { raw, kind });
        trace!(id, ?raw, ?kind, "acquired handle");
        Handle {
            id,
            registry: Rc::downgrade(registry),
        }
    }

    pub(crate) fn raw(&self, id: u64) -> Option<RawHandle> {
        self.live.get(&id).map(|entry| entry.raw)
    }

    pub(crate) fn kind(&self, id: u64) -> Option<HandleKind> {
        self.live.get(&id).map(|entry| entry.kind)
    }

    /// Stop tracking `id`, returning the raw handle for the VM to release.
    pub(crate) fn remove(&mut self, id: u64) -> Option<RawHandle> {
        self.live.remove(&id).map(|entry| entry.raw)
    }

    fn queue_release(&mut self, id: u64) {
        if let Some(entry) = self.live.remove(&id) {
            trace!(id, "queued dropped handle for release");
            self.pending_release.push(entry.raw);
        }
    }

    pub(crate) fn take_pending(&mut self) -> Vec<RawHandle> {
        std::mem::take(&mut self.pending_release)
    }

    /// Every raw handle still owed to the VM, live or pending.
    pub(crate) fn drain_all(&mut self) -> Vec<RawHandle> {
        let mut raw: Vec<RawHandle> = self.live.drain().map(|(_, entry)| entry.raw).collect();
        raw.append(&mut self.pending_release);
        raw
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending_release.len()
    }
}

/// An owned, persistent reference to a VM value.
///
/// Obtained from a slot with
/// [`get_slot_handle`](crate::VirtualMachine::get_slot_handle) or from
/// [`make_call_handle`](crate::VirtualMachine::make_call_handle). Release it
/// explicitly with [`release_handle`](crate::VirtualMachine::release_handle);
/// dropping it unreleased releases it at the next VM entry point.
pub struct Handle {
    id: u64,
    registry: Weak<RefCell<HandleRegistry>>,
}

impl Handle {
    /// True once released, or once the owning VM is gone.
    pub fn is_released(&self) -> bool {
        !self.has_reference()
    }

    /// True while the handle still pins its VM value.
    pub fn has_reference(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.borrow().raw(self.id).is_some())
    }

    /// What the handle refers to; `None` once released.
    pub fn kind(&self) -> Option<HandleKind> {
        self.registry.upgrade().and_then(|registry| registry.borrow().kind(self.id))
    }

    /// Non-owning reference, for passing the handle as a [`Value`](crate::Value).
    pub fn reference(&self) -> HandleRef {
        HandleRef {
            id: self.id,
            registry: Weak::clone(&self.registry),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn belongs_to(&self, registry: &SharedHandles) -> bool {
        std::ptr::eq(self.registry.as_ptr(), Rc::as_ptr(registry))
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        match registry.try_borrow_mut() {
            Ok(mut registry) => registry.queue_release(self.id),
            Err(_) => warn!(id = self.id, "handle dropped while its registry was busy; leaking it"),
        };
    }
}

/// A borrowed view of a [`Handle`] that can be written to a slot.
#[derive(Clone)]
pub struct HandleRef {
    id: u64,
    registry: Weak<RefCell<HandleRegistry>>,
}

impl HandleRef {
    /// Raw handle to write, or why it cannot be written.
    pub(crate) fn resolve(&self) -> WrenResult<RawHandle> {
        let registry = self.registry.upgrade().ok_or(WrenError::HandleReleased)?;
        let raw = registry.borrow().raw(self.id);
        raw.ok_or(WrenError::HandleReleased)
    }

    pub(crate) fn belongs_to(&self, registry: &SharedHandles) -> bool {
        std::ptr::eq(self.registry.as_ptr(), Rc::as_ptr(registry))
    }
}

impl PartialEq for HandleRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Weak::ptr_eq(&self.registry, &other.registry)
    }
}

impl fmt::Debug for HandleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HandleRef").field(&self.id).finish()
    }
}
