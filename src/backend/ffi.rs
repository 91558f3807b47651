//! [`Backend`] over libwren.
//!
//! libwren calls back through plain function pointers that receive only the
//! `WrenVM*`. The host is reached through the VM's user data; which bound
//! method or class is meant is encoded in the function pointer itself, by
//! handing out one monomorphised trampoline per [`MethodId`] / [`ClassId`].

use std::any::Any;
use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::mem::{MaybeUninit, size_of};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::rc::Rc;

use tracing::{debug, warn};
use wren_sys as sys;

use super::{Backend, ClassId, Host, MethodId, RawHandle, Slots};
use crate::binder::abort_with;
use crate::error::{WrenError, WrenResult};
use crate::registry::ForeignToken;
use crate::types::{ErrorType, InterpretResult, ValueType};
use crate::vm::Configuration;

const TABLE_ROWS: usize = 16;
const ROW_LEN: usize = 16;
const ALLOCATOR_ROWS: usize = 4;

/// Foreign methods one VM can bind, over all its classes. Declarations past
/// this fail in the script as unbound foreign methods.
pub const MAX_FOREIGN_METHODS: usize = TABLE_ROWS * ROW_LEN;

/// Foreign classes one VM can bind. Declarations past this get no allocator,
/// so constructing them fails in the script.
pub const MAX_FOREIGN_CLASSES: usize = ALLOCATOR_ROWS * ROW_LEN;

/// Marks foreign storage written by this module.
const CELL_MAGIC: u64 = 0x5752_454e_464f_524e;

struct UserData {
    host: Rc<dyn Host>,
}

/// Raw storage of every foreign instance this backend creates.
#[repr(C)]
#[derive(Clone, Copy)]
struct ForeignCell {
    magic: u64,
    user_data: *const UserData,
    token: ForeignToken,
}

/// Slot access through a raw VM pointer.
///
/// Valid while the VM is alive; callbacks build their own from the pointer
/// libwren passes them.
pub struct VmRef {
    vm: *mut sys::WrenVM,
}

fn c_slot(slot: usize) -> c_int {
    c_int::try_from(slot).unwrap_or(c_int::MAX)
}

fn lossy(text: *const c_char) -> Option<String> {
    if text.is_null() {
        return None;
    }
    // SAFETY: libwren hands out NUL-terminated strings valid for the callback.
    Some(unsafe { CStr::from_ptr(text) }.to_string_lossy().into_owned())
}

impl VmRef {
    fn user_data(&self) -> *const UserData {
        // SAFETY: `vm` is a live VM created by `WrenVm::create`.
        unsafe { sys::wrenGetUserData(self.vm) as *const UserData }
    }

    fn host(&self) -> Option<Rc<dyn Host>> {
        let data = self.user_data();
        // SAFETY: user data is the `UserData` box owned by `WrenVm`, freed
        // only after the VM itself.
        (!data.is_null()).then(|| Rc::clone(unsafe { &(*data).host }))
    }

    /// libwren asserts on indices outside the window, and compiles the
    /// assertion out of release builds.
    fn in_window(&self, slot: usize) -> bool {
        let valid = slot < self.slot_count();
        if !valid {
            warn!(slot, count = self.slot_count(), "slot access outside the window ignored");
        }
        valid
    }

    /// libwren reads a slot as whatever its getter expects, unchecked.
    fn holds(&self, slot: usize, kind: ValueType) -> bool {
        if !self.in_window(slot) {
            return false;
        }
        let actual = self.slot_type(slot);
        if actual != kind {
            warn!(slot, %actual, expected = %kind, "slot read with the wrong tag ignored");
        }
        actual == kind
    }
}

impl Slots for VmRef {
    fn ensure_slots(&mut self, count: usize) {
        unsafe { sys::wrenEnsureSlots(self.vm, c_slot(count)) }
    }

    fn slot_count(&self) -> usize {
        // Zero while no window is set up.
        usize::try_from(unsafe { sys::wrenGetSlotCount(self.vm) }).unwrap_or(0)
    }

    fn slot_type(&self, slot: usize) -> ValueType {
        if slot >= self.slot_count() {
            return ValueType::Unknown;
        }
        ValueType::from(unsafe { sys::wrenGetSlotType(self.vm, c_slot(slot)) })
    }

    fn get_slot_bool(&self, slot: usize) -> bool {
        self.holds(slot, ValueType::Bool) && unsafe { sys::wrenGetSlotBool(self.vm, c_slot(slot)) }
    }

    fn get_slot_double(&self, slot: usize) -> f64 {
        if !self.holds(slot, ValueType::Num) {
            return 0.0;
        }
        unsafe { sys::wrenGetSlotDouble(self.vm, c_slot(slot)) }
    }

    fn get_slot_bytes(&self, slot: usize) -> Vec<u8> {
        if !self.holds(slot, ValueType::String) {
            return Vec::new();
        }
        let mut length: c_int = 0;
        let bytes = unsafe { sys::wrenGetSlotBytes(self.vm, c_slot(slot), &mut length) };
        let length = usize::try_from(length).unwrap_or(0);
        if bytes.is_null() || length == 0 {
            return Vec::new();
        }
        // SAFETY: libwren returns `length` readable bytes owned by the string.
        unsafe { std::slice::from_raw_parts(bytes.cast::<u8>(), length) }.to_vec()
    }

    fn get_slot_string(&self, slot: usize) -> String {
        String::from_utf8_lossy(&self.get_slot_bytes(slot)).into_owned()
    }

    fn get_slot_handle(&mut self, slot: usize) -> Option<RawHandle> {
        if !self.in_window(slot) {
            return None;
        }
        RawHandle::from_ptr(unsafe { sys::wrenGetSlotHandle(self.vm, c_slot(slot)) })
    }

    fn get_slot_foreign(&self, slot: usize) -> Option<ForeignToken> {
        if self.slot_type(slot) != ValueType::Foreign {
            return None;
        }
        let data = unsafe { sys::wrenGetSlotForeign(self.vm, c_slot(slot)) };
        // SAFETY: foreign storage is at least as large as the class asked for;
        // a class bound elsewhere may be smaller, hence the magic check on an
        // unaligned read only for instances of classes bound here.
        read_cell(data).map(|cell| cell.token)
    }

    fn set_slot_bool(&mut self, slot: usize, value: bool) {
        if self.in_window(slot) {
            unsafe { sys::wrenSetSlotBool(self.vm, c_slot(slot), value) }
        }
    }

    fn set_slot_double(&mut self, slot: usize, value: f64) {
        if self.in_window(slot) {
            unsafe { sys::wrenSetSlotDouble(self.vm, c_slot(slot), value) }
        }
    }

    fn set_slot_bytes(&mut self, slot: usize, bytes: &[u8]) {
        if self.in_window(slot) {
            // libwren copies the buffer before returning.
            unsafe { sys::wrenSetSlotBytes(self.vm, c_slot(slot), bytes.as_ptr().cast(), bytes.len()) }
        }
    }

    fn set_slot_string(&mut self, slot: usize, text: &str) {
        self.set_slot_bytes(slot, text.as_bytes());
    }

    unsafe fn set_slot_handle(&mut self, slot: usize, handle: RawHandle) {
        if self.in_window(slot) {
            // SAFETY: the caller guarantees `handle` is live and ours.
            unsafe { sys::wrenSetSlotHandle(self.vm, c_slot(slot), handle.as_ptr()) }
        }
    }

    fn set_slot_null(&mut self, slot: usize) {
        if self.in_window(slot) {
            unsafe { sys::wrenSetSlotNull(self.vm, c_slot(slot)) }
        }
    }

    fn set_slot_new_list(&mut self, slot: usize) {
        if self.in_window(slot) {
            unsafe { sys::wrenSetSlotNewList(self.vm, c_slot(slot)) }
        }
    }

    unsafe fn set_slot_new_foreign(&mut self, slot: usize, class_slot: usize, token: ForeignToken) {
        if !self.in_window(slot) || !self.in_window(class_slot) {
            return;
        }
        let cell = ForeignCell {
            magic: CELL_MAGIC,
            user_data: self.user_data(),
            token,
        };
        // SAFETY: the caller guarantees `class_slot` holds a foreign class.
        let data = unsafe {
            sys::wrenSetSlotNewForeign(self.vm, c_slot(slot), c_slot(class_slot), size_of::<ForeignCell>())
        };
        if !data.is_null() {
            // SAFETY: libwren just allocated `size_of::<ForeignCell>()` bytes.
            unsafe { ptr::write_unaligned(data.cast::<ForeignCell>(), cell) };
        }
    }

    fn list_count(&self, slot: usize) -> usize {
        if !self.holds(slot, ValueType::List) {
            return 0;
        }
        usize::try_from(unsafe { sys::wrenGetListCount(self.vm, c_slot(slot)) }).unwrap_or(0)
    }

    fn get_list_element(&mut self, list_slot: usize, index: usize, element_slot: usize) {
        if !self.in_window(element_slot) || index >= self.list_count(list_slot) {
            return;
        }
        unsafe {
            sys::wrenGetListElement(self.vm, c_slot(list_slot), c_slot(index), c_slot(element_slot))
        }
    }

    fn insert_in_list(&mut self, list_slot: usize, index: isize, element_slot: usize) {
        if !self.in_window(element_slot) || !self.holds(list_slot, ValueType::List) {
            return;
        }
        let count = isize::try_from(self.list_count(list_slot)).unwrap_or(isize::MAX);
        let Ok(index) = c_int::try_from(index) else {
            warn!(index, "list index does not fit the VM's index type");
            return;
        };
        if !(-(count + 1)..=count).contains(&(index as isize)) {
            warn!(index, count, "list insertion outside the list ignored");
            return;
        }
        unsafe { sys::wrenInsertInList(self.vm, c_slot(list_slot), index, c_slot(element_slot)) }
    }

    fn get_variable(&mut self, module: &str, name: &str, slot: usize) -> WrenResult<()> {
        let module = CString::new(module)?;
        let name = CString::new(name)?;
        if !self.in_window(slot) {
            return Err(WrenError::SlotOutOfRange {
                slot,
                count: self.slot_count(),
            });
        }
        // libwren asserts on unknown modules and variables; read them as null.
        let found = unsafe {
            sys::wrenHasModule(self.vm, module.as_ptr())
                && sys::wrenHasVariable(self.vm, module.as_ptr(), name.as_ptr())
        };
        if found {
            unsafe { sys::wrenGetVariable(self.vm, module.as_ptr(), name.as_ptr(), c_slot(slot)) };
        } else {
            debug!(module = ?module, name = ?name, "variable not defined; reading null");
            self.set_slot_null(slot);
        }
        Ok(())
    }

    fn abort_fiber(&mut self, slot: usize) {
        if self.in_window(slot) {
            unsafe { sys::wrenAbortFiber(self.vm, c_slot(slot)) }
        }
    }
}

fn read_cell(data: *mut c_void) -> Option<ForeignCell> {
    if data.is_null() {
        return None;
    }
    // SAFETY: the caller passes foreign storage of an instance; the magic is
    // only trusted after the read.
    let cell = unsafe { ptr::read_unaligned(data.cast::<ForeignCell>()) };
    (cell.magic == CELL_MAGIC && !cell.user_data.is_null()).then_some(cell)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|text| text.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned());
    format!("Foreign method panicked: {detail}")
}

/// Run `f` against the VM's host, turning a panic into a fiber abort.
fn dispatch(vm: *mut sys::WrenVM, f: impl FnOnce(&dyn Host, &mut VmRef)) {
    let mut slots = VmRef { vm };
    let Some(host) = slots.host() else {
        return;
    };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(&*host, &mut slots)));
    if let Err(payload) = outcome {
        let message = panic_message(payload.as_ref());
        warn!(%message, "caught panic in foreign callback");
        abort_with(&mut slots, &message);
    }
}

unsafe extern "C" fn method_trampoline<const ROW: usize, const COL: usize>(vm: *mut sys::WrenVM) {
    let id = MethodId(ROW * ROW_LEN + COL);
    dispatch(vm, |host, slots| host.invoke_foreign_method(id, slots));
}

unsafe extern "C" fn allocate_trampoline<const ROW: usize, const COL: usize>(vm: *mut sys::WrenVM) {
    let id = ClassId(ROW * ROW_LEN + COL);
    dispatch(vm, |host, slots| host.allocate_foreign(id, slots));
}

unsafe extern "C" fn finalize_trampoline(data: *mut c_void) {
    let Some(cell) = read_cell(data) else {
        return;
    };
    // SAFETY: the cell's user data outlives the VM whose collector runs this.
    let host = Rc::clone(unsafe { &(*cell.user_data).host });
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| host.finalize_foreign(cell.token)));
    if let Err(payload) = outcome {
        warn!(message = %panic_message(payload.as_ref()), "caught panic in finalizer");
    }
}

macro_rules! trampoline_row {
    ($f:ident, $row:literal) => {
        [
            Some($f::<$row, 0>),
            Some($f::<$row, 1>),
            Some($f::<$row, 2>),
            Some($f::<$row, 3>),
            Some($f::<$row, 4>),
            Some($f::<$row, 5>),
            Some($f::<$row, 6>),
            Some($f::<$row, 7>),
            Some($f::<$row, 8>),
            Some($f::<$row, 9>),
            Some($f::<$row, 10>),
            Some($f::<$row, 11>),
            Some($f::<$row, 12>),
            Some($f::<$row, 13>),
            Some($f::<$row, 14>),
            Some($f::<$row, 15>),
        ]
    };
}

macro_rules! trampoline_table {
    ($f:ident, $($row:literal)*) => {
        [$(trampoline_row!($f, $row)),*]
    };
}

static METHOD_TRAMPOLINES: [[sys::WrenForeignMethodFn; ROW_LEN]; TABLE_ROWS] = trampoline_table!(
    method_trampoline,
    0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15
);

static ALLOCATE_TRAMPOLINES: [[sys::WrenForeignMethodFn; ROW_LEN]; ALLOCATOR_ROWS] =
    trampoline_table!(allocate_trampoline, 0 1 2 3);

fn lookup<const ROWS: usize>(
    table: &[[sys::WrenForeignMethodFn; ROW_LEN]; ROWS],
    id: usize,
) -> sys::WrenForeignMethodFn {
    table.get(id / ROW_LEN).and_then(|row| row[id % ROW_LEN])
}

unsafe extern "C" fn bind_foreign_method(
    vm: *mut sys::WrenVM,
    module: *const c_char,
    class_name: *const c_char,
    is_static: bool,
    signature: *const c_char,
) -> sys::WrenForeignMethodFn {
    let (Some(module), Some(class_name), Some(signature)) = (lossy(module), lossy(class_name), lossy(signature))
    else {
        return None;
    };
    let Some(host) = (VmRef { vm }).host() else {
        return None;
    };
    let id = panic::catch_unwind(AssertUnwindSafe(|| {
        host.bind_foreign_method(&module, &class_name, is_static, &signature)
    }))
    .ok()
    .flatten()?;

    let trampoline = lookup(&METHOD_TRAMPOLINES, id.0);
    if trampoline.is_none() {
        warn!(
            id = id.0,
            capacity = MAX_FOREIGN_METHODS,
            %class_name,
            %signature,
            "foreign method table is full"
        );
    }
    trampoline
}

unsafe extern "C" fn bind_foreign_class(
    vm: *mut sys::WrenVM,
    module: *const c_char,
    class_name: *const c_char,
) -> sys::WrenForeignClassMethods {
    let unbound = sys::WrenForeignClassMethods {
        allocate: None,
        finalize: None,
    };
    let (Some(module), Some(class_name)) = (lossy(module), lossy(class_name)) else {
        return unbound;
    };
    let Some(host) = (VmRef { vm }).host() else {
        return unbound;
    };
    let bound = panic::catch_unwind(AssertUnwindSafe(|| host.bind_foreign_class(&module, &class_name)));
    let Ok(Some(id)) = bound else {
        return unbound;
    };

    let allocate = lookup(&ALLOCATE_TRAMPOLINES, id.0);
    if allocate.is_none() {
        warn!(
            id = id.0,
            capacity = MAX_FOREIGN_CLASSES,
            %class_name,
            "foreign class table is full"
        );
        return unbound;
    }
    sys::WrenForeignClassMethods {
        allocate,
        finalize: Some(finalize_trampoline),
    }
}

unsafe extern "C" fn write(vm: *mut sys::WrenVM, text: *const c_char) {
    let (Some(text), Some(host)) = (lossy(text), (VmRef { vm }).host()) else {
        return;
    };
    let _ = panic::catch_unwind(AssertUnwindSafe(|| host.write(&text)));
}

unsafe extern "C" fn report_error(
    vm: *mut sys::WrenVM,
    kind: sys::WrenErrorType,
    module: *const c_char,
    line: c_int,
    message: *const c_char,
) {
    let Ok(kind) = ErrorType::try_from(kind) else {
        warn!(kind, "unknown error kind reported by the VM");
        return;
    };
    let Some(host) = (VmRef { vm }).host() else {
        return;
    };
    let module = lossy(module);
    let message = lossy(message).unwrap_or_default();
    let _ = panic::catch_unwind(AssertUnwindSafe(|| {
        host.report_error(kind, module.as_deref(), line, &message)
    }));
}

/// One libwren VM.
pub struct WrenVm {
    slots: VmRef,
    vm: NonNull<sys::WrenVM>,
    user_data: *mut UserData,
}

impl Backend for WrenVm {
    fn create(host: Rc<dyn Host>, config: &Configuration) -> WrenResult<Self> {
        let user_data = Box::into_raw(Box::new(UserData { host }));

        let mut raw = MaybeUninit::<sys::WrenConfiguration>::uninit();
        // SAFETY: wrenInitConfiguration writes every field.
        let mut raw = unsafe {
            sys::wrenInitConfiguration(raw.as_mut_ptr());
            raw.assume_init()
        };
        raw.bind_foreign_method_fn = Some(bind_foreign_method);
        raw.bind_foreign_class_fn = Some(bind_foreign_class);
        raw.write_fn = Some(write);
        raw.error_fn = Some(report_error);
        raw.user_data = user_data.cast();
        if let Some(bytes) = config.initial_heap_size {
            raw.initial_heap_size = bytes;
        }
        if let Some(bytes) = config.min_heap_size {
            raw.min_heap_size = bytes;
        }
        if let Some(percent) = config.heap_growth_percent {
            raw.heap_growth_percent = c_int::try_from(percent).unwrap_or(c_int::MAX);
        }

        let Some(vm) = NonNull::new(unsafe { sys::wrenNewVM(&mut raw) }) else {
            // SAFETY: no VM refers to the box.
            drop(unsafe { Box::from_raw(user_data) });
            return Err(WrenError::FailedToCreateVm);
        };
        debug!(version = unsafe { sys::wrenGetVersionNumber() }, "created libwren VM");

        Ok(Self {
            slots: VmRef { vm: vm.as_ptr() },
            vm,
            user_data,
        })
    }

    fn slots(&mut self) -> &mut dyn Slots {
        &mut self.slots
    }

    fn interpret(&mut self, module: &str, source: &str) -> WrenResult<InterpretResult> {
        let module = CString::new(module)?;
        let source = CString::new(source)?;
        let raw = unsafe { sys::wrenInterpret(self.vm.as_ptr(), module.as_ptr(), source.as_ptr()) };
        Ok(interpret_result(raw))
    }

    fn make_call_handle(&mut self, signature: &str) -> WrenResult<RawHandle> {
        // libwren reads the last byte of the signature unconditionally.
        if signature.is_empty() {
            return Err(WrenError::InvalidSignature {
                signature: signature.to_owned(),
            });
        }
        let raw_signature = CString::new(signature)?;
        let handle = unsafe { sys::wrenMakeCallHandle(self.vm.as_ptr(), raw_signature.as_ptr()) };
        RawHandle::from_ptr(handle).ok_or_else(|| WrenError::CallHandleFailed {
            signature: signature.to_owned(),
        })
    }

    unsafe fn call(&mut self, method: RawHandle) -> InterpretResult {
        // SAFETY: the caller guarantees a live call handle and a prepared window.
        interpret_result(unsafe { sys::wrenCall(self.vm.as_ptr(), method.as_ptr()) })
    }

    unsafe fn release_handle(&mut self, handle: RawHandle) {
        // SAFETY: the caller guarantees `handle` is live and ours.
        unsafe { sys::wrenReleaseHandle(self.vm.as_ptr(), handle.as_ptr()) }
    }

    fn collect_garbage(&mut self) {
        unsafe { sys::wrenCollectGarbage(self.vm.as_ptr()) }
    }
}

fn interpret_result(raw: sys::WrenInterpretResult) -> InterpretResult {
    InterpretResult::try_from(raw).unwrap_or_else(|_| {
        warn!(raw, "unknown interpret result");
        InterpretResult::RuntimeError
    })
}

impl Drop for WrenVm {
    fn drop(&mut self) {
        // Freeing runs the finalizers, which still need the user data.
        unsafe { sys::wrenFreeVM(self.vm.as_ptr()) };
        // SAFETY: the VM that referred to the box is gone.
        drop(unsafe { Box::from_raw(self.user_data) });
    }
}
