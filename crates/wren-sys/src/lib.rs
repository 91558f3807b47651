//! Raw bindings to the Wren 0.4 embedding API (`wren.h`).
//!
//! Declarations are written by hand against the public header. Enumerations are
//! exposed as plain `c_int` constants so that an out-of-range value coming back
//! from C never materialises as an invalid Rust enum.

#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]

use std::ffi::{c_char, c_int, c_void};

/// Opaque VM instance.
#[repr(C)]
pub struct WrenVM {
    _private: [u8; 0],
}

/// Opaque persistent reference to a VM value.
#[repr(C)]
pub struct WrenHandle {
    _private: [u8; 0],
}

pub type WrenReallocateFn = Option<
    unsafe extern "C" fn(memory: *mut c_void, new_size: usize, user_data: *mut c_void) -> *mut c_void,
>;

pub type WrenForeignMethodFn = Option<unsafe extern "C" fn(vm: *mut WrenVM)>;

pub type WrenFinalizerFn = Option<unsafe extern "C" fn(data: *mut c_void)>;

pub type WrenResolveModuleFn = Option<
    unsafe extern "C" fn(
        vm: *mut WrenVM,
        importer: *const c_char,
        name: *const c_char,
    ) -> *const c_char,
>;

pub type WrenLoadModuleCompleteFn =
    Option<unsafe extern "C" fn(vm: *mut WrenVM, name: *const c_char, result: WrenLoadModuleResult)>;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct WrenLoadModuleResult {
    pub source: *const c_char,
    pub on_complete: WrenLoadModuleCompleteFn,
    pub user_data: *mut c_void,
}

pub type WrenLoadModuleFn =
    Option<unsafe extern "C" fn(vm: *mut WrenVM, name: *const c_char) -> WrenLoadModuleResult>;

pub type WrenBindForeignMethodFn = Option<
    unsafe extern "C" fn(
        vm: *mut WrenVM,
        module: *const c_char,
        class_name: *const c_char,
        is_static: bool,
        signature: *const c_char,
    ) -> WrenForeignMethodFn,
>;

pub type WrenWriteFn = Option<unsafe extern "C" fn(vm: *mut WrenVM, text: *const c_char)>;

pub type WrenErrorType = c_int;
pub const WREN_ERROR_COMPILE: WrenErrorType = 0;
pub const WREN_ERROR_RUNTIME: WrenErrorType = 1;
pub const WREN_ERROR_STACK_TRACE: WrenErrorType = 2;

pub type WrenErrorFn = Option<
    unsafe extern "C" fn(
        vm: *mut WrenVM,
        kind: WrenErrorType,
        module: *const c_char,
        line: c_int,
        message: *const c_char,
    ),
>;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct WrenForeignClassMethods {
    pub allocate: WrenForeignMethodFn,
    pub finalize: WrenFinalizerFn,
}

pub type WrenBindForeignClassFn = Option<
    unsafe extern "C" fn(
        vm: *mut WrenVM,
        module: *const c_char,
        class_name: *const c_char,
    ) -> WrenForeignClassMethods,
>;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct WrenConfiguration {
    pub reallocate_fn: WrenReallocateFn,
    pub resolve_module_fn: WrenResolveModuleFn,
    pub load_module_fn: WrenLoadModuleFn,
    pub bind_foreign_method_fn: WrenBindForeignMethodFn,
    pub bind_foreign_class_fn: WrenBindForeignClassFn,
    pub write_fn: WrenWriteFn,
    pub error_fn: WrenErrorFn,
    pub initial_heap_size: usize,
    pub min_heap_size: usize,
    pub heap_growth_percent: c_int,
    pub user_data: *mut c_void,
}

pub type WrenInterpretResult = c_int;
pub const WREN_RESULT_SUCCESS: WrenInterpretResult = 0;
pub const WREN_RESULT_COMPILE_ERROR: WrenInterpretResult = 1;
pub const WREN_RESULT_RUNTIME_ERROR: WrenInterpretResult = 2;

pub type WrenType = c_int;
pub const WREN_TYPE_BOOL: WrenType = 0;
pub const WREN_TYPE_NUM: WrenType = 1;
pub const WREN_TYPE_FOREIGN: WrenType = 2;
pub const WREN_TYPE_LIST: WrenType = 3;
pub const WREN_TYPE_MAP: WrenType = 4;
pub const WREN_TYPE_NULL: WrenType = 5;
pub const WREN_TYPE_STRING: WrenType = 6;
pub const WREN_TYPE_UNKNOWN: WrenType = 7;

unsafe extern "C" {
    pub fn wrenGetVersionNumber() -> c_int;

    pub fn wrenInitConfiguration(configuration: *mut WrenConfiguration);
    pub fn wrenNewVM(configuration: *mut WrenConfiguration) -> *mut WrenVM;
    pub fn wrenFreeVM(vm: *mut WrenVM);
    pub fn wrenCollectGarbage(vm: *mut WrenVM);

    pub fn wrenInterpret(
        vm: *mut WrenVM,
        module: *const c_char,
        source: *const c_char,
    ) -> WrenInterpretResult;

    pub fn wrenMakeCallHandle(vm: *mut WrenVM, signature: *const c_char) -> *mut WrenHandle;
    pub fn wrenCall(vm: *mut WrenVM, method: *mut WrenHandle) -> WrenInterpretResult;
    pub fn wrenReleaseHandle(vm: *mut WrenVM, handle: *mut WrenHandle);

    pub fn wrenGetSlotCount(vm: *mut WrenVM) -> c_int;
    pub fn wrenEnsureSlots(vm: *mut WrenVM, num_slots: c_int);
    pub fn wrenGetSlotType(vm: *mut WrenVM, slot: c_int) -> WrenType;

    pub fn wrenGetSlotBool(vm: *mut WrenVM, slot: c_int) -> bool;
    pub fn wrenGetSlotBytes(vm: *mut WrenVM, slot: c_int, length: *mut c_int) -> *const c_char;
    pub fn wrenGetSlotDouble(vm: *mut WrenVM, slot: c_int) -> f64;
    pub fn wrenGetSlotForeign(vm: *mut WrenVM, slot: c_int) -> *mut c_void;
    pub fn wrenGetSlotString(vm: *mut WrenVM, slot: c_int) -> *const c_char;
    pub fn wrenGetSlotHandle(vm: *mut WrenVM, slot: c_int) -> *mut WrenHandle;

    pub fn wrenSetSlotBool(vm: *mut WrenVM, slot: c_int, value: bool);
    pub fn wrenSetSlotBytes(vm: *mut WrenVM, slot: c_int, bytes: *const c_char, length: usize);
    pub fn wrenSetSlotDouble(vm: *mut WrenVM, slot: c_int, value: f64);
    pub fn wrenSetSlotNewForeign(
        vm: *mut WrenVM,
        slot: c_int,
        class_slot: c_int,
        size: usize,
    ) -> *mut c_void;
    pub fn wrenSetSlotNewList(vm: *mut WrenVM, slot: c_int);
    pub fn wrenSetSlotNewMap(vm: *mut WrenVM, slot: c_int);
    pub fn wrenSetSlotNull(vm: *mut WrenVM, slot: c_int);
    pub fn wrenSetSlotString(vm: *mut WrenVM, slot: c_int, text: *const c_char);
    pub fn wrenSetSlotHandle(vm: *mut WrenVM, slot: c_int, handle: *mut WrenHandle);

    pub fn wrenGetListCount(vm: *mut WrenVM, slot: c_int) -> c_int;
    pub fn wrenGetListElement(vm: *mut WrenVM, list_slot: c_int, index: c_int, element_slot: c_int);
    pub fn wrenSetListElement(vm: *mut WrenVM, list_slot: c_int, index: c_int, element_slot: c_int);
    pub fn wrenInsertInList(vm: *mut WrenVM, list_slot: c_int, index: c_int, element_slot: c_int);

    pub fn wrenGetMapCount(vm: *mut WrenVM, slot: c_int) -> c_int;
    pub fn wrenGetMapContainsKey(vm: *mut WrenVM, map_slot: c_int, key_slot: c_int) -> bool;
    pub fn wrenGetMapValue(vm: *mut WrenVM, map_slot: c_int, key_slot: c_int, value_slot: c_int);
    pub fn wrenSetMapValue(vm: *mut WrenVM, map_slot: c_int, key_slot: c_int, value_slot: c_int);
    pub fn wrenRemoveMapValue(
        vm: *mut WrenVM,
        map_slot: c_int,
        key_slot: c_int,
        removed_value_slot: c_int,
    );

    pub fn wrenGetVariable(
        vm: *mut WrenVM,
        module: *const c_char,
        name: *const c_char,
        slot: c_int,
    );
    pub fn wrenHasVariable(vm: *mut WrenVM, module: *const c_char, name: *const c_char) -> bool;
    pub fn wrenHasModule(vm: *mut WrenVM, module: *const c_char) -> bool;

    pub fn wrenAbortFiber(vm: *mut WrenVM, slot: c_int);

    pub fn wrenGetUserData(vm: *mut WrenVM) -> *mut c_void;
    pub fn wrenSetUserData(vm: *mut WrenVM, user_data: *mut c_void);
}
