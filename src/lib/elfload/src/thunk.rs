//! Calls from host code into generated code.
//!
//! Generated code follows the platform's system calling convention, which is not necessarily the
//! convention the host was compiled with (x86_64 Windows, for example). There is one function per
//! signature the runtime ever needs; adding a signature means adding a function here and a case to
//! each architecture's `host` module.
//!
//! Naming follows `call_<ret>_<args>`: `v` is void, `i` is a C `int` and `p` is a pointer.

use core::ffi::{c_int, c_void};
use std::fmt::Display;

use crate::arch::host;

/// The closed set of signatures generated code is called with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallSignature {
    /// `void fn(void)`, used for initializers.
    VoidVoid,
    /// `void *fn(int)`
    PtrInt,
    /// `void *fn(int, void *)`, used for the library query.
    PtrIntPtr,
    /// `int fn(void *, void *)`, used for entry points.
    IntPtrPtr,
}

impl Display for CallSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CallSignature::VoidVoid => "v_v",
            CallSignature::PtrInt => "p_i",
            CallSignature::PtrIntPtr => "p_ip",
            CallSignature::IntPtrPtr => "i_pp",
        };
        f.write_str(s)
    }
}

/// Arguments for [invoke]. The variant selects the signature.
#[derive(Debug, Clone, Copy)]
pub enum CallArgs {
    None,
    Int(c_int),
    IntPtr(c_int, *mut c_void),
    PtrPtr(*mut c_void, *mut c_void),
}

impl CallArgs {
    pub fn signature(&self) -> CallSignature {
        match self {
            CallArgs::None => CallSignature::VoidVoid,
            CallArgs::Int(_) => CallSignature::PtrInt,
            CallArgs::IntPtr(..) => CallSignature::PtrIntPtr,
            CallArgs::PtrPtr(..) => CallSignature::IntPtrPtr,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallResult {
    Void,
    Ptr(*mut c_void),
    Int(c_int),
}

impl CallResult {
    /// The returned pointer, if the call returned one.
    pub fn ptr(self) -> Option<*mut c_void> {
        match self {
            CallResult::Ptr(p) => Some(p),
            _ => None,
        }
    }

    /// The returned `int`, if the call returned one.
    pub fn int(self) -> Option<c_int> {
        match self {
            CallResult::Int(i) => Some(i),
            _ => None,
        }
    }
}

/// Call `sym` with the signature implied by `args`.
///
/// # Safety
/// `sym` must be the address of a function with that signature in the system calling convention.
pub unsafe fn invoke(sym: *const u8, args: CallArgs) -> CallResult {
    match args {
        CallArgs::None => {
            call_v_v(sym);
            CallResult::Void
        }
        CallArgs::Int(a0) => CallResult::Ptr(call_p_i(sym, a0)),
        CallArgs::IntPtr(a0, a1) => CallResult::Ptr(call_p_ip(sym, a0, a1)),
        CallArgs::PtrPtr(a0, a1) => CallResult::Int(call_i_pp(sym, a0, a1)),
    }
}

/// # Safety
/// `sym` must be the address of a `void fn(void)` in the system calling convention.
pub unsafe fn call_v_v(sym: *const u8) {
    host::call_v_v(sym)
}

/// # Safety
/// `sym` must be the address of a `void *fn(int)` in the system calling convention.
pub unsafe fn call_p_i(sym: *const u8, a0: c_int) -> *mut c_void {
    host::call_p_i(sym, a0)
}

/// # Safety
/// `sym` must be the address of a `void *fn(int, void *)` in the system calling convention.
pub unsafe fn call_p_ip(sym: *const u8, a0: c_int, a1: *mut c_void) -> *mut c_void {
    host::call_p_ip(sym, a0, a1)
}

/// # Safety
/// `sym` must be the address of an `int fn(void *, void *)` in the system calling convention,
/// and both pointers must be valid for whatever that function does with them.
pub unsafe fn call_i_pp(sym: *const u8, a0: *mut c_void, a1: *mut c_void) -> c_int {
    host::call_i_pp(sym, a0, a1)
}

/// Define a function using the system calling convention that the `call_*` thunks expect, so
/// host-compiled code can stand in for generated code.
#[macro_export]
macro_rules! system_abi_fn {
    ($(#[$m:meta])* $vis:vis unsafe fn $name:ident($($arg:ident: $ty:ty),* $(,)?) $(-> $ret:ty)? $body:block) => {
        #[cfg(target_arch = "x86_64")]
        $(#[$m])* $vis unsafe extern "sysv64" fn $name($($arg: $ty),*) $(-> $ret)? $body
        #[cfg(not(target_arch = "x86_64"))]
        $(#[$m])* $vis unsafe extern "C" fn $name($($arg: $ty),*) $(-> $ret)? $body
    };
}
