//! x86-64 (System V psABI) relocations and calls.

use elf::{abi::EM_X86_64, file::Class};
use tracing::error;

use crate::{
    reloc::{RelocationEntry, RelocationState, TableKind, Width},
    LoadError, LoadErrorKind,
};

pub use elf::abi::{
    R_X86_64_16, R_X86_64_32, R_X86_64_32S, R_X86_64_64, R_X86_64_8, R_X86_64_COPY,
    R_X86_64_GLOB_DAT, R_X86_64_JUMP_SLOT, R_X86_64_PC16, R_X86_64_PC32, R_X86_64_PC64,
    R_X86_64_PC8, R_X86_64_RELATIVE,
};

pub struct X86_64;

impl super::RelocationArch for X86_64 {
    const NAME: &'static str = "x86_64";
    const MACHINE: u16 = EM_X86_64;
    const CLASS: Class = Class::ELF64;
    const TABLE_KIND: TableKind = TableKind::Rela;

    fn apply(state: &mut RelocationState<'_>, rel: &RelocationEntry) -> Result<(), LoadError> {
        // No symbol resolution happens here, so S is always zero.
        let s = 0u64;
        let a = rel.addend.unwrap_or(0) as u64;
        let p = state.place(rel.offset);
        let off = rel.offset;

        match rel.r_type {
            R_X86_64_RELATIVE => state.write(off, Width::W64, state.load_bias().wrapping_add(a)),
            R_X86_64_GLOB_DAT | R_X86_64_JUMP_SLOT => {
                state.write(off, Width::W64, s.wrapping_add(a))
            }
            R_X86_64_COPY => state.write(off, Width::W64, s),
            R_X86_64_64 => state.accumulate(off, Width::W64, s.wrapping_add(a)),
            // 32S differs from 32 only in how the linker checked for overflow; the stored bits
            // are the low 32 either way.
            R_X86_64_32 | R_X86_64_32S => state.accumulate(off, Width::W32, s.wrapping_add(a)),
            R_X86_64_16 => state.accumulate(off, Width::W16, s.wrapping_add(a)),
            R_X86_64_8 => state.accumulate(off, Width::W8, s.wrapping_add(a)),
            R_X86_64_PC64 => state.accumulate(off, Width::W64, s.wrapping_add(a).wrapping_sub(p)),
            R_X86_64_PC32 => state.accumulate(off, Width::W32, s.wrapping_add(a).wrapping_sub(p)),
            R_X86_64_PC16 => state.accumulate(off, Width::W16, s.wrapping_add(a).wrapping_sub(p)),
            R_X86_64_PC8 => state.accumulate(off, Width::W8, s.wrapping_add(a).wrapping_sub(p)),
            other => {
                error!("x86_64: unsupported relocation: {}", other);
                Err(LoadErrorKind::UnsupportedReloc {
                    arch: Self::NAME,
                    r_type: other,
                }
                .into())
            }
        }
    }
}

// System V AMD64 calling convention: arguments in RDI, RSI, RDX, RCX, R8, R9, results in RAX.
// Generated code always uses it, so calls are made through `extern "sysv64"` pointers, which
// also gives Windows hosts (whose default is the Microsoft x64 convention) the right call sites.
#[cfg(target_arch = "x86_64")]
pub(crate) mod host {
    use core::ffi::{c_int, c_void};

    pub unsafe fn call_v_v(sym: *const u8) {
        let f: unsafe extern "sysv64" fn() = core::mem::transmute(sym);
        f()
    }

    pub unsafe fn call_p_i(sym: *const u8, a0: c_int) -> *mut c_void {
        let f: unsafe extern "sysv64" fn(c_int) -> *mut c_void = core::mem::transmute(sym);
        f(a0)
    }

    pub unsafe fn call_p_ip(sym: *const u8, a0: c_int, a1: *mut c_void) -> *mut c_void {
        let f: unsafe extern "sysv64" fn(c_int, *mut c_void) -> *mut c_void =
            core::mem::transmute(sym);
        f(a0, a1)
    }

    pub unsafe fn call_i_pp(sym: *const u8, a0: *mut c_void, a1: *mut c_void) -> c_int {
        let f: unsafe extern "sysv64" fn(*mut c_void, *mut c_void) -> c_int =
            core::mem::transmute(sym);
        f(a0, a1)
    }
}
