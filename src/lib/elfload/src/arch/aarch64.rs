use elf::{abi::EM_AARCH64, file::Class};
use tracing::error;

use crate::{
    reloc::{RelocationEntry, RelocationState, TableKind, Width},
    LoadError, LoadErrorKind,
};

pub use elf::abi::{
    R_AARCH64_ABS16, R_AARCH64_ABS32, R_AARCH64_ABS64, R_AARCH64_GLOB_DAT, R_AARCH64_JUMP_SLOT,
    R_AARCH64_PREL16, R_AARCH64_PREL32, R_AARCH64_PREL64, R_AARCH64_RELATIVE,
};

pub struct Aarch64;

impl super::RelocationArch for Aarch64 {
    const NAME: &'static str = "aarch64";
    const MACHINE: u16 = EM_AARCH64;
    const CLASS: Class = Class::ELF64;
    const TABLE_KIND: TableKind = TableKind::Rela;

    fn apply(state: &mut RelocationState<'_>, rel: &RelocationEntry) -> Result<(), LoadError> {
        let s = 0u64;
        let a = rel.addend.unwrap_or(0) as u64;
        let p = state.place(rel.offset);
        let off = rel.offset;

        match rel.r_type {
            R_AARCH64_RELATIVE => state.write(off, Width::W64, state.load_bias().wrapping_add(a)),
            R_AARCH64_GLOB_DAT | R_AARCH64_JUMP_SLOT => {
                state.write(off, Width::W64, s.wrapping_add(a))
            }
            R_AARCH64_ABS64 => state.accumulate(off, Width::W64, s.wrapping_add(a)),
            R_AARCH64_ABS32 => state.accumulate(off, Width::W32, s.wrapping_add(a)),
            R_AARCH64_ABS16 => state.accumulate(off, Width::W16, s.wrapping_add(a)),
            R_AARCH64_PREL64 => {
                state.accumulate(off, Width::W64, s.wrapping_add(a).wrapping_sub(p))
            }
            R_AARCH64_PREL32 => {
                state.accumulate(off, Width::W32, s.wrapping_add(a).wrapping_sub(p))
            }
            R_AARCH64_PREL16 => {
                state.accumulate(off, Width::W16, s.wrapping_add(a).wrapping_sub(p))
            }
            other => {
                error!("aarch64: unsupported relocation: {}", other);
                Err(LoadErrorKind::UnsupportedReloc {
                    arch: Self::NAME,
                    r_type: other,
                }
                .into())
            }
        }
    }
}

#[cfg(target_arch = "aarch64")]
pub(crate) mod host {
    use core::ffi::{c_int, c_void};

    pub unsafe fn call_v_v(sym: *const u8) {
        let f: unsafe extern "C" fn() = core::mem::transmute(sym);
        f()
    }

    pub unsafe fn call_p_i(sym: *const u8, a0: c_int) -> *mut c_void {
        let f: unsafe extern "C" fn(c_int) -> *mut c_void = core::mem::transmute(sym);
        f(a0)
    }

    pub unsafe fn call_p_ip(sym: *const u8, a0: c_int, a1: *mut c_void) -> *mut c_void {
        let f: unsafe extern "C" fn(c_int, *mut c_void) -> *mut c_void =
            core::mem::transmute(sym);
        f(a0, a1)
    }

    pub unsafe fn call_i_pp(sym: *const u8, a0: *mut c_void, a1: *mut c_void) -> c_int {
        let f: unsafe extern "C" fn(*mut c_void, *mut c_void) -> c_int =
            core::mem::transmute(sym);
        f(a0, a1)
    }

    /// Make freshly written code visible to instruction fetch.
    pub fn flush_icache(start: *const u8, len: usize) {
        extern "C" {
            fn __clear_cache(start: *mut core::ffi::c_char, end: *mut core::ffi::c_char);
        }
        // __clear_cache is provided by compiler-rt / libgcc on every aarch64 target.
        unsafe {
            __clear_cache(
                start as *mut core::ffi::c_char,
                start.add(len) as *mut core::ffi::c_char,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use elf::abi::{DT_RELA, DT_RELAENT, DT_RELASZ};

    use super::*;
    use crate::{
        apply_relocations,
        reloc::{
            tests::{image_with_table, rela64, BIAS, TABLE_AT},
            DynEntry,
        },
        StatusCode,
    };

    fn relocate(entries: &[[u8; 24]], init: &[(u64, u64)]) -> Result<Vec<u8>, LoadError> {
        let table: Vec<u8> = entries.iter().flatten().copied().collect();
        let mut image = image_with_table(&table);
        for (off, val) in init {
            image[*off as usize..*off as usize + 8].copy_from_slice(&val.to_le_bytes());
        }
        let dynamic = [
            DynEntry::new(DT_RELA, TABLE_AT),
            DynEntry::new(DT_RELASZ, table.len() as u64),
            DynEntry::new(DT_RELAENT, 24),
        ];
        let mut state = RelocationState::new(&mut image, 0, BIAS, &dynamic);
        apply_relocations::<Aarch64>(&mut state)?;
        Ok(image)
    }

    fn u64_at(image: &[u8], off: usize) -> u64 {
        u64::from_le_bytes(image[off..off + 8].try_into().unwrap())
    }

    #[test]
    fn relative_overwrites() {
        let image = relocate(
            &[rela64(0x10, 0, R_AARCH64_RELATIVE, 0x88)],
            &[(0x10, 0x5555)],
        )
        .unwrap();
        assert_eq!(u64_at(&image, 0x10), BIAS + 0x88);
    }

    #[test]
    fn absolute_accumulates() {
        let image = relocate(
            &[
                rela64(0x10, 0, R_AARCH64_ABS64, 0x10),
                rela64(0x18, 0, R_AARCH64_ABS32, 0x10),
                rela64(0x20, 0, R_AARCH64_ABS16, 0x10),
            ],
            &[(0x10, 1), (0x18, 0xffff_ffff_0000_0002), (0x20, 0xffff)],
        )
        .unwrap();
        assert_eq!(u64_at(&image, 0x10), 0x11);
        assert_eq!(u64_at(&image, 0x18), 0xffff_ffff_0000_0012);
        // 0xffff + 0x10 wraps within the 16-bit place.
        assert_eq!(u64_at(&image, 0x20), 0x000f);
    }

    #[test]
    fn place_relative() {
        let image = relocate(
            &[
                rela64(0x10, 0, R_AARCH64_PREL64, 0x100),
                rela64(0x18, 0, R_AARCH64_PREL32, 0x100),
                rela64(0x20, 0, R_AARCH64_PREL16, 0x100),
            ],
            &[],
        )
        .unwrap();
        assert_eq!(u64_at(&image, 0x10), 0x100u64.wrapping_sub(BIAS + 0x10));
        assert_eq!(
            u64_at(&image, 0x18),
            0x100u64.wrapping_sub(BIAS + 0x18) & 0xffff_ffff
        );
        assert_eq!(
            u64_at(&image, 0x20),
            0x100u64.wrapping_sub(BIAS + 0x20) & 0xffff
        );
    }

    #[test]
    fn got_slots_take_addend() {
        let image = relocate(
            &[
                rela64(0x10, 0, R_AARCH64_GLOB_DAT, 0x40),
                rela64(0x18, 0, R_AARCH64_JUMP_SLOT, 0x48),
            ],
            &[(0x10, 7), (0x18, 7)],
        )
        .unwrap();
        assert_eq!(u64_at(&image, 0x10), 0x40);
        assert_eq!(u64_at(&image, 0x18), 0x48);
    }

    #[test]
    fn tls_relocations_are_unimplemented() {
        // R_AARCH64_TLS_TPREL64
        let err = relocate(&[rela64(0x10, 0, 1030, 0)], &[]).unwrap_err();
        assert_eq!(err.code(), StatusCode::Unimplemented);
        assert!(matches!(
            err.related[0].kind,
            LoadErrorKind::UnsupportedReloc {
                arch: "aarch64",
                r_type: 1030
            }
        ));
    }

    #[test]
    fn x86_64_codes_are_not_aarch64_codes() {
        // R_X86_64_RELATIVE has no meaning here.
        let err = relocate(&[rela64(0x10, 0, 8, 0)], &[]).unwrap_err();
        assert_eq!(err.code(), StatusCode::Unimplemented);
    }
}
