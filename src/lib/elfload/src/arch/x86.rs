//! 32-bit x86. Images use REL tables, so every addend is the value already stored at the place.

use elf::{abi::EM_386, file::Class};
use tracing::error;

use crate::{
    reloc::{RelocationEntry, RelocationState, TableKind, Width},
    LoadError, LoadErrorKind,
};

// elf::abi carries no i386 relocation types.
pub const R_386_32: u32 = 1;
pub const R_386_PC32: u32 = 2;
pub const R_386_GLOB_DAT: u32 = 6;
pub const R_386_JMP_SLOT: u32 = 7;
pub const R_386_RELATIVE: u32 = 8;
pub const R_386_16: u32 = 20;
pub const R_386_PC16: u32 = 21;
pub const R_386_8: u32 = 22;
pub const R_386_PC8: u32 = 23;

pub struct X86;

impl super::RelocationArch for X86 {
    const NAME: &'static str = "x86";
    const MACHINE: u16 = EM_386;
    const CLASS: Class = Class::ELF32;
    const TABLE_KIND: TableKind = TableKind::Rel;

    fn apply(state: &mut RelocationState<'_>, rel: &RelocationEntry) -> Result<(), LoadError> {
        let s = 0u64;
        let p = state.place(rel.offset);
        let off = rel.offset;

        match rel.r_type {
            R_386_RELATIVE => state.accumulate(off, Width::W32, state.load_bias()),
            R_386_GLOB_DAT | R_386_JMP_SLOT => state.write(off, Width::W32, s),
            R_386_32 => state.accumulate(off, Width::W32, s),
            R_386_16 => state.accumulate(off, Width::W16, s),
            R_386_8 => state.accumulate(off, Width::W8, s),
            R_386_PC32 => state.accumulate(off, Width::W32, s.wrapping_sub(p)),
            R_386_PC16 => state.accumulate(off, Width::W16, s.wrapping_sub(p)),
            R_386_PC8 => state.accumulate(off, Width::W8, s.wrapping_sub(p)),
            other => {
                error!("x86: unsupported relocation: {}", other);
                Err(LoadErrorKind::UnsupportedReloc {
                    arch: Self::NAME,
                    r_type: other,
                }
                .into())
            }
        }
    }
}

#[cfg(target_arch = "x86")]
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
}

#[cfg(test)]
mod tests {
    use elf::abi::{DT_JMPREL, DT_PLTREL, DT_PLTRELSZ, DT_REL, DT_RELENT, DT_RELSZ};

    use super::*;
    use crate::{
        apply_relocations,
        reloc::{
            tests::{image_with_table, rel32, TABLE_AT},
            DynEntry,
        },
        StatusCode,
    };

    const BIAS32: u64 = 0x0804_0000;

    fn relocate(entries: &[[u8; 8]], init: &[(u64, u32)]) -> Result<Vec<u8>, LoadError> {
        let table: Vec<u8> = entries.iter().flatten().copied().collect();
        let mut image = image_with_table(&table);
        for (off, val) in init {
            image[*off as usize..*off as usize + 4].copy_from_slice(&val.to_le_bytes());
        }
        let dynamic = [
            DynEntry::new(DT_REL, TABLE_AT),
            DynEntry::new(DT_RELSZ, table.len() as u64),
            DynEntry::new(DT_RELENT, 8),
        ];
        let mut state = RelocationState::new(&mut image, 0, BIAS32, &dynamic);
        apply_relocations::<X86>(&mut state)?;
        Ok(image)
    }

    fn u32_at(image: &[u8], off: usize) -> u32 {
        u32::from_le_bytes(image[off..off + 4].try_into().unwrap())
    }

    #[test]
    fn relative_adds_bias_to_stored_addend() {
        let image = relocate(&[rel32(0x10, 0, R_386_RELATIVE as u8)], &[(0x10, 0x1234)]).unwrap();
        assert_eq!(u32_at(&image, 0x10), BIAS32 as u32 + 0x1234);
    }

    #[test]
    fn relative_is_order_independent() {
        let a = rel32(0x10, 0, R_386_RELATIVE as u8);
        let b = rel32(0x14, 0, R_386_RELATIVE as u8);
        let init = [(0x10, 0x40), (0x14, 0x80)];
        let fwd = relocate(&[a, b], &init).unwrap();
        let rev = relocate(&[b, a], &init).unwrap();
        assert_eq!(&fwd[0x10..0x18], &rev[0x10..0x18]);
        assert_eq!(u32_at(&fwd, 0x14), BIAS32 as u32 + 0x80);
    }

    #[test]
    fn got_slots_are_cleared() {
        let image = relocate(
            &[
                rel32(0x10, 0, R_386_GLOB_DAT as u8),
                rel32(0x14, 0, R_386_JMP_SLOT as u8),
            ],
            &[(0x10, 0xdead_beef), (0x14, 0xdead_beef)],
        )
        .unwrap();
        assert_eq!(u32_at(&image, 0x10), 0);
        assert_eq!(u32_at(&image, 0x14), 0);
    }

    #[test]
    fn absolute_keeps_implicit_addend() {
        let image = relocate(
            &[
                rel32(0x10, 0, R_386_32 as u8),
                rel32(0x14, 0, R_386_16 as u8),
                rel32(0x18, 0, R_386_8 as u8),
            ],
            &[(0x10, 0x1111_1111), (0x14, 0x2222_2222), (0x18, 0x3333_3333)],
        )
        .unwrap();
        assert_eq!(u32_at(&image, 0x10), 0x1111_1111);
        assert_eq!(u32_at(&image, 0x14), 0x2222_2222);
        assert_eq!(u32_at(&image, 0x18), 0x3333_3333);
    }

    #[test]
    fn pc_relative_subtracts_place() {
        let image = relocate(
            &[
                rel32(0x10, 0, R_386_PC32 as u8),
                rel32(0x18, 0, R_386_PC16 as u8),
            ],
            &[(0x10, 0x100), (0x18, 0x100)],
        )
        .unwrap();
        let p = (BIAS32 + 0x10) as u32;
        assert_eq!(u32_at(&image, 0x10), 0x100u32.wrapping_sub(p));
        let p16 = (BIAS32 + 0x18) as u16;
        assert_eq!(u32_at(&image, 0x18) as u16, 0x100u16.wrapping_sub(p16));
        // Only the low half was touched.
        assert_eq!(u32_at(&image, 0x18) >> 16, 0);
    }

    #[test]
    fn plt_table_uses_rel() {
        let plt = rel32(0x10, 0, R_386_JMP_SLOT as u8);
        let mut image = image_with_table(&plt);
        image[0x10..0x14].copy_from_slice(&0xffff_ffffu32.to_le_bytes());
        let dynamic = [
            DynEntry::new(DT_JMPREL, TABLE_AT),
            DynEntry::new(DT_PLTRELSZ, 8),
            DynEntry::new(DT_PLTREL, DT_REL as u64),
        ];
        let mut state = RelocationState::new(&mut image, 0, BIAS32, &dynamic);
        apply_relocations::<X86>(&mut state).unwrap();
        assert_eq!(u32_at(&image, 0x10), 0);
    }

    #[test]
    fn tls_relocations_are_unimplemented() {
        // R_386_TLS_TPOFF
        let err = relocate(&[rel32(0x10, 0, 14)], &[]).unwrap_err();
        assert_eq!(err.code(), StatusCode::Unimplemented);
        assert!(matches!(
            err.related[0].kind,
            LoadErrorKind::UnsupportedReloc { r_type: 14, .. }
        ));
    }
}
