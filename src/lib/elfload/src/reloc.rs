//! Discovery and application of dynamic relocation tables.
//!
//! A relocatable image is linked as if it were loaded at some base address (usually zero), and
//! carries tables of places that hold addresses. Once the image is copied somewhere else, each of
//! those places has to be adjusted by the difference between where it was linked and where it
//! actually lives, the _load bias_. The tables are found through the dynamic section:
//!
//!   - `DT_RELA`/`DT_RELASZ` (or `DT_REL`/`DT_RELSZ`) describe the main table.
//!   - `DT_JMPREL`/`DT_PLTRELSZ` describe the PLT table, with `DT_PLTREL` naming its entry format.
//!
//! Every architecture consumes exactly one entry format. Seeing the other one is an error, since
//! silently skipping a table leaves stale addresses in the image.

use std::{fmt::Display, ops::Range};

use elf::{
    abi::{
        DT_JMPREL, DT_PLTREL, DT_PLTRELSZ, DT_REL, DT_RELA, DT_RELAENT, DT_RELASZ, DT_RELENT,
        DT_RELSZ,
    },
    dynamic::Dyn,
    endian::LittleEndian,
    parse::{ParseAt, ParsingIterator},
    relocation::{Rel, Rela},
};
use tracing::{debug, error, trace};

use crate::{arch::RelocationArch, LoadError, LoadErrorKind};

/// The entry format of a relocation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// Entries with an implicit addend (read from the place being relocated).
    Rel,
    /// Entries carrying an explicit addend.
    Rela,
    /// The PLT table, in whichever format `DT_PLTREL` names.
    JmpRel,
}

impl TableKind {
    fn dt_tag(&self) -> Option<i64> {
        match self {
            TableKind::Rel => Some(DT_REL),
            TableKind::Rela => Some(DT_RELA),
            TableKind::JmpRel => None,
        }
    }
}

impl Display for TableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TableKind::Rel => write!(f, "REL"),
            TableKind::Rela => write!(f, "RELA"),
            TableKind::JmpRel => write!(f, "JMPREL"),
        }
    }
}

/// One (tag, value) pair of the dynamic table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynEntry {
    pub tag: i64,
    pub value: u64,
}

impl DynEntry {
    pub fn new(tag: i64, value: u64) -> Self {
        Self { tag, value }
    }
}

impl From<Dyn> for DynEntry {
    fn from(value: Dyn) -> Self {
        Self {
            tag: value.d_tag,
            value: value.d_val(),
        }
    }
}

/// A single relocation. `addend` is only present for entries from a RELA table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocationEntry {
    pub offset: u64,
    pub r_type: u32,
    pub sym: u32,
    pub addend: Option<i64>,
}

impl From<Rel> for RelocationEntry {
    fn from(r: Rel) -> Self {
        Self {
            offset: r.r_offset,
            r_type: r.r_type,
            sym: r.r_sym,
            addend: None,
        }
    }
}

impl From<Rela> for RelocationEntry {
    fn from(r: Rela) -> Self {
        Self {
            offset: r.r_offset,
            r_type: r.r_type,
            sym: r.r_sym,
            addend: Some(r.r_addend),
        }
    }
}

/// The width of a place being patched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    W8,
    W16,
    W32,
    W64,
}

impl Width {
    pub const fn bytes(self) -> usize {
        match self {
            Width::W8 => 1,
            Width::W16 => 2,
            Width::W32 => 4,
            Width::W64 => 8,
        }
    }

    const fn mask(self) -> u64 {
        match self {
            Width::W64 => u64::MAX,
            _ => (1u64 << (self.bytes() * 8)) - 1,
        }
    }
}

/// Translate `len` bytes at link address `vaddr` into an index range of an image of `image_len`
/// bytes whose first byte was linked at `vaddr_base`.
pub(crate) fn image_range(
    vaddr_base: u64,
    image_len: usize,
    vaddr: u64,
    len: usize,
) -> Result<Range<usize>, LoadError> {
    let oob = || LoadErrorKind::OutOfBounds {
        vaddr,
        width: len,
        base: vaddr_base,
        len: image_len,
    };
    let start = vaddr
        .checked_sub(vaddr_base)
        .and_then(|s| usize::try_from(s).ok())
        .ok_or_else(oob)?;
    let end = start.checked_add(len).ok_or_else(oob)?;
    if end > image_len {
        return Err(oob().into());
    }
    Ok(start..end)
}

/// Everything needed to relocate one image in place.
///
/// `image[0]` holds the byte linked at virtual address `vaddr_base`, and the byte linked at
/// virtual address `v` is found at runtime address `load_bias + v`. All reads and writes are
/// checked against the bounds of `image`.
pub struct RelocationState<'a> {
    image: &'a mut [u8],
    vaddr_base: u64,
    load_bias: u64,
    dynamic: &'a [DynEntry],
}

impl<'a> RelocationState<'a> {
    pub fn new(image: &'a mut [u8], vaddr_base: u64, load_bias: u64, dynamic: &'a [DynEntry]) -> Self {
        Self {
            image,
            vaddr_base,
            load_bias,
            dynamic,
        }
    }

    pub fn load_bias(&self) -> u64 {
        self.load_bias
    }

    pub fn dynamic(&self) -> &[DynEntry] {
        self.dynamic
    }

    /// The runtime address of the place linked at `vaddr` (the `P` of relocation formulas).
    pub fn place(&self, vaddr: u64) -> u64 {
        self.load_bias.wrapping_add(vaddr)
    }

    fn range(&self, vaddr: u64, len: usize) -> Result<Range<usize>, LoadError> {
        image_range(self.vaddr_base, self.image.len(), vaddr, len)
    }

    /// Borrow `len` bytes of the image starting at link address `vaddr`.
    pub fn bytes(&self, vaddr: u64, len: usize) -> Result<&[u8], LoadError> {
        let range = self.range(vaddr, len)?;
        Ok(&self.image[range])
    }

    /// Read a little-endian value of the given width, zero-extended.
    pub fn read(&self, vaddr: u64, width: Width) -> Result<u64, LoadError> {
        let mut buf = [0u8; 8];
        buf[..width.bytes()].copy_from_slice(self.bytes(vaddr, width.bytes())?);
        Ok(u64::from_le_bytes(buf))
    }

    /// Write the low `width` bytes of `value`, little-endian.
    pub fn write(&mut self, vaddr: u64, width: Width, value: u64) -> Result<(), LoadError> {
        let range = self.range(vaddr, width.bytes())?;
        self.image[range].copy_from_slice(&value.to_le_bytes()[..width.bytes()]);
        Ok(())
    }

    /// Add `value` into the place, wrapping at `width`.
    pub fn accumulate(&mut self, vaddr: u64, width: Width, value: u64) -> Result<(), LoadError> {
        let old = self.read(vaddr, width)?;
        self.write(vaddr, width, old.wrapping_add(value) & width.mask())
    }
}

#[derive(Default, Debug)]
struct TableRef {
    addr: Option<u64>,
    size: u64,
    entsize: Option<u64>,
}

#[derive(Default, Debug)]
struct Tables {
    primary: TableRef,
    plt: TableRef,
}

// Walk the dynamic table once, picking out the tables that this architecture consumes.
fn gather_tables<A: RelocationArch>(dynamic: &[DynEntry]) -> Result<Tables, LoadError> {
    let (ptr_tag, sz_tag, ent_tag, foreign) = match A::TABLE_KIND {
        TableKind::Rela => (DT_RELA, DT_RELASZ, DT_RELAENT, [DT_REL, DT_RELSZ, DT_RELENT]),
        _ => (DT_REL, DT_RELSZ, DT_RELENT, [DT_RELA, DT_RELASZ, DT_RELAENT]),
    };

    let mut tables = Tables::default();
    for d in dynamic {
        match d.tag {
            t if t == ptr_tag => tables.primary.addr = Some(d.value),
            t if t == sz_tag => tables.primary.size = d.value,
            t if t == ent_tag => tables.primary.entsize = Some(d.value),
            t if foreign.contains(&t) => {
                let kind = if A::TABLE_KIND == TableKind::Rela {
                    TableKind::Rel
                } else {
                    TableKind::Rela
                };
                error!("{}: image contains {} relocations", A::NAME, kind);
                return Err(LoadErrorKind::UnsupportedTableKind { arch: A::NAME, kind }.into());
            }
            DT_JMPREL => tables.plt.addr = Some(d.value),
            DT_PLTRELSZ => tables.plt.size = d.value,
            DT_PLTREL => {
                if Some(d.value as i64) != A::TABLE_KIND.dt_tag() {
                    error!("{}: unsupported DT_PLTREL {}", A::NAME, d.value);
                    return Err(LoadErrorKind::UnsupportedPltRel {
                        arch: A::NAME,
                        value: d.value,
                    }
                    .into());
                }
            }
            _ => {}
        }
    }
    Ok(tables)
}

fn parse_entries<P>(data: &[u8], class: elf::file::Class) -> Vec<RelocationEntry>
where
    P: ParseAt + Into<RelocationEntry>,
{
    ParsingIterator::<LittleEndian, P>::new(LittleEndian, class, data)
        .map(Into::into)
        .collect()
}

fn read_table<A: RelocationArch>(
    state: &RelocationState<'_>,
    table: &TableRef,
    name: TableKind,
) -> Result<Vec<RelocationEntry>, LoadError> {
    let Some(addr) = table.addr else {
        return Ok(Vec::new());
    };
    if table.size == 0 {
        return Ok(Vec::new());
    }
    if let Some(entsize) = table.entsize {
        let check = match A::TABLE_KIND {
            TableKind::Rela => Rela::validate_entsize(A::CLASS, entsize as usize),
            _ => Rel::validate_entsize(A::CLASS, entsize as usize),
        };
        check?;
    }
    let len = usize::try_from(table.size).map_err(|_| LoadErrorKind::OutOfBounds {
        vaddr: addr,
        width: usize::MAX,
        base: state.vaddr_base,
        len: state.image.len(),
    })?;
    let entsize = match A::TABLE_KIND {
        TableKind::Rela => Rela::size_for(A::CLASS),
        _ => Rel::size_for(A::CLASS),
    };
    if len % entsize != 0 {
        error!(
            "{}: {} table size {} is not a multiple of {}",
            A::NAME,
            name,
            len,
            entsize
        );
        return Err(LoadErrorKind::TruncatedTable {
            table: name,
            size: len,
            entsize,
        }
        .into());
    }
    let data = state.bytes(addr, len)?;
    let entries = match A::TABLE_KIND {
        TableKind::Rela => parse_entries::<Rela>(data, A::CLASS),
        _ => parse_entries::<Rel>(data, A::CLASS),
    };
    debug!(
        "{}: processing {} relocations (num = {})",
        A::NAME,
        name,
        entries.len()
    );
    Ok(entries)
}

fn apply_table<A: RelocationArch>(
    state: &mut RelocationState<'_>,
    entries: &[RelocationEntry],
) -> Result<(), LoadError> {
    for rel in entries {
        if rel.r_type == 0 {
            continue;
        }
        if rel.sym != 0 {
            error!(
                "{}: relocation at {:#x} references symbol {}",
                A::NAME,
                rel.offset,
                rel.sym
            );
            return Err(LoadErrorKind::SymbolRelocation {
                r_type: rel.r_type,
                sym: rel.sym,
            }
            .into());
        }
        trace!("{}: apply {:?}", A::NAME, rel);
        A::apply(state, rel)?;
    }
    Ok(())
}

/// Apply every relocation in the image's main and PLT tables for architecture `A`.
///
/// An image without any relocation tables is valid and is left untouched. The first entry that
/// cannot be applied aborts the whole operation; callers must discard the image in that case.
pub fn apply_relocations<A: RelocationArch>(state: &mut RelocationState<'_>) -> Result<(), LoadError> {
    let tables = gather_tables::<A>(state.dynamic)?;

    let primary_kind = A::TABLE_KIND;
    let primary = read_table::<A>(state, &tables.primary, primary_kind)?;
    apply_table::<A>(state, &primary).map_err(|e| {
        LoadError::new_collect(
            LoadErrorKind::RelocationTableFail {
                table: primary_kind,
            },
            vec![e],
        )
    })?;

    let plt = read_table::<A>(state, &tables.plt, TableKind::JmpRel)?;
    apply_table::<A>(state, &plt).map_err(|e| {
        LoadError::new_collect(
            LoadErrorKind::RelocationTableFail {
                table: TableKind::JmpRel,
            },
            vec![e],
        )
    })?;

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use elf::abi::{
        R_AARCH64_GLOB_DAT, R_AARCH64_RELATIVE, R_X86_64_GLOB_DAT, R_X86_64_JUMP_SLOT,
        R_X86_64_RELATIVE,
    };

    use super::*;
    use crate::{
        arch::{Aarch64, Arch, X86_64, X86},
        StatusCode,
    };

    /// Encode a 64-bit RELA entry.
    pub(crate) fn rela64(offset: u64, sym: u32, r_type: u32, addend: i64) -> [u8; 24] {
        let mut b = [0u8; 24];
        b[0..8].copy_from_slice(&offset.to_le_bytes());
        let info = (u64::from(sym) << 32) | u64::from(r_type);
        b[8..16].copy_from_slice(&info.to_le_bytes());
        b[16..24].copy_from_slice(&addend.to_le_bytes());
        b
    }

    /// Encode a 32-bit REL entry.
    pub(crate) fn rel32(offset: u32, sym: u32, r_type: u8) -> [u8; 8] {
        let mut b = [0u8; 8];
        b[0..4].copy_from_slice(&offset.to_le_bytes());
        let info = (sym << 8) | u32::from(r_type);
        b[4..8].copy_from_slice(&info.to_le_bytes());
        b
    }

    pub(crate) const TABLE_AT: u64 = 0x100;
    pub(crate) const BIAS: u64 = 0x7f00_0000_0000;

    /// A 0x200 byte image with the relocation table copied in at `TABLE_AT`.
    pub(crate) fn image_with_table(table: &[u8]) -> Vec<u8> {
        let mut image = vec![0u8; 0x200];
        image[TABLE_AT as usize..TABLE_AT as usize + table.len()].copy_from_slice(table);
        image
    }

    fn rela_dynamic(size: usize) -> Vec<DynEntry> {
        vec![
            DynEntry::new(DT_RELA, TABLE_AT),
            DynEntry::new(DT_RELASZ, size as u64),
            DynEntry::new(DT_RELAENT, 24),
        ]
    }

    #[test]
    fn empty_tables_leave_image_untouched() {
        let original: Vec<u8> = (0..0x200).map(|i| i as u8).collect();
        for arch in [Arch::X86_64, Arch::Aarch64, Arch::X86] {
            let mut image = original.clone();
            let mut state = RelocationState::new(&mut image, 0, BIAS, &[]);
            arch.apply_relocations(&mut state).unwrap();
            assert_eq!(image, original);

            // A table pointer with a zero size is also "no relocations".
            let (ptr, sz) = match arch {
                Arch::X86 => (DT_REL, DT_RELSZ),
                _ => (DT_RELA, DT_RELASZ),
            };
            let dynamic = [DynEntry::new(ptr, TABLE_AT), DynEntry::new(sz, 0)];
            let mut image = original.clone();
            let mut state = RelocationState::new(&mut image, 0, BIAS, &dynamic);
            arch.apply_relocations(&mut state).unwrap();
            assert_eq!(image, original);
        }
    }

    #[test]
    fn relative_is_independent_of_order() {
        let entries = [
            rela64(0x10, 0, R_X86_64_RELATIVE, 0x40),
            rela64(0x18, 0, R_X86_64_RELATIVE, 0x1000),
            rela64(0x20, 0, R_X86_64_RELATIVE, -8),
        ];
        let mut forward = Vec::new();
        let mut backward = Vec::new();
        for e in entries.iter() {
            forward.extend_from_slice(e);
        }
        for e in entries.iter().rev() {
            backward.extend_from_slice(e);
        }

        let mut results = Vec::new();
        for table in [forward, backward] {
            let mut image = image_with_table(&table);
            let dynamic = rela_dynamic(table.len());
            let mut state = RelocationState::new(&mut image, 0, BIAS, &dynamic);
            apply_relocations::<X86_64>(&mut state).unwrap();
            let vals: Vec<u64> = [0x10, 0x18, 0x20]
                .iter()
                .map(|off| state.read(*off, Width::W64).unwrap())
                .collect();
            results.push(vals);
        }
        assert_eq!(results[0], vec![BIAS + 0x40, BIAS + 0x1000, BIAS - 8]);
        assert_eq!(results[0], results[1]);
    }

    #[test]
    fn symbol_relocations_are_unimplemented_everywhere() {
        // x86_64 and aarch64 share the RELA encoding.
        for (arch, r_type) in [(Arch::X86_64, R_X86_64_GLOB_DAT), (Arch::Aarch64, R_AARCH64_GLOB_DAT)] {
            let table = rela64(0x10, 3, r_type, 0);
            let mut image = image_with_table(&table);
            let dynamic = rela_dynamic(table.len());
            let mut state = RelocationState::new(&mut image, 0, BIAS, &dynamic);
            let err = arch.apply_relocations(&mut state).unwrap_err();
            assert_eq!(err.code(), StatusCode::Unimplemented);
            assert!(matches!(
                err.related[0].kind,
                LoadErrorKind::SymbolRelocation { sym: 3, .. }
            ));
        }

        let table = rel32(0x10, 2, 6);
        let mut image = image_with_table(&table);
        let dynamic = [
            DynEntry::new(DT_REL, TABLE_AT),
            DynEntry::new(DT_RELSZ, table.len() as u64),
        ];
        let mut state = RelocationState::new(&mut image, 0, 0x1000, &dynamic);
        let err = apply_relocations::<X86>(&mut state).unwrap_err();
        assert_eq!(err.code(), StatusCode::Unimplemented);
    }

    #[test]
    fn foreign_table_kind_is_rejected() {
        let dynamic = [DynEntry::new(DT_REL, TABLE_AT), DynEntry::new(DT_RELSZ, 8)];
        let mut image = vec![0u8; 0x200];
        let mut state = RelocationState::new(&mut image, 0, BIAS, &dynamic);
        let err = apply_relocations::<Aarch64>(&mut state).unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
        assert!(matches!(
            err.kind,
            LoadErrorKind::UnsupportedTableKind {
                kind: TableKind::Rel,
                ..
            }
        ));

        let dynamic = [DynEntry::new(DT_RELA, TABLE_AT)];
        let mut state = RelocationState::new(&mut image, 0, BIAS, &dynamic);
        let err = apply_relocations::<X86>(&mut state).unwrap_err();
        assert!(matches!(
            err.kind,
            LoadErrorKind::UnsupportedTableKind {
                kind: TableKind::Rela,
                ..
            }
        ));
    }

    #[test]
    fn both_flavors_are_rejected() {
        let table = rela64(0x10, 0, R_X86_64_RELATIVE, 0);
        let mut image = image_with_table(&table);
        let mut dynamic = rela_dynamic(table.len());
        dynamic.push(DynEntry::new(DT_REL, TABLE_AT));
        let snapshot = image.clone();
        let mut state = RelocationState::new(&mut image, 0, BIAS, &dynamic);
        let err = apply_relocations::<X86_64>(&mut state).unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
        // Table discovery fails before any entry is applied.
        assert_eq!(image, snapshot);
    }

    #[test]
    fn pltrel_must_match_flavor() {
        let dynamic = [
            DynEntry::new(DT_JMPREL, TABLE_AT),
            DynEntry::new(DT_PLTRELSZ, 24),
            DynEntry::new(DT_PLTREL, DT_REL as u64),
        ];
        let mut image = vec![0u8; 0x200];
        let mut state = RelocationState::new(&mut image, 0, BIAS, &dynamic);
        let err = apply_relocations::<X86_64>(&mut state).unwrap_err();
        assert!(matches!(
            err.kind,
            LoadErrorKind::UnsupportedPltRel { value, .. } if value == DT_REL as u64
        ));
    }

    #[test]
    fn plt_table_is_applied_after_primary() {
        let primary = rela64(0x10, 0, R_X86_64_RELATIVE, 0x20);
        let plt = rela64(0x18, 0, R_X86_64_JUMP_SLOT, 0x30);
        let mut table = Vec::new();
        table.extend_from_slice(&primary);
        table.extend_from_slice(&plt);
        let mut image = image_with_table(&table);
        let dynamic = [
            DynEntry::new(DT_RELA, TABLE_AT),
            DynEntry::new(DT_RELASZ, 24),
            DynEntry::new(DT_JMPREL, TABLE_AT + 24),
            DynEntry::new(DT_PLTRELSZ, 24),
            DynEntry::new(DT_PLTREL, DT_RELA as u64),
        ];
        let mut state = RelocationState::new(&mut image, 0, BIAS, &dynamic);
        apply_relocations::<X86_64>(&mut state).unwrap();
        assert_eq!(state.read(0x10, Width::W64).unwrap(), BIAS + 0x20);
        // JUMP_SLOT writes S + A with S = 0.
        assert_eq!(state.read(0x18, Width::W64).unwrap(), 0x30);
    }

    #[test]
    fn out_of_image_place_is_rejected() {
        let table = rela64(0x1f8 + 4, 0, R_X86_64_RELATIVE, 0);
        let mut image = image_with_table(&table);
        let dynamic = rela_dynamic(table.len());
        let mut state = RelocationState::new(&mut image, 0, BIAS, &dynamic);
        let err = apply_relocations::<X86_64>(&mut state).unwrap_err();
        assert_eq!(err.code(), StatusCode::OutOfRange);
    }

    #[test]
    fn out_of_image_table_is_rejected() {
        let dynamic = [DynEntry::new(DT_RELA, 0x1f0), DynEntry::new(DT_RELASZ, 48)];
        let mut image = vec![0u8; 0x200];
        let mut state = RelocationState::new(&mut image, 0, BIAS, &dynamic);
        let err = apply_relocations::<X86_64>(&mut state).unwrap_err();
        assert_eq!(err.code(), StatusCode::OutOfRange);
    }

    #[test]
    fn partial_entry_is_rejected() {
        // One and a half RELA entries.
        let whole = rela64(0x10, 0, R_X86_64_RELATIVE, 0x40);
        let mut table = whole.to_vec();
        table.extend_from_slice(&whole[..12]);
        let mut image = image_with_table(&table);
        let snapshot = image.clone();
        let dynamic = rela_dynamic(table.len());
        let mut state = RelocationState::new(&mut image, 0, BIAS, &dynamic);
        let err = apply_relocations::<X86_64>(&mut state).unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
        assert!(matches!(
            err.kind,
            LoadErrorKind::TruncatedTable {
                size: 36,
                entsize: 24,
                ..
            }
        ));
        // Nothing was applied, not even the complete first entry.
        assert_eq!(image, snapshot);

        // Same for a REL table on x86.
        let mut table = rel32(0x10, 0, 8).to_vec();
        table.extend_from_slice(&[0u8; 4]);
        let mut image = image_with_table(&table);
        let dynamic = [
            DynEntry::new(DT_REL, TABLE_AT),
            DynEntry::new(DT_RELSZ, table.len() as u64),
        ];
        let mut state = RelocationState::new(&mut image, 0, 0x1000, &dynamic);
        let err = apply_relocations::<X86>(&mut state).unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
    }

    #[test]
    fn vaddr_base_offsets_places() {
        // The image starts at link address 0x4000; the table and place are link addresses.
        let table = rela64(0x4010, 0, R_AARCH64_RELATIVE, 0x4800);
        let mut image = image_with_table(&table);
        let dynamic = [
            DynEntry::new(DT_RELA, 0x4000 + TABLE_AT),
            DynEntry::new(DT_RELASZ, 24),
        ];
        let bias = 0x1000_0000;
        let mut state = RelocationState::new(&mut image, 0x4000, bias, &dynamic);
        apply_relocations::<Aarch64>(&mut state).unwrap();
        assert_eq!(state.read(0x4010, Width::W64).unwrap(), bias + 0x4800);
        assert_eq!(&image[0x10..0x18], &(bias + 0x4800).to_le_bytes());
    }

    #[test]
    fn none_entries_are_skipped() {
        // Type 0 is skipped even when it names a symbol.
        let table = rela64(0x10, 9, 0, 0x1234);
        let mut image = image_with_table(&table);
        let snapshot = image.clone();
        let dynamic = rela_dynamic(table.len());
        let mut state = RelocationState::new(&mut image, 0, BIAS, &dynamic);
        apply_relocations::<X86_64>(&mut state).unwrap();
        assert_eq!(image, snapshot);
    }

    #[test]
    fn accumulate_wraps_at_width() {
        let mut image = vec![0u8; 16];
        image[0] = 0xff;
        let mut state = RelocationState::new(&mut image, 0, 0, &[]);
        state.accumulate(0, Width::W8, 2).unwrap();
        assert_eq!(state.read(0, Width::W8).unwrap(), 1);
        // Neighbouring bytes are untouched.
        assert_eq!(state.read(1, Width::W8).unwrap(), 0);
        state.write(4, Width::W16, 0x1_2345).unwrap();
        assert_eq!(state.read(4, Width::W16).unwrap(), 0x2345);
        assert_eq!(state.read(6, Width::W16).unwrap(), 0);
    }
}
