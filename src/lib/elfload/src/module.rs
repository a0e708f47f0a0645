//! Mapping, relocating and initializing a relocatable image in host memory.
//!
//! Loading happens in a fixed order, and a failure at any step drops everything done so far:
//!
//!   1. Validate the header against the host architecture.
//!   2. Check every `PT_LOAD` segment, collecting all the problems found.
//!   3. Reserve one anonymous mapping spanning every segment and copy the file contents in. Bytes
//!      past a segment's file size stay zero.
//!   4. Read the dynamic table out of the mapped image and apply relocations.
//!   5. Apply segment protections, then run initializers.

use std::fmt::Display;

use elf::{
    abi::{
        DT_GNU_HASH, DT_HASH, DT_INIT, DT_INIT_ARRAY, DT_INIT_ARRAYSZ, DT_NULL, DT_STRSZ,
        DT_STRTAB, DT_SYMTAB, PF_R, PF_W, PF_X, PT_DYNAMIC, PT_LOAD, SHN_UNDEF,
    },
    dynamic::Dyn,
    endian::{AnyEndian, LittleEndian},
    file::Class,
    parse::ParsingIterator,
    segment::ProgramHeader,
    string_table::StringTable,
    symbol::Symbol,
    ElfBytes,
};
use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, trace, warn};

use crate::{
    arch::HostArch,
    reloc::{image_range, DynEntry, RelocationState},
    thunk::{invoke, CallArgs},
    apply_relocations, validate_header, LoadError, LoadErrorKind, LoadFlags,
};

/// A `PT_LOAD` segment of a loaded image, in link addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub vaddr: u64,
    pub memsz: u64,
    pub filesz: u64,
    pub offset: u64,
    pub flags: u32,
}

impl Segment {
    pub fn is_readable(&self) -> bool {
        self.flags & PF_R != 0
    }

    pub fn is_writable(&self) -> bool {
        self.flags & PF_W != 0
    }

    pub fn is_executable(&self) -> bool {
        self.flags & PF_X != 0
    }
}

impl Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:#010x}..{:#010x} {}{}{} (file {:#x} bytes at {:#x})",
            self.vaddr,
            self.vaddr + self.memsz,
            if self.is_readable() { 'r' } else { '-' },
            if self.is_writable() { 'w' } else { '-' },
            if self.is_executable() { 'x' } else { '-' },
            self.filesz,
            self.offset
        )
    }
}

fn check_segment(bytes: &[u8], index: usize, phdr: &ProgramHeader) -> Result<Segment, LoadError> {
    let bad = |reason: &str| -> LoadError {
        LoadErrorKind::BadSegment {
            index,
            reason: reason.to_string(),
        }
        .into()
    };
    if phdr.p_filesz > phdr.p_memsz {
        return Err(bad("file size exceeds memory size"));
    }
    let file_end = phdr
        .p_offset
        .checked_add(phdr.p_filesz)
        .ok_or_else(|| bad("file range overflows"))?;
    if file_end > bytes.len() as u64 {
        return Err(bad("file range is outside the image"));
    }
    if phdr.p_vaddr.checked_add(phdr.p_memsz).is_none() {
        return Err(bad("memory range overflows"));
    }
    Ok(Segment {
        vaddr: phdr.p_vaddr,
        memsz: phdr.p_memsz,
        filesz: phdr.p_filesz,
        offset: phdr.p_offset,
        flags: phdr.p_flags,
    })
}

fn page_align_down(v: u64, page: u64) -> u64 {
    v & !(page - 1)
}

fn page_align_up(v: u64, page: u64) -> Option<u64> {
    Some(v.checked_add(page - 1)? & !(page - 1))
}

#[cfg(unix)]
fn page_size() -> u64 {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as u64
    } else {
        4096
    }
}

#[cfg(not(unix))]
fn page_size() -> u64 {
    4096
}

fn word_size(class: Class) -> usize {
    match class {
        Class::ELF32 => 4,
        Class::ELF64 => 8,
    }
}

fn read_word(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(bytes.get(at..at + 4)?.try_into().ok()?))
}

/// The number of dynamic symbols described by a GNU hash table, which has no explicit count: it
/// is one past the last symbol reachable from any bucket. `table` runs from the start of the hash
/// table to the end of the image.
fn gnu_hash_symbol_count(table: &[u8], word: usize) -> Option<usize> {
    let nbuckets = read_u32(table, 0)? as usize;
    let symoffset = read_u32(table, 4)? as usize;
    let bloom_size = read_u32(table, 8)? as usize;
    let buckets_at = 16 + bloom_size * word;
    let chains_at = buckets_at + nbuckets * 4;

    let last = (0..nbuckets)
        .map(|i| read_u32(table, buckets_at + i * 4).map(|b| b as usize))
        .collect::<Option<Vec<_>>>()?
        .into_iter()
        .max()
        .unwrap_or(0);
    if last < symoffset {
        return Some(symoffset);
    }
    let mut idx = last;
    loop {
        let chain = read_u32(table, chains_at + (idx - symoffset) * 4)?;
        if chain & 1 != 0 {
            return Some(idx + 1);
        }
        idx += 1;
    }
}

/// A relocated image mapped into host memory. The mapping lives as long as this value.
pub struct ElfModule {
    map: MmapMut,
    vaddr_base: u64,
    load_bias: u64,
    class: Class,
    segments: Vec<Segment>,
    dynamic: Vec<DynEntry>,
    protected: bool,
}

impl ElfModule {
    /// Load an image from `bytes`. The buffer is only read during this call.
    pub fn load(bytes: &[u8], flags: LoadFlags) -> Result<Self, LoadError> {
        let elf = ElfBytes::<AnyEndian>::minimal_parse(bytes)?;
        validate_header::<HostArch, _>(&elf.ehdr)?;
        let class = elf.ehdr.class;

        let phdrs = elf
            .segments()
            .ok_or_else(|| LoadErrorKind::MissingSection {
                name: "program headers".to_string(),
            })?;

        let segments = LoadError::collect(
            LoadErrorKind::SegmentLoadFail,
            phdrs
                .iter()
                .filter(|p| p.p_type == PT_LOAD)
                .enumerate()
                .map(|(i, p)| check_segment(bytes, i, &p)),
        )?;
        if segments.is_empty() {
            return Err(LoadErrorKind::NoLoadableSegments.into());
        }

        let page = page_size();
        let lo = segments.iter().map(|s| s.vaddr).min().unwrap_or(0);
        let hi = segments
            .iter()
            .map(|s| s.vaddr + s.memsz)
            .max()
            .unwrap_or(0);
        let vaddr_base = page_align_down(lo, page);
        let span = page_align_up(hi, page)
            .map(|end| end - vaddr_base)
            .and_then(|len| usize::try_from(len).ok())
            .ok_or_else(|| LoadErrorKind::BadSegment {
                index: 0,
                reason: "image span overflows".to_string(),
            })?;

        debug!(
            "mapping {} segments: {:#x} bytes for vaddr {:#x}",
            segments.len(),
            span,
            vaddr_base
        );
        let mut map = MmapOptions::new()
            .len(span)
            .map_anon()
            .map_err(|err| LoadErrorKind::MapFailed { err })?;

        for seg in &segments {
            let dst = (seg.vaddr - vaddr_base) as usize;
            let src = seg.offset as usize;
            let len = seg.filesz as usize;
            trace!("copy segment {}", seg);
            map[dst..dst + len].copy_from_slice(&bytes[src..src + len]);
        }

        let load_bias = (map.as_ptr() as u64).wrapping_sub(vaddr_base);

        let dynamic: Vec<DynEntry> = match phdrs.iter().find(|p| p.p_type == PT_DYNAMIC) {
            Some(phdr) => {
                let len = usize::try_from(phdr.p_memsz).unwrap_or(usize::MAX);
                let range = image_range(vaddr_base, map.len(), phdr.p_vaddr, len)?;
                ParsingIterator::<LittleEndian, Dyn>::new(LittleEndian, class, &map[range])
                    .map(DynEntry::from)
                    .take_while(|d| d.tag != DT_NULL)
                    .collect()
            }
            None => {
                debug!("image has no dynamic segment");
                Vec::new()
            }
        };

        {
            let mut state = RelocationState::new(&mut map[..], vaddr_base, load_bias, &dynamic);
            apply_relocations::<HostArch>(&mut state)?;
        }

        let mut module = Self {
            map,
            vaddr_base,
            load_bias,
            class,
            segments,
            dynamic,
            protected: false,
        };

        if flags.contains(LoadFlags::SKIP_PROTECTION) {
            debug!("leaving image at {:p} read-write", module.base());
        } else {
            module.protect()?;
            module.protected = true;
        }

        if flags.contains(LoadFlags::SKIP_INITIALIZERS) {
            debug!("skipping initializers");
        } else if !module.protected {
            warn!("initializers not run: image is not executable without protections");
        } else {
            module.run_initializers()?;
        }

        Ok(module)
    }

    #[cfg(unix)]
    fn protect(&self) -> Result<(), LoadError> {
        let page = page_size();
        for (index, seg) in self.segments.iter().enumerate() {
            let start = page_align_down(seg.vaddr, page);
            let end = page_align_up(seg.vaddr + seg.memsz, page).unwrap_or(u64::MAX);
            let mut prot = libc::PROT_NONE;
            if seg.is_readable() {
                prot |= libc::PROT_READ;
            }
            if seg.is_writable() {
                prot |= libc::PROT_WRITE;
            }
            if seg.is_executable() {
                prot |= libc::PROT_EXEC;
            }
            let addr = self.load_bias.wrapping_add(start) as usize as *mut libc::c_void;
            let len = (end - start) as usize;
            debug!("protect segment {}: {:p} + {:#x} -> {:#x}", index, addr, len, prot);
            let rc = unsafe { libc::mprotect(addr, len, prot) };
            if rc != 0 {
                return Err(LoadErrorKind::ProtectFailed {
                    index,
                    err: std::io::Error::last_os_error(),
                }
                .into());
            }
        }

        #[cfg(target_arch = "aarch64")]
        crate::arch::host::flush_icache(self.map.as_ptr(), self.map.len());

        Ok(())
    }

    #[cfg(not(unix))]
    fn protect(&self) -> Result<(), LoadError> {
        Err(LoadErrorKind::HostUnsupported {
            what: "segment protection",
        }
        .into())
    }

    fn run_initializers(&self) -> Result<(), LoadError> {
        if let Some(init) = self.dynamic_value(DT_INIT).filter(|v| *v != 0) {
            debug!("calling legacy init at {:#x}", init);
            unsafe { invoke(self.address_of(init), CallArgs::None) };
        }

        let Some(array) = self.dynamic_value(DT_INIT_ARRAY) else {
            return Ok(());
        };
        let len = self.dynamic_value(DT_INIT_ARRAYSZ).unwrap_or(0) as usize;
        let word = word_size(self.class);
        // Collected up front: the array lives in memory the initializers may write.
        let ctors: Vec<u64> = self
            .bytes(array, len)?
            .chunks_exact(word)
            .map(read_word)
            .collect();
        let all_ones = if word == 8 { u64::MAX } else { u64::from(u32::MAX) };
        debug!("calling {} init_array entries", ctors.len());
        for ctor in ctors {
            if ctor == 0 || ctor == all_ones {
                continue;
            }
            trace!("init_array entry {:#x}", ctor);
            // Entries have already been relocated to runtime addresses.
            unsafe { invoke(ctor as usize as *const u8, CallArgs::None) };
        }
        Ok(())
    }

    /// The runtime address of the lowest mapped byte.
    pub fn base(&self) -> *const u8 {
        self.map.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// The difference between runtime and link addresses.
    pub fn load_bias(&self) -> u64 {
        self.load_bias
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn dynamic(&self) -> &[DynEntry] {
        &self.dynamic
    }

    /// Whether segment protections were applied.
    pub fn is_protected(&self) -> bool {
        self.protected
    }

    fn dynamic_value(&self, tag: i64) -> Option<u64> {
        self.dynamic.iter().find(|d| d.tag == tag).map(|d| d.value)
    }

    /// The runtime address of link address `vaddr`.
    pub fn address_of(&self, vaddr: u64) -> *const u8 {
        self.load_bias.wrapping_add(vaddr) as usize as *const u8
    }

    /// Whether `len` bytes at runtime address `addr` lie entirely inside the mapping.
    pub fn contains(&self, addr: *const u8, len: usize) -> bool {
        let start = self.map.as_ptr() as usize;
        let addr = addr as usize;
        addr >= start
            && addr
                .checked_add(len)
                .is_some_and(|end| end <= start + self.map.len())
    }

    /// Borrow `len` bytes at link address `vaddr`.
    pub fn bytes(&self, vaddr: u64, len: usize) -> Result<&[u8], LoadError> {
        let range = image_range(self.vaddr_base, self.map.len(), vaddr, len)?;
        Ok(&self.map[range])
    }

    fn symbol_count(&self) -> Result<usize, LoadError> {
        if let Some(hash) = self.dynamic_value(DT_HASH) {
            // nbucket, nchain: there is one chain entry per symbol.
            let header = self.bytes(hash, 8)?;
            return Ok(read_word(&header[4..8]) as usize);
        }
        if let Some(gnu) = self.dynamic_value(DT_GNU_HASH) {
            let start = image_range(self.vaddr_base, self.map.len(), gnu, 0)?.start;
            return gnu_hash_symbol_count(&self.map[start..], word_size(self.class)).ok_or_else(
                || {
                    LoadErrorKind::MissingSection {
                        name: "DT_GNU_HASH chains".to_string(),
                    }
                    .into()
                },
            );
        }
        Err(LoadErrorKind::MissingSection {
            name: "DT_HASH".to_string(),
        }
        .into())
    }

    /// Find a defined dynamic symbol by name and return its runtime address.
    pub fn lookup_export(&self, name: &str) -> Result<*const u8, LoadError> {
        let missing = |tag: &str| -> LoadError {
            LoadErrorKind::MissingSection {
                name: tag.to_string(),
            }
            .into()
        };
        let symtab = self
            .dynamic_value(DT_SYMTAB)
            .ok_or_else(|| missing("DT_SYMTAB"))?;
        let strtab = self
            .dynamic_value(DT_STRTAB)
            .ok_or_else(|| missing("DT_STRTAB"))?;
        let strsz = self
            .dynamic_value(DT_STRSZ)
            .ok_or_else(|| missing("DT_STRSZ"))?;

        let count = self.symbol_count()?;
        let entsize = match self.class {
            Class::ELF32 => 16,
            Class::ELF64 => 24,
        };
        let syms = self.bytes(symtab, count * entsize)?;
        let strs = StringTable::new(self.bytes(strtab, strsz as usize)?);

        for sym in ParsingIterator::<LittleEndian, Symbol>::new(LittleEndian, self.class, syms) {
            if sym.st_shndx == SHN_UNDEF || sym.st_name == 0 {
                continue;
            }
            if strs.get(sym.st_name as usize)? == name {
                trace!("found export {} at {:#x}", name, sym.st_value);
                return Ok(self.address_of(sym.st_value));
            }
        }
        Err(LoadErrorKind::SymbolNotFound {
            name: name.to_string(),
        }
        .into())
    }
}

impl std::fmt::Debug for ElfModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElfModule")
            .field("base", &self.base())
            .field("len", &self.len())
            .field("load_bias", &format_args!("{:#x}", self.load_bias))
            .field("segments", &self.segments.len())
            .finish()
    }
}
