//! A minimal writer for 64-bit little-endian ELF shared objects.
//!
//! Produces just enough of an image for the loader to chew on: one read-execute segment for code,
//! one read-write segment for data and the dynamic tables, a RELA table, a SysV hash table and
//! the dynamic symbols it indexes. Used by tests that need a real image without a toolchain.

use elf::abi::{
    DT_HASH, DT_INIT, DT_INIT_ARRAY, DT_INIT_ARRAYSZ, DT_NULL, DT_RELA, DT_RELAENT, DT_RELASZ,
    DT_STRSZ, DT_STRTAB, DT_SYMENT, DT_SYMTAB, EM_AARCH64, ET_DYN, PF_R, PF_W, PF_X,
    PT_DYNAMIC, PT_LOAD, R_AARCH64_RELATIVE, R_X86_64_RELATIVE,
};

/// Link address of the code segment.
pub const TEXT_VADDR: u64 = 0x1_0000;
/// Link address of the data segment. Far enough from the code that the two never share a page,
/// even with 64K pages.
pub const DATA_VADDR: u64 = 0x2_0000;

const TEXT_LIMIT: usize = (DATA_VADDR - TEXT_VADDR) as usize;
const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const RELA_SIZE: usize = 24;
const SYM_SIZE: usize = 24;
const DYN_SIZE: usize = 16;

fn align(v: usize, to: usize) -> usize {
    (v + to - 1) & !(to - 1)
}

fn put_u16(b: &mut Vec<u8>, v: u16) {
    b.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(b: &mut Vec<u8>, v: u32) {
    b.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(b: &mut Vec<u8>, v: u64) {
    b.extend_from_slice(&v.to_le_bytes());
}

fn pad_to(b: &mut Vec<u8>, to: usize) {
    let len = align(b.len(), to);
    b.resize(len, 0);
}

struct Reloc {
    offset: u64,
    r_type: u32,
    sym: u32,
    addend: i64,
}

pub struct ImageBuilder {
    machine: u16,
    text: Vec<u8>,
    data: Vec<u8>,
    relocs: Vec<Reloc>,
    exports: Vec<(String, u64)>,
    init: Option<u64>,
    init_array: Vec<u64>,
}

impl ImageBuilder {
    pub fn new(machine: u16) -> Self {
        Self {
            machine,
            text: Vec::new(),
            data: Vec::new(),
            relocs: Vec::new(),
            exports: Vec::new(),
            init: None,
            init_array: Vec::new(),
        }
    }

    /// A builder for the machine the tests run on. Only 64-bit hosts have one.
    pub fn host() -> Self {
        Self::new(crate::Arch::host().machine())
    }

    fn relative_type(&self) -> u32 {
        match self.machine {
            EM_AARCH64 => R_AARCH64_RELATIVE,
            _ => R_X86_64_RELATIVE,
        }
    }

    /// Append machine code, returning its link address.
    pub fn code(&mut self, bytes: &[u8]) -> u64 {
        pad_to(&mut self.text, 16);
        let at = TEXT_VADDR + self.text.len() as u64;
        self.text.extend_from_slice(bytes);
        assert!(self.text.len() <= TEXT_LIMIT, "code segment overflow");
        at
    }

    /// Append raw data, 8-byte aligned, returning its link address.
    pub fn data(&mut self, bytes: &[u8]) -> u64 {
        pad_to(&mut self.data, 8);
        let at = DATA_VADDR + self.data.len() as u64;
        self.data.extend_from_slice(bytes);
        at
    }

    /// Append a NUL-terminated string.
    pub fn string(&mut self, s: &str) -> u64 {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        self.data(&bytes)
    }

    /// Append a pointer-sized slot that a relative relocation will point at `target`.
    pub fn pointer(&mut self, target: u64) -> u64 {
        let at = self.data(&[0u8; 8]);
        let r_type = self.relative_type();
        self.reloc(at, r_type, 0, target as i64);
        at
    }

    /// Append a relocation entry at link address `offset`.
    pub fn reloc(&mut self, offset: u64, r_type: u32, sym: u32, addend: i64) -> &mut Self {
        self.relocs.push(Reloc {
            offset,
            r_type,
            sym,
            addend,
        });
        self
    }

    pub fn export(&mut self, name: &str, vaddr: u64) -> &mut Self {
        self.exports.push((name.to_string(), vaddr));
        self
    }

    pub fn init(&mut self, vaddr: u64) -> &mut Self {
        self.init = Some(vaddr);
        self
    }

    pub fn init_array(&mut self, vaddr: u64) -> &mut Self {
        self.init_array.push(vaddr);
        self
    }

    /// A function returning the runtime address of link address `target`.
    pub fn address_fn(&mut self, target: u64) -> u64 {
        let at = TEXT_VADDR + align(self.text.len(), 16) as u64;
        match self.machine {
            EM_AARCH64 => {
                let insns = [adr(0, target.wrapping_sub(at) as i64), RET];
                self.code(&words(&insns))
            }
            _ => {
                // lea rax, [rip + disp32]; ret
                let disp = target.wrapping_sub(at + 7) as u32;
                let mut code = vec![0x48, 0x8d, 0x05];
                code.extend_from_slice(&disp.to_le_bytes());
                code.push(0xc3);
                self.code(&code)
            }
        }
    }

    /// A function returning the integer `value`.
    pub fn return_fn(&mut self, value: u16) -> u64 {
        match self.machine {
            EM_AARCH64 => self.code(&words(&[movz(0, value), RET])),
            _ => {
                // mov eax, imm32; ret
                let mut code = vec![0xb8];
                code.extend_from_slice(&u32::from(value).to_le_bytes());
                code.push(0xc3);
                self.code(&code)
            }
        }
    }

    /// A function storing the 32-bit `value` at link address `target` and returning zero.
    pub fn store_fn(&mut self, target: u64, value: u16) -> u64 {
        let at = TEXT_VADDR + align(self.text.len(), 16) as u64;
        match self.machine {
            EM_AARCH64 => {
                let insns = [
                    adr(1, target.wrapping_sub(at) as i64),
                    movz(0, value),
                    // str w0, [x1]
                    0xb900_0020,
                    movz(0, 0),
                    RET,
                ];
                self.code(&words(&insns))
            }
            _ => {
                // mov dword [rip + disp32], imm32; xor eax, eax; ret
                let disp = target.wrapping_sub(at + 10) as u32;
                let mut code = vec![0xc7, 0x05];
                code.extend_from_slice(&disp.to_le_bytes());
                code.extend_from_slice(&u32::from(value).to_le_bytes());
                code.extend_from_slice(&[0x31, 0xc0, 0xc3]);
                self.code(&code)
            }
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let mut data = self.data.clone();
        let mut relocs: Vec<(u64, u32, u32, i64)> = self
            .relocs
            .iter()
            .map(|r| (r.offset, r.r_type, r.sym, r.addend))
            .collect();

        pad_to(&mut data, 8);
        let init_array_at = DATA_VADDR + data.len() as u64;
        for target in &self.init_array {
            let slot = DATA_VADDR + data.len() as u64;
            put_u64(&mut data, 0);
            relocs.push((slot, self.relative_type(), 0, *target as i64));
        }

        let rela_at = DATA_VADDR + data.len() as u64;
        for (offset, r_type, sym, addend) in &relocs {
            put_u64(&mut data, *offset);
            put_u64(&mut data, (u64::from(*sym) << 32) | u64::from(*r_type));
            put_u64(&mut data, *addend as u64);
        }

        let mut strtab = vec![0u8];
        let symtab_at = DATA_VADDR + data.len() as u64;
        data.extend_from_slice(&[0u8; SYM_SIZE]);
        for (name, vaddr) in &self.exports {
            let name_off = strtab.len() as u32;
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
            put_u32(&mut data, name_off);
            // STB_GLOBAL, STT_FUNC
            data.push(0x12);
            data.push(0);
            // Any defined section index.
            put_u16(&mut data, 1);
            put_u64(&mut data, *vaddr);
            put_u64(&mut data, 0);
        }
        let nsyms = 1 + self.exports.len() as u32;

        // One bucket chaining every symbol, highest index first.
        let hash_at = DATA_VADDR + data.len() as u64;
        put_u32(&mut data, 1);
        put_u32(&mut data, nsyms);
        put_u32(&mut data, nsyms - 1);
        for i in 0..nsyms {
            put_u32(&mut data, i.saturating_sub(1));
        }

        let strtab_at = DATA_VADDR + data.len() as u64;
        data.extend_from_slice(&strtab);

        pad_to(&mut data, 8);
        let dynamic_at = DATA_VADDR + data.len() as u64;
        let mut dynamic: Vec<(i64, u64)> = vec![
            (DT_HASH, hash_at),
            (DT_STRTAB, strtab_at),
            (DT_SYMTAB, symtab_at),
            (DT_STRSZ, strtab.len() as u64),
            (DT_SYMENT, SYM_SIZE as u64),
        ];
        if !relocs.is_empty() {
            dynamic.push((DT_RELA, rela_at));
            dynamic.push((DT_RELASZ, (relocs.len() * RELA_SIZE) as u64));
            dynamic.push((DT_RELAENT, RELA_SIZE as u64));
        }
        if let Some(init) = self.init {
            dynamic.push((DT_INIT, init));
        }
        if !self.init_array.is_empty() {
            dynamic.push((DT_INIT_ARRAY, init_array_at));
            dynamic.push((DT_INIT_ARRAYSZ, (self.init_array.len() * 8) as u64));
        }
        dynamic.push((DT_NULL, 0));
        for (tag, val) in &dynamic {
            put_u64(&mut data, *tag as u64);
            put_u64(&mut data, *val);
        }
        let dynamic_len = (dynamic.len() * DYN_SIZE) as u64;

        let mut text = self.text.clone();
        if text.is_empty() {
            text.push(0xcc);
        }

        let phnum = 3u16;
        let text_off = align(EHDR_SIZE + PHDR_SIZE * phnum as usize, 16);
        let data_off = align(text_off + text.len(), 16);

        let mut out = Vec::new();
        out.extend_from_slice(b"\x7fELF");
        // ELFCLASS64, ELFDATA2LSB, EV_CURRENT, then padding.
        out.extend_from_slice(&[2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        put_u16(&mut out, ET_DYN);
        put_u16(&mut out, self.machine);
        put_u32(&mut out, 1);
        // e_entry, e_phoff, e_shoff
        put_u64(&mut out, 0);
        put_u64(&mut out, EHDR_SIZE as u64);
        put_u64(&mut out, 0);
        put_u32(&mut out, 0);
        put_u16(&mut out, EHDR_SIZE as u16);
        put_u16(&mut out, PHDR_SIZE as u16);
        put_u16(&mut out, phnum);
        // e_shentsize, e_shnum, e_shstrndx
        put_u16(&mut out, 64);
        put_u16(&mut out, 0);
        put_u16(&mut out, 0);

        let mut phdr = |p_type: u32, flags: u32, off: usize, vaddr: u64, size: u64, align: u64| {
            put_u32(&mut out, p_type);
            put_u32(&mut out, flags);
            put_u64(&mut out, off as u64);
            put_u64(&mut out, vaddr);
            put_u64(&mut out, vaddr);
            put_u64(&mut out, size);
            put_u64(&mut out, size);
            put_u64(&mut out, align);
        };
        phdr(PT_LOAD, PF_R | PF_X, text_off, TEXT_VADDR, text.len() as u64, 0x1_0000);
        phdr(PT_LOAD, PF_R | PF_W, data_off, DATA_VADDR, data.len() as u64, 0x1_0000);
        phdr(
            PT_DYNAMIC,
            PF_R | PF_W,
            data_off + (dynamic_at - DATA_VADDR) as usize,
            dynamic_at,
            dynamic_len,
            8,
        );

        out.resize(text_off, 0);
        out.extend_from_slice(&text);
        out.resize(data_off, 0);
        out.extend_from_slice(&data);
        out
    }
}

// aarch64 encodings used by the code helpers.
const RET: u32 = 0xd65f_03c0;

fn adr(rd: u32, offset: i64) -> u32 {
    let imm = (offset as u32) & 0x1f_ffff;
    0x1000_0000 | ((imm & 3) << 29) | ((imm >> 2) << 5) | rd
}

fn movz(rd: u32, imm: u16) -> u32 {
    0x5280_0000 | (u32::from(imm) << 5) | rd
}

fn words(insns: &[u32]) -> Vec<u8> {
    insns.iter().flat_map(|i| i.to_le_bytes()).collect()
}
