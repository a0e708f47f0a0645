//! Per-architecture relocation semantics and calling conventions.
//!
//! Each supported architecture is a zero-sized type implementing [RelocationArch]. The loader is
//! built for exactly one of them, [HostArch], but all of them can relocate images held in plain
//! byte buffers, which is how they are tested on any host.

use elf::{endian::EndianParse, file::Class, file::FileHeader};

use crate::{
    reloc::{RelocationEntry, RelocationState, TableKind},
    HeaderError, LoadError,
};

mod aarch64;
mod x86;
mod x86_64;

pub use aarch64::Aarch64;
pub use x86::X86;
pub use x86_64::X86_64;

/// Relocation semantics of one instruction set architecture.
pub trait RelocationArch {
    /// Name used in logs and errors.
    const NAME: &'static str;
    /// The `e_machine` value images for this architecture carry.
    const MACHINE: u16;
    /// The ELF class of images for this architecture.
    const CLASS: Class;
    /// The one relocation entry format this architecture consumes.
    const TABLE_KIND: TableKind;

    /// Apply a single relocation. Entries of type 0 and entries naming a symbol never reach here.
    fn apply(state: &mut RelocationState<'_>, rel: &RelocationEntry) -> Result<(), LoadError>;
}

/// Load-time selection of a [RelocationArch].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86_64,
    Aarch64,
    X86,
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub type HostArch = X86_64;
        pub(crate) use x86_64::host as host;
        const HOST: Arch = Arch::X86_64;
    } else if #[cfg(target_arch = "aarch64")] {
        pub type HostArch = Aarch64;
        pub(crate) use aarch64::host as host;
        const HOST: Arch = Arch::Aarch64;
    } else if #[cfg(target_arch = "x86")] {
        pub type HostArch = X86;
        pub(crate) use x86::host as host;
        const HOST: Arch = Arch::X86;
    } else {
        compile_error!("elfload supports x86_64, aarch64 and x86 hosts only");
    }
}

impl Arch {
    /// The architecture this build targets.
    pub const fn host() -> Arch {
        HOST
    }

    pub fn from_machine(machine: u16) -> Option<Arch> {
        [Arch::X86_64, Arch::Aarch64, Arch::X86]
            .into_iter()
            .find(|a| a.machine() == machine)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Arch::X86_64 => X86_64::NAME,
            Arch::Aarch64 => Aarch64::NAME,
            Arch::X86 => X86::NAME,
        }
    }

    pub const fn machine(self) -> u16 {
        match self {
            Arch::X86_64 => X86_64::MACHINE,
            Arch::Aarch64 => Aarch64::MACHINE,
            Arch::X86 => X86::MACHINE,
        }
    }

    pub fn validate<E: EndianParse>(self, ehdr: &FileHeader<E>) -> Result<(), HeaderError> {
        match self {
            Arch::X86_64 => crate::validate_header::<X86_64, E>(ehdr),
            Arch::Aarch64 => crate::validate_header::<Aarch64, E>(ehdr),
            Arch::X86 => crate::validate_header::<X86, E>(ehdr),
        }
    }

    /// Whether an image with this header may be relocated and run as this architecture.
    pub fn is_valid<E: EndianParse>(self, ehdr: &FileHeader<E>) -> bool {
        self.validate(ehdr).is_ok()
    }

    pub fn apply_relocations(self, state: &mut RelocationState<'_>) -> Result<(), LoadError> {
        match self {
            Arch::X86_64 => crate::apply_relocations::<X86_64>(state),
            Arch::Aarch64 => crate::apply_relocations::<Aarch64>(state),
            Arch::X86 => crate::apply_relocations::<X86>(state),
        }
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
