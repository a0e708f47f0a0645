//! Loading position-independent compiled kernels without the system dynamic linker.
//!
//! Kernel binaries produced by a code generator are ELF shared objects, but they are not ordinary
//! libraries: they have no dependencies, import nothing by symbol, and are only ever called
//! through a handful of narrow, fixed signatures. That makes it possible to load them with a lot
//! less machinery than a real dynamic linker:
//!
//!   1. Check that the image was built for the machine we're running on ([validate_header]).
//!   2. Copy its loadable segments into fresh memory ([ElfModule::load]).
//!   3. Patch every place that holds an address, using the relocation tables the linker left in
//!      the dynamic section ([apply_relocations]).
//!   4. Lock down page protections and run any initializers.
//!
//! After that, calling into the image goes through [thunk], which bridges from the host calling
//! convention to the system one the generated code uses.
//!
//! # Relocations
//! The only relocations that can be applied are the ones that don't name a symbol: since there
//! is nothing to import, any entry with a symbol index is an error rather than something to
//! resolve. Each architecture knows which entry format it uses (RELA for x86_64 and aarch64, REL
//! for x86) and refuses images that carry the other one. See [arch] for the per-architecture
//! semantics, which can be exercised against plain byte buffers on any host.

mod error;
mod header;
mod module;
mod reloc;

pub mod arch;
#[cfg(any(test, feature = "synth"))]
pub mod synth;
pub mod thunk;

pub use arch::{Arch, HostArch, RelocationArch};
pub use error::*;
pub use header::validate_header;
pub use module::{ElfModule, Segment};
pub use reloc::{apply_relocations, DynEntry, RelocationEntry, RelocationState, TableKind, Width};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    /// Options for [ElfModule::load].
    pub struct LoadFlags : u32 {
        /// Don't run `DT_INIT` or `DT_INIT_ARRAY` functions.
        const SKIP_INITIALIZERS = 1;
        /// Leave the whole image mapped read-write. Nothing in it can be executed, so this also
        /// skips initializers.
        const SKIP_PROTECTION = 2;
    }
}
