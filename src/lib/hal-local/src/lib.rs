//! Running compiled kernels on the host CPU.
//!
//! An executable is a set of entry points, each of which computes one workgroup of a dispatch
//! grid. Two kinds are provided: [ElfExecutable], loaded from a relocatable image with
//! [elfload], and [StaticExecutable], whose entry points are linked into the host. Both are run
//! the same way, through [dispatch_inline] (or [dispatch_range] for a piece of a grid), which calls
//! the chosen entry point once per workgroup on the calling thread.
//!
//! The structures generated code sees ([DispatchState], [WorkgroupId], [LibraryV0]) live in
//! [abi] and are laid out to match the C definitions the code generator compiles against.

pub mod abi;
mod dispatch;
mod elf_executable;
mod error;
mod executable;
mod layout;
mod static_executable;

pub use abi::{Bindings, DispatchState, ImportTable, LibraryHeader, LibraryV0, Vec3, WorkgroupId};
pub use dispatch::{dispatch_inline, dispatch_range, WorkgroupRange};
pub use elf_executable::ElfExecutable;
pub use error::*;
pub use executable::{ExecutableBase, LocalExecutable};
pub use layout::ExecutableLayout;
pub use static_executable::{StaticEntryPoint, StaticExecutable};
