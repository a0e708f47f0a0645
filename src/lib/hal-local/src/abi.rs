//! The ABI shared between the runtime and generated code.
//!
//! Everything here is `#[repr(C)]` and crosses into generated code by pointer. An entry point is
//! called once per workgroup as `int entry(const DispatchState *state, const WorkgroupId *id)` and
//! returns zero on success. The dispatch state is the same for every workgroup in a grid and is
//! never written by the callee.
//!
//! A loadable library exports [LIBRARY_QUERY_SYMBOL], a `void *query(int version, void *reserved)`
//! that returns a pointer to a [LibraryV0] for versions it understands and null otherwise.

use core::ffi::{c_char, c_int, c_void};
use std::{fmt::Display, marker::PhantomData};

use static_assertions::{assert_eq_size, const_assert_eq};

/// Name of the function a library exports to describe itself.
pub const LIBRARY_QUERY_SYMBOL: &str = "hal_executable_library_query";

pub const LIBRARY_VERSION_0: c_int = 0;
/// The newest library version this runtime understands.
pub const LIBRARY_LATEST_VERSION: c_int = LIBRARY_VERSION_0;

/// A point or extent in the three-dimensional workgroup grid.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Vec3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

/// Which workgroup of a grid an invocation is for.
pub type WorkgroupId = Vec3;

impl Vec3 {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub const fn splat(v: u32) -> Self {
        Self { x: v, y: v, z: v }
    }

    /// The number of points in a grid of this extent.
    pub const fn volume(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

impl Display for Vec3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}", self.x, self.y, self.z)
    }
}

impl From<[u32; 3]> for Vec3 {
    fn from(v: [u32; 3]) -> Self {
        Self::new(v[0], v[1], v[2])
    }
}

/// Host functions made available to generated code.
#[repr(C)]
#[derive(Debug)]
pub struct ImportTable<'a> {
    count: usize,
    symbols: *const *const c_void,
    _marker: PhantomData<&'a [*const c_void]>,
}

impl<'a> ImportTable<'a> {
    pub fn new(symbols: &'a [*const c_void]) -> Self {
        Self {
            count: symbols.len(),
            symbols: symbols.as_ptr(),
            _marker: PhantomData,
        }
    }

    pub fn symbols(&self) -> &'a [*const c_void] {
        if self.count == 0 {
            return &[];
        }
        // Built from a slice that outlives 'a.
        unsafe { core::slice::from_raw_parts(self.symbols, self.count) }
    }
}

/// The buffers an invocation reads and writes, as parallel pointer and length arrays.
#[derive(Debug, Default)]
pub struct Bindings<'a> {
    ptrs: Vec<*mut c_void>,
    lengths: Vec<usize>,
    _marker: PhantomData<&'a mut [u8]>,
}

impl<'a> Bindings<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a buffer that generated code may write.
    pub fn output<T>(mut self, buf: &'a mut [T]) -> Self {
        self.ptrs.push(buf.as_mut_ptr() as *mut c_void);
        self.lengths.push(core::mem::size_of_val(buf));
        self
    }

    /// Add a buffer that generated code only reads.
    pub fn input<T>(mut self, buf: &'a [T]) -> Self {
        self.ptrs.push(buf.as_ptr() as *mut c_void);
        self.lengths.push(core::mem::size_of_val(buf));
        self
    }

    pub fn len(&self) -> usize {
        self.ptrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ptrs.is_empty()
    }
}

/// Everything an entry point learns about the dispatch it is part of.
///
/// The raw pointers borrow from the push constants, bindings and imports this was built from,
/// which must outlive `'a`.
#[repr(C)]
#[derive(Debug)]
pub struct DispatchState<'a> {
    pub workgroup_count: Vec3,
    pub workgroup_size: Vec3,
    push_constant_count: usize,
    push_constants: *const u32,
    binding_count: usize,
    binding_ptrs: *const *mut c_void,
    binding_lengths: *const usize,
    imports: *const ImportTable<'a>,
    _marker: PhantomData<&'a ()>,
}

// The state is read-only once built, and the buffers behind it are only touched by generated
// code, which is responsible for writing disjoint parts of them from different workgroups.
unsafe impl Sync for DispatchState<'_> {}
unsafe impl Send for DispatchState<'_> {}

impl<'a> DispatchState<'a> {
    pub fn new(
        workgroup_count: Vec3,
        workgroup_size: Vec3,
        push_constants: &'a [u32],
        bindings: &'a Bindings<'a>,
        imports: Option<&'a ImportTable<'a>>,
    ) -> Self {
        Self {
            workgroup_count,
            workgroup_size,
            push_constant_count: push_constants.len(),
            push_constants: push_constants.as_ptr(),
            binding_count: bindings.len(),
            binding_ptrs: bindings.ptrs.as_ptr(),
            binding_lengths: bindings.lengths.as_ptr(),
            imports: imports.map_or(core::ptr::null(), |i| i as *const _),
            _marker: PhantomData,
        }
    }

    pub fn push_constants(&self) -> &'a [u32] {
        if self.push_constant_count == 0 {
            return &[];
        }
        unsafe { core::slice::from_raw_parts(self.push_constants, self.push_constant_count) }
    }

    pub fn binding_ptrs(&self) -> &'a [*mut c_void] {
        if self.binding_count == 0 {
            return &[];
        }
        unsafe { core::slice::from_raw_parts(self.binding_ptrs, self.binding_count) }
    }

    pub fn binding_lengths(&self) -> &'a [usize] {
        if self.binding_count == 0 {
            return &[];
        }
        unsafe { core::slice::from_raw_parts(self.binding_lengths, self.binding_count) }
    }

    pub fn imports(&self) -> Option<&'a ImportTable<'a>> {
        unsafe { self.imports.as_ref() }
    }
}

/// Header shared by every library version.
#[repr(C)]
#[derive(Debug)]
pub struct LibraryHeader {
    pub version: c_int,
    /// NUL-terminated name, usable to find the library in a registry.
    pub name: *const c_char,
}

/// Version 0 of the library description returned by the query function.
#[repr(C)]
#[derive(Debug)]
pub struct LibraryV0 {
    pub header: *const LibraryHeader,
    pub entry_point_count: usize,
    /// `entry_point_count` entry points, called with the system calling convention.
    pub entry_points: *const *const c_void,
    /// `entry_point_count` NUL-terminated names, or null if the library has none.
    pub entry_point_names: *const *const c_char,
}

assert_eq_size!(Vec3, [u32; 3]);
assert_eq_size!(LibraryHeader, [usize; 2]);
assert_eq_size!(LibraryV0, [usize; 4]);
const_assert_eq!(
    core::mem::size_of::<DispatchState<'static>>(),
    24 + 6 * core::mem::size_of::<usize>()
);
const_assert_eq!(core::mem::size_of::<ImportTable<'static>>(), 2 * core::mem::size_of::<usize>());
