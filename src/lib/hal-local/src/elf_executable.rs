//! Executables loaded from relocatable images.
//!
//! Loading goes through [elfload::ElfModule], after which the library describes itself: the
//! exported query function is called with the newest version we understand, and returns a
//! [LibraryV0] living inside the image. Every pointer reachable from it is checked to land inside
//! the mapping before it is followed, and everything needed later (entry point addresses, names)
//! is copied out so nothing borrowed from the image outlives construction.

use core::ffi::{c_char, c_int, c_void};
use std::{ffi::CStr, sync::Arc};

use elfload::{
    thunk::{invoke, CallArgs},
    ElfModule, LoadFlags,
};
use tracing::{debug, error};

use crate::{
    abi::{
        DispatchState, LibraryHeader, LibraryV0, WorkgroupId, LIBRARY_LATEST_VERSION,
        LIBRARY_QUERY_SYMBOL,
    },
    executable::{check_layouts, check_ordinal},
    ExecutableBase, ExecutableLayout, HalError, HalErrorKind, LocalExecutable,
};

fn invalid(reason: impl ToString) -> HalError {
    HalErrorKind::InvalidLibrary {
        reason: reason.to_string(),
    }
    .into()
}

fn vaddr_of(module: &ElfModule, p: *const u8) -> u64 {
    (p as usize as u64).wrapping_sub(module.load_bias())
}

fn read_struct<'m, T>(module: &'m ElfModule, p: *const c_void, what: &str) -> Result<&'m T, HalError> {
    let p = p as *const u8;
    if p.is_null()
        || !module.contains(p, core::mem::size_of::<T>())
        || (p as usize) % core::mem::align_of::<T>() != 0
    {
        return Err(invalid(format!("{} at {:p} is not inside the image", what, p)));
    }
    // In bounds, aligned, and the mapping lives as long as the module.
    Ok(unsafe { &*(p as *const T) })
}

fn read_array<'m, T>(
    module: &'m ElfModule,
    p: *const T,
    count: usize,
    what: &str,
) -> Result<&'m [T], HalError> {
    if count == 0 {
        return Ok(&[]);
    }
    let p = p as *const u8;
    let in_bounds = count
        .checked_mul(core::mem::size_of::<T>())
        .is_some_and(|len| module.contains(p, len));
    if p.is_null() || !in_bounds || (p as usize) % core::mem::align_of::<T>() != 0 {
        return Err(invalid(format!("{} at {:p} is not inside the image", what, p)));
    }
    Ok(unsafe { core::slice::from_raw_parts(p as *const T, count) })
}

fn read_c_str(module: &ElfModule, p: *const c_char, what: &str) -> Result<String, HalError> {
    let p = p as *const u8;
    if p.is_null() || !module.contains(p, 1) {
        return Err(invalid(format!("{} at {:p} is not inside the image", what, p)));
    }
    let avail = module.base() as usize + module.len() - p as usize;
    let bytes = module.bytes(vaddr_of(module, p), avail)?;
    let s = CStr::from_bytes_until_nul(bytes)
        .map_err(|_| invalid(format!("{} is not NUL-terminated", what)))?;
    Ok(s.to_string_lossy().into_owned())
}

/// An executable backed by a loaded image.
pub struct ElfExecutable {
    base: ExecutableBase,
    name: String,
    version: c_int,
    entry_points: Vec<usize>,
    entry_point_names: Vec<Option<String>>,
    module: ElfModule,
}

impl ElfExecutable {
    /// Load `bytes` and bind its entry points, one layout per entry point.
    pub fn load(bytes: &[u8], layouts: &[Arc<ExecutableLayout>]) -> Result<Self, HalError> {
        Self::load_with_flags(bytes, layouts, LoadFlags::empty())
    }

    pub fn load_with_flags(
        bytes: &[u8],
        layouts: &[Arc<ExecutableLayout>],
        flags: LoadFlags,
    ) -> Result<Self, HalError> {
        Self::load_inner(bytes, Some(layouts), flags)
    }

    /// Load `bytes` giving every entry point an empty layout. Useful for looking at images whose
    /// layouts aren't known.
    pub fn load_for_inspection(bytes: &[u8], flags: LoadFlags) -> Result<Self, HalError> {
        Self::load_inner(bytes, None, flags)
    }

    fn load_inner(
        bytes: &[u8],
        layouts: Option<&[Arc<ExecutableLayout>]>,
        flags: LoadFlags,
    ) -> Result<Self, HalError> {
        let module = ElfModule::load(bytes, flags)?;
        if !module.is_protected() {
            return Err(HalErrorKind::NotExecutable.into());
        }

        let query = module.lookup_export(LIBRARY_QUERY_SYMBOL)?;
        let args = CallArgs::IntPtr(LIBRARY_LATEST_VERSION, core::ptr::null_mut());
        let ptr = unsafe { invoke(query, args) }
            .ptr()
            .unwrap_or(core::ptr::null_mut());
        if ptr.is_null() {
            error!(
                "library does not support version {}",
                LIBRARY_LATEST_VERSION
            );
            return Err(HalErrorKind::UnsupportedLibraryVersion {
                requested: LIBRARY_LATEST_VERSION,
            }
            .into());
        }

        let library: &LibraryV0 = read_struct(&module, ptr, "library")?;
        let header: &LibraryHeader =
            read_struct(&module, library.header as *const c_void, "library header")?;
        if header.version > LIBRARY_LATEST_VERSION {
            return Err(HalErrorKind::LibraryTooNew {
                found: header.version,
                latest: LIBRARY_LATEST_VERSION,
            }
            .into());
        }
        let version = header.version;
        let name = read_c_str(&module, header.name, "library name")?;

        let count = library.entry_point_count;
        let layouts = match layouts {
            Some(layouts) => {
                check_layouts(layouts.len(), count)?;
                layouts.to_vec()
            }
            None => vec![Arc::new(ExecutableLayout::default()); count],
        };

        let entries = read_array(&module, library.entry_points, count, "entry point table")?;
        let entry_points = HalError::collect(
            HalErrorKind::CreateFailed,
            entries.iter().enumerate().map(|(i, p)| {
                if module.contains(*p as *const u8, 1) {
                    Ok(*p as usize)
                } else {
                    Err(invalid(format!("entry point {} at {:p} is not inside the image", i, *p)))
                }
            }),
        )?;

        let entry_point_names = if library.entry_point_names.is_null() {
            vec![None; count]
        } else {
            let names = read_array(&module, library.entry_point_names, count, "entry point names")?;
            HalError::collect(
                HalErrorKind::CreateFailed,
                names.iter().map(|p| {
                    if p.is_null() {
                        Ok(None)
                    } else {
                        read_c_str(&module, *p, "entry point name").map(Some)
                    }
                }),
            )?
        };

        debug!(
            "{}: loaded library version {} with {} entry points",
            name, version, count
        );
        Ok(Self {
            base: ExecutableBase::initialize(&layouts),
            name,
            version,
            entry_points,
            entry_point_names,
            module,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> c_int {
        self.version
    }

    pub fn module(&self) -> &ElfModule {
        &self.module
    }
}

impl std::fmt::Debug for ElfExecutable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElfExecutable")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("entry_points", &self.entry_points.len())
            .field("module", &self.module)
            .finish()
    }
}

impl LocalExecutable for ElfExecutable {
    fn base(&self) -> &ExecutableBase {
        &self.base
    }

    fn entry_point_count(&self) -> usize {
        self.entry_points.len()
    }

    fn entry_point_name(&self, ordinal: usize) -> Option<&str> {
        self.entry_point_names.get(ordinal)?.as_deref()
    }

    fn issue_call(
        &self,
        ordinal: usize,
        state: &DispatchState<'_>,
        workgroup_id: &WorkgroupId,
    ) -> Result<(), HalError> {
        check_ordinal(ordinal, self.entry_points.len())?;
        // Generated code takes both arguments as const pointers; it never writes through them.
        let args = CallArgs::PtrPtr(
            state as *const DispatchState<'_> as *mut c_void,
            workgroup_id as *const WorkgroupId as *mut c_void,
        );
        let code = unsafe { invoke(self.entry_points[ordinal] as *const u8, args) }
            .int()
            .unwrap_or(-1);
        if code != 0 {
            error!(
                "{}: entry point {} returned {} at workgroup {}",
                self.name, ordinal, code, workgroup_id
            );
            return Err(HalErrorKind::EntryPointFailed {
                ordinal,
                workgroup: *workgroup_id,
                code,
            }
            .into());
        }
        Ok(())
    }
}
