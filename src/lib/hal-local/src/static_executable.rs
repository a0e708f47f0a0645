//! Executables whose entry points are compiled into the host.

use core::ffi::c_int;
use std::sync::Arc;

use tracing::{debug, error};

use crate::{
    abi::{DispatchState, WorkgroupId},
    executable::{check_layouts, check_ordinal},
    ExecutableBase, ExecutableLayout, HalError, HalErrorKind, LocalExecutable,
};

/// An entry point compiled into the host binary.
pub type StaticEntryPoint =
    unsafe extern "C" fn(state: *const DispatchState<'_>, workgroup_id: *const WorkgroupId) -> c_int;

/// An executable whose entry points were linked into the host rather than loaded from an image.
pub struct StaticExecutable {
    base: ExecutableBase,
    name: String,
    entry_points: Vec<(String, StaticEntryPoint)>,
}

impl StaticExecutable {
    /// Create an executable from named entry points, one layout per entry point.
    ///
    /// Entry points are trusted: each must be sound to call with any dispatch state that matches
    /// its layout.
    pub fn new(
        name: impl ToString,
        entry_points: &[(&str, StaticEntryPoint)],
        layouts: &[Arc<ExecutableLayout>],
    ) -> Result<Self, HalError> {
        check_layouts(layouts.len(), entry_points.len())?;
        let name = name.to_string();
        debug!("{}: {} static entry points", name, entry_points.len());
        Ok(Self {
            base: ExecutableBase::initialize(layouts),
            name,
            entry_points: entry_points
                .iter()
                .map(|(n, f)| (n.to_string(), *f))
                .collect(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for StaticExecutable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticExecutable")
            .field("name", &self.name)
            .field(
                "entry_points",
                &self.entry_points.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl LocalExecutable for StaticExecutable {
    fn base(&self) -> &ExecutableBase {
        &self.base
    }

    fn entry_point_count(&self) -> usize {
        self.entry_points.len()
    }

    fn entry_point_name(&self, ordinal: usize) -> Option<&str> {
        self.entry_points.get(ordinal).map(|(n, _)| n.as_str())
    }

    fn issue_call(
        &self,
        ordinal: usize,
        state: &DispatchState<'_>,
        workgroup_id: &WorkgroupId,
    ) -> Result<(), HalError> {
        check_ordinal(ordinal, self.entry_points.len())?;
        let (_, entry) = &self.entry_points[ordinal];
        let code = unsafe { entry(state, workgroup_id) };
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
