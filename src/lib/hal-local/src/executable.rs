//! The interface every locally runnable executable implements.

use std::sync::Arc;

use tracing::trace;

use crate::{
    abi::{DispatchState, WorkgroupId},
    ExecutableLayout, HalError, HalErrorKind,
};

/// State common to every executable: the layouts it was created with.
///
/// Creating a base takes a reference to each layout, and dropping it gives them back. Nothing
/// else about the executable (its image, its entry points) is owned here.
#[derive(Debug)]
pub struct ExecutableBase {
    layouts: Vec<Arc<ExecutableLayout>>,
}

impl ExecutableBase {
    pub fn initialize(layouts: &[Arc<ExecutableLayout>]) -> Self {
        trace!("retaining {} executable layouts", layouts.len());
        Self {
            layouts: layouts.to_vec(),
        }
    }

    pub fn layouts(&self) -> &[Arc<ExecutableLayout>] {
        &self.layouts
    }

    pub fn layout(&self, ordinal: usize) -> Option<&ExecutableLayout> {
        self.layouts.get(ordinal).map(|l| l.as_ref())
    }
}

impl Drop for ExecutableBase {
    fn drop(&mut self) {
        trace!("releasing {} executable layouts", self.layouts.len());
    }
}

/// An executable whose entry points run on the calling thread.
pub trait LocalExecutable: Send + Sync {
    fn base(&self) -> &ExecutableBase;

    fn entry_point_count(&self) -> usize;

    fn entry_point_name(&self, _ordinal: usize) -> Option<&str> {
        None
    }

    /// Run entry point `ordinal` for a single workgroup.
    fn issue_call(
        &self,
        ordinal: usize,
        state: &DispatchState<'_>,
        workgroup_id: &WorkgroupId,
    ) -> Result<(), HalError>;

    /// Find an entry point's ordinal by name.
    fn lookup_entry_point(&self, name: &str) -> Option<usize> {
        (0..self.entry_point_count()).find(|i| self.entry_point_name(*i) == Some(name))
    }
}

pub(crate) fn check_ordinal(ordinal: usize, count: usize) -> Result<(), HalError> {
    if ordinal >= count {
        return Err(HalErrorKind::OrdinalOutOfRange { ordinal, count }.into());
    }
    Ok(())
}

pub(crate) fn check_layouts(layouts: usize, entry_points: usize) -> Result<(), HalError> {
    if layouts != entry_points {
        return Err(HalErrorKind::LayoutCountMismatch {
            layouts,
            entry_points,
        }
        .into());
    }
    Ok(())
}
