//! Running an entry point over a grid of workgroups.

use tracing::{error, trace_span};

use crate::{
    abi::{DispatchState, Vec3, WorkgroupId},
    HalError, HalErrorKind, LocalExecutable,
};

/// A half-open box `start..end` of workgroup ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkgroupRange {
    pub start: Vec3,
    pub end: Vec3,
}

impl WorkgroupRange {
    pub const fn new(start: Vec3, end: Vec3) -> Self {
        Self { start, end }
    }

    /// Every workgroup of a grid.
    pub const fn full(count: Vec3) -> Self {
        Self {
            start: Vec3::new(0, 0, 0),
            end: count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start.x >= self.end.x || self.start.y >= self.end.y || self.start.z >= self.end.z
    }

    /// The number of workgroups in the range.
    pub fn len(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        Vec3::new(
            self.end.x - self.start.x,
            self.end.y - self.start.y,
            self.end.z - self.start.z,
        )
        .volume()
    }

    /// Split into at most `parts` disjoint ranges, cutting along the outermost dimension with more
    /// than one workgroup. Running the parts in order visits workgroups in the same order as
    /// running the whole range.
    pub fn split(&self, parts: u32) -> Vec<WorkgroupRange> {
        if self.is_empty() || parts <= 1 {
            return vec![*self];
        }
        let axis = if self.end.z - self.start.z > 1 {
            2
        } else if self.end.y - self.start.y > 1 {
            1
        } else {
            0
        };
        let get = |v: &Vec3| match axis {
            2 => v.z,
            1 => v.y,
            _ => v.x,
        };
        let set = |v: &mut Vec3, val: u32| match axis {
            2 => v.z = val,
            1 => v.y = val,
            _ => v.x = val,
        };

        let (lo, hi) = (get(&self.start), get(&self.end));
        let extent = hi - lo;
        let parts = parts.min(extent);
        let mut out = Vec::with_capacity(parts as usize);
        let mut at = lo;
        for i in 0..parts {
            // Spread the remainder over the first parts.
            let len = extent / parts + u32::from(i < extent % parts);
            let mut r = *self;
            set(&mut r.start, at);
            set(&mut r.end, at + len);
            out.push(r);
            at += len;
        }
        out
    }
}

/// Run entry point `ordinal` once per workgroup in `range`, z outermost and x innermost.
///
/// Calls are strictly sequential on the calling thread. The first failing call stops the
/// dispatch and its error is returned; whatever earlier calls wrote stays written.
pub fn dispatch_range(
    executable: &dyn LocalExecutable,
    ordinal: usize,
    state: &DispatchState<'_>,
    range: WorkgroupRange,
) -> Result<(), HalError> {
    let count = state.workgroup_count;
    if !range.is_empty()
        && (range.end.x > count.x || range.end.y > count.y || range.end.z > count.z)
    {
        return Err(HalErrorKind::RangeOutsideGrid {
            start: range.start,
            end: range.end,
            count,
        }
        .into());
    }

    let _span = trace_span!("dispatch", grid = %count, ordinal).entered();
    if range.is_empty() {
        return Ok(());
    }

    for z in range.start.z..range.end.z {
        for y in range.start.y..range.end.y {
            for x in range.start.x..range.end.x {
                let workgroup_id = WorkgroupId::new(x, y, z);
                if let Err(e) = executable.issue_call(ordinal, state, &workgroup_id) {
                    error!("dispatch of {} stopped at {}: {}", ordinal, workgroup_id, e);
                    return Err(e);
                }
            }
        }
    }
    Ok(())
}

/// Run entry point `ordinal` over the whole grid described by `state`.
pub fn dispatch_inline(
    executable: &dyn LocalExecutable,
    ordinal: usize,
    state: &DispatchState<'_>,
) -> Result<(), HalError> {
    dispatch_range(
        executable,
        ordinal,
        state,
        WorkgroupRange::full(state.workgroup_count),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use elfload::StatusCode;

    use super::*;
    use crate::{Bindings, ExecutableBase};

    /// Records every call, failing the `fail_at`th one (1-based).
    struct Recorder {
        base: ExecutableBase,
        calls: Mutex<Vec<(usize, WorkgroupId)>>,
        attempts: AtomicUsize,
        fail_at: Option<usize>,
    }

    impl Recorder {
        fn new(fail_at: Option<usize>) -> Self {
            Self {
                base: ExecutableBase::initialize(&[]),
                calls: Mutex::new(Vec::new()),
                attempts: AtomicUsize::new(0),
                fail_at,
            }
        }

        fn calls(&self) -> Vec<(usize, WorkgroupId)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl LocalExecutable for Recorder {
        fn base(&self) -> &ExecutableBase {
            &self.base
        }

        fn entry_point_count(&self) -> usize {
            2
        }

        fn issue_call(
            &self,
            ordinal: usize,
            _state: &DispatchState<'_>,
            workgroup_id: &WorkgroupId,
        ) -> Result<(), HalError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if Some(n) == self.fail_at {
                return Err(HalErrorKind::EntryPointFailed {
                    ordinal,
                    workgroup: *workgroup_id,
                    code: 1,
                }
                .into());
            }
            self.calls.lock().unwrap().push((ordinal, *workgroup_id));
            Ok(())
        }
    }

    fn state<'a>(bindings: &'a Bindings<'a>, count: Vec3) -> DispatchState<'a> {
        DispatchState::new(count, Vec3::splat(1), &[], bindings, None)
    }

    #[test]
    fn linear_grid_in_order() {
        let exec = Recorder::new(None);
        let b = Bindings::new();
        let s = state(&b, Vec3::new(4, 1, 1));
        dispatch_inline(&exec, 1, &s).unwrap();
        let expect: Vec<_> = (0..4).map(|x| (1, Vec3::new(x, 0, 0))).collect();
        assert_eq!(exec.calls(), expect);
    }

    #[test]
    fn x_is_innermost() {
        let exec = Recorder::new(None);
        let b = Bindings::new();
        let s = state(&b, Vec3::new(2, 2, 2));
        dispatch_inline(&exec, 0, &s).unwrap();
        let ids: Vec<_> = exec.calls().into_iter().map(|(_, id)| id).collect();
        let mut expect = Vec::new();
        for z in 0..2 {
            for y in 0..2 {
                for x in 0..2 {
                    expect.push(Vec3::new(x, y, z));
                }
            }
        }
        assert_eq!(ids, expect);
    }

    #[test]
    fn first_failure_stops_dispatch() {
        let exec = Recorder::new(Some(3));
        let b = Bindings::new();
        let s = state(&b, Vec3::new(4, 1, 1));
        let err = dispatch_inline(&exec, 0, &s).unwrap_err();
        assert_eq!(err.code(), StatusCode::Internal);
        assert!(matches!(
            err.kind,
            HalErrorKind::EntryPointFailed {
                workgroup: Vec3 { x: 2, y: 0, z: 0 },
                ..
            }
        ));
        // The fourth call never happened.
        assert_eq!(exec.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(exec.calls().len(), 2);
    }

    #[test]
    fn empty_grid_issues_no_calls() {
        for count in [Vec3::new(0, 1, 1), Vec3::new(3, 0, 1), Vec3::new(3, 3, 0)] {
            let exec = Recorder::new(Some(1));
            let b = Bindings::new();
            let s = state(&b, count);
            dispatch_inline(&exec, 0, &s).unwrap();
            assert_eq!(exec.attempts.load(Ordering::SeqCst), 0);
        }
    }

    #[test]
    fn range_outside_grid_is_rejected() {
        let exec = Recorder::new(None);
        let b = Bindings::new();
        let s = state(&b, Vec3::new(2, 2, 1));
        let range = WorkgroupRange::new(Vec3::new(0, 0, 0), Vec3::new(3, 1, 1));
        let err = dispatch_range(&exec, 0, &s, range).unwrap_err();
        assert_eq!(err.code(), StatusCode::OutOfRange);
        assert_eq!(exec.attempts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn split_covers_range_in_order() {
        let full = WorkgroupRange::full(Vec3::new(3, 5, 1));
        let parts = full.split(3);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts.iter().map(|p| p.len()).sum::<u64>(), full.len());
        assert_eq!(parts[0].start, Vec3::new(0, 0, 0));
        assert_eq!(parts[0].end, Vec3::new(3, 2, 1));
        assert_eq!(parts[2].end, full.end);

        let exec = Recorder::new(None);
        let b = Bindings::new();
        let s = state(&b, full.end);
        for p in &parts {
            dispatch_range(&exec, 0, &s, *p).unwrap();
        }
        let whole = Recorder::new(None);
        dispatch_inline(&whole, 0, &s).unwrap();
        assert_eq!(exec.calls(), whole.calls());

        // More parts than workgroups.
        assert_eq!(WorkgroupRange::full(Vec3::new(2, 1, 1)).split(8).len(), 2);
    }

    #[test]
    fn disjoint_ranges_run_concurrently() {
        let exec = Recorder::new(None);
        let count = Vec3::new(4, 4, 4);
        let b = Bindings::new();
        let s = state(&b, count);
        let parts = WorkgroupRange::full(count).split(4);
        std::thread::scope(|scope| {
            for p in &parts {
                let exec = &exec;
                let s = &s;
                scope.spawn(move || dispatch_range(exec, 0, s, *p).unwrap());
            }
        });
        let mut ids: Vec<_> = exec.calls().into_iter().map(|(_, id)| id).collect();
        ids.sort_by_key(|v| (v.z, v.y, v.x));
        ids.dedup();
        assert_eq!(ids.len() as u64, count.volume());
    }
}
