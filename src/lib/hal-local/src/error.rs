//! Errors for executables and dispatch.
use core::ffi::c_int;

use elfload::{LoadError, StatusCode};
use itertools::{Either, Itertools};
use miette::Diagnostic;
use thiserror::Error;

use crate::abi::Vec3;

#[derive(Debug, Error, Diagnostic)]
#[error("{kind}")]
pub struct HalError {
    pub kind: HalErrorKind,
    #[related]
    pub related: Vec<HalError>,
}

impl HalError {
    /// Collect the results of an iterator, returning either all of the values, or a new error of
    /// kind `parent_kind` holding every error that occurred.
    pub fn collect<I, T>(parent_kind: HalErrorKind, it: I) -> Result<Vec<T>, HalError>
    where
        I: IntoIterator<Item = Result<T, HalError>>,
    {
        let (vals, errs): (Vec<T>, Vec<HalError>) =
            it.into_iter().partition_map(|item| match item {
                Ok(o) => Either::Left(o),
                Err(e) => Either::Right(e),
            });

        if errs.is_empty() {
            Ok(vals)
        } else {
            Err(HalError {
                kind: parent_kind,
                related: errs,
            })
        }
    }

    pub fn code(&self) -> StatusCode {
        match self.kind.code() {
            Some(code) => code,
            None => self
                .related
                .first()
                .map(|e| e.code())
                .unwrap_or(StatusCode::Internal),
        }
    }
}

impl From<HalErrorKind> for HalError {
    fn from(value: HalErrorKind) -> Self {
        Self {
            kind: value,
            related: vec![],
        }
    }
}

impl From<LoadError> for HalError {
    fn from(value: LoadError) -> Self {
        HalErrorKind::Load { err: value }.into()
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum HalErrorKind {
    #[error("failed to load executable image")]
    Load {
        #[source]
        #[diagnostic_source]
        err: LoadError,
    },
    #[error("executable library does not support version {requested}")]
    UnsupportedLibraryVersion { requested: c_int },
    #[error("executable library version {found} is newer than the runtime ({latest})")]
    LibraryTooNew { found: c_int, latest: c_int },
    #[error("malformed executable library: {reason}")]
    InvalidLibrary { reason: String },
    #[error("{layouts} executable layouts given for {entry_points} entry points")]
    LayoutCountMismatch { layouts: usize, entry_points: usize },
    #[error("entry point ordinal {ordinal} out of bounds ({count} entry points)")]
    OrdinalOutOfRange { ordinal: usize, count: usize },
    #[error("entry point {ordinal} failed at workgroup {workgroup} with code {code}")]
    EntryPointFailed {
        ordinal: usize,
        workgroup: Vec3,
        code: c_int,
    },
    #[error("workgroup range {start}..{end} is outside the grid {count}")]
    RangeOutsideGrid { start: Vec3, end: Vec3, count: Vec3 },
    #[error("image was loaded without protections and cannot be executed")]
    NotExecutable,
    #[error("failed to create executable")]
    CreateFailed,
}

impl HalErrorKind {
    /// The status code for this kind, or `None` if the kind only wraps related errors.
    pub fn code(&self) -> Option<StatusCode> {
        Some(match self {
            HalErrorKind::Load { err } => err.code(),
            HalErrorKind::UnsupportedLibraryVersion { .. } => StatusCode::NotFound,
            HalErrorKind::LibraryTooNew { .. }
            | HalErrorKind::LayoutCountMismatch { .. }
            | HalErrorKind::OrdinalOutOfRange { .. }
            | HalErrorKind::NotExecutable => StatusCode::FailedPrecondition,
            HalErrorKind::InvalidLibrary { .. } => StatusCode::InvalidArgument,
            HalErrorKind::EntryPointFailed { .. } => StatusCode::Internal,
            HalErrorKind::RangeOutsideGrid { .. } => StatusCode::OutOfRange,
            HalErrorKind::CreateFailed => return None,
        })
    }
}
