//! Definitions for errors for the loader.
use std::fmt::Display;

use elf::file::Class;
use itertools::{Either, Itertools};
use miette::Diagnostic;
use thiserror::Error;

use crate::reloc::TableKind;

/// Coarse classification of a failure, shared by every layer that sits on top of the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    InvalidArgument,
    Unimplemented,
    FailedPrecondition,
    OutOfRange,
    NotFound,
    ResourceExhausted,
    Internal,
}

impl Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StatusCode::InvalidArgument => "invalid-argument",
            StatusCode::Unimplemented => "unimplemented",
            StatusCode::FailedPrecondition => "failed-precondition",
            StatusCode::OutOfRange => "out-of-range",
            StatusCode::NotFound => "not-found",
            StatusCode::ResourceExhausted => "resource-exhausted",
            StatusCode::Internal => "internal",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error, Diagnostic)]
#[error("{kind}")]
pub struct LoadError {
    pub kind: LoadErrorKind,
    #[related]
    pub related: Vec<LoadError>,
}

impl LoadError {
    pub fn new_collect(kind: LoadErrorKind, related: Vec<LoadError>) -> Self {
        Self { kind, related }
    }

    /// Collect the results of an iterator, returning either all of the values, or a new error of
    /// kind `parent_kind` holding every error that occurred.
    pub fn collect<I, T>(parent_kind: LoadErrorKind, it: I) -> Result<Vec<T>, LoadError>
    where
        I: IntoIterator<Item = Result<T, LoadError>>,
    {
        let (vals, errs): (Vec<T>, Vec<LoadError>) =
            it.into_iter().partition_map(|item| match item {
                Ok(o) => Either::Left(o),
                Err(e) => Either::Right(e),
            });

        if errs.is_empty() {
            Ok(vals)
        } else {
            Err(LoadError {
                kind: parent_kind,
                related: errs,
            })
        }
    }

    /// The status code of this error. Wrapping kinds report the code of their first cause.
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

impl From<LoadErrorKind> for LoadError {
    fn from(value: LoadErrorKind) -> Self {
        Self {
            kind: value,
            related: vec![],
        }
    }
}

impl From<elf::ParseError> for LoadError {
    fn from(value: elf::ParseError) -> Self {
        LoadErrorKind::ParseError { err: value }.into()
    }
}

impl From<HeaderError> for LoadError {
    fn from(value: HeaderError) -> Self {
        LoadErrorKind::InvalidELFHeader { hdr_err: value }.into()
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum LoadErrorKind {
    #[error("parse failed: {err}")]
    ParseError {
        #[from]
        err: elf::ParseError,
    },
    #[error("invalid ELF header: {hdr_err}")]
    InvalidELFHeader {
        #[source]
        #[diagnostic_source]
        hdr_err: HeaderError,
    },
    #[error("image is missing a required segment or dynamic entry '{name}'")]
    MissingSection { name: String },
    #[error("image has no loadable segments")]
    NoLoadableSegments,
    #[error("segment {index} is malformed: {reason}")]
    BadSegment { index: usize, reason: String },
    #[error("failed to load segments")]
    SegmentLoadFail,
    #[error("unsupported relocation table kind {kind} for {arch}")]
    UnsupportedTableKind { arch: &'static str, kind: TableKind },
    #[error("unsupported DT_PLTREL value {value} for {arch}")]
    UnsupportedPltRel { arch: &'static str, value: u64 },
    #[error("symbol-relative relocations not implemented (symbol {sym}, type {r_type})")]
    SymbolRelocation { r_type: u32, sym: u32 },
    #[error("unimplemented {arch} relocation type {r_type:08X}")]
    UnsupportedReloc { arch: &'static str, r_type: u32 },
    #[error("access of {width} bytes at vaddr {vaddr:#x} is outside the image ({len} bytes at {base:#x})")]
    OutOfBounds {
        vaddr: u64,
        width: usize,
        base: u64,
        len: usize,
    },
    #[error("relocation table '{table}' is {size} bytes, not a whole number of {entsize}-byte entries")]
    TruncatedTable {
        table: TableKind,
        size: usize,
        entsize: usize,
    },
    #[error("failed to process relocation table '{table}'")]
    RelocationTableFail { table: TableKind },
    #[error("failed to map image memory")]
    MapFailed {
        #[source]
        err: std::io::Error,
    },
    #[error("failed to protect segment {index}")]
    ProtectFailed {
        index: usize,
        #[source]
        err: std::io::Error,
    },
    #[error("exported symbol '{name}' not found")]
    SymbolNotFound { name: String },
    #[error("{what} is not supported on this host")]
    HostUnsupported { what: &'static str },
}

impl LoadErrorKind {
    /// The status code for this kind, or `None` if the kind only wraps related errors.
    pub fn code(&self) -> Option<StatusCode> {
        Some(match self {
            LoadErrorKind::ParseError { .. }
            | LoadErrorKind::NoLoadableSegments
            | LoadErrorKind::BadSegment { .. }
            | LoadErrorKind::MissingSection { .. }
            | LoadErrorKind::UnsupportedTableKind { .. }
            | LoadErrorKind::UnsupportedPltRel { .. }
            | LoadErrorKind::TruncatedTable { .. } => StatusCode::InvalidArgument,
            LoadErrorKind::InvalidELFHeader { .. } => StatusCode::FailedPrecondition,
            LoadErrorKind::SymbolRelocation { .. }
            | LoadErrorKind::UnsupportedReloc { .. }
            | LoadErrorKind::HostUnsupported { .. } => StatusCode::Unimplemented,
            LoadErrorKind::OutOfBounds { .. } => StatusCode::OutOfRange,
            LoadErrorKind::SymbolNotFound { .. } => StatusCode::NotFound,
            LoadErrorKind::MapFailed { .. } => StatusCode::ResourceExhausted,
            LoadErrorKind::ProtectFailed { .. } => StatusCode::Internal,
            LoadErrorKind::SegmentLoadFail | LoadErrorKind::RelocationTableFail { .. } => {
                return None
            }
        })
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum HeaderError {
    #[error("class mismatch: expected {expect:?}, got {got:?}")]
    ClassMismatch { expect: Class, got: Class },
    #[error("endianness mismatch: expected little endian")]
    EndianMismatch,
    #[error("ELF type mismatch: expected {expect}, got {got}")]
    ELFTypeMismatch { expect: u16, got: u16 },
    #[error("machine mismatch: expected {expect}, got {got}")]
    MachineMismatch { expect: u16, got: u16 },
}
