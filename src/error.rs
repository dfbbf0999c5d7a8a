//! Errors

use std::io;

use thiserror::Error;

/// Closed set of error kinds surfaced by this crate.
///
/// Every fallible call in this crate returns one of these variants; none are
/// swallowed internally.
#[derive(Error, Debug)]
pub enum E57Error {
    #[error("std io error: {0}")]
    StdIo(#[from] io::Error),

    #[error("file read error: {0}")]
    FileRead(io::Error),

    #[error("file write error: {0}")]
    FileWrite(io::Error),

    #[error("file open error: {0}")]
    FileOpen(io::Error),

    #[error("deku error: {0:?}")]
    Deku(#[from] deku::DekuError),

    #[error("xml error: {0:?}")]
    Xml(#[from] quick_xml::Error),

    #[error("xml attribute error: {0:?}")]
    XmlAttr(#[from] quick_xml::events::attributes::AttrError),

    #[error("string error: {0:?}")]
    StringUtf8(#[from] std::string::FromUtf8Error),

    #[error("checksum mismatch at logical offset {offset:#x}")]
    ChecksumMismatch { offset: u64 },

    #[error("bad file signature")]
    BadFileSignature,

    #[error("unsupported version {major}.{minor}")]
    UnsupportedVersion { major: u32, minor: u32 },

    #[error("malformed xml: {0}")]
    BadXml(String),

    #[error("malformed path: {0}")]
    BadPath(String),

    #[error("path not defined: {0}")]
    PathUndefined(String),

    #[error("already defined at path: {0}")]
    AlreadyDefined(String),

    #[error("element is not a container: {0}")]
    NotContainer(String),

    #[error("node is already attached elsewhere")]
    AlreadySet,

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("value out of bounds: {0}")]
    ValueOutOfBounds(String),

    #[error("bad buffer: {0}")]
    BadBuffer(String),

    #[error("buffer size mismatch: expected {expected}, got {got}")]
    BufferSizeMismatch { expected: usize, got: usize },

    #[error("duplicate bound path: {0}")]
    BufferDuplicatePath(String),

    #[error("reader is not open")]
    ReaderNotOpen,

    #[error("writer is not open")]
    WriterNotOpen,

    #[error("file is not open")]
    FileNotOpen,

    #[error("internal error: {0}")]
    InternalError(String),
}

impl From<E57Error> for io::Error {
    fn from(value: E57Error) -> Self {
        use E57Error::*;
        match value {
            StdIo(io) | FileRead(io) | FileWrite(io) | FileOpen(io) => io,
            e @ (Deku(_)
            | Xml(_)
            | XmlAttr(_)
            | StringUtf8(_)
            | ChecksumMismatch { .. }
            | BadFileSignature
            | UnsupportedVersion { .. }
            | BadXml(_)
            | BadPath(_)
            | PathUndefined(_)
            | AlreadyDefined(_)
            | NotContainer(_)
            | AlreadySet
            | TypeMismatch(_)
            | ValueOutOfBounds(_)
            | BadBuffer(_)
            | BufferSizeMismatch { .. }
            | BufferDuplicatePath(_)
            | ReaderNotOpen
            | WriterNotOpen
            | FileNotOpen
            | InternalError(_)) => Self::new(io::ErrorKind::InvalidData, e),
        }
    }
}
