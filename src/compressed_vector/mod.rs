//! The compressed-vector codec pipeline: a record-oriented writer (F) and
//! reader (G) built on top of [`crate::bitpack`]'s per-field codecs and
//! [`crate::packet`]'s framing.

pub mod reader;
pub mod writer;

pub use reader::CompressedVectorReader;
pub use writer::CompressedVectorWriter;

use crate::bitpack::bits_needed;
use crate::error::E57Error;
use crate::node::{NodeData, Precision};

/// The decoded shape of one prototype leaf, derived once at construction.
#[derive(Debug, Clone, Copy)]
pub(crate) enum LeafKind {
    Integer { bits: u32, min: i64 },
    ScaledInteger { bits: u32, min: i64, max: i64, scale: f64, offset: f64 },
    Float(Precision),
    String,
}

pub(crate) fn leaf_kind_of(data: &NodeData) -> Result<LeafKind, E57Error> {
    match data {
        NodeData::Integer(i) => Ok(LeafKind::Integer { bits: bits_needed(i.min, i.max), min: i.min }),
        NodeData::ScaledInteger(s) => Ok(LeafKind::ScaledInteger {
            bits: bits_needed(s.min, s.max),
            min: s.min,
            max: s.max,
            scale: s.scale,
            offset: s.offset,
        }),
        NodeData::Float(f) => Ok(LeafKind::Float(f.precision)),
        NodeData::String(_) => Ok(LeafKind::String),
        other => Err(E57Error::TypeMismatch(format!(
            "prototype leaf must be a scalar, found {}",
            other.kind_name()
        ))),
    }
}

/// A decoded/to-be-encoded value for one record, one field.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LeafValue {
    Int(i64),
    Float(f64),
    Str(String),
}
