//! A reader/writer for the E57 3D imaging container format: a hierarchical
//! XML metadata tree addressing one or more compressed-vector binary
//! sections of bit-packed point records.

pub mod binding;
pub mod bitpack;
pub mod compressed_vector;
pub mod error;
pub mod file;
pub mod header;
pub mod node;
mod packet;
pub mod packet_cache;
pub mod paged_file;
mod xml;

pub use crate::binding::{BufferBinding, MemoryRepresentation};
pub use crate::compressed_vector::{CompressedVectorReader, CompressedVectorWriter};
pub use crate::error::E57Error;
pub use crate::file::E57File;
pub use crate::node::{Arena, NodeData, NodeId};
pub use crate::packet_cache::PacketCache;
pub use crate::paged_file::ReadChecksumPolicy;
