//! Concrete realization of §4.1's XML projection, using `quick-xml`.
//!
//! Each node variant serializes under its own fixed tag (`structure`,
//! `vector`, `integer`, ...); a `name` attribute carries the element's key
//! within its parent (omitted for the root and for vector children, whose
//! key is positional). Scalar values live in element text content, the
//! conventional XML leaf-value idiom.

use std::io::{BufRead, Write};

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::name::QName;
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;

use crate::error::E57Error;
use crate::node::{Arena, BlobData, NodeData, NodeId, Precision};

pub fn to_writer<W: Write>(arena: &Arena, root: NodeId, writer: W) -> Result<(), E57Error> {
    let mut w = Writer::new_with_indent(writer, b' ', 2);
    write_node(arena, root, None, &mut w)
}

fn write_node<W: Write>(arena: &Arena, id: NodeId, name: Option<&str>, w: &mut Writer<W>) -> Result<(), E57Error> {
    match arena.data(id) {
        NodeData::Structure(s) => {
            let mut start = BytesStart::new("structure");
            if let Some(n) = name {
                start.push_attribute(("name", n));
            }
            w.write_event(Event::Start(start))?;
            for (child_name, &child) in s.names.iter().zip(&s.children) {
                write_node(arena, child, Some(child_name), w)?;
            }
            w.write_event(Event::End(BytesEnd::new("structure")))?;
        },
        NodeData::Vector(v) => {
            let mut start = BytesStart::new("vector");
            if let Some(n) = name {
                start.push_attribute(("name", n));
            }
            start.push_attribute(("allowHeterogeneous", bool_str(v.allow_heterogeneous)));
            w.write_event(Event::Start(start))?;
            for (i, &child) in v.children.iter().enumerate() {
                write_node(arena, child, Some(&i.to_string()), w)?;
            }
            w.write_event(Event::End(BytesEnd::new("vector")))?;
        },
        NodeData::CompressedVector(c) => {
            let mut start = BytesStart::new("compressedVector");
            if let Some(n) = name {
                start.push_attribute(("name", n));
            }
            start.push_attribute(("recordCount", c.record_count.to_string().as_str()));
            start.push_attribute(("fileOffset", c.binary_section_logical_start.to_string().as_str()));
            w.write_event(Event::Start(start))?;

            w.write_event(Event::Start(BytesStart::new("prototype")))?;
            write_node(arena, c.prototype, None, w)?;
            w.write_event(Event::End(BytesEnd::new("prototype")))?;

            w.write_event(Event::Start(BytesStart::new("codecs")))?;
            write_node(arena, c.codecs, None, w)?;
            w.write_event(Event::End(BytesEnd::new("codecs")))?;

            w.write_event(Event::End(BytesEnd::new("compressedVector")))?;
        },
        NodeData::Integer(i) => {
            let mut start = BytesStart::new("integer");
            if let Some(n) = name {
                start.push_attribute(("name", n));
            }
            start.push_attribute(("minimum", i.min.to_string().as_str()));
            start.push_attribute(("maximum", i.max.to_string().as_str()));
            w.write_event(Event::Start(start))?;
            w.write_event(Event::Text(BytesText::new(&i.value.to_string())))?;
            w.write_event(Event::End(BytesEnd::new("integer")))?;
        },
        NodeData::ScaledInteger(si) => {
            let mut start = BytesStart::new("scaledInteger");
            if let Some(n) = name {
                start.push_attribute(("name", n));
            }
            start.push_attribute(("minimum", si.min.to_string().as_str()));
            start.push_attribute(("maximum", si.max.to_string().as_str()));
            start.push_attribute(("scale", si.scale.to_string().as_str()));
            start.push_attribute(("offset", si.offset.to_string().as_str()));
            w.write_event(Event::Start(start))?;
            w.write_event(Event::Text(BytesText::new(&si.raw.to_string())))?;
            w.write_event(Event::End(BytesEnd::new("scaledInteger")))?;
        },
        NodeData::Float(f) => {
            let mut start = BytesStart::new("float");
            if let Some(n) = name {
                start.push_attribute(("name", n));
            }
            start.push_attribute(("precision", precision_str(f.precision)));
            start.push_attribute(("minimum", f.min.to_string().as_str()));
            start.push_attribute(("maximum", f.max.to_string().as_str()));
            w.write_event(Event::Start(start))?;
            w.write_event(Event::Text(BytesText::new(&f.value.to_string())))?;
            w.write_event(Event::End(BytesEnd::new("float")))?;
        },
        NodeData::String(s) => {
            let mut start = BytesStart::new("string");
            if let Some(n) = name {
                start.push_attribute(("name", n));
            }
            w.write_event(Event::Start(start))?;
            w.write_event(Event::Text(BytesText::new(&s.value)))?;
            w.write_event(Event::End(BytesEnd::new("string")))?;
        },
        NodeData::Blob(b) => {
            let mut start = BytesStart::new("blob");
            if let Some(n) = name {
                start.push_attribute(("name", n));
            }
            start.push_attribute(("byteCount", b.byte_count.to_string().as_str()));
            start.push_attribute(("fileOffset", b.binary_section_logical_start.to_string().as_str()));
            start.push_attribute(("length", b.binary_section_logical_length.to_string().as_str()));
            w.write_event(Event::Empty(start))?;
        },
    }
    Ok(())
}

fn bool_str(b: bool) -> &'static str {
    if b { "true" } else { "false" }
}

fn precision_str(p: Precision) -> &'static str {
    match p {
        Precision::Single => "single",
        Precision::Double => "double",
    }
}

fn parse_precision(s: &str) -> Result<Precision, E57Error> {
    match s {
        "single" => Ok(Precision::Single),
        "double" => Ok(Precision::Double),
        other => Err(E57Error::BadXml(format!("unknown float precision {other}"))),
    }
}

/// Parse a document whose root element is a `structure`, populating a
/// fresh [`Arena`] in document order and returning the arena plus its
/// (already-attached) root id.
pub fn from_reader<R: BufRead>(reader: R) -> Result<(Arena, NodeId), E57Error> {
    let mut xml_reader = Reader::from_reader(reader);
    xml_reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut arena = Arena::new();
    let root = arena.root();

    loop {
        match xml_reader.read_event_into(&mut buf)? {
            Event::Start(e) if tag_name(&e.name()) == "structure" => {
                populate_container(&mut xml_reader, &mut buf, &mut arena, root, true)?;
                break;
            },
            Event::Eof => return Err(E57Error::BadXml("no root structure element found".to_string())),
            Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {},
            _ => return Err(E57Error::BadXml("expected root structure element".to_string())),
        }
        buf.clear();
    }
    Ok((arena, root))
}

fn tag_name(name: &QName) -> String {
    String::from_utf8_lossy(name.as_ref()).into_owned()
}

fn get_attr(e: &BytesStart, key: &str) -> Result<Option<String>, E57Error> {
    for attr in e.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == key.as_bytes() {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

fn require_attr(e: &BytesStart, key: &str) -> Result<String, E57Error> {
    get_attr(e, key)?.ok_or_else(|| E57Error::BadXml(format!("missing attribute {key}")))
}

fn require_i64_attr(e: &BytesStart, key: &str) -> Result<i64, E57Error> {
    require_attr(e, key)?
        .parse()
        .map_err(|_| E57Error::BadXml(format!("attribute {key} is not an integer")))
}

fn require_f64_attr(e: &BytesStart, key: &str) -> Result<f64, E57Error> {
    require_attr(e, key)?
        .parse()
        .map_err(|_| E57Error::BadXml(format!("attribute {key} is not a number")))
}

fn require_u64_attr(e: &BytesStart, key: &str) -> Result<u64, E57Error> {
    require_attr(e, key)?
        .parse()
        .map_err(|_| E57Error::BadXml(format!("attribute {key} is not an unsigned integer")))
}

/// Read text content up to the matching end tag. Nested elements inside a
/// scalar are a validation error.
fn read_text_to_end<R: BufRead>(reader: &mut Reader<R>, buf: &mut Vec<u8>) -> Result<String, E57Error> {
    let mut text = String::new();
    loop {
        buf.clear();
        match reader.read_event_into(buf)? {
            Event::Text(t) => text.push_str(&t.unescape()?),
            Event::CData(c) => text.push_str(&String::from_utf8(c.into_inner().into_owned())?),
            Event::End(_) => return Ok(text),
            Event::Eof => return Err(E57Error::BadXml("unexpected eof reading element text".to_string())),
            Event::Start(e) => {
                return Err(E57Error::BadXml(format!("unexpected nested element {}", tag_name(&e.name()))));
            },
            _ => {},
        }
    }
}

/// Populate a just-created `Structure` or `Vector` node with children read
/// from the stream, until its matching end tag. For a `Vector`, `is_struct`
/// is `false` and children are auto-numbered rather than keyed by a `name`
/// attribute.
fn populate_container<R: BufRead>(
    reader: &mut Reader<R>,
    buf: &mut Vec<u8>,
    arena: &mut Arena,
    container: NodeId,
    is_struct: bool,
) -> Result<(), E57Error> {
    loop {
        buf.clear();
        match reader.read_event_into(buf)? {
            Event::Start(e) => {
                let tag = tag_name(&e.name());
                let child = parse_node_body(reader, buf, arena, &tag, &e, false)?;
                attach(arena, container, is_struct, &e, child)?;
            },
            Event::Empty(e) => {
                let tag = tag_name(&e.name());
                let child = parse_node_body(reader, buf, arena, &tag, &e, true)?;
                attach(arena, container, is_struct, &e, child)?;
            },
            Event::End(_) => return Ok(()),
            Event::Eof => return Err(E57Error::BadXml("unexpected eof in container".to_string())),
            _ => {},
        }
    }
}

fn attach(
    arena: &mut Arena,
    container: NodeId,
    is_struct: bool,
    start: &BytesStart,
    child: NodeId,
) -> Result<(), E57Error> {
    if is_struct {
        let name = get_attr(start, "name")?.unwrap_or_else(|| tag_name(&start.name()));
        arena.adopt(container, name, child)
    } else {
        arena.append(container, child)
    }
}

/// Build one node (and, for containers, its whole subtree) from a tag
/// already read as a `Start` (`is_empty = false`) or `Empty` event.
fn parse_node_body<R: BufRead>(
    reader: &mut Reader<R>,
    buf: &mut Vec<u8>,
    arena: &mut Arena,
    tag: &str,
    start: &BytesStart,
    is_empty: bool,
) -> Result<NodeId, E57Error> {
    match tag {
        "structure" => {
            let id = arena.new_structure();
            if !is_empty {
                populate_container(reader, buf, arena, id, true)?;
            }
            Ok(id)
        },
        "vector" => {
            let allow_heterogeneous = get_attr(start, "allowHeterogeneous")?.map(|v| v == "true").unwrap_or(false);
            let id = arena.new_vector(allow_heterogeneous);
            if !is_empty {
                populate_container(reader, buf, arena, id, false)?;
            }
            Ok(id)
        },
        "compressedVector" => {
            if is_empty {
                return Err(E57Error::BadXml("compressedVector must have prototype/codecs children".to_string()));
            }
            let record_count = require_u64_attr(start, "recordCount")?;
            let file_offset = require_u64_attr(start, "fileOffset")?;
            let id = parse_compressed_vector(reader, buf, arena)?;
            if let NodeData::CompressedVector(c) = arena.data_mut(id) {
                c.record_count = record_count;
                c.binary_section_logical_start = file_offset;
            }
            Ok(id)
        },
        "integer" => {
            let min = require_i64_attr(start, "minimum")?;
            let max = require_i64_attr(start, "maximum")?;
            let text = if is_empty { String::new() } else { read_text_to_end(reader, buf)? };
            let value: i64 = if text.trim().is_empty() {
                min
            } else {
                text.trim().parse().map_err(|_| E57Error::BadXml("bad integer value".to_string()))?
            };
            arena.new_integer(value, min, max)
        },
        "scaledInteger" => {
            let min = require_i64_attr(start, "minimum")?;
            let max = require_i64_attr(start, "maximum")?;
            let scale = require_f64_attr(start, "scale")?;
            let offset = require_f64_attr(start, "offset")?;
            let text = if is_empty { String::new() } else { read_text_to_end(reader, buf)? };
            let raw: i64 = if text.trim().is_empty() {
                min
            } else {
                text.trim().parse().map_err(|_| E57Error::BadXml("bad scaledInteger value".to_string()))?
            };
            arena.new_scaled_integer(raw, min, max, scale, offset)
        },
        "float" => {
            let precision = parse_precision(&require_attr(start, "precision")?)?;
            let min = require_f64_attr(start, "minimum")?;
            let max = require_f64_attr(start, "maximum")?;
            let text = if is_empty { String::new() } else { read_text_to_end(reader, buf)? };
            let value: f64 = if text.trim().is_empty() {
                0.0
            } else {
                text.trim().parse().map_err(|_| E57Error::BadXml("bad float value".to_string()))?
            };
            arena.new_float(value, precision, min, max)
        },
        "string" => {
            let text = if is_empty { String::new() } else { read_text_to_end(reader, buf)? };
            Ok(arena.new_string(text))
        },
        "blob" => {
            let byte_count = require_u64_attr(start, "byteCount")?;
            let file_offset = require_u64_attr(start, "fileOffset")?;
            let length = require_u64_attr(start, "length")?;
            let id = arena.new_blob(byte_count);
            // new_blob always produces a Blob variant.
            if let NodeData::Blob(b) = arena.data_mut(id) {
                *b = BlobData {
                    byte_count,
                    binary_section_logical_start: file_offset,
                    binary_section_logical_length: length,
                };
            }
            Ok(id)
        },
        other => Err(E57Error::BadXml(format!("unknown element {other}"))),
    }
}

fn parse_compressed_vector<R: BufRead>(
    reader: &mut Reader<R>,
    buf: &mut Vec<u8>,
    arena: &mut Arena,
) -> Result<NodeId, E57Error> {
    let mut prototype = None;
    let mut codecs = None;
    loop {
        buf.clear();
        match reader.read_event_into(buf)? {
            Event::Start(e) => {
                let tag = tag_name(&e.name());
                match tag.as_str() {
                    "prototype" => prototype = Some(parse_wrapped_single_child(reader, buf, arena)?),
                    "codecs" => codecs = Some(parse_wrapped_single_child(reader, buf, arena)?),
                    other => return Err(E57Error::BadXml(format!("unexpected element {other} in compressedVector"))),
                }
            },
            Event::End(_) => break,
            Event::Eof => return Err(E57Error::BadXml("unexpected eof in compressedVector".to_string())),
            _ => {},
        }
    }
    let prototype = prototype.ok_or_else(|| E57Error::BadXml("compressedVector missing prototype".to_string()))?;
    let codecs = codecs.ok_or_else(|| E57Error::BadXml("compressedVector missing codecs".to_string()))?;
    arena.new_compressed_vector(prototype, codecs)
}

fn parse_wrapped_single_child<R: BufRead>(
    reader: &mut Reader<R>,
    buf: &mut Vec<u8>,
    arena: &mut Arena,
) -> Result<NodeId, E57Error> {
    loop {
        buf.clear();
        match reader.read_event_into(buf)? {
            Event::Start(e) => {
                let tag = tag_name(&e.name());
                let child = parse_node_body(reader, buf, arena, &tag, &e, false)?;
                // consume the wrapper's end tag
                loop {
                    buf.clear();
                    if let Event::End(_) = reader.read_event_into(buf)? {
                        break;
                    }
                }
                return Ok(child);
            },
            Event::Empty(e) => {
                let tag = tag_name(&e.name());
                let child = parse_node_body(reader, buf, arena, &tag, &e, true)?;
                loop {
                    buf.clear();
                    if let Event::End(_) = reader.read_event_into(buf)? {
                        break;
                    }
                }
                return Ok(child);
            },
            Event::End(_) => return Err(E57Error::BadXml("prototype/codecs wrapper has no child".to_string())),
            Event::Eof => return Err(E57Error::BadXml("unexpected eof in wrapper element".to_string())),
            _ => {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trips_structure_with_scalars() {
        let mut arena = Arena::new();
        let root = arena.root();
        let int_node = arena.new_integer(7, 0, 10).unwrap();
        arena.adopt(root, "count".to_string(), int_node).unwrap();
        let str_node = arena.new_string("hello");
        arena.adopt(root, "label".to_string(), str_node).unwrap();

        let mut out = Vec::new();
        to_writer(&arena, root, &mut out).unwrap();

        let (arena2, root2) = from_reader(Cursor::new(out)).unwrap();
        let found = arena2.get(root2, "/count").unwrap();
        match arena2.data(found) {
            NodeData::Integer(i) => assert_eq!(i.value, 7),
            _ => panic!("expected integer"),
        }
        let found = arena2.get(root2, "/label").unwrap();
        match arena2.data(found) {
            NodeData::String(s) => assert_eq!(s.value, "hello"),
            _ => panic!("expected string"),
        }
    }

    #[test]
    fn round_trips_compressed_vector_shape() {
        let mut arena = Arena::new();
        let root = arena.root();
        let proto = arena.new_structure();
        let field = arena.new_integer(0, 0, 255).unwrap();
        arena.adopt(proto, "intensity".to_string(), field).unwrap();
        let codecs = arena.new_vector(true);
        let cv = arena.new_compressed_vector(proto, codecs).unwrap();
        arena.adopt(root, "points".to_string(), cv).unwrap();

        let mut out = Vec::new();
        to_writer(&arena, root, &mut out).unwrap();
        let (arena2, root2) = from_reader(Cursor::new(out)).unwrap();
        let found = arena2.get(root2, "/points").unwrap();
        assert!(matches!(arena2.data(found), NodeData::CompressedVector(_)));
        let leaves = match arena2.data(found) {
            NodeData::CompressedVector(c) => arena2.prototype_leaves(c.prototype),
            _ => unreachable!(),
        };
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].0, "intensity");
    }
}
