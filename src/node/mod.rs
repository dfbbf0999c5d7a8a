//! The typed metadata tree: an arena-owned, attach-once forest of [`Node`]s.
//!
//! Nodes never own each other through `Rc`/`Weak`; every link is an index
//! into [`Arena`]'s backing `Vec`. This sidesteps the cycle/double-attach
//! hazards a shared-ownership graph would need runtime checks for: a node
//! can only ever gain a parent once (see [`Arena::adopt`]).

pub mod path;

use std::fmt;

use crate::error::E57Error;
use path::{ParsedPath, PathElement};

/// Index into an [`Arena`]. Stable for the lifetime of the arena.
pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Single,
    Double,
}

#[derive(Debug, Clone, Default)]
pub struct StructureData {
    pub names: Vec<String>,
    pub children: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub struct VectorData {
    pub allow_heterogeneous: bool,
    pub children: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub struct CompressedVectorData {
    pub prototype: NodeId,
    pub codecs: NodeId,
    pub record_count: u64,
    pub binary_section_logical_start: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegerData {
    pub value: i64,
    pub min: i64,
    pub max: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaledIntegerData {
    pub raw: i64,
    pub min: i64,
    pub max: i64,
    pub scale: f64,
    pub offset: f64,
}

impl ScaledIntegerData {
    pub fn scaled_value(&self) -> f64 {
        self.raw as f64 * self.scale + self.offset
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FloatData {
    pub value: f64,
    pub precision: Precision,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StringData {
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobData {
    pub byte_count: u64,
    pub binary_section_logical_start: u64,
    pub binary_section_logical_length: u64,
}

#[derive(Debug, Clone)]
pub enum NodeData {
    Structure(StructureData),
    Vector(VectorData),
    CompressedVector(CompressedVectorData),
    Integer(IntegerData),
    ScaledInteger(ScaledIntegerData),
    Float(FloatData),
    String(StringData),
    Blob(BlobData),
}

impl NodeData {
    pub fn kind_name(&self) -> &'static str {
        match self {
            NodeData::Structure(_) => "structure",
            NodeData::Vector(_) => "vector",
            NodeData::CompressedVector(_) => "compressedVector",
            NodeData::Integer(_) => "integer",
            NodeData::ScaledInteger(_) => "scaledInteger",
            NodeData::Float(_) => "float",
            NodeData::String(_) => "string",
            NodeData::Blob(_) => "blob",
        }
    }
}

struct Slot {
    data: NodeData,
    parent: Option<NodeId>,
    name: String,
    attached: bool,
}

/// Owns every node of one open file. A fresh arena starts with an attached,
/// unnamed root `Structure` at index 0.
pub struct Arena {
    slots: Vec<Slot>,
    root: NodeId,
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena").field("len", &self.slots.len()).finish()
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Arena {
    pub fn new() -> Self {
        let root = Slot {
            data: NodeData::Structure(StructureData::default()),
            parent: None,
            name: String::new(),
            attached: true,
        };
        Arena {
            slots: vec![root],
            root: 0,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn data(&self, id: NodeId) -> &NodeData {
        &self.slots[id].data
    }

    pub fn data_mut(&mut self, id: NodeId) -> &mut NodeData {
        &mut self.slots[id].data
    }

    pub fn is_attached(&self, id: NodeId) -> bool {
        self.slots[id].attached
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.slots[id].parent
    }

    /// Create a detached node holding `data`. Callers wire it into a
    /// container with [`Arena::adopt`] (directly or via [`Arena::set`]).
    fn insert_detached(&mut self, data: NodeData) -> NodeId {
        self.slots.push(Slot {
            data,
            parent: None,
            name: String::new(),
            attached: false,
        });
        self.slots.len() - 1
    }

    pub fn new_structure(&mut self) -> NodeId {
        self.insert_detached(NodeData::Structure(StructureData::default()))
    }

    pub fn new_vector(&mut self, allow_heterogeneous: bool) -> NodeId {
        self.insert_detached(NodeData::Vector(VectorData {
            allow_heterogeneous,
            children: Vec::new(),
        }))
    }

    /// Build a `CompressedVector` node from detached `prototype`/`codecs`
    /// subtrees. Both must not already have a parent.
    pub fn new_compressed_vector(
        &mut self,
        prototype: NodeId,
        codecs: NodeId,
    ) -> Result<NodeId, E57Error> {
        if self.slots[prototype].parent.is_some() || self.slots[codecs].parent.is_some() {
            return Err(E57Error::AlreadySet);
        }
        let id = self.insert_detached(NodeData::CompressedVector(CompressedVectorData {
            prototype,
            codecs,
            record_count: 0,
            binary_section_logical_start: 0,
        }));
        self.slots[prototype].parent = Some(id);
        self.slots[prototype].name = "prototype".to_string();
        self.slots[codecs].parent = Some(id);
        self.slots[codecs].name = "codecs".to_string();
        Ok(id)
    }

    pub fn new_integer(&mut self, value: i64, min: i64, max: i64) -> Result<NodeId, E57Error> {
        if value < min || value > max {
            return Err(E57Error::ValueOutOfBounds(format!(
                "integer {value} outside [{min}, {max}]"
            )));
        }
        Ok(self.insert_detached(NodeData::Integer(IntegerData { value, min, max })))
    }

    pub fn new_scaled_integer(
        &mut self,
        raw: i64,
        min: i64,
        max: i64,
        scale: f64,
        offset: f64,
    ) -> Result<NodeId, E57Error> {
        if raw < min || raw > max {
            return Err(E57Error::ValueOutOfBounds(format!(
                "scaledInteger raw {raw} outside [{min}, {max}]"
            )));
        }
        Ok(self.insert_detached(NodeData::ScaledInteger(ScaledIntegerData {
            raw,
            min,
            max,
            scale,
            offset,
        })))
    }

    /// Construct a `ScaledInteger` from a scaled real value, choosing the
    /// nearest in-range raw integer.
    pub fn new_scaled_integer_from_value(
        &mut self,
        value: f64,
        min: i64,
        max: i64,
        scale: f64,
        offset: f64,
    ) -> Result<NodeId, E57Error> {
        let raw = ((value - offset) / scale).round();
        if !raw.is_finite() || raw < min as f64 || raw > max as f64 {
            return Err(E57Error::ValueOutOfBounds(format!(
                "scaled value {value} outside [{min}, {max}] once unscaled"
            )));
        }
        self.new_scaled_integer(raw as i64, min, max, scale, offset)
    }

    pub fn new_float(&mut self, value: f64, precision: Precision, min: f64, max: f64) -> Result<NodeId, E57Error> {
        if value.is_nan() {
            return Err(E57Error::ValueOutOfBounds("float value is NaN".to_string()));
        }
        if value < min || value > max {
            return Err(E57Error::ValueOutOfBounds(format!(
                "float {value} outside [{min}, {max}]"
            )));
        }
        Ok(self.insert_detached(NodeData::Float(FloatData {
            value,
            precision,
            min,
            max,
        })))
    }

    pub fn new_string(&mut self, value: impl Into<String>) -> NodeId {
        self.insert_detached(NodeData::String(StringData { value: value.into() }))
    }

    pub fn new_blob(&mut self, byte_count: u64) -> NodeId {
        self.insert_detached(NodeData::Blob(BlobData {
            byte_count,
            binary_section_logical_start: 0,
            binary_section_logical_length: 0,
        }))
    }

    /// Look up the direct child of `container` named by `elem`, if any.
    fn child_named(&self, container: NodeId, elem: &PathElement) -> Result<Option<NodeId>, E57Error> {
        match &self.slots[container].data {
            NodeData::Structure(s) => {
                let key = elem.as_key();
                Ok(s.names.iter().position(|n| n == &key).map(|i| s.children[i]))
            },
            NodeData::Vector(v) => match elem {
                PathElement::Index(i) => Ok(v.children.get(*i as usize).copied()),
                PathElement::Name { .. } => Err(E57Error::BadPath(elem.as_key())),
            },
            _ => Err(E57Error::NotContainer(self.path_name(container))),
        }
    }

    /// Attach `child` under `container` as `name`, enforcing the attach-once
    /// and homogeneous-vector invariants. `container` must already be a
    /// Structure or Vector node.
    pub fn adopt(&mut self, container: NodeId, name: String, child: NodeId) -> Result<(), E57Error> {
        if self.slots[child].parent.is_some() {
            return Err(E57Error::AlreadySet);
        }
        match &self.slots[container].data {
            NodeData::Structure(s) => {
                if s.names.contains(&name) {
                    return Err(E57Error::AlreadyDefined(format!(
                        "{}/{name}",
                        self.path_name(container)
                    )));
                }
            },
            NodeData::Vector(v) => {
                if !v.allow_heterogeneous {
                    if let Some(&first) = v.children.first() {
                        if !self.is_type_equivalent(first, child) {
                            return Err(E57Error::TypeMismatch(format!(
                                "{}/{name} is not type-equivalent to element 0",
                                self.path_name(container)
                            )));
                        }
                    }
                }
            },
            _ => return Err(E57Error::NotContainer(self.path_name(container))),
        }

        match &mut self.slots[container].data {
            NodeData::Structure(s) => {
                s.names.push(name.clone());
                s.children.push(child);
            },
            NodeData::Vector(v) => v.children.push(child),
            _ => unreachable!("checked above"),
        }

        self.slots[child].parent = Some(container);
        self.slots[child].name = name;

        if self.slots[container].attached {
            self.set_attached_recursive(child);
        }
        Ok(())
    }

    /// `append(node)`: adopt with an auto-numbered key (`children.len()`).
    pub fn append(&mut self, container: NodeId, child: NodeId) -> Result<(), E57Error> {
        let next_key = match &self.slots[container].data {
            NodeData::Structure(s) => s.children.len().to_string(),
            NodeData::Vector(v) => v.children.len().to_string(),
            _ => return Err(E57Error::NotContainer(self.path_name(container))),
        };
        self.adopt(container, next_key, child)
    }

    /// `get(origin, path)`.
    pub fn get(&self, origin: NodeId, path: &str) -> Result<NodeId, E57Error> {
        let parsed = path::parse(path)?;
        self.resolve(origin, &parsed, path)
    }

    fn resolve(&self, origin: NodeId, parsed: &ParsedPath, original: &str) -> Result<NodeId, E57Error> {
        let mut cur = if parsed.is_absolute { self.root } else { origin };
        for elem in &parsed.elements {
            cur = self
                .child_named(cur, elem)?
                .ok_or_else(|| E57Error::PathUndefined(original.to_string()))?;
        }
        Ok(cur)
    }

    pub fn is_defined(&self, origin: NodeId, path: &str) -> bool {
        self.get(origin, path).is_ok()
    }

    /// `set(origin, path, data, auto_path_create)`. Inserts a freshly
    /// constructed node holding `data` at `path` and returns its id.
    pub fn set(
        &mut self,
        origin: NodeId,
        path: &str,
        data: NodeData,
        auto_path_create: bool,
    ) -> Result<NodeId, E57Error> {
        let parsed = path::parse(path)?;
        let (last, init) = parsed
            .elements
            .split_last()
            .ok_or_else(|| E57Error::BadPath(path.to_string()))?;

        let mut cur = if parsed.is_absolute { self.root } else { origin };
        for elem in init {
            cur = match self.child_named(cur, elem)? {
                Some(id) => id,
                None if auto_path_create => {
                    let new_struct = self.new_structure();
                    self.adopt(cur, elem.as_key(), new_struct)?;
                    new_struct
                },
                None => return Err(E57Error::PathUndefined(path.to_string())),
            };
        }

        if self.child_named(cur, last)?.is_some() {
            return Err(E57Error::AlreadyDefined(path.to_string()));
        }
        let new_id = self.insert_detached(data);
        self.adopt(cur, last.as_key(), new_id)?;
        Ok(new_id)
    }

    /// Mark `id` and its entire subtree attached. Recurses through a
    /// `CompressedVector`'s prototype and codecs too, per §4.1.
    pub fn set_attached_recursive(&mut self, id: NodeId) {
        self.slots[id].attached = true;
        let children: Vec<NodeId> = match &self.slots[id].data {
            NodeData::Structure(s) => s.children.clone(),
            NodeData::Vector(v) => v.children.clone(),
            NodeData::CompressedVector(c) => vec![c.prototype, c.codecs],
            _ => Vec::new(),
        };
        for child in children {
            self.set_attached_recursive(child);
        }
    }

    /// The node's absolute path from the root, `/`-joined.
    pub fn path_name(&self, id: NodeId) -> String {
        let mut segments = Vec::new();
        let mut cur = id;
        while let Some(parent) = self.slots[cur].parent {
            segments.push(self.slots[cur].name.clone());
            cur = parent;
        }
        if segments.is_empty() {
            return "/".to_string();
        }
        segments.reverse();
        format!("/{}", segments.join("/"))
    }

    /// Structural type equivalence: same variant and, for scalars, identical
    /// range/scale/precision parameters; for containers, same child names
    /// and pairwise equivalent children. Values, names and attachment are
    /// not compared.
    pub fn is_type_equivalent(&self, a: NodeId, b: NodeId) -> bool {
        match (&self.slots[a].data, &self.slots[b].data) {
            (NodeData::Integer(x), NodeData::Integer(y)) => x.min == y.min && x.max == y.max,
            (NodeData::ScaledInteger(x), NodeData::ScaledInteger(y)) => {
                x.min == y.min && x.max == y.max && x.scale == y.scale && x.offset == y.offset
            },
            (NodeData::Float(x), NodeData::Float(y)) => {
                x.precision == y.precision && x.min == y.min && x.max == y.max
            },
            (NodeData::String(_), NodeData::String(_)) => true,
            (NodeData::Blob(_), NodeData::Blob(_)) => true,
            (NodeData::Structure(x), NodeData::Structure(y)) => {
                x.names == y.names
                    && x.children
                        .iter()
                        .zip(&y.children)
                        .all(|(&c1, &c2)| self.is_type_equivalent(c1, c2))
            },
            (NodeData::Vector(x), NodeData::Vector(y)) => {
                x.children.len() == y.children.len()
                    && x.children
                        .iter()
                        .zip(&y.children)
                        .all(|(&c1, &c2)| self.is_type_equivalent(c1, c2))
            },
            (NodeData::CompressedVector(x), NodeData::CompressedVector(y)) => {
                self.is_type_equivalent(x.prototype, y.prototype)
                    && self.is_type_equivalent(x.codecs, y.codecs)
            },
            _ => false,
        }
    }

    /// Depth-first scalar leaves of `prototype` in document order, paired
    /// with their path relative to `prototype`. Used to bind a writer's or
    /// reader's bindings onto the record layout (§4.2, §4.4).
    pub fn prototype_leaves(&self, prototype: NodeId) -> Vec<(String, NodeId)> {
        let mut out = Vec::new();
        self.collect_leaves(prototype, "", &mut out);
        out
    }

    fn collect_leaves(&self, id: NodeId, prefix: &str, out: &mut Vec<(String, NodeId)>) {
        match &self.slots[id].data {
            NodeData::Structure(s) => {
                for (name, &child) in s.names.iter().zip(&s.children) {
                    let path = if prefix.is_empty() {
                        name.clone()
                    } else {
                        format!("{prefix}/{name}")
                    };
                    self.collect_leaves(child, &path, out);
                }
            },
            NodeData::Vector(v) => {
                for (i, &child) in v.children.iter().enumerate() {
                    let path = if prefix.is_empty() {
                        i.to_string()
                    } else {
                        format!("{prefix}/{i}")
                    };
                    self.collect_leaves(child, &path, out);
                }
            },
            NodeData::Integer(_) | NodeData::ScaledInteger(_) | NodeData::Float(_) | NodeData::String(_) => {
                out.push((prefix.to_string(), id));
            },
            NodeData::CompressedVector(_) | NodeData::Blob(_) => {
                // Not addressable as a bytestream field; skipped.
            },
        }
    }
}
