//! Serialization codec for page data
//!
//! Loader data is a value graph: scalars plus container nodes that may be shared
//! or cyclic. Containers live in an arena (`ValueGraph`) and are referenced by
//! index, so a graph can point back at itself without reference counting.
//!
//! # Wire format
//!
//! The wire string is a JSON array of nodes and node 0 is the root. Primitive
//! nodes are stored as raw JSON, plain arrays as arrays of node indices, plain
//! objects as objects of node indices. Other kinds are tagged arrays:
//!
//! | kind              | node                                   |
//! |-------------------|----------------------------------------|
//! | Date              | `["Date", iso8601]`                    |
//! | Set               | `["Set", i, ...]`                      |
//! | Map               | `["Map", k, v, ...]`                   |
//! | RegExp            | `["RegExp", source, flags]`            |
//! | boxed primitive   | `["Object", primitive]`                |
//! | big integer       | `["BigInt", digits]`                   |
//! | null-proto object | `["null", key, i, ...]`                |
//!
//! `undefined`, `NaN`, `+Infinity`, `-Infinity` and `-0` never occupy a slot;
//! they are the reserved indices below. `-2` marks an array hole.

use crate::error::NavigationError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map as JsonMap, Number as JsonNumber, Value as JsonValue};
use std::collections::{HashMap, HashSet};

/// Index of a container node inside a [`ValueGraph`]
pub type NodeId = usize;

pub const UNDEFINED: i64 = -1;
pub const HOLE: i64 = -2;
pub const NAN: i64 = -3;
pub const POSITIVE_INFINITY: i64 = -4;
pub const NEGATIVE_INFINITY: i64 = -5;
pub const NEGATIVE_ZERO: i64 = -6;

/// Largest integer a JS number represents exactly
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Deepest container nesting `decode` accepts
pub const MAX_DEPTH: usize = 256;

/// A value inside a graph
///
/// `Node` compares by index, use [`ValueGraph`] equality for structure.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    BigInt(i128),
    Date(DateTime<Utc>),
    RegExp { source: String, flags: String },
    Node(NodeId),
}

impl Value {
    /// Convenience for string values
    pub fn string(value: impl Into<String>) -> Self {
        Self::String(value.into())
    }

    /// Numeric payload, if any
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// String payload, if any
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Boolean payload, if any
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// A container node
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Array, `None` entries are holes
    Array(Vec<Option<Value>>),
    /// Plain object, in insertion order
    Object(Vec<(String, Value)>),
    /// Object without a prototype
    NullProto(Vec<(String, Value)>),
    Set(Vec<Value>),
    Map(Vec<(Value, Value)>),
    /// Boxed primitive (`new String("x")`)
    Boxed(Value),
}

/// An arena of nodes plus the root value
#[derive(Debug, Clone)]
pub struct ValueGraph {
    nodes: Vec<Node>,
    root: Value,
}

/// Data produced by a load function
pub type PageData = ValueGraph;

impl ValueGraph {
    /// Graph holding a single scalar (or nothing yet)
    pub fn new(root: Value) -> Self {
        Self {
            nodes: Vec::new(),
            root,
        }
    }

    /// Graph whose root is an empty object
    pub fn object() -> Self {
        let mut graph = Self::new(Value::Undefined);
        let root = graph.alloc(Node::Object(Vec::new()));
        graph.root = Value::Node(root);
        graph
    }

    /// Build from plain JSON
    pub fn from_json(json: JsonValue) -> Self {
        let mut graph = Self::new(Value::Undefined);
        graph.root = graph.import_json(json);
        graph
    }

    /// The root value
    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Replace the root value
    pub fn set_root(&mut self, root: Value) {
        self.root = root;
    }

    /// Add a node to the arena
    pub fn alloc(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Look up a node
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Look up a node mutably
    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    /// Set `key` on an object node, replacing an existing entry in place
    pub fn insert(&mut self, object: NodeId, key: impl Into<String>, value: Value) {
        let key = key.into();
        if let Some(Node::Object(entries) | Node::NullProto(entries)) = self.nodes.get_mut(object)
        {
            match entries.iter_mut().find(|(k, _)| *k == key) {
                Some(entry) => entry.1 = value,
                None => entries.push((key, value)),
            }
        }
    }

    /// Append to an array or set node
    pub fn push(&mut self, container: NodeId, value: Value) {
        match self.nodes.get_mut(container) {
            Some(Node::Array(items)) => items.push(Some(value)),
            Some(Node::Set(items)) => items.push(value),
            _ => {}
        }
    }

    /// Entries of an object value
    pub fn entries(&self, value: &Value) -> Option<&[(String, Value)]> {
        match value {
            Value::Node(id) => match self.nodes.get(*id)? {
                Node::Object(entries) | Node::NullProto(entries) => Some(entries.as_slice()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Field of an object value
    pub fn field(&self, value: &Value, key: &str) -> Option<&Value> {
        self.entries(value)?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Field of the root object
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.field(&self.root, key)
    }

    /// Items of an array value (holes included)
    pub fn items(&self, value: &Value) -> Option<&[Option<Value>]> {
        match value {
            Value::Node(id) => match self.nodes.get(*id)? {
                Node::Array(items) => Some(items.as_slice()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Number of root object entries (0 when the root is not an object)
    pub fn len(&self) -> usize {
        self.entries(&self.root).map_or(0, <[_]>::len)
    }

    /// Whether the root object has no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy everything reachable from `value` in `other` into this graph
    pub fn import(&mut self, other: &ValueGraph, value: &Value) -> Value {
        let mut remap = HashMap::new();
        self.import_value(other, value, &mut remap)
    }

    /// A standalone graph of everything reachable from `value`
    pub fn extract(&self, value: &Value) -> ValueGraph {
        let mut graph = ValueGraph::new(Value::Undefined);
        graph.root = graph.import(self, value);
        graph
    }

    /// Shallow-merge the root objects of several graphs, later keys winning
    pub fn merge<'a>(graphs: impl IntoIterator<Item = &'a ValueGraph>) -> ValueGraph {
        let mut merged = ValueGraph::object();
        let Value::Node(root) = merged.root else {
            return merged;
        };

        for graph in graphs {
            let Some(entries) = graph.entries(&graph.root) else {
                continue;
            };
            let mut remap = HashMap::new();
            for (key, value) in entries {
                let value = merged.import_value(graph, value, &mut remap);
                merged.insert(root, key.clone(), value);
            }
        }

        merged
    }

    /// Convert to plain JSON
    ///
    /// Lossy the way `JSON.stringify` is: `undefined` object fields are dropped,
    /// non-finite numbers become `null`. Cycles are an error.
    pub fn to_json(&self) -> Result<JsonValue, NavigationError> {
        let mut visiting = HashSet::new();
        self.export_json(&self.root, &mut visiting)
    }

    fn import_value(
        &mut self,
        other: &ValueGraph,
        value: &Value,
        remap: &mut HashMap<NodeId, NodeId>,
    ) -> Value {
        let Value::Node(id) = value else {
            return value.clone();
        };
        if let Some(mapped) = remap.get(id) {
            return Value::Node(*mapped);
        }
        let Some(node) = other.nodes.get(*id) else {
            return Value::Undefined;
        };

        let new_id = self.alloc(Node::Array(Vec::new()));
        remap.insert(*id, new_id);

        let copied = match node {
            Node::Array(items) => Node::Array(
                items
                    .iter()
                    .map(|item| item.as_ref().map(|v| self.import_value(other, v, remap)))
                    .collect(),
            ),
            Node::Object(entries) => Node::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), self.import_value(other, v, remap)))
                    .collect(),
            ),
            Node::NullProto(entries) => Node::NullProto(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), self.import_value(other, v, remap)))
                    .collect(),
            ),
            Node::Set(items) => Node::Set(
                items
                    .iter()
                    .map(|v| self.import_value(other, v, remap))
                    .collect(),
            ),
            Node::Map(entries) => Node::Map(
                entries
                    .iter()
                    .map(|(k, v)| {
                        let k = self.import_value(other, k, remap);
                        let v = self.import_value(other, v, remap);
                        (k, v)
                    })
                    .collect(),
            ),
            Node::Boxed(inner) => Node::Boxed(inner.clone()),
        };
        self.nodes[new_id] = copied;

        Value::Node(new_id)
    }

    fn import_json(&mut self, json: JsonValue) -> Value {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            JsonValue::String(s) => Value::String(s),
            JsonValue::Array(items) => {
                let items = items
                    .into_iter()
                    .map(|item| Some(self.import_json(item)))
                    .collect();
                Value::Node(self.alloc(Node::Array(items)))
            }
            JsonValue::Object(entries) => {
                let entries = entries
                    .into_iter()
                    .map(|(k, v)| (k, self.import_json(v)))
                    .collect();
                Value::Node(self.alloc(Node::Object(entries)))
            }
        }
    }

    fn export_json(
        &self,
        value: &Value,
        visiting: &mut HashSet<NodeId>,
    ) -> Result<JsonValue, NavigationError> {
        Ok(match value {
            Value::Undefined | Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Number(n) => number_to_json(*n).unwrap_or(JsonValue::Null),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::BigInt(n) => JsonValue::String(n.to_string()),
            Value::Date(date) => JsonValue::String(to_iso_string(date)),
            Value::RegExp { .. } => JsonValue::Object(JsonMap::new()),
            Value::Node(id) => {
                if !visiting.insert(*id) {
                    return Err(NavigationError::serialization(
                        "cannot convert a cyclic structure to JSON",
                    ));
                }
                let node = self
                    .nodes
                    .get(*id)
                    .ok_or_else(|| NavigationError::serialization("dangling node reference"))?;
                let json = match node {
                    Node::Array(items) => JsonValue::Array(
                        items
                            .iter()
                            .map(|item| match item {
                                Some(v) => self.export_json(v, visiting),
                                None => Ok(JsonValue::Null),
                            })
                            .collect::<Result<_, _>>()?,
                    ),
                    Node::Object(entries) | Node::NullProto(entries) => {
                        let mut map = JsonMap::new();
                        for (k, v) in entries {
                            if *v != Value::Undefined {
                                map.insert(k.clone(), self.export_json(v, visiting)?);
                            }
                        }
                        JsonValue::Object(map)
                    }
                    Node::Set(items) => JsonValue::Array(
                        items
                            .iter()
                            .map(|v| self.export_json(v, visiting))
                            .collect::<Result<_, _>>()?,
                    ),
                    Node::Map(entries) => JsonValue::Array(
                        entries
                            .iter()
                            .map(|(k, v)| {
                                Ok(JsonValue::Array(vec![
                                    self.export_json(k, visiting)?,
                                    self.export_json(v, visiting)?,
                                ]))
                            })
                            .collect::<Result<_, NavigationError>>()?,
                    ),
                    Node::Boxed(inner) => self.export_json(inner, visiting)?,
                };
                visiting.remove(id);
                json
            }
        })
    }

    fn values_equal(
        &self,
        a: &Value,
        other: &ValueGraph,
        b: &Value,
        pairs: &mut Pairing,
    ) -> bool {
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => same_number(*x, *y),
            (Value::Node(x), Value::Node(y)) => {
                match (pairs.forward.get(x), pairs.backward.get(y)) {
                    (Some(mapped), _) => return mapped == y,
                    (None, Some(_)) => return false,
                    (None, None) => {}
                }
                pairs.forward.insert(*x, *y);
                pairs.backward.insert(*y, *x);

                match (self.nodes.get(*x), other.nodes.get(*y)) {
                    (Some(left), Some(right)) => self.nodes_equal(left, other, right, pairs),
                    _ => false,
                }
            }
            (Value::Node(_), _) | (_, Value::Node(_)) => false,
            _ => a == b,
        }
    }

    fn nodes_equal(&self, a: &Node, other: &ValueGraph, b: &Node, pairs: &mut Pairing) -> bool {
        match (a, b) {
            (Node::Array(x), Node::Array(y)) => {
                x.len() == y.len()
                    && x.iter().zip(y).all(|pair| match pair {
                        (Some(l), Some(r)) => self.values_equal(l, other, r, pairs),
                        (None, None) => true,
                        _ => false,
                    })
            }
            (Node::Object(x), Node::Object(y)) | (Node::NullProto(x), Node::NullProto(y)) => {
                x.len() == y.len()
                    && x.iter().all(|(key, l)| {
                        y.iter()
                            .find(|(k, _)| k == key)
                            .is_some_and(|(_, r)| self.values_equal(l, other, r, pairs))
                    })
            }
            (Node::Set(x), Node::Set(y)) => {
                x.len() == y.len()
                    && x.iter()
                        .zip(y)
                        .all(|(l, r)| self.values_equal(l, other, r, pairs))
            }
            (Node::Map(x), Node::Map(y)) => {
                x.len() == y.len()
                    && x.iter().zip(y).all(|((lk, lv), (rk, rv))| {
                        self.values_equal(lk, other, rk, pairs)
                            && self.values_equal(lv, other, rv, pairs)
                    })
            }
            (Node::Boxed(x), Node::Boxed(y)) => self.values_equal(x, other, y, pairs),
            _ => false,
        }
    }
}

#[derive(Default)]
struct Pairing {
    forward: HashMap<NodeId, NodeId>,
    backward: HashMap<NodeId, NodeId>,
}

/// Structural equality: same shape, same sharing, same cycles
impl PartialEq for ValueGraph {
    fn eq(&self, other: &Self) -> bool {
        self.values_equal(&self.root, other, &other.root, &mut Pairing::default())
    }
}

impl Default for ValueGraph {
    fn default() -> Self {
        Self::new(Value::Undefined)
    }
}

fn same_number(x: f64, y: f64) -> bool {
    (x.is_nan() && y.is_nan()) || (x == y && x.is_sign_negative() == y.is_sign_negative())
}

fn number_to_json(n: f64) -> Option<JsonValue> {
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        return Some(JsonValue::Number(JsonNumber::from(n as i64)));
    }
    JsonNumber::from_f64(n).map(JsonValue::Number)
}

fn to_iso_string(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode a graph into the wire format
pub fn encode(graph: &ValueGraph) -> String {
    let mut encoder = Encoder {
        graph,
        wire: Vec::new(),
        nodes: HashMap::new(),
        primitives: HashMap::new(),
        pending: Vec::new(),
    };

    let root = encoder.flatten(&graph.root);
    if root < 0 {
        return root.to_string();
    }

    // Containers are written after their slot is reserved, so deep nesting
    // grows the worklist and not the stack
    while let Some((id, index)) = encoder.pending.pop() {
        let json = encoder.node_json(id);
        encoder.wire[index as usize] = json;
    }

    JsonValue::Array(encoder.wire).to_string()
}

struct Encoder<'a> {
    graph: &'a ValueGraph,
    wire: Vec<JsonValue>,
    nodes: HashMap<NodeId, i64>,
    primitives: HashMap<String, i64>,
    /// Containers whose slot is reserved but not yet written
    pending: Vec<(NodeId, i64)>,
}

impl Encoder<'_> {
    fn slot(&mut self, json: JsonValue) -> i64 {
        self.wire.push(json);
        (self.wire.len() - 1) as i64
    }

    fn primitive(&mut self, json: JsonValue) -> i64 {
        let key = json.to_string();
        if let Some(index) = self.primitives.get(&key) {
            return *index;
        }
        let index = self.slot(json);
        self.primitives.insert(key, index);
        index
    }

    fn flatten(&mut self, value: &Value) -> i64 {
        match value {
            Value::Undefined => UNDEFINED,
            Value::Number(n) if n.is_nan() => NAN,
            Value::Number(n) if *n == f64::INFINITY => POSITIVE_INFINITY,
            Value::Number(n) if *n == f64::NEG_INFINITY => NEGATIVE_INFINITY,
            Value::Number(n) if *n == 0.0 && n.is_sign_negative() => NEGATIVE_ZERO,
            Value::Number(n) => {
                let json = number_to_json(*n).unwrap_or(JsonValue::Null);
                self.primitive(json)
            }
            Value::Null => self.primitive(JsonValue::Null),
            Value::Bool(b) => self.primitive(JsonValue::Bool(*b)),
            Value::String(s) => self.primitive(JsonValue::String(s.clone())),
            Value::BigInt(n) => self.slot(serde_json::json!(["BigInt", n.to_string()])),
            Value::Date(date) => self.slot(serde_json::json!(["Date", to_iso_string(date)])),
            Value::RegExp { source, flags } => {
                self.slot(serde_json::json!(["RegExp", source, flags]))
            }
            Value::Node(id) => self.flatten_node(*id),
        }
    }

    fn flatten_node(&mut self, id: NodeId) -> i64 {
        if let Some(index) = self.nodes.get(&id) {
            return *index;
        }
        if id >= self.graph.nodes.len() {
            return UNDEFINED;
        }

        // Reserve the slot first so cycles resolve to it
        let index = self.slot(JsonValue::Null);
        self.nodes.insert(id, index);
        self.pending.push((id, index));
        index
    }

    fn node_json(&mut self, id: NodeId) -> JsonValue {
        let graph = self.graph;
        let Some(node) = graph.nodes.get(id) else {
            return JsonValue::Null;
        };

        match node {
            Node::Array(items) => JsonValue::Array(
                items
                    .iter()
                    .map(|item| item.as_ref().map_or(HOLE, |v| self.flatten(v)).into())
                    .collect(),
            ),
            Node::Object(entries) => {
                let mut map = JsonMap::new();
                for (key, value) in entries {
                    map.insert(key.clone(), self.flatten(value).into());
                }
                JsonValue::Object(map)
            }
            Node::NullProto(entries) => {
                let mut tagged = vec![JsonValue::from("null")];
                for (key, value) in entries {
                    tagged.push(JsonValue::from(key.as_str()));
                    tagged.push(self.flatten(value).into());
                }
                JsonValue::Array(tagged)
            }
            Node::Set(items) => {
                let mut tagged = vec![JsonValue::from("Set")];
                tagged.extend(items.iter().map(|v| JsonValue::from(self.flatten(v))));
                JsonValue::Array(tagged)
            }
            Node::Map(entries) => {
                let mut tagged = vec![JsonValue::from("Map")];
                for (key, value) in entries {
                    tagged.push(self.flatten(key).into());
                    tagged.push(self.flatten(value).into());
                }
                JsonValue::Array(tagged)
            }
            Node::Boxed(inner) => {
                let primitive = match inner {
                    Value::String(s) => JsonValue::String(s.clone()),
                    Value::Bool(b) => JsonValue::Bool(*b),
                    Value::Number(n) => number_to_json(*n).unwrap_or(JsonValue::Null),
                    _ => JsonValue::Null,
                };
                JsonValue::Array(vec![JsonValue::from("Object"), primitive])
            }
        }
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode a wire string into a graph
pub fn decode(wire: &str) -> Result<ValueGraph, NavigationError> {
    let parsed: JsonValue = serde_json::from_str(wire)?;

    let nodes = match parsed {
        JsonValue::Number(n) => {
            let index = n
                .as_i64()
                .ok_or_else(|| NavigationError::serialization("root index is not an integer"))?;
            let root = special(index)
                .ok_or_else(|| NavigationError::serialization("bare root must be a reserved value"))?;
            return Ok(ValueGraph::new(root));
        }
        JsonValue::Array(nodes) if !nodes.is_empty() => nodes,
        _ => return Err(NavigationError::serialization("expected a non-empty node array")),
    };

    let mut decoder = Decoder {
        hydrated: vec![None; nodes.len()],
        wire: nodes,
        graph: ValueGraph::new(Value::Undefined),
        depth: 0,
    };
    let root = decoder.hydrate(0)?;
    decoder.graph.root = root;

    Ok(decoder.graph)
}

fn special(index: i64) -> Option<Value> {
    match index {
        UNDEFINED => Some(Value::Undefined),
        NAN => Some(Value::Number(f64::NAN)),
        POSITIVE_INFINITY => Some(Value::Number(f64::INFINITY)),
        NEGATIVE_INFINITY => Some(Value::Number(f64::NEG_INFINITY)),
        NEGATIVE_ZERO => Some(Value::Number(-0.0)),
        _ => None,
    }
}

struct Decoder {
    wire: Vec<JsonValue>,
    hydrated: Vec<Option<Value>>,
    graph: ValueGraph,
    /// Containers currently being hydrated
    depth: usize,
}

impl Decoder {
    fn index(json: &JsonValue) -> Result<i64, NavigationError> {
        json.as_i64()
            .ok_or_else(|| NavigationError::serialization(format!("invalid node index {}", json)))
    }

    fn hydrate_json(&mut self, json: &JsonValue) -> Result<Value, NavigationError> {
        self.hydrate(Self::index(json)?)
    }

    fn hydrate(&mut self, index: i64) -> Result<Value, NavigationError> {
        if index < 0 {
            return special(index).ok_or_else(|| {
                NavigationError::serialization(format!("unexpected reserved index {}", index))
            });
        }
        let slot = index as usize;
        if slot >= self.wire.len() {
            return Err(NavigationError::serialization(format!(
                "node index {} out of range",
                index
            )));
        }
        if let Some(value) = &self.hydrated[slot] {
            return Ok(value.clone());
        }
        if self.depth >= MAX_DEPTH {
            return Err(NavigationError::serialization(format!(
                "nodes nested deeper than {} levels",
                MAX_DEPTH
            )));
        }

        self.depth += 1;
        let value = self.hydrate_slot(slot);
        self.depth -= 1;
        let value = value?;

        self.hydrated[slot] = Some(value.clone());
        Ok(value)
    }

    fn hydrate_slot(&mut self, slot: usize) -> Result<Value, NavigationError> {
        let node = self.wire[slot].clone();
        Ok(match node {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            JsonValue::String(s) => Value::String(s),
            JsonValue::Array(items) => match items.first() {
                Some(JsonValue::String(tag)) => {
                    let tag = tag.clone();
                    self.hydrate_tagged(slot, &tag, &items[1..])?
                }
                _ => {
                    let id = self.register(slot, Node::Array(Vec::new()));
                    let mut array = Vec::with_capacity(items.len());
                    for item in &items {
                        let index = Self::index(item)?;
                        array.push(if index == HOLE {
                            None
                        } else {
                            Some(self.hydrate(index)?)
                        });
                    }
                    self.graph.nodes[id] = Node::Array(array);
                    Value::Node(id)
                }
            },
            JsonValue::Object(entries) => {
                let id = self.register(slot, Node::Object(Vec::new()));
                let mut object = Vec::with_capacity(entries.len());
                for (key, item) in &entries {
                    object.push((key.clone(), self.hydrate_json(item)?));
                }
                self.graph.nodes[id] = Node::Object(object);
                Value::Node(id)
            }
        })
    }

    /// Allocate a container and record it before its children are visited
    fn register(&mut self, slot: usize, placeholder: Node) -> NodeId {
        let id = self.graph.alloc(placeholder);
        self.hydrated[slot] = Some(Value::Node(id));
        id
    }

    fn hydrate_tagged(
        &mut self,
        slot: usize,
        tag: &str,
        args: &[JsonValue],
    ) -> Result<Value, NavigationError> {
        let string_arg = |position: usize| -> Result<String, NavigationError> {
            args.get(position)
                .and_then(JsonValue::as_str)
                .map(str::to_string)
                .ok_or_else(|| NavigationError::serialization(format!("malformed {} node", tag)))
        };

        Ok(match tag {
            "Date" => {
                let text = string_arg(0)?;
                let date = DateTime::parse_from_rfc3339(&text)
                    .map_err(|e| NavigationError::serialization(format!("bad date {}: {}", text, e)))?;
                Value::Date(date.with_timezone(&Utc))
            }
            "RegExp" => Value::RegExp {
                source: string_arg(0)?,
                flags: args
                    .get(1)
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            "BigInt" => {
                let digits = string_arg(0)?;
                let n = digits.parse::<i128>().map_err(|e| {
                    NavigationError::serialization(format!("bad bigint {}: {}", digits, e))
                })?;
                Value::BigInt(n)
            }
            "Object" => {
                let inner = match args.first() {
                    Some(JsonValue::String(s)) => Value::String(s.clone()),
                    Some(JsonValue::Bool(b)) => Value::Bool(*b),
                    Some(JsonValue::Number(n)) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
                    _ => return Err(NavigationError::serialization("malformed Object node")),
                };
                let id = self.register(slot, Node::Boxed(inner));
                Value::Node(id)
            }
            "Set" => {
                let id = self.register(slot, Node::Set(Vec::new()));
                let mut items = Vec::with_capacity(args.len());
                for arg in args {
                    items.push(self.hydrate_json(arg)?);
                }
                self.graph.nodes[id] = Node::Set(items);
                Value::Node(id)
            }
            "Map" => {
                if args.len() % 2 != 0 {
                    return Err(NavigationError::serialization("Map node has a dangling key"));
                }
                let id = self.register(slot, Node::Map(Vec::new()));
                let mut entries = Vec::with_capacity(args.len() / 2);
                for pair in args.chunks(2) {
                    let key = self.hydrate_json(&pair[0])?;
                    let value = self.hydrate_json(&pair[1])?;
                    entries.push((key, value));
                }
                self.graph.nodes[id] = Node::Map(entries);
                Value::Node(id)
            }
            "null" => {
                if args.len() % 2 != 0 {
                    return Err(NavigationError::serialization("null node has a dangling key"));
                }
                let id = self.register(slot, Node::NullProto(Vec::new()));
                let mut entries = Vec::with_capacity(args.len() / 2);
                for pair in args.chunks(2) {
                    let key = pair[0]
                        .as_str()
                        .ok_or_else(|| NavigationError::serialization("null node key is not a string"))?
                        .to_string();
                    entries.push((key, self.hydrate_json(&pair[1])?));
                }
                self.graph.nodes[id] = Node::NullProto(entries);
                Value::Node(id)
            }
            other => {
                return Err(NavigationError::serialization(format!(
                    "unknown node type {:?}",
                    other
                )))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn round_trip(graph: &ValueGraph) -> ValueGraph {
        decode(&encode(graph)).unwrap()
    }

    #[test]
    fn test_undefined_field_survives() {
        let mut graph = ValueGraph::object();
        let Value::Node(root) = *graph.root() else {
            unreachable!()
        };
        let list = graph.alloc(Node::Array(vec![Some(1.0.into()), Some(2.0.into())]));
        graph.insert(root, "a", Value::Node(list));
        graph.insert(root, "b", Value::Undefined);

        let wire = encode(&graph);
        assert_eq!(wire, r#"[{"a":1,"b":-1},[2,3],1,2]"#);

        let decoded = decode(&wire).unwrap();
        assert_eq!(decoded, graph);
        assert_eq!(decoded.get("b"), Some(&Value::Undefined));
    }

    #[test]
    fn test_special_numbers_use_reserved_indices() {
        let mut graph = ValueGraph::new(Value::Undefined);
        let list = graph.alloc(Node::Array(vec![
            Some(Value::Number(f64::NAN)),
            Some(Value::Number(f64::INFINITY)),
            Some(Value::Number(f64::NEG_INFINITY)),
            Some(Value::Number(-0.0)),
            None,
        ]));
        graph.set_root(Value::Node(list));

        let wire = encode(&graph);
        assert_eq!(wire, "[[-3,-4,-5,-6,-2]]");
        assert_eq!(round_trip(&graph), graph);
    }

    #[test]
    fn test_negative_zero_is_not_zero() {
        let negative = ValueGraph::new(Value::Number(-0.0));
        let positive = ValueGraph::new(Value::Number(0.0));
        assert_ne!(negative, positive);
        assert_eq!(encode(&negative), "-6");
        assert_eq!(round_trip(&negative), negative);
    }

    #[test]
    fn test_bare_undefined_root() {
        let graph = ValueGraph::new(Value::Undefined);
        assert_eq!(encode(&graph), "-1");
        assert_eq!(decode("-1").unwrap(), graph);
    }

    #[test]
    fn test_self_referential_object() {
        let mut graph = ValueGraph::object();
        let Value::Node(root) = *graph.root() else {
            unreachable!()
        };
        graph.insert(root, "name", "loop".into());
        graph.insert(root, "self", Value::Node(root));

        let decoded = round_trip(&graph);
        assert_eq!(decoded, graph);

        let decoded_self = decoded.get("self").unwrap();
        assert_eq!(decoded_self, decoded.root());
    }

    #[test]
    fn test_shared_structure_stays_shared() {
        let mut graph = ValueGraph::new(Value::Undefined);
        let shared = graph.alloc(Node::Object(vec![("x".to_string(), 1.0.into())]));
        let list = graph.alloc(Node::Array(vec![
            Some(Value::Node(shared)),
            Some(Value::Node(shared)),
        ]));
        graph.set_root(Value::Node(list));

        let decoded = round_trip(&graph);
        let items = decoded.items(decoded.root()).unwrap();
        assert_eq!(items[0], items[1]);

        // Two distinct but equal objects are not the same graph
        let mut copied = ValueGraph::new(Value::Undefined);
        let a = copied.alloc(Node::Object(vec![("x".to_string(), 1.0.into())]));
        let b = copied.alloc(Node::Object(vec![("x".to_string(), 1.0.into())]));
        let list = copied.alloc(Node::Array(vec![Some(Value::Node(a)), Some(Value::Node(b))]));
        copied.set_root(Value::Node(list));
        assert_ne!(decoded, copied);
    }

    #[test]
    fn test_rich_kinds_round_trip() {
        let mut graph = ValueGraph::new(Value::Undefined);
        let date = Utc.with_ymd_and_hms(2022, 10, 3, 12, 30, 0).unwrap();
        let set = graph.alloc(Node::Set(vec!["a".into(), "b".into()]));
        let boxed = graph.alloc(Node::Boxed("boxed".into()));
        let bare = graph.alloc(Node::NullProto(vec![("k".to_string(), true.into())]));
        let map = graph.alloc(Node::Map(vec![
            ("when".into(), Value::Date(date)),
            (Value::Node(set), Value::BigInt(12_345_678_901_234_567_890)),
        ]));
        let root = graph.alloc(Node::Array(vec![
            Some(Value::Node(map)),
            Some(Value::Node(boxed)),
            Some(Value::Node(bare)),
            Some(Value::RegExp {
                source: "^a+$".to_string(),
                flags: "gi".to_string(),
            }),
        ]));
        graph.set_root(Value::Node(root));

        assert_eq!(round_trip(&graph), graph);
    }

    #[test]
    fn test_date_wire_format() {
        let date = Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap();
        let graph = ValueGraph::new(Value::Date(date));
        assert_eq!(encode(&graph), r#"[["Date","2020-01-02T03:04:05.000Z"]]"#);
    }

    #[test]
    fn test_decode_rejects_malformed_payloads() {
        for wire in [
            "not json",
            "[]",
            "{}",
            "[[5]]",
            r#"[["Bogus", 1]]"#,
            r#"[["Map", 1]]"#,
            r#"[{"a": "x"}]"#,
            r#"[["Date", "yesterday"]]"#,
            "7",
        ] {
            let error = decode(wire).unwrap_err();
            assert!(
                matches!(error, NavigationError::Serialization { .. }),
                "{} should fail",
                wire
            );
        }
    }

    /// `[[1],[2],...,[depth-1],0]`: a chain of `depth` nodes, each array holding the next
    fn nested_wire(depth: usize) -> String {
        let mut nodes: Vec<String> = (1..depth).map(|next| format!("[{}]", next)).collect();
        nodes.push("0".to_string());
        format!("[{}]", nodes.join(","))
    }

    #[test]
    fn test_decode_rejects_deep_nesting() {
        let error = decode(&nested_wire(200_000)).unwrap_err();
        assert!(matches!(error, NavigationError::Serialization { .. }));

        assert!(decode(&nested_wire(MAX_DEPTH + 1)).is_err());
        assert!(decode(&nested_wire(MAX_DEPTH)).is_ok());
    }

    #[test]
    fn test_encode_deep_graph() {
        let mut graph = ValueGraph::new(Value::Undefined);
        let mut child: Option<Value> = None;
        for _ in 0..100_000 {
            let items = child.take().into_iter().map(Some).collect();
            child = Some(Value::Node(graph.alloc(Node::Array(items))));
        }
        graph.set_root(child.unwrap());

        let wire = encode(&graph);
        assert!(wire.starts_with("[[1],[2],[3],"));
        assert!(wire.ends_with(",[99999],[]]"));
        assert!(matches!(
            decode(&wire),
            Err(NavigationError::Serialization { .. })
        ));
    }

    #[test]
    fn test_json_conversion() {
        let graph = ValueGraph::from_json(json!({"title": "Intro", "tags": ["a", "b"], "n": 3}));
        assert_eq!(graph.get("title"), Some(&Value::string("Intro")));
        assert_eq!(
            graph.to_json().unwrap(),
            json!({"title": "Intro", "tags": ["a", "b"], "n": 3})
        );
        assert_eq!(round_trip(&graph), graph);
    }

    #[test]
    fn test_to_json_rejects_cycles() {
        let mut graph = ValueGraph::object();
        let Value::Node(root) = *graph.root() else {
            unreachable!()
        };
        graph.insert(root, "me", Value::Node(root));
        assert!(graph.to_json().is_err());
    }

    #[test]
    fn test_merge_later_keys_win() {
        let layout = ValueGraph::from_json(json!({"user": "ann", "theme": "dark"}));
        let page = ValueGraph::from_json(json!({"theme": "light", "post": {"id": 1}}));

        let merged = ValueGraph::merge([&layout, &page]);
        assert_eq!(
            merged.to_json().unwrap(),
            json!({"user": "ann", "theme": "light", "post": {"id": 1}})
        );
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn test_extract_subgraph() {
        let graph = ValueGraph::from_json(json!({"data": {"a": [1, 2]}, "other": true}));
        let data = graph.get("data").unwrap().clone();
        let extracted = graph.extract(&data);
        assert_eq!(extracted, ValueGraph::from_json(json!({"a": [1, 2]})));
    }
}
