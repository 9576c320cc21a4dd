//! Converts producer-side layers into consumer-side node descriptors.
//!
//! ## Responsibility
//! Translate a [`LayerDescriptor`] read from the compositing app into the
//! [`NodeDescriptor`] the node-graph app's HTTP API accepts. The mapping is a
//! pure, total function: unknown layer types fall back to `MediaIn` and
//! unsupported property shapes are dropped rather than reported.
//!
//! ## Mapping
//! | Layer type    | Node type    |
//! |---------------|--------------|
//! | `solid`       | `Background` |
//! | `composition` | `Merge`      |
//! | `text`        | `Text+`      |
//! | `shape`       | `Rectangle`  |
//! | `image`       | `Loader`     |
//! | `video`       | `MediaIn`    |
//! | anything else | `MediaIn`    |
//!
//! | Property value           | Node property                  |
//! |--------------------------|--------------------------------|
//! | number                   | `{type: Number, value}`        |
//! | boolean                  | `{type: Boolean, value}`       |
//! | string                   | `{type: Text, value}`          |
//! | `[number, number]`       | `{type: Point, value: {X, Y}}` |
//! | null / object / other    | dropped                        |

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Number, Value};
use tracing::debug;

/// Node type used when a layer type has no entry in the table.
pub const FALLBACK_NODE_TYPE: &str = "MediaIn";

// ---------------------------------------------------------------------------
// Producer side
// ---------------------------------------------------------------------------

/// Layer kinds reported by the compositing app.
///
/// Deserialization never fails: any unrecognised string, or a non-string
/// value, becomes [`LayerType::Unknown`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "Value", into = "String")]
pub enum LayerType {
    Solid,
    Composition,
    Text,
    Shape,
    Image,
    Video,
    #[default]
    Unknown,
}

impl From<String> for LayerType {
    fn from(s: String) -> Self {
        LayerType::from(s.as_str())
    }
}

impl From<Value> for LayerType {
    fn from(v: Value) -> Self {
        match v {
            Value::String(s) => LayerType::from(s.as_str()),
            _ => LayerType::Unknown,
        }
    }
}

impl From<&str> for LayerType {
    fn from(s: &str) -> Self {
        match s {
            "solid" => LayerType::Solid,
            "composition" => LayerType::Composition,
            "text" => LayerType::Text,
            "shape" => LayerType::Shape,
            "image" => LayerType::Image,
            "video" => LayerType::Video,
            _ => LayerType::Unknown,
        }
    }
}

impl From<LayerType> for String {
    fn from(t: LayerType) -> Self {
        t.as_str().to_string()
    }
}

impl LayerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerType::Solid => "solid",
            LayerType::Composition => "composition",
            LayerType::Text => "text",
            LayerType::Shape => "shape",
            LayerType::Image => "image",
            LayerType::Video => "video",
            LayerType::Unknown => "unknown",
        }
    }

    /// Consumer node type for this layer kind.
    pub fn node_type(&self) -> &'static str {
        match self {
            LayerType::Solid => "Background",
            LayerType::Composition => "Merge",
            LayerType::Text => "Text+",
            LayerType::Shape => "Rectangle",
            LayerType::Image => "Loader",
            LayerType::Video => "MediaIn",
            LayerType::Unknown => FALLBACK_NODE_TYPE,
        }
    }
}

/// One layer as reported by the producer's `get-layers` command.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LayerDescriptor {
    #[serde(default, deserialize_with = "string_or_empty")]
    pub name: String,
    #[serde(rename = "type", default)]
    pub layer_type: LayerType,
    #[serde(default, deserialize_with = "object_or_empty")]
    pub properties: Map<String, Value>,
}

fn string_or_empty<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(de)? {
        Value::String(s) => s,
        _ => String::new(),
    })
}

/// `null`, arrays and scalars in place of the property map read as "no properties".
fn object_or_empty<'de, D: Deserializer<'de>>(de: D) -> Result<Map<String, Value>, D::Error> {
    Ok(match Value::deserialize(de)? {
        Value::Object(map) => map,
        _ => Map::new(),
    })
}

impl LayerDescriptor {
    pub fn new(name: impl Into<String>, layer_type: impl Into<LayerType>) -> Self {
        Self {
            name: name.into(),
            layer_type: layer_type.into(),
            properties: Map::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

// ---------------------------------------------------------------------------
// Consumer side
// ---------------------------------------------------------------------------

/// The property type tags the node-graph API understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeTag {
    Number,
    Boolean,
    Text,
    Point,
}

/// A 2-D point, serialized with the consumer's upper-case axis names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    #[serde(rename = "X")]
    pub x: Number,
    #[serde(rename = "Y")]
    pub y: Number,
}

/// A typed node property, serialized as `{"type": <tag>, "value": <value>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum NodeProperty {
    Number(Number),
    Boolean(bool),
    Text(String),
    Point(Point),
}

impl NodeProperty {
    pub fn type_tag(&self) -> TypeTag {
        match self {
            NodeProperty::Number(_) => TypeTag::Number,
            NodeProperty::Boolean(_) => TypeTag::Boolean,
            NodeProperty::Text(_) => TypeTag::Text,
            NodeProperty::Point(_) => TypeTag::Point,
        }
    }

    /// Coerce one layer property value, or `None` when its shape is unsupported.
    pub fn coerce(value: &Value) -> Option<NodeProperty> {
        match value {
            Value::Number(n) => Some(NodeProperty::Number(n.clone())),
            Value::Bool(b) => Some(NodeProperty::Boolean(*b)),
            Value::String(s) => Some(NodeProperty::Text(s.clone())),
            Value::Array(items) => match items.as_slice() {
                [Value::Number(x), Value::Number(y)] => Some(NodeProperty::Point(Point {
                    x: x.clone(),
                    y: y.clone(),
                })),
                _ => None,
            },
            Value::Null | Value::Object(_) => None,
        }
    }
}

/// A node-graph element ready to POST to the consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDescriptor {
    pub node_type: String,
    pub name: String,
    pub properties: BTreeMap<String, NodeProperty>,
}

// ---------------------------------------------------------------------------
// Translation
// ---------------------------------------------------------------------------

/// Translate a layer into a node. Never fails.
pub fn layer_to_node(layer: &LayerDescriptor) -> NodeDescriptor {
    layer_to_node_report(layer).0
}

/// Like [`layer_to_node`], also returning the property keys that were dropped.
pub fn layer_to_node_report(layer: &LayerDescriptor) -> (NodeDescriptor, Vec<String>) {
    let mut properties = BTreeMap::new();
    let mut dropped = Vec::new();

    for (key, value) in &layer.properties {
        match NodeProperty::coerce(value) {
            Some(prop) => {
                properties.insert(key.clone(), prop);
            }
            None => dropped.push(key.clone()),
        }
    }

    if !dropped.is_empty() {
        debug!(layer = %layer.name, dropped = ?dropped, "dropped unsupported layer properties");
    }

    let node = NodeDescriptor {
        node_type: layer.layer_type.node_type().to_string(),
        name: layer.name.clone(),
        properties,
    };
    (node, dropped)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
