/*!
Diagram document model: components, connections and document metadata.

The engine treats these as opaque data handed over by the editing surface.
It validates their shape but never changes component or connection semantics.
*/

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Current document schema version
pub const SCHEMA_VERSION: u32 = 1;

/// 2D canvas position of a component
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A node of the diagram graph
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Component {
    pub id: String,

    /// Type tag, e.g. `"database"` or `"service"`
    #[serde(rename = "type")]
    pub kind: String,

    pub position: Position,

    /// Free-form properties owned by the editor
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

impl Component {
    pub fn new<S1, S2>(id: S1, kind: S2, x: f64, y: f64) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            id: id.into(),
            kind: kind.into(),
            position: Position { x, y },
            properties: BTreeMap::new(),
        }
    }

    /// Set a free-form property
    pub fn with_property<S: Into<String>>(mut self, name: S, value: Value) -> Self {
        self.properties.insert(name.into(), value);
        self
    }
}

/// A directed edge between two components
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Connection {
    pub id: String,
    pub source: String,
    pub target: String,

    #[serde(rename = "type", default)]
    pub kind: String,
}

impl Connection {
    pub fn new<S1, S2, S3, S4>(id: S1, source: S2, target: S3, kind: S4) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
        S4: Into<String>,
    {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            kind: kind.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    pub last_modified: DateTime<Utc>,
    pub version: u32,
}

impl Default for DocumentMetadata {
    fn default() -> Self {
        Self {
            last_modified: Utc::now(),
            version: SCHEMA_VERSION,
        }
    }
}

/// The unit of persistence: one diagram plus its metadata
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Document {
    /// Document identity; keys the primary record, backups and save tokens
    pub id: String,
    pub components: Vec<Component>,
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub metadata: DocumentMetadata,
}

impl Document {
    /// Create an empty document
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self {
            id: id.into(),
            components: Vec::new(),
            connections: Vec::new(),
            metadata: DocumentMetadata::default(),
        }
    }

    pub fn with_component(mut self, component: Component) -> Self {
        self.components.push(component);
        self
    }

    pub fn with_connection(mut self, connection: Connection) -> Self {
        self.connections.push(connection);
        self
    }

    /// Stamp the document as modified now
    pub fn touch(&mut self) {
        self.metadata.last_modified = Utc::now();
    }

    pub fn component(&self, id: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.id == id)
    }
}
