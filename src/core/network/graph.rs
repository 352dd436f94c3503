use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A process declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    /// Component name; a node without one is registered but can't be wired
    #[serde(default)]
    pub component: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

/// One side of an edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeEnd {
    pub node: String,
    pub port: String,
    #[serde(default)]
    pub index: Option<usize>,
}

impl EdgeEnd {
    pub fn new(node: &str, port: &str) -> Self {
        Self {
            node: node.to_string(),
            port: port.to_string(),
            index: None,
        }
    }

    pub fn indexed(node: &str, port: &str, index: usize) -> Self {
        Self {
            index: Some(index),
            ..Self::new(node, port)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: EdgeEnd,
    pub to: EdgeEnd,
    #[serde(default)]
    pub metadata: Value,
}

/// Initial packet seeded into a port when the network starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphInitial {
    pub data: Value,
    pub to: EdgeEnd,
    #[serde(default)]
    pub metadata: Value,
}

/// A port of an inner process exposed on a subgraph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedPort {
    pub process: String,
    pub port: String,
    #[serde(default)]
    pub metadata: Value,
}

/// In-memory graph description
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Graph {
    pub name: String,
    pub description: Option<String>,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    pub initializers: Vec<GraphInitial>,
    pub inports: IndexMap<String, ExportedPort>,
    pub outports: IndexMap<String, ExportedPort>,
}

impl Graph {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn add_node(&mut self, id: &str, component: &str) -> &mut Self {
        self.add_node_with_metadata(id, component, Value::Null)
    }

    pub fn add_node_with_metadata(&mut self, id: &str, component: &str, metadata: Value) -> &mut Self {
        self.nodes.push(GraphNode {
            id: id.to_string(),
            component: Some(component.to_string()),
            metadata,
        });
        self
    }

    pub fn add_edge(&mut self, from: &str, out_port: &str, to: &str, in_port: &str) -> &mut Self {
        self.edges.push(GraphEdge {
            from: EdgeEnd::new(from, out_port),
            to: EdgeEnd::new(to, in_port),
            metadata: Value::Null,
        });
        self
    }

    /// Edge between explicit port slots
    pub fn add_edge_index(&mut self, from: EdgeEnd, to: EdgeEnd, metadata: Value) -> &mut Self {
        self.edges.push(GraphEdge { from, to, metadata });
        self
    }

    pub fn add_initial(&mut self, data: impl Into<Value>, node: &str, port: &str) -> &mut Self {
        self.initializers.push(GraphInitial {
            data: data.into(),
            to: EdgeEnd::new(node, port),
            metadata: Value::Null,
        });
        self
    }

    pub fn add_initial_index(
        &mut self,
        data: impl Into<Value>,
        node: &str,
        port: &str,
        index: usize,
    ) -> &mut Self {
        self.initializers.push(GraphInitial {
            data: data.into(),
            to: EdgeEnd::indexed(node, port, index),
            metadata: Value::Null,
        });
        self
    }

    /// Expose `process.port` as public inport `name`
    pub fn add_inport(&mut self, name: &str, process: &str, port: &str) -> &mut Self {
        self.inports.insert(
            name.to_string(),
            ExportedPort {
                process: process.to_string(),
                port: port.to_string(),
                metadata: Value::Null,
            },
        );
        self
    }

    pub fn add_outport(&mut self, name: &str, process: &str, port: &str) -> &mut Self {
        self.outports.insert(
            name.to_string(),
            ExportedPort {
                process: process.to_string(),
                port: port.to_string(),
                metadata: Value::Null,
            },
        );
        self
    }
}
