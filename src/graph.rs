//! In-memory representation of exported computation graphs.

use std::collections::BTreeMap;
use std::fmt;

use crate::attrs::Attrs;
use crate::header::{FORMAT_MAJOR, FORMAT_MINOR};
use crate::op_registry::OpKind;
use crate::value::{TensorData, TensorDesc};

mod builder;

pub use builder::GraphBuilder;

/// One recorded operator application.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    /// Position of the node in the graph's node sequence.
    pub id: usize,
    pub op: OpKind,

    /// Names of the values consumed by this node.
    pub inputs: Vec<String>,

    /// Names of the values produced by this node.
    pub outputs: Vec<String>,
    pub attrs: Attrs,

    /// Scope path of the model code that recorded this node, eg.
    /// "layer1/conv".
    pub provenance: Option<String>,
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}) -> {}",
            self.op,
            self.inputs.join(", "),
            self.outputs.join(", ")
        )
    }
}

/// A named constant tensor embedded in a graph.
#[derive(Clone, Debug, PartialEq)]
pub struct Initializer {
    pub name: String,
    pub data: TensorData,
}

impl Initializer {
    pub fn desc(&self) -> TensorDesc {
        TensorDesc::with_info(self.name.clone(), self.data.info())
    }
}

/// Graph-level metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct GraphMetadata {
    pub format_major: u16,
    pub format_minor: u16,

    /// Identifies the tool that produced the graph.
    pub producer: String,

    /// Free-form key/value properties.
    pub properties: BTreeMap<String, String>,
}

impl Default for GraphMetadata {
    fn default() -> Self {
        GraphMetadata {
            format_major: FORMAT_MAJOR,
            format_minor: FORMAT_MINOR,
            producer: String::new(),
            properties: BTreeMap::new(),
        }
    }
}

/// A validated computation graph.
///
/// Graphs are constructed using a [`GraphBuilder`], which checks that nodes
/// are in topological order, that each value has a single producer and that
/// declared output types match those inferred from the nodes. Graphs are
/// immutable once built.
#[derive(Clone, Debug, PartialEq)]
pub struct Graph {
    inputs: Vec<TensorDesc>,
    outputs: Vec<TensorDesc>,
    nodes: Vec<Node>,
    initializers: BTreeMap<String, Initializer>,
    metadata: GraphMetadata,
}

impl Graph {
    /// Return the graph's inputs, in the order they are passed to the model.
    pub fn inputs(&self) -> &[TensorDesc] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorDesc] {
        &self.outputs
    }

    /// Return the nodes in topological order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Return the initializers, ordered by name.
    pub fn initializers(&self) -> &BTreeMap<String, Initializer> {
        &self.initializers
    }

    pub fn initializer(&self, name: &str) -> Option<&Initializer> {
        self.initializers.get(name)
    }

    pub fn metadata(&self) -> &GraphMetadata {
        &self.metadata
    }

    /// Return the node which produces a given value.
    pub fn producer_of(&self, name: &str) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|node| node.outputs.iter().any(|output| output == name))
    }

    /// Return the total number of elements in all initializers.
    pub fn parameter_count(&self) -> usize {
        self.initializers.values().map(|init| init.data.len()).sum()
    }

    /// Convert the graph back into a builder, eg. to add metadata.
    pub fn into_builder(self) -> GraphBuilder {
        GraphBuilder::from_graph(self)
    }
}
