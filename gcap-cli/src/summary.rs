use std::collections::BTreeMap;

use gcap::header::Header;
use gcap::{Graph, TensorDesc};
use serde::Serialize;

/// Machine-readable description of an artifact, printed by `inspect --json`.
#[derive(Serialize)]
pub struct ArtifactSummary {
    pub format_version: String,
    pub size_bytes: usize,
    pub checksum: bool,
    pub producer: String,
    pub inputs: Vec<TensorSummary>,
    pub outputs: Vec<TensorSummary>,
    pub initializers: usize,
    pub parameters: usize,
    pub nodes: Vec<NodeSummary>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

#[derive(Serialize)]
pub struct TensorSummary {
    pub name: String,
    pub dtype: String,

    /// Dimension sizes, or names for symbolic dimensions.
    pub shape: Vec<String>,
}

impl From<&TensorDesc> for TensorSummary {
    fn from(desc: &TensorDesc) -> Self {
        TensorSummary {
            name: desc.name.clone(),
            dtype: desc.dtype.to_string(),
            shape: desc.shape.iter().map(|d| d.to_string()).collect(),
        }
    }
}

#[derive(Serialize)]
pub struct NodeSummary {
    pub op: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl ArtifactSummary {
    pub fn new(header: &Header, size_bytes: usize, graph: &Graph) -> Self {
        let metadata = graph.metadata();
        ArtifactSummary {
            format_version: format!("{}.{}", header.format_major, header.format_minor),
            size_bytes,
            checksum: header.has_checksum(),
            producer: metadata.producer.clone(),
            inputs: graph.inputs().iter().map(TensorSummary::from).collect(),
            outputs: graph.outputs().iter().map(TensorSummary::from).collect(),
            initializers: graph.initializers().len(),
            parameters: graph.parameter_count(),
            nodes: graph
                .nodes()
                .iter()
                .map(|node| NodeSummary {
                    op: node.op.to_string(),
                    inputs: node.inputs.clone(),
                    outputs: node.outputs.clone(),
                    scope: node.provenance.clone(),
                })
                .collect(),
            properties: metadata.properties.clone(),
        }
    }
}
