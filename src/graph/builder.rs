use rustc_hash::{FxHashMap, FxHashSet};

use super::{Graph, GraphMetadata, Initializer, Node};
use crate::error::{ExportError, Invariant, NodeRef};
use crate::infer_shapes::infer_graph;
use crate::op_registry::OpRegistry;
use crate::tracer::Trace;
use crate::value::{byte_len, TensorData, TensorDesc, ValueInfo};

/// Assembles nodes, inputs, outputs and initializers into a [`Graph`].
///
/// The builder does not trust its inputs. [`GraphBuilder::build`] checks all
/// of the graph's structural invariants independently of how the parts were
/// produced, and fails with [`ExportError::MalformedGraph`] naming the first
/// invariant that does not hold.
#[derive(Clone, Debug, Default)]
pub struct GraphBuilder {
    inputs: Vec<TensorDesc>,
    outputs: Vec<TensorDesc>,
    nodes: Vec<Node>,
    initializers: Vec<Initializer>,
    metadata: GraphMetadata,
}

impl GraphBuilder {
    pub fn new() -> GraphBuilder {
        GraphBuilder::default()
    }

    /// Create a builder from the record produced by a [`Tracer`](crate::Tracer).
    pub fn from_trace(trace: Trace) -> GraphBuilder {
        GraphBuilder {
            inputs: trace.inputs,
            outputs: trace.outputs,
            nodes: trace.nodes,
            initializers: trace.initializers,
            metadata: GraphMetadata::default(),
        }
    }

    pub(super) fn from_graph(graph: Graph) -> GraphBuilder {
        GraphBuilder {
            inputs: graph.inputs,
            outputs: graph.outputs,
            nodes: graph.nodes,
            initializers: graph.initializers.into_values().collect(),
            metadata: graph.metadata,
        }
    }

    pub fn add_input(&mut self, desc: TensorDesc) -> &mut Self {
        self.inputs.push(desc);
        self
    }

    pub fn add_output(&mut self, desc: TensorDesc) -> &mut Self {
        self.outputs.push(desc);
        self
    }

    /// Append a node. Nodes must be added in topological order.
    pub fn add_node(&mut self, node: Node) -> &mut Self {
        self.nodes.push(node);
        self
    }

    pub fn add_initializer(&mut self, name: &str, data: TensorData) -> &mut Self {
        self.initializers.push(Initializer {
            name: name.to_string(),
            data,
        });
        self
    }

    /// Return the number of nodes added so far.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn set_producer(&mut self, producer: &str) -> &mut Self {
        self.metadata.producer = producer.to_string();
        self
    }

    pub fn set_property(&mut self, key: &str, value: &str) -> &mut Self {
        self.metadata
            .properties
            .insert(key.to_string(), value.to_string());
        self
    }

    /// Set the format version recorded in the graph's metadata.
    pub(crate) fn set_format_version(&mut self, major: u16, minor: u16) -> &mut Self {
        self.metadata.format_major = major;
        self.metadata.format_minor = minor;
        self
    }

    /// Validate the graph and return it.
    ///
    /// `registry` determines which operators the graph may use.
    pub fn build(self, registry: &OpRegistry) -> Result<Graph, ExportError> {
        let GraphBuilder {
            inputs,
            outputs,
            nodes,
            initializers,
            metadata,
        } = self;

        for (index, node) in nodes.iter().enumerate() {
            if node.id != index {
                return Err(ExportError::malformed(
                    Invariant::NodeIds,
                    format!("node at position {} has id {}", index, node.id),
                ));
            }
        }

        let mut defined: FxHashSet<&str> = FxHashSet::default();
        let graph_values = inputs
            .iter()
            .map(|input| input.name.as_str())
            .chain(initializers.iter().map(|init| init.name.as_str()));
        for name in graph_values {
            if !defined.insert(name) {
                return Err(ExportError::malformed(
                    Invariant::UniqueNames,
                    format!("\"{}\" is declared more than once", name),
                ));
            }
        }

        for init in &initializers {
            let expected = byte_len(init.data.dtype(), init.data.shape());
            if expected != Some(init.data.bytes().len()) {
                return Err(ExportError::malformed(
                    Invariant::InitializerData,
                    format!(
                        "initializer \"{}\" has {} bytes of data",
                        init.name,
                        init.data.bytes().len()
                    ),
                ));
            }
        }

        // Position of the node that produces each value, used to tell
        // forward references apart from undefined values.
        let producers: FxHashMap<&str, usize> = nodes
            .iter()
            .flat_map(|node| node.outputs.iter().map(|name| (name.as_str(), node.id)))
            .collect();

        for node in &nodes {
            let node_ref = NodeRef::new(node.id, node.op.name());
            let schema = registry.lookup(node.op).ok_or_else(|| {
                ExportError::malformed(
                    Invariant::OperatorSchema,
                    format!("{} uses an unsupported operator", node_ref),
                )
            })?;
            schema
                .check_node(&node_ref, node.inputs.len(), &node.attrs)
                .map_err(|err| ExportError::malformed(Invariant::OperatorSchema, err.to_string()))?;
            if !schema.outputs.contains(node.outputs.len()) {
                return Err(ExportError::malformed(
                    Invariant::OperatorSchema,
                    format!(
                        "{} has {} outputs but expected {}",
                        node_ref,
                        node.outputs.len(),
                        schema.outputs
                    ),
                ));
            }

            for input in &node.inputs {
                if defined.contains(input.as_str()) {
                    continue;
                }
                let detail = match producers.get(input.as_str()) {
                    Some(producer) => format!(
                        "{} consumes \"{}\" before it is produced by node {}",
                        node_ref, input, producer
                    ),
                    None => format!("{} consumes undefined value \"{}\"", node_ref, input),
                };
                return Err(ExportError::malformed(Invariant::TopologicalOrder, detail));
            }

            for output in &node.outputs {
                if !defined.insert(output.as_str()) {
                    return Err(ExportError::malformed(
                        Invariant::SingleProducer,
                        format!("{} redefines \"{}\"", node_ref, output),
                    ));
                }
            }
        }

        let mut output_names = FxHashSet::default();
        for output in &outputs {
            if !defined.contains(output.name.as_str()) {
                return Err(ExportError::malformed(
                    Invariant::OutputsDefined,
                    format!("output \"{}\" is not defined", output.name),
                ));
            }
            if !output_names.insert(output.name.as_str()) {
                return Err(ExportError::malformed(
                    Invariant::OutputsDefined,
                    format!("output \"{}\" is listed more than once", output.name),
                ));
            }
        }

        let initializers = initializers
            .into_iter()
            .map(|init| (init.name.clone(), init))
            .collect();

        let infos = infer_graph(&inputs, &initializers, &nodes)
            .map_err(|err| ExportError::malformed(Invariant::InferredDescriptors, err.to_string()))?;

        for node in &nodes {
            let Some(info) = node.inputs.first().and_then(|name| infos.get(name)) else {
                continue;
            };
            let node_ref = NodeRef::new(node.id, node.op.name());
            if let Some(schema) = registry.lookup(node.op) {
                schema
                    .check_input_type(&node_ref, info.dtype)
                    .map_err(|err| ExportError::malformed(Invariant::OperatorSchema, err.to_string()))?;
            }
        }

        for output in &outputs {
            let declared = output.info();
            let inferred: Option<&ValueInfo> = infos.get(&output.name);
            if inferred != Some(&declared) {
                return Err(ExportError::malformed(
                    Invariant::InferredDescriptors,
                    format!(
                        "output \"{}\" is declared as {} but inferred as {}",
                        output.name,
                        declared,
                        inferred.map(|i| i.to_string()).unwrap_or_default()
                    ),
                ));
            }
        }

        Ok(Graph {
            inputs,
            outputs,
            nodes,
            initializers,
            metadata,
        })
    }
}
