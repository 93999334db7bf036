//! Recording operator applications as graph nodes.
//!
//! A [`Tracer`] is driven by model code. The model declares its inputs and
//! parameters, then calls [`Tracer::apply`] once for each operator it would
//! run. Each call is checked against the operator registry, has its output
//! types inferred and is recorded as a node. No tensor math is performed.
//!
//! # Control flow
//!
//! The trace records a single execution path. If model code branches or loops
//! based on sample input data (see [`Tracer::sample_value`]) or on shapes,
//! only the operators on the path taken for the given samples are recorded.
//! Conditionals and loops are not represented in the exported graph.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::attrs::Attrs;
use crate::diagnostics::Diagnostics;
use crate::error::{ExportError, NodeRef};
use crate::graph::{Initializer, Node};
use crate::infer_shapes::{infer_node, Input, SymbolGen};
use crate::op_registry::{OpKind, OpRegistry};
use crate::value::{Dimension, Shape, TensorData, TensorDesc, ValueInfo};
use crate::value_store::ValueStore;

/// Handle to a value recorded by a [`Tracer`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Value {
    name: String,
}

impl Value {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// An operator input.
#[derive(Clone, Debug)]
pub enum Operand {
    /// An existing value, identified by name.
    Value(String),

    /// A literal tensor, which is added to the graph as an initializer.
    Tensor(TensorData),
}

impl From<&Value> for Operand {
    fn from(val: &Value) -> Operand {
        Operand::Value(val.name.clone())
    }
}

impl From<Value> for Operand {
    fn from(val: Value) -> Operand {
        Operand::Value(val.name)
    }
}

impl From<&str> for Operand {
    fn from(name: &str) -> Operand {
        Operand::Value(name.to_string())
    }
}

impl From<TensorData> for Operand {
    fn from(data: TensorData) -> Operand {
        Operand::Tensor(data)
    }
}

/// The record produced by a completed trace.
///
/// Pass this to [`GraphBuilder::from_trace`](crate::GraphBuilder::from_trace)
/// to validate it and produce a [`Graph`](crate::Graph).
#[derive(Clone, Debug)]
pub struct Trace {
    pub inputs: Vec<TensorDesc>,
    pub outputs: Vec<TensorDesc>,
    pub nodes: Vec<Node>,
    pub initializers: Vec<Initializer>,
}

/// Records operator applications as a sequence of graph nodes.
///
/// A tracer is used for a single export and is not shared between threads.
pub struct Tracer<'r> {
    registry: &'r OpRegistry,
    store: ValueStore,

    /// Sample data of graph inputs.
    samples: FxHashMap<String, TensorData>,

    /// Data of values produced by `Constant` nodes.
    constant_values: FxHashMap<String, TensorData>,

    nodes: Vec<Node>,
    inputs: Vec<String>,
    parameters: Vec<String>,
    next_value_id: usize,
    next_constant_id: usize,
    scopes: Vec<String>,
    sym_gen: SymbolGen,
    diagnostics: Diagnostics,
    keep_unused_parameters: bool,
}

impl<'r> Tracer<'r> {
    /// Create a tracer which accepts operators in `registry`.
    ///
    /// Diagnostics are configured from the environment. See
    /// [`Diagnostics::from_env`].
    pub fn new(registry: &'r OpRegistry) -> Tracer<'r> {
        Self::with_diagnostics(registry, Diagnostics::from_env())
    }

    pub fn with_diagnostics(registry: &'r OpRegistry, diagnostics: Diagnostics) -> Tracer<'r> {
        Tracer {
            registry,
            store: ValueStore::new(),
            samples: FxHashMap::default(),
            constant_values: FxHashMap::default(),
            nodes: Vec::new(),
            inputs: Vec::new(),
            parameters: Vec::new(),
            next_value_id: 0,
            next_constant_id: 0,
            scopes: Vec::new(),
            sym_gen: SymbolGen::new(),
            diagnostics,
            keep_unused_parameters: false,
        }
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Set whether parameters that no node uses are kept as initializers.
    /// By default they are removed when the trace finishes.
    pub fn set_keep_unused_parameters(&mut self, keep: bool) {
        self.keep_unused_parameters = keep;
    }

    /// Declare a graph input whose descriptor is taken from a sample.
    pub fn add_input(&mut self, name: &str, sample: TensorData) -> Result<Value, ExportError> {
        self.add_dynamic_input(name, sample, &[])
    }

    /// Declare a graph input with symbolic dimensions.
    ///
    /// `dynamic` lists `(axis, symbol)` pairs. The sample provides sizes for
    /// the trace, but the input's descriptor has the symbol in place of the
    /// sample size for each listed axis.
    pub fn add_dynamic_input(
        &mut self,
        name: &str,
        sample: TensorData,
        dynamic: &[(usize, &str)],
    ) -> Result<Value, ExportError> {
        let mut shape: Shape = sample.shape().iter().copied().map(Dimension::Fixed).collect();
        for &(axis, symbol) in dynamic {
            let Some(dim) = shape.get_mut(axis) else {
                return Err(ExportError::ShapeMismatch {
                    node: None,
                    shapes: vec![shape.clone()],
                    detail: format!("input \"{}\" has no axis {} to make dynamic", name, axis),
                });
            };
            *dim = Dimension::Symbolic(symbol.to_string());
        }

        self.store
            .declare(TensorDesc::new(name, sample.dtype(), shape))?;
        self.samples.insert(name.to_string(), sample);
        self.inputs.push(name.to_string());
        Ok(Value {
            name: name.to_string(),
        })
    }

    /// Register a learned parameter.
    pub fn add_parameter(&mut self, name: &str, data: TensorData) -> Result<Value, ExportError> {
        self.store.declare_constant(name, data)?;
        self.parameters.push(name.to_string());
        Ok(Value {
            name: name.to_string(),
        })
    }

    /// Look up a parameter registered with [`add_parameter`](Self::add_parameter).
    pub fn param(&self, name: &str) -> Result<Value, ExportError> {
        if !self.parameters.iter().any(|p| p == name) {
            return Err(ExportError::UseBeforeDefinition {
                node: None,
                name: name.to_string(),
            });
        }
        Ok(Value {
            name: name.to_string(),
        })
    }

    /// Add an anonymous constant, named `const_N`.
    pub fn constant(&mut self, data: TensorData) -> Result<Value, ExportError> {
        let name = loop {
            self.next_constant_id += 1;
            let name = format!("const_{}", self.next_constant_id);
            if !self.store.contains(&name) {
                break name;
            }
        };
        self.store.declare_constant(&name, data)?;
        Ok(Value { name })
    }

    /// Return the descriptor of a value.
    pub fn desc(&self, value: &Value) -> Option<&TensorDesc> {
        self.store.get(&value.name)
    }

    /// Return the sample data for a graph input or constant.
    ///
    /// Model code may use this to make decisions based on input data. Since
    /// only the path taken for the sample is recorded, each call emits a
    /// warning. Values computed by operators have no data during tracing, so
    /// this returns `None` for them.
    pub fn sample_value(&self, value: &Value) -> Option<&TensorData> {
        let data = self
            .samples
            .get(&value.name)
            .or_else(|| self.store.constant(&value.name))
            .or_else(|| self.constant_values.get(&value.name))?;
        self.diagnostics.warn(
            &value.name,
            format_args!(
                "sample data was read during tracing; only the path taken for this sample is recorded"
            ),
        );
        Some(data)
    }

    /// Run `f` with `name` pushed onto the provenance scope stack.
    ///
    /// Nodes record the `/`-separated scope stack at the point they were
    /// applied, eg. "layer1/conv1".
    pub fn scope<R>(&mut self, name: &str, f: impl FnOnce(&mut Self) -> R) -> R {
        self.scopes.push(name.to_string());
        let result = f(self);
        self.scopes.pop();
        result
    }

    /// Record an application of operator `op` and return its outputs.
    ///
    /// Fails with [`ExportError::UnsupportedOperator`] if `op` is not in the
    /// registry, [`ExportError::UseBeforeDefinition`] if an operand names a
    /// value that does not exist, or with an error describing why the
    /// operands and attributes are invalid for the operator.
    pub fn apply(
        &mut self,
        op: &str,
        operands: &[Operand],
        attrs: Attrs,
    ) -> Result<Vec<Value>, ExportError> {
        let index = self.nodes.len();
        let registry = self.registry;
        let schema = registry.resolve(op, index)?;
        let node_ref = NodeRef::new(index, schema.kind.name());
        schema.check_node(&node_ref, operands.len(), &attrs)?;

        for operand in operands {
            if let Operand::Value(name) = operand {
                if !self.store.contains(name) {
                    return Err(ExportError::UseBeforeDefinition {
                        node: Some(node_ref),
                        name: name.clone(),
                    });
                }
            }
        }

        let mut input_names = Vec::with_capacity(operands.len());
        for operand in operands {
            let name = match operand {
                Operand::Value(name) => name.clone(),
                Operand::Tensor(data) => self.constant(data.clone())?.name,
            };
            input_names.push(name);
        }

        let infos: Vec<ValueInfo> = input_names
            .iter()
            .filter_map(|name| self.store.get(name).map(|desc| desc.info()))
            .collect();
        if let Some(first) = infos.first() {
            schema.check_input_type(&node_ref, first.dtype)?;
        }

        let inputs: Vec<Input> = input_names
            .iter()
            .zip(&infos)
            .map(|(name, info)| Input {
                info,
                constant: self
                    .store
                    .constant(name)
                    .or_else(|| self.constant_values.get(name)),
            })
            .collect();
        let output_infos = infer_node(schema.kind, &attrs, &inputs, &mut self.sym_gen).map_err(
            |err| err.into_export_error(node_ref.clone(), schema.inputs, input_names.len()),
        )?;

        let mut outputs = Vec::with_capacity(output_infos.len());
        for info in output_infos {
            let name = self.next_value_name();
            self.diagnostics.info(
                &node_ref.to_string(),
                format_args!("output \"{}\" is {}", name, info),
            );
            self.store.declare(TensorDesc::with_info(name.clone(), info))?;
            outputs.push(Value { name });
        }

        if let (OpKind::Constant, Some(value), Some(output)) =
            (schema.kind, attrs.tensor("value"), outputs.first())
        {
            self.constant_values
                .insert(output.name.clone(), value.clone());
        }

        let provenance = (!self.scopes.is_empty()).then(|| self.scopes.join("/"));
        self.nodes.push(Node {
            id: index,
            op: schema.kind,
            inputs: input_names,
            outputs: outputs.iter().map(|v| v.name.clone()).collect(),
            attrs,
            provenance,
        });

        Ok(outputs)
    }

    /// Record an application of a single-output operator.
    pub fn apply1(
        &mut self,
        op: &str,
        operands: &[Operand],
        attrs: Attrs,
    ) -> Result<Value, ExportError> {
        let mut outputs = self.apply(op, operands, attrs)?;
        Ok(outputs.swap_remove(0))
    }

    /// Record an application of an operator with one input and no
    /// attributes.
    pub fn unary(&mut self, op: &str, x: impl Into<Operand>) -> Result<Value, ExportError> {
        self.apply1(op, &[x.into()], Attrs::new())
    }

    /// Record an application of an operator with two inputs and no
    /// attributes.
    pub fn binary(
        &mut self,
        op: &str,
        a: impl Into<Operand>,
        b: impl Into<Operand>,
    ) -> Result<Value, ExportError> {
        self.apply1(op, &[a.into(), b.into()], Attrs::new())
    }

    fn next_value_name(&mut self) -> String {
        loop {
            self.next_value_id += 1;
            let name = format!("t{}", self.next_value_id);
            if !self.store.contains(&name) {
                return name;
            }
        }
    }

    /// Rename a value produced by a node, updating all references to it.
    fn rename_value(&mut self, old_name: &str, new_name: &str) -> Result<(), ExportError> {
        self.store.rename(old_name, new_name)?;
        for node in &mut self.nodes {
            for name in node.inputs.iter_mut().chain(node.outputs.iter_mut()) {
                if name == old_name {
                    *name = new_name.to_string();
                }
            }
        }
        if let Some(data) = self.constant_values.remove(old_name) {
            self.constant_values.insert(new_name.to_string(), data);
        }
        Ok(())
    }

    /// Finish the trace, naming the graph outputs.
    ///
    /// Each value in `outputs` is given the paired name. Values produced by a
    /// node are renamed. Graph inputs, parameters and values which are
    /// already graph outputs are instead passed through an `Identity` node.
    pub fn finish(mut self, outputs: &[(&str, &Value)]) -> Result<Trace, ExportError> {
        // Current names of values renamed so far.
        let mut renamed: FxHashMap<String, String> = FxHashMap::default();
        let mut output_names: FxHashSet<String> = FxHashSet::default();

        for &(output_name, value) in outputs {
            let current = renamed
                .get(&value.name)
                .cloned()
                .unwrap_or_else(|| value.name.clone());
            if !self.store.contains(&current) {
                return Err(ExportError::UseBeforeDefinition {
                    node: None,
                    name: current,
                });
            }

            let produced = self
                .nodes
                .iter()
                .any(|node| node.outputs.contains(&current));
            let needs_identity = !produced || output_names.contains(&current);

            if needs_identity {
                self.identity(&current, output_name)?;
            } else if current != output_name {
                self.rename_value(&current, output_name)?;
                renamed.insert(value.name.clone(), output_name.to_string());
            }
            output_names.insert(output_name.to_string());
        }

        if !self.keep_unused_parameters {
            let used: FxHashSet<&str> = self
                .nodes
                .iter()
                .flat_map(|node| node.inputs.iter().map(|s| s.as_str()))
                .collect();
            let unused: Vec<String> = self
                .parameters
                .iter()
                .filter(|p| !used.contains(p.as_str()))
                .cloned()
                .collect();
            for name in unused {
                self.diagnostics.info(
                    &name,
                    format_args!("parameter is not used by any node and was removed"),
                );
                self.store.remove(&name);
            }
        }

        let input_descs = self.descs(self.inputs.iter().map(|s| s.as_str()))?;
        let output_descs = self.descs(outputs.iter().map(|(name, _)| *name))?;

        self.diagnostics.info(
            "trace",
            format_args!(
                "recorded {} nodes with inputs {} and outputs {}",
                self.nodes.len(),
                format_descs(&input_descs),
                format_descs(&output_descs)
            ),
        );

        let nodes = std::mem::take(&mut self.nodes);
        let initializers = self
            .store
            .into_constants()
            .into_iter()
            .map(|(name, data)| Initializer { name, data })
            .collect();

        Ok(Trace {
            inputs: input_descs,
            outputs: output_descs,
            nodes,
            initializers,
        })
    }

    fn descs<'a>(
        &self,
        names: impl Iterator<Item = &'a str>,
    ) -> Result<Vec<TensorDesc>, ExportError> {
        names
            .map(|name| {
                self.store
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ExportError::UseBeforeDefinition {
                        node: None,
                        name: name.to_string(),
                    })
            })
            .collect()
    }

    /// Append an `Identity` node which copies `input` to a new value.
    fn identity(&mut self, input: &str, output: &str) -> Result<(), ExportError> {
        let Some(desc) = self.store.get(input) else {
            return Err(ExportError::UseBeforeDefinition {
                node: None,
                name: input.to_string(),
            });
        };
        self.store
            .declare(TensorDesc::new(output, desc.dtype, desc.shape.clone()))?;
        self.nodes.push(Node {
            id: self.nodes.len(),
            op: OpKind::Identity,
            inputs: vec![input.to_string()],
            outputs: vec![output.to_string()],
            attrs: Attrs::new(),
            provenance: None,
        });
        Ok(())
    }
}

fn format_descs(descs: &[TensorDesc]) -> String {
    let descs: Vec<String> = descs.iter().map(|d| d.to_string()).collect();
    format!("[{}]", descs.join(", "))
}

#[cfg(test)]
mod tests {
    use super::{Operand, Tracer};
    use crate::attrs::Attrs;
    use crate::diagnostics::{DiagnosticLevel, Diagnostics};
    use crate::dims;
    use crate::error::{ErrorKind, ExportError};
    use crate::op_registry::{OpKind, OpRegistry};
    use crate::value::{DataType, TensorData};

    fn tracer(registry: &OpRegistry) -> Tracer<'_> {
        Tracer::with_diagnostics(registry, Diagnostics::new(DiagnosticLevel::Warn))
    }

    #[test]
    fn test_trace_add_relu() {
        let mut tracer = tracer(OpRegistry::global());
        let x = tracer
            .add_input("input", TensorData::zeros(DataType::Float32, &[1, 4]))
            .unwrap();
        let bias = tracer
            .add_parameter("bias", TensorData::from_vec(&[4], vec![0.1f32; 4]))
            .unwrap();
        let y = tracer.binary("Add", &x, &bias).unwrap();
        assert_eq!(y.name(), "t1");
        let z = tracer.unary("Relu", &y).unwrap();
        assert_eq!(tracer.desc(&z).unwrap().shape, dims![1, 4]);

        let trace = tracer.finish(&[("output", &z)]).unwrap();
        let ops: Vec<_> = trace.nodes.iter().map(|n| n.op).collect();
        assert_eq!(ops, [OpKind::Add, OpKind::Relu]);
        assert_eq!(trace.nodes[0].inputs, ["input", "bias"]);
        assert_eq!(trace.nodes[0].outputs, ["t1"]);
        assert_eq!(trace.nodes[1].inputs, ["t1"]);
        assert_eq!(trace.nodes[1].outputs, ["output"]);
        assert_eq!(trace.outputs[0].name, "output");
        assert_eq!(trace.initializers.len(), 1);
    }

    #[test]
    fn test_unsupported_operator() {
        let mut registry = OpRegistry::new();
        registry.register(OpKind::Relu);
        let mut tracer = tracer(&registry);
        let x = tracer
            .add_input("x", TensorData::zeros(DataType::Float32, &[2]))
            .unwrap();
        tracer.unary("Relu", &x).unwrap();

        let err = tracer.unary("Sigmoid", &x).unwrap_err();
        assert!(matches!(
            err,
            ExportError::UnsupportedOperator { node: 1, ref op } if op == "Sigmoid"
        ));

        let err = tracer.unary("Loop", &x).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperator);
    }

    #[test]
    fn test_use_before_definition() {
        let mut tracer = tracer(OpRegistry::global());
        tracer
            .add_input("x", TensorData::zeros(DataType::Float32, &[2]))
            .unwrap();
        let err = tracer.binary("Add", "x", "y").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UseBeforeDefinition);
        assert_eq!(
            err.to_string(),
            "in node 0 (Add): value \"y\" is used before it is defined"
        );

        let err = tracer.param("weight").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UseBeforeDefinition);
    }

    #[test]
    fn test_invalid_applications() {
        let mut tracer = tracer(OpRegistry::global());
        let x = tracer
            .add_input("x", TensorData::zeros(DataType::Float32, &[2, 3]))
            .unwrap();
        let y = tracer
            .add_input("y", TensorData::zeros(DataType::Float32, &[4, 5]))
            .unwrap();
        let idx = tracer
            .add_input("idx", TensorData::zeros(DataType::Bool, &[2, 3]))
            .unwrap();

        let err = tracer.apply("Add", &[(&x).into()], Attrs::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInputCount);

        let err = tracer
            .apply("Relu", &[(&x).into()], Attrs::new().with("axis", 1))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidAttribute);

        let err = tracer.unary("Relu", &idx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);

        let err = tracer.binary("Add", &x, &y).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShapeMismatch);
        assert_eq!(
            err.to_string(),
            "in node 0 (Add): shape mismatch between [2, 3] and [4, 5]: dimension sizes 3 and 5 cannot be broadcast"
        );
    }

    #[test]
    fn test_degenerate_shapes_are_rejected() {
        let mut tracer = tracer(OpRegistry::global());
        let x = tracer
            .add_input("x", TensorData::zeros(DataType::Float32, &[1, 1, 4, 4]))
            .unwrap();
        let v = tracer
            .add_input("v", TensorData::zeros(DataType::Float32, &[4]))
            .unwrap();

        let err = tracer
            .apply(
                "Conv",
                &[(&x).into(), TensorData::zeros(DataType::Float32, &[1, 1, 0, 0]).into()],
                Attrs::new(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShapeMismatch);

        let err = tracer
            .apply(
                "MaxPool",
                &[(&x).into()],
                Attrs::new()
                    .with("kernel_shape", vec![2i64, 2])
                    .with("pads", vec![i64::MAX; 4]),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShapeMismatch);

        let err = tracer
            .apply(
                "Reshape",
                &[(&v).into(), TensorData::from_vec(&[2], vec![i64::MAX, 4]).into()],
                Attrs::new(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShapeMismatch);

        // Failed applications leave no nodes behind.
        let trace = tracer.finish(&[("out", &x)]).unwrap();
        assert_eq!(trace.nodes.len(), 1);
        assert_eq!(trace.nodes[0].op, OpKind::Identity);
    }

    #[test]
    fn test_literal_operands() {
        let mut tracer = tracer(OpRegistry::global());
        let x = tracer
            .add_input("x", TensorData::zeros(DataType::Float32, &[2, 3]))
            .unwrap();
        let y = tracer
            .binary("Mul", &x, TensorData::scalar(2.0f32))
            .unwrap();
        let y = tracer
            .apply1(
                "Reshape",
                &[(&y).into(), TensorData::from_vec(&[1], vec![-1i64]).into()],
                Attrs::new(),
            )
            .unwrap();
        assert_eq!(tracer.desc(&y).unwrap().shape, dims![6]);

        let trace = tracer.finish(&[("y", &y)]).unwrap();
        let names: Vec<_> = trace.initializers.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["const_1", "const_2"]);
    }

    #[test]
    fn test_constant_node_feeds_reshape() {
        let mut tracer = tracer(OpRegistry::global());
        let x = tracer
            .add_input("x", TensorData::zeros(DataType::Float32, &[2, 3, 4]))
            .unwrap();
        let shape = tracer
            .apply1(
                "Constant",
                &[],
                Attrs::new().with("value", TensorData::from_vec(&[2], vec![0i64, -1])),
            )
            .unwrap();
        assert!(tracer.sample_value(&shape).is_some());
        let y = tracer.binary("Reshape", &x, &shape).unwrap();
        assert_eq!(tracer.desc(&y).unwrap().shape, dims![2, 12]);
    }

    #[test]
    fn test_output_naming() {
        let mut tracer = tracer(OpRegistry::global());
        let x = tracer
            .add_input("x", TensorData::zeros(DataType::Float32, &[2]))
            .unwrap();
        let y = tracer.unary("Relu", &x).unwrap();

        let trace = tracer
            .finish(&[("relu", &y), ("relu_copy", &y), ("passthrough", &x)])
            .unwrap();
        let nodes: Vec<_> = trace
            .nodes
            .iter()
            .map(|n| (n.op, n.inputs.clone(), n.outputs.clone()))
            .collect();
        assert_eq!(
            nodes,
            [
                (OpKind::Relu, vec!["x".to_string()], vec!["relu".to_string()]),
                (
                    OpKind::Identity,
                    vec!["relu".to_string()],
                    vec!["relu_copy".to_string()]
                ),
                (
                    OpKind::Identity,
                    vec!["x".to_string()],
                    vec!["passthrough".to_string()]
                ),
            ]
        );
        let outputs: Vec<_> = trace.outputs.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(outputs, ["relu", "relu_copy", "passthrough"]);
    }

    #[test]
    fn test_output_name_conflict() {
        let mut tracer = tracer(OpRegistry::global());
        let x = tracer
            .add_input("x", TensorData::zeros(DataType::Float32, &[2]))
            .unwrap();
        let y = tracer.unary("Relu", &x).unwrap();
        let err = tracer.finish(&[("x", &y)]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateName);
    }

    #[test]
    fn test_unused_parameters() {
        for keep in [false, true] {
            let mut tracer = tracer(OpRegistry::global());
            tracer.set_keep_unused_parameters(keep);
            let x = tracer
                .add_input("x", TensorData::zeros(DataType::Float32, &[2]))
                .unwrap();
            tracer
                .add_parameter("used", TensorData::zeros(DataType::Float32, &[2]))
                .unwrap();
            tracer
                .add_parameter("unused", TensorData::zeros(DataType::Float32, &[2]))
                .unwrap();
            let used = tracer.param("used").unwrap();
            let y = tracer.binary("Add", &x, &used).unwrap();

            let trace = tracer.finish(&[("y", &y)]).unwrap();
            let names: Vec<_> = trace.initializers.iter().map(|i| i.name.as_str()).collect();
            if keep {
                assert_eq!(names, ["used", "unused"]);
            } else {
                assert_eq!(names, ["used"]);
            }
        }
    }

    #[test]
    fn test_scopes() {
        let mut tracer = tracer(OpRegistry::global());
        let x = tracer
            .add_input("x", TensorData::zeros(DataType::Float32, &[2]))
            .unwrap();
        let y = tracer
            .scope("block1", |t| t.scope("act", |t| t.unary("Relu", &x)))
            .unwrap();
        let z = tracer.unary("Neg", &y).unwrap();
        let trace = tracer.finish(&[("z", &z)]).unwrap();
        assert_eq!(trace.nodes[0].provenance.as_deref(), Some("block1/act"));
        assert_eq!(trace.nodes[1].provenance, None);
    }

    #[test]
    fn test_dynamic_input() {
        let mut tracer = tracer(OpRegistry::global());
        let x = tracer
            .add_dynamic_input(
                "x",
                TensorData::zeros(DataType::Float32, &[2, 8]),
                &[(0, "batch")],
            )
            .unwrap();
        let w = tracer
            .add_parameter("w", TensorData::zeros(DataType::Float32, &[8, 3]))
            .unwrap();
        let y = tracer.binary("MatMul", &x, &w).unwrap();
        assert_eq!(tracer.desc(&y).unwrap().shape, dims!["batch", 3]);

        let err = tracer
            .add_dynamic_input(
                "z",
                TensorData::zeros(DataType::Float32, &[2]),
                &[(1, "batch")],
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShapeMismatch);
    }

    #[test]
    fn test_sample_value_warns() {
        let mut tracer = tracer(OpRegistry::global());
        let x = tracer
            .add_input("x", TensorData::from_vec(&[2], vec![1.0f32, -1.0]))
            .unwrap();
        let y = tracer.unary("Relu", &x).unwrap();

        let sample = tracer.sample_value(&x).unwrap();
        assert_eq!(sample.to_vec::<f32>(), Some(vec![1.0, -1.0]));
        assert!(tracer.sample_value(&y).is_none());
        assert_eq!(tracer.diagnostics().warning_count(), 1);
    }

    #[test]
    fn test_operand_conversions() {
        assert!(matches!(Operand::from("x"), Operand::Value(ref n) if n == "x"));
        assert!(matches!(
            Operand::from(TensorData::scalar(1i64)),
            Operand::Tensor(_)
        ));
    }
}
