//! Shape and type inference.
//!
//! Each operator kind has a rule which computes the element types and shapes
//! of a node's outputs from those of its inputs and its attributes. Rules see
//! the data of inputs which are constants (eg. the target shape of a
//! `Reshape`) but never the data of other values.
//!
//! Dimensions whose size depends on a symbolic input dimension are either
//! propagated as that symbol or, where the size is some function of symbols,
//! replaced by a fresh symbol from a [`SymbolGen`]. Rules are applied to
//! nodes one at a time in trace order, so running inference twice over the
//! same nodes generates the same symbols.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::attrs::Attrs;
use crate::error::{ExportError, NodeRef};
use crate::graph::{Initializer, Node};
use crate::op_registry::{Arity, OpKind, OpSchema};
use crate::value::{
    element_count, fixed_shape, DataType, Dimension, Shape, TensorData, TensorDesc, ValueInfo,
};

mod binary;
mod conv_pool;
mod layout;
mod reduce;

pub use binary::broadcast_shapes;

/// Generates names for symbolic dimensions whose size cannot be expressed in
/// terms of existing symbols.
pub struct SymbolGen {
    prefix: &'static str,
    next_symbol_id: u32,
}

impl Default for SymbolGen {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolGen {
    pub fn new() -> Self {
        Self::with_prefix("unk__")
    }

    pub fn with_prefix(prefix: &'static str) -> Self {
        Self {
            prefix,
            next_symbol_id: 0,
        }
    }

    /// Generate a new symbolic dimension.
    pub fn gen(&mut self) -> Dimension {
        self.next_symbol_id += 1;
        Dimension::Symbolic(format!("{}{}", self.prefix, self.next_symbol_id))
    }
}

/// An operator input as seen by shape inference.
#[derive(Copy, Clone, Debug)]
pub struct Input<'a> {
    pub info: &'a ValueInfo,

    /// Data of the input, if it is a constant.
    pub constant: Option<&'a TensorData>,
}

impl<'a> Input<'a> {
    pub fn new(info: &'a ValueInfo) -> Input<'a> {
        Input {
            info,
            constant: None,
        }
    }

    pub fn with_constant(info: &'a ValueInfo, constant: &'a TensorData) -> Input<'a> {
        Input {
            info,
            constant: Some(constant),
        }
    }

    fn shape(&self) -> &'a [Dimension] {
        &self.info.shape
    }

    fn dtype(&self) -> DataType {
        self.info.dtype
    }

    fn ndim(&self) -> usize {
        self.info.ndim()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum InferShapesError {
    /// Too many or too few inputs were provided for this operator.
    IncorrectInputCount,

    /// The input shapes are incompatible.
    IncompatibleShapes { shapes: Vec<Shape>, detail: String },

    /// An input's rank does not match that expected by the operator.
    IncorrectRank { shape: Shape, detail: String },

    /// An input has the wrong element type.
    TypeMismatch { expected: String, actual: String },

    /// An attribute has an invalid value.
    InvalidAttr { attr: String, error: String },
}

impl InferShapesError {
    /// Convert this error into an [`ExportError`] for node `node`, whose
    /// operator accepts `arity` inputs and was given `input_count`.
    pub(crate) fn into_export_error(
        self,
        node: NodeRef,
        arity: Arity,
        input_count: usize,
    ) -> ExportError {
        match self {
            Self::IncorrectInputCount => ExportError::InvalidInputCount {
                node,
                expected: arity,
                actual: input_count,
            },
            Self::IncompatibleShapes { shapes, detail } => ExportError::ShapeMismatch {
                node: Some(node),
                shapes,
                detail,
            },
            Self::IncorrectRank { shape, detail } => ExportError::ShapeMismatch {
                node: Some(node),
                shapes: vec![shape],
                detail,
            },
            Self::TypeMismatch { expected, actual } => ExportError::TypeMismatch {
                node: Some(node),
                expected,
                actual,
            },
            Self::InvalidAttr { attr, error } => ExportError::InvalidAttribute {
                node: Some(node),
                attr,
                error,
            },
        }
    }

    fn incompatible(shapes: &[&[Dimension]], detail: impl Into<String>) -> Self {
        Self::IncompatibleShapes {
            shapes: shapes.iter().map(|s| Shape::from(*s)).collect(),
            detail: detail.into(),
        }
    }

    fn rank(shape: &[Dimension], detail: impl Into<String>) -> Self {
        Self::IncorrectRank {
            shape: shape.into(),
            detail: detail.into(),
        }
    }

    fn attr(attr: &str, error: impl Into<String>) -> Self {
        Self::InvalidAttr {
            attr: attr.to_string(),
            error: error.into(),
        }
    }
}

/// Infer the types and shapes of the outputs of an operator application.
pub fn infer_node(
    kind: OpKind,
    attrs: &Attrs,
    inputs: &[Input],
    sym_gen: &mut SymbolGen,
) -> Result<Vec<ValueInfo>, InferShapesError> {
    use OpKind::*;

    let info = match kind {
        Abs | Neg | Relu | Sigmoid | Tanh | Exp | Log | Sqrt | Erf | Identity | LeakyRelu
        | Gelu | Softmax | LogSoftmax => unary(kind, attrs, inputs)?,
        Clip => binary::clip(inputs)?,
        Add | Sub | Mul | Div => binary::arithmetic(inputs, sym_gen)?,
        Pow => binary::pow(inputs, sym_gen)?,
        Equal | Less | Greater => binary::compare(inputs, sym_gen)?,
        Where => binary::where_op(inputs, sym_gen)?,
        Cast => cast(attrs, inputs)?,
        MatMul => binary::matmul(inputs, sym_gen)?,
        Gemm => binary::gemm(attrs, inputs, sym_gen)?,
        Conv => conv_pool::conv(attrs, inputs, sym_gen)?,
        MaxPool | AveragePool => conv_pool::pool(attrs, inputs, sym_gen)?,
        GlobalAveragePool => conv_pool::global_pool(inputs)?,
        BatchNormalization => conv_pool::batch_norm(inputs)?,
        ReduceMean | ReduceSum | ReduceMax | ReduceMin => reduce::reduce(attrs, inputs)?,
        ArgMax => reduce::arg_max(attrs, inputs)?,
        Reshape => layout::reshape(attrs, inputs, sym_gen)?,
        Flatten => layout::flatten(attrs, inputs, sym_gen)?,
        Transpose => layout::transpose(attrs, inputs)?,
        Squeeze => layout::squeeze(attrs, inputs)?,
        Unsqueeze => layout::unsqueeze(attrs, inputs)?,
        Concat => layout::concat(attrs, inputs, sym_gen)?,
        Gather => layout::gather(attrs, inputs)?,
        Split => return layout::split(attrs, inputs, sym_gen),
        Shape => layout::shape(inputs)?,
        Constant => constant(attrs)?,
    };

    Ok(vec![info])
}

/// Shape inference for operators whose single output has the same type and
/// shape as their first input.
fn unary(kind: OpKind, attrs: &Attrs, inputs: &[Input]) -> Result<ValueInfo, InferShapesError> {
    let [data] = inputs else {
        return Err(InferShapesError::IncorrectInputCount);
    };

    if matches!(kind, OpKind::Softmax | OpKind::LogSoftmax) {
        resolve_axis(data.ndim(), attrs.int("axis").unwrap_or(-1), "axis")?;
    }
    if kind == OpKind::Gelu {
        match attrs.string("approximate").unwrap_or("none") {
            "none" | "tanh" => {}
            other => {
                return Err(InferShapesError::attr(
                    "approximate",
                    format!("unknown approximation \"{}\"", other),
                ))
            }
        }
    }

    Ok(data.info.clone())
}

fn cast(attrs: &Attrs, inputs: &[Input]) -> Result<ValueInfo, InferShapesError> {
    let [data] = inputs else {
        return Err(InferShapesError::IncorrectInputCount);
    };
    let to = attrs.int("to").unwrap_or(0);
    let dtype = u8::try_from(to)
        .ok()
        .and_then(DataType::from_tag)
        .ok_or_else(|| InferShapesError::attr("to", format!("unknown data type tag {}", to)))?;
    Ok(ValueInfo::new(dtype, data.info.shape.clone()))
}

fn constant(attrs: &Attrs) -> Result<ValueInfo, InferShapesError> {
    attrs
        .tensor("value")
        .map(|value| value.info())
        .ok_or_else(|| InferShapesError::attr("value", "missing tensor value"))
}

/// Resolve an axis given as a value in `[-ndim, ndim-1]` to a zero-based
/// dimension index.
///
/// Negative axis values count backwards from the last dimension.
pub(crate) fn resolve_axis(ndim: usize, axis: i64, attr: &str) -> Result<usize, InferShapesError> {
    let resolved = if axis < 0 { axis + ndim as i64 } else { axis };
    if resolved < 0 || resolved >= ndim as i64 {
        return Err(InferShapesError::attr(
            attr,
            format!("axis {} is out of range for rank {}", axis, ndim),
        ));
    }
    Ok(resolved as usize)
}

/// Resolve a list of axes, rejecting duplicates.
pub(crate) fn resolve_axes(
    ndim: usize,
    axes: &[i64],
    attr: &str,
) -> Result<SmallVec<[usize; 4]>, InferShapesError> {
    let mut resolved = SmallVec::<[usize; 4]>::with_capacity(axes.len());
    for &axis in axes {
        let axis = resolve_axis(ndim, axis, attr)?;
        if resolved.contains(&axis) {
            return Err(InferShapesError::attr(
                attr,
                format!("axis {} is repeated", axis),
            ));
        }
        resolved.push(axis);
    }
    Ok(resolved)
}

/// Check that two inputs have the same element type.
fn same_dtype(a: &Input, b: &Input) -> Result<(), InferShapesError> {
    if a.dtype() != b.dtype() {
        return Err(InferShapesError::TypeMismatch {
            expected: a.dtype().to_string(),
            actual: b.dtype().to_string(),
        });
    }
    Ok(())
}

/// Return the product of a list of dimensions.
///
/// If any dimension is symbolic, the result is the sole symbolic dimension
/// when all others are 1, or a fresh symbol otherwise.
fn dim_product(dims: &[Dimension], sym_gen: &mut SymbolGen) -> Result<Dimension, InferShapesError> {
    if let Some(sizes) = fixed_shape(dims) {
        return element_count(&sizes)
            .map(Dimension::Fixed)
            .ok_or_else(|| InferShapesError::incompatible(&[dims], "element count overflows"));
    }
    let mut symbolic = dims.iter().filter(|d| d.fixed() != Some(1));
    let dim = match (symbolic.next(), symbolic.next()) {
        (Some(dim @ Dimension::Symbolic(_)), None) => dim.clone(),
        _ => sym_gen.gen(),
    };
    Ok(dim)
}

/// Run shape inference over every node in a graph.
///
/// Returns the inferred type and shape of every value which is a graph input,
/// an initializer or a node output.
pub fn infer_graph(
    inputs: &[TensorDesc],
    initializers: &BTreeMap<String, Initializer>,
    nodes: &[Node],
) -> Result<FxHashMap<String, ValueInfo>, ExportError> {
    let mut infos: FxHashMap<String, ValueInfo> = FxHashMap::default();
    let mut constants: FxHashMap<String, TensorData> = FxHashMap::default();
    let mut sym_gen = SymbolGen::new();

    for input in inputs {
        infos.insert(input.name.clone(), input.info());
    }
    for (name, init) in initializers {
        infos.insert(name.clone(), init.data.info());
    }

    for node in nodes {
        let node_ref = NodeRef::new(node.id, node.op.name());
        let mut node_inputs = Vec::with_capacity(node.inputs.len());
        for name in &node.inputs {
            let info = infos
                .get(name)
                .ok_or_else(|| ExportError::UseBeforeDefinition {
                    node: Some(node_ref.clone()),
                    name: name.clone(),
                })?;
            let constant = initializers
                .get(name)
                .map(|init| &init.data)
                .or_else(|| constants.get(name));
            node_inputs.push(Input { info, constant });
        }

        let outputs = infer_node(node.op, &node.attrs, &node_inputs, &mut sym_gen).map_err(|err| {
            err.into_export_error(
                node_ref.clone(),
                OpSchema::builtin(node.op).inputs,
                node.inputs.len(),
            )
        })?;
        if outputs.len() != node.outputs.len() {
            return Err(ExportError::malformed(
                crate::error::Invariant::InferredDescriptors,
                format!(
                    "{} has {} outputs but inference produced {}",
                    node_ref,
                    node.outputs.len(),
                    outputs.len()
                ),
            ));
        }

        if let (OpKind::Constant, Some(value)) = (node.op, node.attrs.tensor("value")) {
            constants.insert(node.outputs[0].clone(), value.clone());
        }
        for (name, info) in node.outputs.iter().zip(outputs) {
            infos.insert(name.clone(), info);
        }
    }

    Ok(infos)
}
