use std::fmt;
use std::sync::OnceLock;

use rustc_hash::FxHashMap;

use crate::attrs::{AttrType, Attrs};
use crate::error::{ExportError, NodeRef};
use crate::value::DataType;

macro_rules! declare_ops {
    ($($name:ident = $tag:literal),* $(,)?) => {
        /// Enum of all operator kinds that can appear in a graph.
        ///
        /// Each kind has a stable numeric tag which identifies it in
        /// serialized artifacts. New kinds must use new tags.
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum OpKind {
            $($name),*
        }

        impl OpKind {
            /// All operator kinds, in declaration order.
            pub const ALL: &'static [OpKind] = &[$(OpKind::$name),*];

            /// Return the operator name, eg. "MatMul".
            pub fn name(self) -> &'static str {
                match self {
                    $(OpKind::$name => stringify!($name)),*
                }
            }

            /// Return the tag used to identify this operator in serialized
            /// artifacts.
            pub fn tag(self) -> u16 {
                match self {
                    $(OpKind::$name => $tag),*
                }
            }

            pub fn from_name(name: &str) -> Option<OpKind> {
                match name {
                    $(stringify!($name) => Some(OpKind::$name),)*
                    _ => None,
                }
            }

            pub fn from_tag(tag: u16) -> Option<OpKind> {
                match tag {
                    $($tag => Some(OpKind::$name),)*
                    _ => None,
                }
            }
        }
    };
}

declare_ops! {
    Abs = 1,
    Add = 2,
    ArgMax = 3,
    AveragePool = 4,
    BatchNormalization = 5,
    Cast = 6,
    Clip = 7,
    Concat = 8,
    Constant = 9,
    Conv = 10,
    Div = 11,
    Equal = 12,
    Erf = 13,
    Exp = 14,
    Flatten = 15,
    Gather = 16,
    Gelu = 17,
    Gemm = 18,
    GlobalAveragePool = 19,
    Greater = 20,
    Identity = 21,
    LeakyRelu = 22,
    Less = 23,
    Log = 24,
    LogSoftmax = 25,
    MatMul = 26,
    MaxPool = 27,
    Mul = 28,
    Neg = 29,
    Pow = 30,
    ReduceMax = 31,
    ReduceMean = 32,
    ReduceMin = 33,
    ReduceSum = 34,
    Relu = 35,
    Reshape = 36,
    Shape = 37,
    Sigmoid = 38,
    Softmax = 39,
    Split = 40,
    Sqrt = 41,
    Squeeze = 42,
    Sub = 43,
    Tanh = 44,
    Transpose = 45,
    Unsqueeze = 46,
    Where = 47,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Number of inputs or outputs an operator accepts.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Arity {
    Fixed(usize),
    /// Inclusive range.
    Range(usize, usize),
    /// Variadic, with a minimum count.
    AtLeast(usize),
}

impl Arity {
    pub fn contains(self, count: usize) -> bool {
        match self {
            Arity::Fixed(n) => count == n,
            Arity::Range(min, max) => (min..=max).contains(&count),
            Arity::AtLeast(min) => count >= min,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Fixed(n) => write!(f, "{}", n),
            Arity::Range(min, max) => write!(f, "{} to {}", min, max),
            Arity::AtLeast(min) => write!(f, "at least {}", min),
        }
    }
}

/// Constraint on the element type of an operator's first input.
///
/// Constraints on other inputs (eg. that both operands of `Add` have the same
/// type, or that `Gather` indices are integers) are checked during shape
/// inference.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TypeConstraint {
    Any,
    Float,
    Numeric,
}

impl TypeConstraint {
    pub fn allows(self, dtype: DataType) -> bool {
        match self {
            TypeConstraint::Any => true,
            TypeConstraint::Float => dtype.is_float(),
            TypeConstraint::Numeric => dtype.is_numeric(),
        }
    }
}

impl fmt::Display for TypeConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let desc = match self {
            TypeConstraint::Any => "any type",
            TypeConstraint::Float => "a float type",
            TypeConstraint::Numeric => "a numeric type",
        };
        f.write_str(desc)
    }
}

/// Name and type of an attribute accepted by an operator.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AttrSpec {
    pub name: &'static str,
    pub ty: AttrType,
    pub required: bool,
}

const fn opt(name: &'static str, ty: AttrType) -> AttrSpec {
    AttrSpec {
        name,
        ty,
        required: false,
    }
}

const fn req(name: &'static str, ty: AttrType) -> AttrSpec {
    AttrSpec {
        name,
        ty,
        required: true,
    }
}

const NO_ATTRS: &[AttrSpec] = &[];
const AXIS: &[AttrSpec] = &[opt("axis", AttrType::Int)];
const REDUCE_ATTRS: &[AttrSpec] = &[opt("axes", AttrType::Ints), opt("keepdims", AttrType::Int)];
const ARGMAX_ATTRS: &[AttrSpec] = &[opt("axis", AttrType::Int), opt("keepdims", AttrType::Int)];
const CONV_ATTRS: &[AttrSpec] = &[
    opt("dilations", AttrType::Ints),
    opt("group", AttrType::Int),
    opt("kernel_shape", AttrType::Ints),
    opt("pads", AttrType::Ints),
    opt("strides", AttrType::Ints),
];
const POOL_ATTRS: &[AttrSpec] = &[
    opt("ceil_mode", AttrType::Int),
    req("kernel_shape", AttrType::Ints),
    opt("pads", AttrType::Ints),
    opt("strides", AttrType::Ints),
];
const GEMM_ATTRS: &[AttrSpec] = &[
    opt("alpha", AttrType::Float),
    opt("beta", AttrType::Float),
    opt("transA", AttrType::Int),
    opt("transB", AttrType::Int),
];
const BATCH_NORM_ATTRS: &[AttrSpec] = &[
    opt("epsilon", AttrType::Float),
    opt("momentum", AttrType::Float),
];
const LEAKY_RELU_ATTRS: &[AttrSpec] = &[opt("alpha", AttrType::Float)];
const GELU_ATTRS: &[AttrSpec] = &[opt("approximate", AttrType::String)];
const CAST_ATTRS: &[AttrSpec] = &[req("to", AttrType::Int)];
const RESHAPE_ATTRS: &[AttrSpec] = &[opt("shape", AttrType::Ints)];
const TRANSPOSE_ATTRS: &[AttrSpec] = &[opt("perm", AttrType::Ints)];
const SQUEEZE_ATTRS: &[AttrSpec] = &[opt("axes", AttrType::Ints)];
const UNSQUEEZE_ATTRS: &[AttrSpec] = &[req("axes", AttrType::Ints)];
const CONCAT_ATTRS: &[AttrSpec] = &[req("axis", AttrType::Int)];
const CONSTANT_ATTRS: &[AttrSpec] = &[req("value", AttrType::Tensor)];
const SPLIT_ATTRS: &[AttrSpec] = &[
    opt("axis", AttrType::Int),
    opt("num_outputs", AttrType::Int),
    opt("split", AttrType::Ints),
];

/// Schema for an operator kind.
#[derive(Clone, Debug, PartialEq)]
pub struct OpSchema {
    pub kind: OpKind,
    pub inputs: Arity,
    pub outputs: Arity,

    /// Constraint on the element type of the first input.
    pub types: TypeConstraint,
    pub attrs: &'static [AttrSpec],
}

impl OpSchema {
    /// Return the built-in schema for an operator kind.
    pub fn builtin(kind: OpKind) -> OpSchema {
        use Arity::{AtLeast, Fixed, Range};
        use OpKind::*;
        use TypeConstraint as T;

        let one = Fixed(1);

        let (inputs, outputs, types, attrs): (Arity, Arity, TypeConstraint, &'static [AttrSpec]) =
            match kind {
                Abs | Neg | Relu => (one, one, T::Numeric, NO_ATTRS),
                Sigmoid | Tanh | Exp | Log | Sqrt | Erf => (one, one, T::Float, NO_ATTRS),
                Identity => (one, one, T::Any, NO_ATTRS),
                LeakyRelu => (one, one, T::Float, LEAKY_RELU_ATTRS),
                Gelu => (one, one, T::Float, GELU_ATTRS),
                Clip => (Range(1, 3), one, T::Numeric, NO_ATTRS),
                Add | Sub | Mul | Div | Pow | Less | Greater => (Fixed(2), one, T::Numeric, NO_ATTRS),
                Equal => (Fixed(2), one, T::Any, NO_ATTRS),
                Where => (Fixed(3), one, T::Any, NO_ATTRS),
                Cast => (one, one, T::Any, CAST_ATTRS),
                MatMul => (Fixed(2), one, T::Numeric, NO_ATTRS),
                Gemm => (Range(2, 3), one, T::Numeric, GEMM_ATTRS),
                Conv => (Range(2, 3), one, T::Float, CONV_ATTRS),
                MaxPool | AveragePool => (one, one, T::Float, POOL_ATTRS),
                GlobalAveragePool => (one, one, T::Float, NO_ATTRS),
                BatchNormalization => (Fixed(5), one, T::Float, BATCH_NORM_ATTRS),
                ReduceMean | ReduceSum | ReduceMax | ReduceMin => (one, one, T::Numeric, REDUCE_ATTRS),
                ArgMax => (one, one, T::Numeric, ARGMAX_ATTRS),
                Reshape => (Range(1, 2), one, T::Any, RESHAPE_ATTRS),
                Flatten => (one, one, T::Any, AXIS),
                Transpose => (one, one, T::Any, TRANSPOSE_ATTRS),
                Squeeze => (one, one, T::Any, SQUEEZE_ATTRS),
                Unsqueeze => (one, one, T::Any, UNSQUEEZE_ATTRS),
                Concat => (AtLeast(1), one, T::Any, CONCAT_ATTRS),
                Gather => (Fixed(2), one, T::Any, AXIS),
                Split => (one, AtLeast(1), T::Any, SPLIT_ATTRS),
                Shape => (one, one, T::Any, NO_ATTRS),
                Softmax | LogSoftmax => (one, one, T::Float, AXIS),
                Constant => (Fixed(0), one, T::Any, CONSTANT_ATTRS),
            };

        OpSchema {
            kind,
            inputs,
            outputs,
            types,
            attrs,
        }
    }

    /// Return the spec for an attribute accepted by this operator.
    pub fn attr(&self, name: &str) -> Option<&AttrSpec> {
        self.attrs.iter().find(|spec| spec.name == name)
    }

    /// Check that `attrs` contains only known attributes of the right types,
    /// and all required attributes.
    pub fn validate_attrs(&self, attrs: &Attrs) -> Result<(), ExportError> {
        let attr_error = |attr: &str, error: String| ExportError::InvalidAttribute {
            node: None,
            attr: attr.to_string(),
            error,
        };

        for (name, value) in attrs.iter() {
            let Some(spec) = self.attr(name) else {
                return Err(attr_error(
                    name,
                    format!("not an attribute of {}", self.kind),
                ));
            };
            if spec.ty != value.attr_type() {
                return Err(attr_error(
                    name,
                    format!("expected {} but got {}", spec.ty, value.attr_type()),
                ));
            }
        }

        if let Some(missing) = self
            .attrs
            .iter()
            .find(|spec| spec.required && attrs.get(spec.name).is_none())
        {
            return Err(attr_error(missing.name, "required attribute is missing".into()));
        }

        Ok(())
    }

    /// Check the input count and attributes of an application of this
    /// operator.
    pub(crate) fn check_node(
        &self,
        node: &NodeRef,
        input_count: usize,
        attrs: &Attrs,
    ) -> Result<(), ExportError> {
        if !self.inputs.contains(input_count) {
            return Err(ExportError::InvalidInputCount {
                node: node.clone(),
                expected: self.inputs,
                actual: input_count,
            });
        }
        self.validate_attrs(attrs)
            .map_err(|err| err.in_node(node.clone()))
    }

    /// Check the element type of the first input against this operator's
    /// type constraint.
    pub(crate) fn check_input_type(
        &self,
        node: &NodeRef,
        dtype: DataType,
    ) -> Result<(), ExportError> {
        if self.types.allows(dtype) {
            return Ok(());
        }
        Err(ExportError::TypeMismatch {
            node: Some(node.clone()),
            expected: self.types.to_string(),
            actual: dtype.to_string(),
        })
    }
}

/// Table of operators which may be used in graphs.
///
/// New registries have no operators registered. To create a registry with all
/// built-in operators, use [`OpRegistry::with_all_ops`] or the shared
/// [`OpRegistry::global`] instance. A registry with a subset of operators can
/// be used to guarantee that exported graphs only use operators which a
/// particular consumer supports.
///
/// Registries are not modified once an export begins, so one registry can be
/// shared by any number of concurrent exports.
#[derive(Clone, Debug, Default)]
pub struct OpRegistry {
    ops: FxHashMap<OpKind, OpSchema>,
}

impl OpRegistry {
    /// Create a new empty registry.
    pub fn new() -> OpRegistry {
        OpRegistry::default()
    }

    /// Create a new registry with all built-in operators registered.
    pub fn with_all_ops() -> OpRegistry {
        let mut reg = OpRegistry::new();
        for &kind in OpKind::ALL {
            reg.register(kind);
        }
        reg
    }

    /// Return the process-wide registry with all built-in operators.
    pub fn global() -> &'static OpRegistry {
        static REGISTRY: OnceLock<OpRegistry> = OnceLock::new();
        REGISTRY.get_or_init(OpRegistry::with_all_ops)
    }

    /// Register the built-in schema for an operator.
    pub fn register(&mut self, kind: OpKind) -> &mut Self {
        self.ops.insert(kind, OpSchema::builtin(kind));
        self
    }

    /// Look up the schema for an operator kind.
    pub fn lookup(&self, kind: OpKind) -> Option<&OpSchema> {
        self.ops.get(&kind)
    }

    /// Look up the schema for an operator by name.
    pub fn lookup_name(&self, name: &str) -> Option<&OpSchema> {
        OpKind::from_name(name).and_then(|kind| self.lookup(kind))
    }

    pub fn is_supported(&self, kind: OpKind) -> bool {
        self.ops.contains_key(&kind)
    }

    /// Return the registered operator kinds in tag order.
    pub fn kinds(&self) -> Vec<OpKind> {
        let mut kinds: Vec<_> = self.ops.keys().copied().collect();
        kinds.sort_by_key(|k| k.tag());
        kinds
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Look up an operator by name for the node at index `node`, failing
    /// with [`ExportError::UnsupportedOperator`] if it is not registered.
    pub(crate) fn resolve(&self, op: &str, node: usize) -> Result<&OpSchema, ExportError> {
        self.lookup_name(op)
            .ok_or_else(|| ExportError::UnsupportedOperator {
                node,
                op: op.to_string(),
            })
    }
}
