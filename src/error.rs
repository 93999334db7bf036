use std::error::Error;
use std::fmt::{Display, Formatter};

use crate::op_registry::Arity;
use crate::value::{format_shape, Shape};

/// Identifies the graph node that an error relates to.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeRef {
    /// Position of the node in the trace / graph.
    pub index: usize,

    /// Name of the operator.
    pub op: String,
}

impl NodeRef {
    pub fn new(index: usize, op: impl Into<String>) -> NodeRef {
        NodeRef {
            index,
            op: op.into(),
        }
    }
}

impl Display for NodeRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "node {} ({})", self.index, self.op)
    }
}

/// Structural invariants of a [`Graph`](crate::Graph) which are verified when
/// the graph is built.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Invariant {
    /// Node IDs match their positions in the node list.
    NodeIds,

    /// Graph inputs, initializers and node outputs have distinct names.
    UniqueNames,

    /// Each value is produced by at most one node, and never by a node if it
    /// is a graph input or initializer.
    SingleProducer,

    /// Each node input is a graph input, an initializer or the output of an
    /// earlier node.
    TopologicalOrder,

    /// Each graph output is defined by the graph.
    OutputsDefined,

    /// Nodes use supported operators with valid input counts and attributes.
    OperatorSchema,

    /// Initializer data is consistent with its element type and shape.
    InitializerData,

    /// The declared output descriptors match those produced by shape
    /// inference.
    InferredDescriptors,
}

impl Display for Invariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let desc = match self {
            Invariant::NodeIds => "node ids match positions",
            Invariant::UniqueNames => "value names are unique",
            Invariant::SingleProducer => "values have a single producer",
            Invariant::TopologicalOrder => "nodes are in topological order",
            Invariant::OutputsDefined => "graph outputs are defined",
            Invariant::OperatorSchema => "nodes match their operator schema",
            Invariant::InitializerData => "initializer data matches its descriptor",
            Invariant::InferredDescriptors => "output descriptors match inferred types",
        };
        f.write_str(desc)
    }
}

/// Errors that occur when capturing, validating, encoding or decoding a
/// graph.
///
/// Export is all-or-nothing. None of these errors are recoverable within a
/// single export, and a failed export never produces an artifact.
#[derive(Debug)]
#[non_exhaustive]
pub enum ExportError {
    /// The operator is not known, or not enabled in the registry in use.
    UnsupportedOperator {
        /// Index the node would have had in the trace.
        node: usize,
        op: String,
    },

    /// A value was consumed before it was produced.
    UseBeforeDefinition {
        node: Option<NodeRef>,
        name: String,
    },

    /// A value name was declared more than once.
    DuplicateName { name: String },

    /// Tensor shapes are inconsistent.
    ShapeMismatch {
        node: Option<NodeRef>,
        /// The conflicting shapes.
        shapes: Vec<Shape>,
        detail: String,
    },

    /// Element types or buffer sizes are inconsistent.
    TypeMismatch {
        node: Option<NodeRef>,
        expected: String,
        actual: String,
    },

    /// An attribute is unknown, has the wrong type, is missing or has an
    /// invalid value.
    InvalidAttribute {
        node: Option<NodeRef>,
        attr: String,
        error: String,
    },

    /// An operator was given more or fewer inputs than it accepts.
    InvalidInputCount {
        node: NodeRef,
        expected: Arity,
        actual: usize,
    },

    /// Independent validation of the assembled graph failed.
    MalformedGraph { invariant: Invariant, detail: String },

    /// The artifact's major format version is not supported.
    UnsupportedVersion { major: u16 },

    /// The artifact ended before a complete field could be read.
    TruncatedInput {
        /// Offset at which the read was attempted.
        offset: usize,
        /// Number of bytes needed.
        needed: usize,
        /// Number of bytes remaining.
        available: usize,
    },

    /// A field in the artifact has an invalid type tag, length or value.
    CorruptField { field: String, detail: String },

    /// The checksum footer does not match the artifact contents.
    ChecksumMismatch { expected: u64, actual: u64 },

    /// An error occurred reading or writing an artifact file.
    Io(std::io::Error),
}

/// Categories of [`ExportError`].
///
/// See [`ExportError::kind`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    UnsupportedOperator,
    UseBeforeDefinition,
    DuplicateName,
    ShapeMismatch,
    TypeMismatch,
    InvalidAttribute,
    InvalidInputCount,
    MalformedGraph,
    UnsupportedVersion,
    TruncatedInput,
    CorruptField,
    ChecksumMismatch,
    Io,
}

impl ExportError {
    /// Return the category of error.
    pub fn kind(&self) -> ErrorKind {
        type Kind = ErrorKind;

        match self {
            Self::UnsupportedOperator { .. } => Kind::UnsupportedOperator,
            Self::UseBeforeDefinition { .. } => Kind::UseBeforeDefinition,
            Self::DuplicateName { .. } => Kind::DuplicateName,
            Self::ShapeMismatch { .. } => Kind::ShapeMismatch,
            Self::TypeMismatch { .. } => Kind::TypeMismatch,
            Self::InvalidAttribute { .. } => Kind::InvalidAttribute,
            Self::InvalidInputCount { .. } => Kind::InvalidInputCount,
            Self::MalformedGraph { .. } => Kind::MalformedGraph,
            Self::UnsupportedVersion { .. } => Kind::UnsupportedVersion,
            Self::TruncatedInput { .. } => Kind::TruncatedInput,
            Self::CorruptField { .. } => Kind::CorruptField,
            Self::ChecksumMismatch { .. } => Kind::ChecksumMismatch,
            Self::Io(_) => Kind::Io,
        }
    }

    /// Return the node this error relates to, if any.
    pub fn node(&self) -> Option<&NodeRef> {
        match self {
            Self::UseBeforeDefinition { node, .. }
            | Self::ShapeMismatch { node, .. }
            | Self::TypeMismatch { node, .. }
            | Self::InvalidAttribute { node, .. } => node.as_ref(),
            Self::InvalidInputCount { node, .. } => Some(node),
            _ => None,
        }
    }

    /// Attach node context to an error which was raised without it.
    pub(crate) fn in_node(mut self, node_ref: NodeRef) -> ExportError {
        match &mut self {
            Self::UseBeforeDefinition { node, .. }
            | Self::ShapeMismatch { node, .. }
            | Self::TypeMismatch { node, .. }
            | Self::InvalidAttribute { node, .. } => {
                node.get_or_insert(node_ref);
            }
            _ => {}
        }
        self
    }

    pub(crate) fn corrupt(field: impl Into<String>, detail: impl Into<String>) -> ExportError {
        ExportError::CorruptField {
            field: field.into(),
            detail: detail.into(),
        }
    }

    pub(crate) fn malformed(invariant: Invariant, detail: impl Into<String>) -> ExportError {
        ExportError::MalformedGraph {
            invariant,
            detail: detail.into(),
        }
    }
}

impl Display for ExportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(node) = self.node() {
            write!(f, "in {}: ", node)?;
        }

        match self {
            Self::UnsupportedOperator { node, op } => {
                write!(f, "unsupported operator \"{}\" at node {}", op, node)
            }
            Self::UseBeforeDefinition { name, .. } => {
                write!(f, "value \"{}\" is used before it is defined", name)
            }
            Self::DuplicateName { name } => write!(f, "value \"{}\" is already declared", name),
            Self::ShapeMismatch { shapes, detail, .. } => {
                let shapes: Vec<String> = shapes.iter().map(|s| format_shape(s)).collect();
                write!(f, "shape mismatch between {}: {}", shapes.join(" and "), detail)
            }
            Self::TypeMismatch {
                expected, actual, ..
            } => write!(f, "type mismatch: expected {}, got {}", expected, actual),
            Self::InvalidAttribute { attr, error, .. } => {
                write!(f, "error in attribute \"{}\": {}", attr, error)
            }
            Self::InvalidInputCount {
                expected, actual, ..
            } => write!(f, "expected {} inputs but got {}", expected, actual),
            Self::MalformedGraph { invariant, detail } => {
                write!(f, "malformed graph ({}): {}", invariant, detail)
            }
            Self::UnsupportedVersion { major } => {
                write!(f, "unsupported format major version {}", major)
            }
            Self::TruncatedInput {
                offset,
                needed,
                available,
            } => write!(
                f,
                "input truncated at offset {}: needed {} bytes but {} remain",
                offset, needed, available
            ),
            Self::CorruptField { field, detail } => {
                write!(f, "corrupt field \"{}\": {}", field, detail)
            }
            Self::ChecksumMismatch { expected, actual } => write!(
                f,
                "checksum mismatch: expected {:016x}, got {:016x}",
                expected, actual
            ),
            Self::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl Error for ExportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ExportError {
    fn from(val: std::io::Error) -> ExportError {
        ExportError::Io(val)
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorKind, ExportError, Invariant, NodeRef};
    use crate::dims;

    #[test]
    fn test_display_with_node() {
        let err = ExportError::ShapeMismatch {
            node: Some(NodeRef::new(3, "Add")),
            shapes: vec![dims![2, 3], dims![4, 5]],
            detail: "dimension sizes 3 and 5 cannot be broadcast".into(),
        };
        assert_eq!(
            err.to_string(),
            "in node 3 (Add): shape mismatch between [2, 3] and [4, 5]: dimension sizes 3 and 5 cannot be broadcast"
        );
        assert_eq!(err.kind(), ErrorKind::ShapeMismatch);
    }

    #[test]
    fn test_in_node_keeps_existing_context() {
        let err = ExportError::TypeMismatch {
            node: Some(NodeRef::new(1, "Relu")),
            expected: "f32".into(),
            actual: "i64".into(),
        }
        .in_node(NodeRef::new(7, "Add"));
        assert_eq!(err.node(), Some(&NodeRef::new(1, "Relu")));

        let err = ExportError::UseBeforeDefinition {
            node: None,
            name: "x".into(),
        }
        .in_node(NodeRef::new(7, "Add"));
        assert_eq!(err.node(), Some(&NodeRef::new(7, "Add")));
    }

    #[test]
    fn test_malformed_display() {
        let err = ExportError::malformed(Invariant::TopologicalOrder, "node 1 consumes \"t2\"");
        assert_eq!(
            err.to_string(),
            "malformed graph (nodes are in topological order): node 1 consumes \"t2\""
        );
    }
}
