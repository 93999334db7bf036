//! gcap captures computation graphs by tracing model code and exports them to
//! a versioned binary format.
//!
//! # Exporting models
//!
//! The basic workflow is:
//!
//! 1. Implement [`Module`] for the model. The implementation enumerates the
//!    model's parameters and describes its computation by applying operators
//!    to a [`Tracer`].
//! 2. Prepare sample inputs with the shapes and element types the model
//!    expects.
//! 3. Call [`export_to_file`] (or [`export`] / [`export_to_bytes`]) with the
//!    module, the samples and [`ExportOptions`].
//!
//! Export is all-or-nothing. Each operator application is checked against the
//! [`OpRegistry`] and has the type and shape of its outputs inferred as it is
//! recorded. The assembled graph is then validated independently by a
//! [`GraphBuilder`] before it is encoded. Any failure produces an
//! [`ExportError`] and no artifact.
//!
//! ```
//! use gcap::{export_to_bytes, ExportError, ExportOptions, Module, TensorData, Tracer, Value};
//!
//! struct AddRelu {
//!     bias: TensorData,
//! }
//!
//! impl Module for AddRelu {
//!     fn parameters(&self) -> Vec<(&str, &TensorData)> {
//!         vec![("bias", &self.bias)]
//!     }
//!
//!     fn forward(&self, tracer: &mut Tracer, inputs: &[Value]) -> Result<Vec<Value>, ExportError> {
//!         let bias = tracer.param("bias")?;
//!         let sum = tracer.binary("Add", &inputs[0], &bias)?;
//!         Ok(vec![tracer.unary("Relu", &sum)?])
//!     }
//! }
//!
//! let model = AddRelu { bias: TensorData::from_vec(&[4], vec![0.5f32; 4]) };
//! let sample = TensorData::from_vec(&[1, 4], vec![1.0f32, -1.0, 2.0, -2.0]);
//! let artifact = export_to_bytes(&model, &[("input", sample)], &ExportOptions::new())?;
//!
//! let graph = gcap::codec::decode(&artifact)?;
//! assert_eq!(graph.nodes().len(), 2);
//! # Ok::<_, ExportError>(())
//! ```
//!
//! # Control flow
//!
//! Tracing records the single execution path that the model code takes for
//! the given sample inputs. Branches and loops in model code are unrolled or
//! resolved at trace time, and the exported graph contains no control-flow
//! operators. Model code that reads sample data with
//! [`Tracer::sample_value`] triggers a warning, since a different sample could
//! have produced a different graph.
//!
//! # Artifact format
//!
//! See the [`codec`] module for the binary layout. Artifacts carry a major and
//! minor format version. Readers reject artifacts with a different major
//! version and skip optional sections they do not recognize.
//!
//! # Diagnostics
//!
//! Warnings are printed to stderr. Set `GCAP_VERBOSE=1` to also print each
//! recorded node and a summary of each export, or use
//! [`ExportOptions::diagnostics`].

mod attrs;
pub mod codec;
mod diagnostics;
mod env;
mod error;
mod export;
mod graph;
pub mod header;
pub mod infer_shapes;
mod number;
mod op_registry;
pub mod threading;
pub mod tracer;
mod value;
mod value_store;

pub use attrs::{AttrType, AttrValue, Attrs};
pub use diagnostics::{DiagnosticLevel, Diagnostics};
pub use error::{ErrorKind, ExportError, Invariant, NodeRef};
#[cfg(feature = "mmap")]
pub use export::decode_mmap;
pub use export::{
    decode_file, export, export_batch, export_to_bytes, export_to_file, ExportJob, ExportOptions,
    Module,
};
pub use graph::{Graph, GraphBuilder, GraphMetadata, Initializer, Node};
pub use number::{DataTypeOf, Element};
pub use op_registry::{Arity, AttrSpec, OpKind, OpRegistry, OpSchema, TypeConstraint};
pub use tracer::{Operand, Trace, Tracer, Value};
pub use value::{format_shape, DataType, Dimension, Shape, TensorData, TensorDesc, ValueInfo};
pub use value_store::ValueStore;
