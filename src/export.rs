//! Driving a full export: trace, build, encode and write.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[cfg(feature = "mmap")]
use memmap2::Mmap;
use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::codec::{self, EncodeOptions};
use crate::diagnostics::{DiagnosticLevel, Diagnostics};
use crate::error::{ExportError, Invariant};
use crate::graph::{Graph, GraphBuilder};
use crate::op_registry::OpRegistry;
use crate::threading::export_pool;
use crate::tracer::{Tracer, Value};
use crate::value::TensorData;

/// A model which can be exported.
///
/// Implementations enumerate their learned parameters and describe their
/// computation by applying operators to a [`Tracer`].
pub trait Module {
    /// Return the model's parameters, in a stable order.
    fn parameters(&self) -> Vec<(&str, &TensorData)>;

    /// Apply the model's operators to `inputs` and return its outputs.
    ///
    /// Parameters returned by [`parameters`](Module::parameters) are
    /// registered before this is called and can be looked up with
    /// [`Tracer::param`].
    fn forward(&self, tracer: &mut Tracer<'_>, inputs: &[Value]) -> Result<Vec<Value>, ExportError>;
}

/// Options which customize an export.
#[derive(Clone, Debug)]
pub struct ExportOptions {
    registry: Option<Arc<OpRegistry>>,
    producer: String,
    checksum: bool,
    dynamic_dims: FxHashMap<String, Vec<(usize, String)>>,
    output_names: Vec<String>,
    keep_unused_parameters: bool,
    properties: BTreeMap<String, String>,
    diagnostics: Option<DiagnosticLevel>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        ExportOptions {
            registry: None,
            producer: format!("gcap {}", env!("CARGO_PKG_VERSION")),
            checksum: true,
            dynamic_dims: FxHashMap::default(),
            output_names: Vec::new(),
            keep_unused_parameters: false,
            properties: BTreeMap::new(),
            diagnostics: None,
        }
    }
}

impl ExportOptions {
    /// Create options with all built-in operators enabled.
    pub fn new() -> ExportOptions {
        ExportOptions::default()
    }

    /// Create options which only allow operators in `registry`.
    pub fn with_ops(registry: Arc<OpRegistry>) -> ExportOptions {
        ExportOptions {
            registry: Some(registry),
            ..Default::default()
        }
    }

    /// Return the operator registry used by the export.
    pub fn registry(&self) -> &OpRegistry {
        self.registry.as_deref().unwrap_or(OpRegistry::global())
    }

    /// Set the name of the tool recorded in the graph's metadata.
    pub fn producer(&mut self, producer: &str) -> &mut Self {
        self.producer = producer.to_string();
        self
    }

    /// Set whether a checksum footer is written. Enabled by default.
    pub fn checksum(&mut self, enable: bool) -> &mut Self {
        self.checksum = enable;
        self
    }

    /// Mark dimension `axis` of input `input` as dynamic, with name `symbol`.
    pub fn dynamic_dim(&mut self, input: &str, axis: usize, symbol: &str) -> &mut Self {
        self.dynamic_dims
            .entry(input.to_string())
            .or_default()
            .push((axis, symbol.to_string()));
        self
    }

    /// Set the names of the graph outputs.
    ///
    /// By default a single output is named "output" and multiple outputs are
    /// named "output_0", "output_1" and so on.
    pub fn output_names<S: AsRef<str>>(&mut self, names: &[S]) -> &mut Self {
        self.output_names = names.iter().map(|n| n.as_ref().to_string()).collect();
        self
    }

    /// Set whether parameters which no node uses are kept. By default they
    /// are removed.
    pub fn keep_unused_parameters(&mut self, keep: bool) -> &mut Self {
        self.keep_unused_parameters = keep;
        self
    }

    /// Add a metadata property.
    pub fn property(&mut self, key: &str, value: &str) -> &mut Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }

    /// Set the diagnostics level. By default this is determined by the
    /// `GCAP_VERBOSE` environment variable.
    pub fn diagnostics(&mut self, level: DiagnosticLevel) -> &mut Self {
        self.diagnostics = Some(level);
        self
    }

    fn diagnostics_level(&self) -> DiagnosticLevel {
        self.diagnostics
            .unwrap_or_else(|| Diagnostics::from_env().level())
    }

    fn resolve_output_names(&self, count: usize) -> Result<Vec<String>, ExportError> {
        if self.output_names.is_empty() {
            return Ok(match count {
                1 => vec!["output".to_string()],
                _ => (0..count).map(|i| format!("output_{}", i)).collect(),
            });
        }
        if self.output_names.len() != count {
            return Err(ExportError::malformed(
                Invariant::OutputsDefined,
                format!(
                    "{} output names were given but the model produced {} outputs",
                    self.output_names.len(),
                    count
                ),
            ));
        }
        Ok(self.output_names.clone())
    }
}

/// Trace `module` with sample inputs and return the validated graph.
///
/// `samples` gives the name and sample data of each graph input, in order.
/// Only the operators applied for these samples are recorded. See the
/// [tracer](crate::tracer) module docs.
pub fn export<S: AsRef<str>>(
    module: &dyn Module,
    samples: &[(S, TensorData)],
    options: &ExportOptions,
) -> Result<Graph, ExportError> {
    let registry = options.registry();
    let level = options.diagnostics_level();
    let mut tracer = Tracer::with_diagnostics(registry, Diagnostics::new(level));
    tracer.set_keep_unused_parameters(options.keep_unused_parameters);

    for (name, data) in module.parameters() {
        tracer.add_parameter(name, data.clone())?;
    }

    let sample_names: Vec<&str> = samples.iter().map(|(name, _)| name.as_ref()).collect();
    if let Some(name) = options
        .dynamic_dims
        .keys()
        .find(|name| !sample_names.contains(&name.as_str()))
    {
        return Err(ExportError::UseBeforeDefinition {
            node: None,
            name: name.clone(),
        });
    }

    let mut inputs = Vec::with_capacity(samples.len());
    for (&name, (_, sample)) in sample_names.iter().zip(samples) {
        let dynamic: Vec<(usize, &str)> = options
            .dynamic_dims
            .get(name)
            .map(|dims| dims.iter().map(|(axis, sym)| (*axis, sym.as_str())).collect())
            .unwrap_or_default();
        inputs.push(tracer.add_dynamic_input(name, sample.clone(), &dynamic)?);
    }

    let outputs = module.forward(&mut tracer, &inputs)?;
    let output_names = options.resolve_output_names(outputs.len())?;
    let named_outputs: Vec<(&str, &Value)> = output_names
        .iter()
        .map(|name| name.as_str())
        .zip(&outputs)
        .collect();
    let trace = tracer.finish(&named_outputs)?;

    let mut builder = GraphBuilder::from_trace(trace);
    builder.set_producer(&options.producer);
    for (key, value) in &options.properties {
        builder.set_property(key, value);
    }
    let graph = builder.build(registry)?;

    Diagnostics::new(level).info(
        "export",
        format_args!(
            "built graph with {} nodes and {} initializers ({} parameters)",
            graph.nodes().len(),
            graph.initializers().len(),
            graph.parameter_count()
        ),
    );

    Ok(graph)
}

/// Export `module` and encode the graph as an artifact.
pub fn export_to_bytes<S: AsRef<str>>(
    module: &dyn Module,
    samples: &[(S, TensorData)],
    options: &ExportOptions,
) -> Result<Vec<u8>, ExportError> {
    let graph = export(module, samples, options)?;
    encode(&graph, options)
}

fn encode(graph: &Graph, options: &ExportOptions) -> Result<Vec<u8>, ExportError> {
    let bytes = codec::encode(
        graph,
        &EncodeOptions {
            checksum: options.checksum,
        },
    )?;
    Diagnostics::new(options.diagnostics_level()).info(
        "export",
        format_args!("encoded artifact of {} bytes", bytes.len()),
    );
    Ok(bytes)
}

/// Export `module` and write the artifact to `path`.
///
/// The artifact is written to a temporary file next to `path`, flushed to
/// disk and then renamed, so `path` either holds a complete artifact or is
/// left untouched. Nothing is written if the export fails.
pub fn export_to_file<S: AsRef<str>>(
    module: &dyn Module,
    samples: &[(S, TensorData)],
    path: impl AsRef<Path>,
    options: &ExportOptions,
) -> Result<Graph, ExportError> {
    let graph = export(module, samples, options)?;
    let bytes = encode(&graph, options)?;
    write_atomic(path.as_ref(), &bytes)?;
    Ok(graph)
}

/// Return a path for a temporary file in the same directory as `path`.
///
/// The name includes the process ID and a per-process counter, so concurrent
/// exports to the same path do not share a temporary file.
fn temp_path(path: &Path) -> Result<PathBuf, ExportError> {
    static NEXT_TEMP_ID: AtomicU64 = AtomicU64::new(0);

    let Some(file_name) = path.file_name() else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} is not a file path", path.display()),
        )
        .into());
    };
    let id = NEXT_TEMP_ID.fetch_add(1, Ordering::Relaxed);
    let mut temp_name = std::ffi::OsString::from(".");
    temp_name.push(file_name);
    temp_name.push(format!(".{}.{}.tmp", std::process::id(), id));
    Ok(path.with_file_name(temp_name))
}

/// Write `bytes` to `path` via a temporary file and a rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ExportError> {
    let temp = temp_path(path)?;
    let write = || -> std::io::Result<()> {
        let mut file = File::create(&temp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        std::fs::rename(&temp, path)
    };
    write().map_err(|err| {
        let _ = std::fs::remove_file(&temp);
        err.into()
    })
}

/// Read and decode an artifact file.
pub fn decode_file(path: impl AsRef<Path>) -> Result<Graph, ExportError> {
    let data = std::fs::read(path)?;
    codec::decode(&data)
}

/// Decode an artifact file by mapping a view of it as memory.
///
/// This method requires the `mmap` crate feature to be enabled.
///
/// # Safety
///
/// The file must not be modified while it is being decoded. See
/// [`memmap2::Mmap::map`].
#[cfg(feature = "mmap")]
pub unsafe fn decode_mmap(path: impl AsRef<Path>) -> Result<Graph, ExportError> {
    let file = File::open(path)?;
    let mmap = Mmap::map(&file)?;
    codec::decode(&mmap)
}

/// One export run by [`export_batch`].
pub struct ExportJob<'a> {
    pub module: &'a (dyn Module + Sync),
    pub samples: Vec<(String, TensorData)>,
    pub options: ExportOptions,
}

/// Export several models in parallel and return their artifacts.
///
/// Each job has its own tracer and graph, so jobs are independent and the
/// failure of one does not affect the others. Results are returned in the
/// same order as `jobs`. Jobs run in the [`export_pool`].
pub fn export_batch(jobs: &[ExportJob]) -> Vec<Result<Vec<u8>, ExportError>> {
    export_pool().run(|| {
        jobs.par_iter()
            .map(|job| export_to_bytes(job.module, &job.samples, &job.options))
            .collect()
    })
}
