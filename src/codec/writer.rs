use crate::attrs::AttrValue;
use crate::error::ExportError;
use crate::graph::Graph;
use crate::number::LeBytes;
use crate::value::{Dimension, TensorData, TensorDesc};

use super::{DIM_FIXED, DIM_SYMBOLIC, SECTION_PROPERTIES, SECTION_PROVENANCE};

/// Write little-endian encoded values to a growable buffer.
#[derive(Default)]
pub(crate) struct ValueWriter {
    buf: Vec<u8>,
}

impl ValueWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn write<T: LeBytes>(&mut self, value: T) {
        self.buf.extend(value.to_le_bytes().as_ref());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Write a `u32` element count.
    pub fn write_count(&mut self, field: &str, count: usize) -> Result<(), ExportError> {
        let count = u32::try_from(count).map_err(|_| {
            ExportError::corrupt(field, format!("count {} exceeds the format limit", count))
        })?;
        self.write(count);
        Ok(())
    }

    /// Write a `u64` byte length.
    pub fn write_len(&mut self, len: usize) {
        self.write(len as u64);
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn write_string(&mut self, field: &str, s: &str) -> Result<(), ExportError> {
        self.write_count(field, s.len())?;
        self.write_bytes(s.as_bytes());
        Ok(())
    }

    /// Write an optional section, whose payload is produced by `f`.
    fn write_section(
        &mut self,
        tag: u32,
        f: impl FnOnce(&mut ValueWriter) -> Result<(), ExportError>,
    ) -> Result<(), ExportError> {
        let mut payload = ValueWriter::new();
        f(&mut payload)?;
        self.write(tag);
        self.write_len(payload.buf.len());
        self.write_bytes(&payload.buf);
        Ok(())
    }
}

pub(crate) fn write_body(writer: &mut ValueWriter, graph: &Graph) -> Result<(), ExportError> {
    writer.write_string("producer", &graph.metadata().producer)?;
    write_descs(writer, "inputs", graph.inputs())?;
    write_descs(writer, "outputs", graph.outputs())?;

    // Initializers are stored in a map ordered by name.
    writer.write_count("initializers", graph.initializers().len())?;
    for init in graph.initializers().values() {
        writer.write_string("initializer.name", &init.name)?;
        write_tensor(writer, "initializer", &init.data)?;
    }

    writer.write_count("nodes", graph.nodes().len())?;
    for node in graph.nodes() {
        writer.write(node.op.tag());
        for (field, refs) in [("node.inputs", &node.inputs), ("node.outputs", &node.outputs)] {
            writer.write_count(field, refs.len())?;
            for name in refs {
                writer.write_string(field, name)?;
            }
        }
        writer.write_count("node.attrs", node.attrs.len())?;
        for (name, value) in node.attrs.iter() {
            writer.write_string("attr.name", name)?;
            write_attr_value(writer, value)?;
        }
    }

    let provenance: Vec<_> = graph
        .nodes()
        .iter()
        .enumerate()
        .filter_map(|(i, node)| Some((i, node.provenance.as_deref()?)))
        .collect();
    let properties = &graph.metadata().properties;

    let section_count = usize::from(!provenance.is_empty()) + usize::from(!properties.is_empty());
    writer.write_count("sections", section_count)?;

    if !provenance.is_empty() {
        writer.write_section(SECTION_PROVENANCE, |w| {
            w.write_count("provenance", provenance.len())?;
            for (index, scope) in &provenance {
                w.write(*index as u32);
                w.write_string("provenance.scope", scope)?;
            }
            Ok(())
        })?;
    }
    if !properties.is_empty() {
        writer.write_section(SECTION_PROPERTIES, |w| {
            w.write_count("properties", properties.len())?;
            for (key, value) in properties {
                w.write_string("properties.key", key)?;
                w.write_string("properties.value", value)?;
            }
            Ok(())
        })?;
    }

    Ok(())
}

fn write_descs(
    writer: &mut ValueWriter,
    field: &str,
    descs: &[TensorDesc],
) -> Result<(), ExportError> {
    writer.write_count(field, descs.len())?;
    for desc in descs {
        writer.write_string(field, &desc.name)?;
        writer.write(desc.dtype.tag());
        writer.write_count(field, desc.shape.len())?;
        for dim in &desc.shape {
            match dim {
                Dimension::Fixed(size) => {
                    writer.write(DIM_FIXED);
                    writer.write_len(*size);
                }
                Dimension::Symbolic(name) => {
                    writer.write(DIM_SYMBOLIC);
                    writer.write_string(field, name)?;
                }
            }
        }
    }
    Ok(())
}

fn write_tensor(
    writer: &mut ValueWriter,
    field: &str,
    data: &TensorData,
) -> Result<(), ExportError> {
    writer.write(data.dtype().tag());
    writer.write_count(field, data.ndim())?;
    for &size in data.shape() {
        writer.write_len(size);
    }
    writer.write_len(data.bytes().len());
    writer.write_bytes(data.bytes());
    Ok(())
}

fn write_attr_value(writer: &mut ValueWriter, value: &AttrValue) -> Result<(), ExportError> {
    writer.write(value.attr_type().tag());
    match value {
        AttrValue::Int(x) => writer.write(*x),
        AttrValue::Float(x) => writer.write(*x),
        AttrValue::String(s) => writer.write_string("attr.value", s)?,
        AttrValue::Tensor(t) => write_tensor(writer, "attr.value", t)?,
        AttrValue::Ints(xs) => {
            writer.write_count("attr.value", xs.len())?;
            for &x in xs {
                writer.write(x);
            }
        }
        AttrValue::Floats(xs) => {
            writer.write_count("attr.value", xs.len())?;
            for &x in xs {
                writer.write(x);
            }
        }
        AttrValue::Strings(xs) => {
            writer.write_count("attr.value", xs.len())?;
            for s in xs {
                writer.write_string("attr.value", s)?;
            }
        }
    }
    Ok(())
}
