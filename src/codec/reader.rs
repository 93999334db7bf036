use std::collections::BTreeMap;

use crate::attrs::{AttrType, AttrValue, Attrs};
use crate::error::ExportError;
use crate::graph::Node;
use crate::number::LeBytes;
use crate::op_registry::OpKind;
use crate::value::{DataType, Dimension, Shape, TensorData, TensorDesc};

use super::{DIM_FIXED, DIM_SYMBOLIC, SECTION_PROPERTIES, SECTION_PROVENANCE};

/// Read little-endian encoded values from a byte buffer.
///
/// Reads past the end of the buffer fail with
/// [`ExportError::TruncatedInput`]. Offsets in errors are relative to the
/// start of the artifact.
pub(crate) struct ValueReader<'a> {
    pos: usize,
    base: usize,
    buf: &'a [u8],
}

impl<'a> ValueReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self::with_offset(buf, 0)
    }

    /// Create a reader for a slice which starts at offset `base` in the
    /// artifact.
    pub fn with_offset(buf: &'a [u8], base: usize) -> Self {
        Self { pos: 0, base, buf }
    }

    /// Return the offset of the next byte in the artifact.
    pub fn offset(&self) -> usize {
        self.base + self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn truncated(&self, needed: usize) -> ExportError {
        ExportError::TruncatedInput {
            offset: self.offset(),
            needed,
            available: self.remaining(),
        }
    }

    /// Return the next `len` bytes from the buffer.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ExportError> {
        let chunk = self
            .pos
            .checked_add(len)
            .and_then(|end| self.buf.get(self.pos..end))
            .ok_or_else(|| self.truncated(len))?;
        self.pos += len;
        Ok(chunk)
    }

    /// Return the next N bytes from the buffer.
    pub fn read_n<const N: usize>(&mut self) -> Result<[u8; N], ExportError> {
        let chunk = self.read_bytes(N)?;
        Ok(chunk.try_into().unwrap())
    }

    /// Read a little-endian encoded value.
    pub fn read<T: LeBytes>(&mut self) -> Result<T, ExportError> {
        let chunk = self.read_bytes(std::mem::size_of::<T>())?;
        let chunk_array = chunk.try_into().unwrap();
        Ok(T::from_le_bytes(chunk_array))
    }

    /// Read a `u32` element count.
    pub fn read_count(&mut self) -> Result<usize, ExportError> {
        self.read::<u32>().map(|count| count as usize)
    }

    /// Read a `u64` byte length.
    pub fn read_len(&mut self, field: &str) -> Result<usize, ExportError> {
        let len = self.read::<u64>()?;
        usize::try_from(len)
            .map_err(|_| ExportError::corrupt(field, format!("length {} is too large", len)))
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self, field: &str) -> Result<String, ExportError> {
        let len = self.read_count()?;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|err| ExportError::corrupt(field, format!("invalid UTF-8: {}", err)))
    }
}

/// Return a `Vec` capacity for `count` items which is bounded by the bytes
/// left in the reader, so a corrupt count cannot trigger a huge allocation.
fn capacity(reader: &ValueReader, count: usize) -> usize {
    count.min(reader.remaining())
}

/// Decoded contents of an artifact body.
pub(crate) struct Body {
    pub producer: String,
    pub inputs: Vec<TensorDesc>,
    pub outputs: Vec<TensorDesc>,
    pub initializers: Vec<(String, TensorData)>,
    pub nodes: Vec<Node>,
    pub properties: BTreeMap<String, String>,
}

pub(crate) fn read_body(reader: &mut ValueReader) -> Result<Body, ExportError> {
    let producer = reader.read_string("producer")?;
    let inputs = read_descs(reader, "inputs")?;
    let outputs = read_descs(reader, "outputs")?;

    let initializer_count = reader.read_count()?;
    let mut initializers = Vec::with_capacity(capacity(reader, initializer_count));
    for _ in 0..initializer_count {
        let name = reader.read_string("initializer.name")?;
        let data = read_tensor(reader, "initializer")?;
        initializers.push((name, data));
    }

    let node_count = reader.read_count()?;
    let mut nodes = Vec::with_capacity(capacity(reader, node_count));
    for index in 0..node_count {
        nodes.push(read_node(reader, index)?);
    }

    let mut properties = BTreeMap::new();
    let section_count = reader.read_count()?;
    for _ in 0..section_count {
        let tag = reader.read::<u32>()?;
        let len = reader.read_len("section.len")?;
        let section_offset = reader.offset();
        let payload = reader.read_bytes(len)?;
        let mut section = ValueReader::with_offset(payload, section_offset);

        match tag {
            SECTION_PROVENANCE => read_provenance(&mut section, &mut nodes)?,
            SECTION_PROPERTIES => {
                let count = section.read_count()?;
                for _ in 0..count {
                    let key = section.read_string("properties.key")?;
                    let value = section.read_string("properties.value")?;
                    properties.insert(key, value);
                }
            }
            // Sections added in later minor versions.
            _ => continue,
        }

        if !section.is_empty() {
            return Err(ExportError::corrupt(
                "section",
                format!(
                    "section {} has {} unread bytes",
                    tag,
                    section.remaining()
                ),
            ));
        }
    }

    Ok(Body {
        producer,
        inputs,
        outputs,
        initializers,
        nodes,
        properties,
    })
}

fn read_provenance(reader: &mut ValueReader, nodes: &mut [Node]) -> Result<(), ExportError> {
    let count = reader.read_count()?;
    for _ in 0..count {
        let index = reader.read::<u32>()? as usize;
        let scope = reader.read_string("provenance.scope")?;
        let Some(node) = nodes.get_mut(index) else {
            return Err(ExportError::corrupt(
                "provenance.node",
                format!("node index {} is out of range", index),
            ));
        };
        node.provenance = Some(scope);
    }
    Ok(())
}

fn read_dtype(reader: &mut ValueReader, field: &str) -> Result<DataType, ExportError> {
    let tag = reader.read::<u8>()?;
    DataType::from_tag(tag)
        .ok_or_else(|| ExportError::corrupt(field, format!("unknown element type tag {}", tag)))
}

fn read_shape(reader: &mut ValueReader, field: &str) -> Result<Shape, ExportError> {
    let ndim = reader.read_count()?;
    let mut shape = Shape::with_capacity(capacity(reader, ndim));
    for _ in 0..ndim {
        let dim = match reader.read::<u8>()? {
            DIM_FIXED => Dimension::Fixed(reader.read_len(field)?),
            DIM_SYMBOLIC => Dimension::Symbolic(reader.read_string(field)?),
            tag => {
                return Err(ExportError::corrupt(
                    field,
                    format!("unknown dimension tag {}", tag),
                ))
            }
        };
        shape.push(dim);
    }
    Ok(shape)
}

fn read_descs(reader: &mut ValueReader, field: &str) -> Result<Vec<TensorDesc>, ExportError> {
    let count = reader.read_count()?;
    let mut descs = Vec::with_capacity(capacity(reader, count));
    for _ in 0..count {
        let name = reader.read_string(field)?;
        let dtype = read_dtype(reader, field)?;
        let shape = read_shape(reader, field)?;
        descs.push(TensorDesc::new(name, dtype, shape));
    }
    Ok(descs)
}

fn read_tensor(reader: &mut ValueReader, field: &str) -> Result<TensorData, ExportError> {
    let dtype = read_dtype(reader, field)?;
    let ndim = reader.read_count()?;
    let mut shape = Vec::with_capacity(capacity(reader, ndim));
    for _ in 0..ndim {
        shape.push(reader.read_len(field)?);
    }
    let raw_len = reader.read_len(field)?;
    let bytes = reader.read_bytes(raw_len)?;
    TensorData::from_bytes(dtype, &shape, bytes.to_vec())
        .map_err(|err| ExportError::corrupt(field, err.to_string()))
}

fn read_node(reader: &mut ValueReader, index: usize) -> Result<Node, ExportError> {
    let tag = reader.read::<u16>()?;
    let op = OpKind::from_tag(tag).ok_or_else(|| {
        ExportError::corrupt(
            "node.op",
            format!("unknown operator tag {} in node {}", tag, index),
        )
    })?;

    let mut read_refs = |field| -> Result<Vec<String>, ExportError> {
        let count = reader.read_count()?;
        let mut refs = Vec::with_capacity(capacity(reader, count));
        for _ in 0..count {
            refs.push(reader.read_string(field)?);
        }
        Ok(refs)
    };
    let inputs = read_refs("node.inputs")?;
    let outputs = read_refs("node.outputs")?;

    let attr_count = reader.read_count()?;
    let mut attrs = Attrs::new();
    for _ in 0..attr_count {
        let name = reader.read_string("attr.name")?;
        let value = read_attr_value(reader)?;
        if attrs.insert(&name, value).is_some() {
            return Err(ExportError::corrupt(
                "attr.name",
                format!("duplicate attribute \"{}\" in node {}", name, index),
            ));
        }
    }

    Ok(Node {
        id: index,
        op,
        inputs,
        outputs,
        attrs,
        provenance: None,
    })
}

fn read_attr_value(reader: &mut ValueReader) -> Result<AttrValue, ExportError> {
    let tag = reader.read::<u8>()?;
    let Some(ty) = AttrType::from_tag(tag) else {
        return Err(ExportError::corrupt(
            "attr.type",
            format!("unknown attribute type tag {}", tag),
        ));
    };

    let value = match ty {
        AttrType::Int => AttrValue::Int(reader.read()?),
        AttrType::Float => AttrValue::Float(reader.read()?),
        AttrType::String => AttrValue::String(reader.read_string("attr.value")?),
        AttrType::Tensor => AttrValue::Tensor(read_tensor(reader, "attr.value")?),
        AttrType::Ints => {
            let count = reader.read_count()?;
            let mut values = Vec::with_capacity(capacity(reader, count));
            for _ in 0..count {
                values.push(reader.read()?);
            }
            AttrValue::Ints(values)
        }
        AttrType::Floats => {
            let count = reader.read_count()?;
            let mut values = Vec::with_capacity(capacity(reader, count));
            for _ in 0..count {
                values.push(reader.read()?);
            }
            AttrValue::Floats(values)
        }
        AttrType::Strings => {
            let count = reader.read_count()?;
            let mut values = Vec::with_capacity(capacity(reader, count));
            for _ in 0..count {
                values.push(reader.read_string("attr.value")?);
            }
            AttrValue::Strings(values)
        }
    };
    Ok(value)
}
