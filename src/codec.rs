//! Encoding graphs to, and decoding graphs from, the binary artifact format.
//!
//! An artifact consists of a fixed [`Header`], a body and an optional
//! checksum footer. All integers are little-endian.
//!
//! ```text
//! header:    magic "GCAP", format_major u16, format_minor u16, flags u32,
//!            body_len u64
//! body:      producer string
//!            inputs, outputs:  count u32, then (name, dtype u8, shape)
//!            initializers:     count u32, then (name, dtype u8, rank u32,
//!                              dims u64..., raw_len u64, raw bytes)
//!            nodes:            count u32, then (op u16, input refs, output refs,
//!                              attr count u32, (name, type u8, value)...)
//!            sections:         count u32, then (tag u32, len u64, payload)
//! footer:    FNV-1a 64 hash of header and body, if flag bit 0 is set
//! ```
//!
//! Strings are a `u32` length followed by UTF-8 bytes. Shapes are a `u32`
//! rank followed by dimensions, each a tag byte (0 fixed, 1 symbolic) followed
//! by a `u64` size or a string.
//!
//! Encoding is deterministic. Initializers are written in name order and
//! attributes in name order, so encoding the same graph always produces the
//! same bytes.

use crate::error::ExportError;
use crate::graph::{Graph, GraphBuilder};
use crate::header::Header;
use crate::op_registry::OpRegistry;

pub mod checksum;
pub(crate) mod reader;
mod writer;

use checksum::fnv1a;
use reader::{read_body, ValueReader};
use writer::{write_body, ValueWriter};

const DIM_FIXED: u8 = 0;
const DIM_SYMBOLIC: u8 = 1;

/// Optional section holding the scope path of each node.
const SECTION_PROVENANCE: u32 = 1;

/// Optional section holding graph metadata properties.
const SECTION_PROPERTIES: u32 = 2;

/// Size of the checksum footer.
const FOOTER_LEN: usize = 8;

/// Options that control encoding.
#[derive(Clone, Debug)]
pub struct EncodeOptions {
    /// Append a checksum footer. Enabled by default.
    pub checksum: bool,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        EncodeOptions { checksum: true }
    }
}

/// Encode a graph as an artifact.
///
/// The artifact always uses the current format version, regardless of the
/// version recorded in the graph's metadata.
pub fn encode(graph: &Graph, options: &EncodeOptions) -> Result<Vec<u8>, ExportError> {
    let mut body = ValueWriter::new();
    write_body(&mut body, graph)?;
    let body = body.into_inner();

    let header = Header::new(body.len() as u64, options.checksum);
    let mut buf = header.to_buf();
    buf.reserve(body.len() + FOOTER_LEN);
    buf.extend(body);

    if options.checksum {
        let hash = fnv1a(&buf);
        buf.extend(hash.to_le_bytes());
    }

    Ok(buf)
}

/// Decode an artifact, accepting any operator in the global registry.
///
/// See [`decode_with_registry`].
pub fn decode(bytes: &[u8]) -> Result<Graph, ExportError> {
    decode_with_registry(bytes, OpRegistry::global())
}

/// Decode an artifact.
///
/// The header is checked first, and an artifact whose major format version
/// differs from [`FORMAT_MAJOR`](crate::header::FORMAT_MAJOR) is rejected
/// before anything else is read. Optional sections with unknown tags are
/// skipped. The decoded graph is validated with [`GraphBuilder::build`]
/// using `registry`. On failure no part of the graph is returned.
pub fn decode_with_registry(bytes: &[u8], registry: &OpRegistry) -> Result<Graph, ExportError> {
    let header = Header::from_buf(bytes)?;

    let body_len = usize::try_from(header.body_len).map_err(|_| {
        ExportError::corrupt(
            "body_len",
            format!("length {} is too large", header.body_len),
        )
    })?;
    let footer_len = if header.has_checksum() { FOOTER_LEN } else { 0 };
    let body_end = Header::LEN.checked_add(body_len);
    let total_len = body_end.and_then(|end| end.checked_add(footer_len));

    let (Some(body_end), Some(total_len)) = (body_end, total_len) else {
        return Err(ExportError::corrupt(
            "body_len",
            format!("length {} is too large", body_len),
        ));
    };
    if bytes.len() < total_len {
        return Err(ExportError::TruncatedInput {
            offset: Header::LEN,
            needed: total_len - Header::LEN,
            available: bytes.len() - Header::LEN,
        });
    }
    if bytes.len() > total_len {
        return Err(ExportError::corrupt(
            "body_len",
            format!(
                "{} unexpected bytes after the end of the artifact",
                bytes.len() - total_len
            ),
        ));
    }

    if header.has_checksum() {
        let mut footer = ValueReader::with_offset(&bytes[body_end..], body_end);
        let expected = footer.read::<u64>()?;
        let actual = fnv1a(&bytes[..body_end]);
        if expected != actual {
            return Err(ExportError::ChecksumMismatch { expected, actual });
        }
    }

    let mut reader = ValueReader::with_offset(&bytes[Header::LEN..body_end], Header::LEN);
    let body = read_body(&mut reader)?;
    if !reader.is_empty() {
        return Err(ExportError::corrupt(
            "body",
            format!("{} unread bytes at the end of the body", reader.remaining()),
        ));
    }

    let mut builder = GraphBuilder::new();
    builder
        .set_format_version(header.format_major, header.format_minor)
        .set_producer(&body.producer);
    for (key, value) in &body.properties {
        builder.set_property(key, value);
    }
    for input in body.inputs {
        builder.add_input(input);
    }
    for output in body.outputs {
        builder.add_output(output);
    }
    for (name, data) in body.initializers {
        builder.add_initializer(&name, data);
    }
    for node in body.nodes {
        builder.add_node(node);
    }
    builder.build(registry)
}

#[cfg(test)]
mod tests {
    use gcap_testing::{assert_bytes_eq, TestCases};

    use super::{decode, decode_with_registry, encode, EncodeOptions, FOOTER_LEN};
    use crate::attrs::Attrs;
    use crate::error::{ErrorKind, ExportError};
    use crate::graph::{Graph, GraphBuilder, Node};
    use crate::header::{Header, FORMAT_MAJOR, FORMAT_MINOR};
    use crate::op_registry::{OpKind, OpRegistry};
    use crate::value::{DataType, TensorData, TensorDesc};
    use crate::dims;

    /// Build input [batch, 4] -> Add(bias) -> Relu -> output.
    fn add_relu_graph() -> Graph {
        let mut builder = GraphBuilder::new();
        builder
            .set_producer("test")
            .add_input(TensorDesc::new("input", DataType::Float32, dims!["batch", 4]))
            .add_output(TensorDesc::new("output", DataType::Float32, dims!["batch", 4]))
            .add_initializer(
                "bias",
                TensorData::from_vec(&[4], vec![0.5f32, -0.5, 1.0, -1.0]),
            )
            .add_node(Node {
                id: 0,
                op: OpKind::Add,
                inputs: vec!["input".into(), "bias".into()],
                outputs: vec!["t1".into()],
                attrs: Attrs::new(),
                provenance: Some("block".into()),
            })
            .add_node(Node {
                id: 1,
                op: OpKind::LeakyRelu,
                inputs: vec!["t1".into()],
                outputs: vec!["output".into()],
                attrs: Attrs::new().with("alpha", 0.1f32),
                provenance: None,
            });
        builder.build(OpRegistry::global()).unwrap()
    }

    fn encode_default(graph: &Graph) -> Vec<u8> {
        encode(graph, &EncodeOptions::default()).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let mut builder = add_relu_graph().into_builder();
        builder.set_property("source", "unit test");
        let graph = builder.build(OpRegistry::global()).unwrap();

        for checksum in [true, false] {
            let bytes = encode(&graph, &EncodeOptions { checksum }).unwrap();
            let decoded = decode(&bytes).unwrap();
            assert_eq!(decoded, graph);
            assert_eq!(decoded.nodes()[0].provenance.as_deref(), Some("block"));
            assert_eq!(decoded.metadata().properties["source"], "unit test");
        }
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let first = encode_default(&add_relu_graph());
        let second = encode_default(&add_relu_graph());
        assert_bytes_eq(&first, &second);

        let reencoded = encode_default(&decode(&first).unwrap());
        assert_bytes_eq(&first, &reencoded);
    }

    #[test]
    fn test_header_fields() {
        let bytes = encode_default(&add_relu_graph());
        let header = Header::from_buf(&bytes).unwrap();
        assert_eq!(header.format_major, FORMAT_MAJOR);
        assert_eq!(header.format_minor, FORMAT_MINOR);
        assert!(header.has_checksum());
        assert_eq!(
            header.body_len as usize,
            bytes.len() - Header::LEN - FOOTER_LEN
        );
        assert_eq!(&bytes[Header::LEN + 4..Header::LEN + 8], b"test");
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = encode_default(&add_relu_graph());
        bytes[4..6].copy_from_slice(&(FORMAT_MAJOR + 1).to_le_bytes());

        // Corrupt everything after the version. The error should still be
        // about the version.
        for byte in &mut bytes[6..] {
            *byte = 0xff;
        }

        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, ExportError::UnsupportedVersion { major: 2 }));
    }

    #[test]
    fn test_newer_minor_version_accepted() {
        let graph = add_relu_graph();
        let mut bytes = encode(&graph, &EncodeOptions { checksum: false }).unwrap();
        bytes[6..8].copy_from_slice(&(FORMAT_MINOR + 3).to_le_bytes());
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.metadata().format_minor, FORMAT_MINOR + 3);
        assert_eq!(decoded.nodes(), graph.nodes());
    }

    #[test]
    fn test_truncated_input() {
        let bytes = encode_default(&add_relu_graph());
        for len in [0, 3, Header::LEN - 1, Header::LEN, bytes.len() - 1] {
            let err = decode(&bytes[..len]).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::TruncatedInput, "length {}", len);
        }
    }

    #[test]
    fn test_trailing_bytes() {
        let mut bytes = encode_default(&add_relu_graph());
        bytes.push(0);
        let err = decode(&bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptField);
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut bytes = encode_default(&add_relu_graph());
        let last_body_byte = bytes.len() - FOOTER_LEN - 1;
        bytes[last_body_byte] ^= 0x01;
        let err = decode(&bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChecksumMismatch);
    }

    #[test]
    fn test_unknown_section_skipped() {
        let graph = add_relu_graph();
        let mut bytes = encode(&graph, &EncodeOptions { checksum: false }).unwrap();

        // The graph has one section (provenance). Append another with an
        // unknown tag and fix up the section count and body length.
        let section_count_pos = find_section_count(&bytes);
        bytes[section_count_pos..section_count_pos + 4].copy_from_slice(&2u32.to_le_bytes());
        bytes.extend(99u32.to_le_bytes());
        bytes.extend(3u64.to_le_bytes());
        bytes.extend([1, 2, 3]);
        let body_len = (bytes.len() - Header::LEN) as u64;
        bytes[12..20].copy_from_slice(&body_len.to_le_bytes());

        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, graph);
    }

    /// Return the offset of the optional section count in an artifact
    /// without a checksum, whose only section is the provenance of node 0.
    fn find_section_count(bytes: &[u8]) -> usize {
        // Section: tag u32, len u64, count u32, node u32, "block" string.
        let section_len = 4 + 8 + 4 + 4 + 4 + "block".len();
        bytes.len() - section_len - 4
    }

    #[test]
    fn test_corrupt_fields() {
        #[derive(Debug)]
        struct Case {
            // Offset relative to the start of the body.
            offset: usize,
            value: u8,
            field: &'static str,
        }

        // Body starts with the producer "test" (8 bytes), then the input
        // count (4 bytes), then the input name "input" (9 bytes) followed by
        // its dtype tag.
        let cases = [
            Case {
                offset: 4,
                value: 0xff,
                field: "producer",
            },
            Case {
                offset: 8 + 4 + 9,
                value: 200,
                field: "inputs",
            },
            Case {
                offset: 8 + 4 + 9 + 1 + 4,
                value: 7,
                field: "inputs",
            },
        ];

        let graph = add_relu_graph();
        let bytes = encode(&graph, &EncodeOptions { checksum: false }).unwrap();

        cases.test_each(|case| {
            let mut bytes = bytes.clone();
            bytes[Header::LEN + case.offset] = case.value;
            let err = decode(&bytes).unwrap_err();
            assert!(
                matches!(err, ExportError::CorruptField { ref field, .. } if field == case.field),
                "unexpected error {:?}",
                err
            );
        })
    }

    #[test]
    fn test_decode_validates_graph() {
        let graph = add_relu_graph();
        let bytes = encode_default(&graph);

        let mut registry = OpRegistry::new();
        registry.register(OpKind::Add);
        let err = decode_with_registry(&bytes, &registry).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedGraph);
    }

    #[test]
    fn test_decode_mutated_bytes() {
        let graph = add_relu_graph();
        let mut rng = fastrand::Rng::with_seed(1234);

        for checksum in [true, false] {
            let bytes = encode(&graph, &EncodeOptions { checksum }).unwrap();

            for len in 0..bytes.len() {
                assert!(decode(&bytes[..len]).is_err(), "truncated to {} bytes", len);
            }

            // Without a checksum some mutations, such as changes to weights,
            // still decode to a valid graph. Decoding must never panic.
            for pos in 0..bytes.len() {
                for mask in [0x01u8, 0x80, 0xff] {
                    let mut mutated = bytes.clone();
                    mutated[pos] ^= mask;
                    let result = decode(&mutated);
                    if checksum {
                        assert!(result.is_err(), "byte {} ^ {:#x} was accepted", pos, mask);
                    }
                }
            }

            for _ in 0..1000 {
                let mut mutated = bytes.clone();
                for _ in 0..rng.usize(1..4) {
                    let pos = rng.usize(..mutated.len());
                    mutated[pos] = rng.u8(..);
                }
                let result = decode(&mutated);
                if checksum && mutated != bytes {
                    assert!(result.is_err());
                }
            }
        }
    }
}
