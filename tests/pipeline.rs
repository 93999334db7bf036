use gcap::codec::{decode, encode, EncodeOptions};
use gcap::header::{Header, FORMAT_MAJOR};
use gcap::{
    dims, export, export_batch, export_to_bytes, export_to_file, Attrs, DataType,
    DiagnosticLevel, ErrorKind, ExportError, ExportJob, ExportOptions, Module, OpKind, TensorData,
    Tracer, Value,
};
use gcap_testing::{assert_bytes_eq, TestCases};

/// Adds a bias to the input and applies ReLU.
struct AddRelu {
    bias: TensorData,
}

impl AddRelu {
    fn new() -> Self {
        AddRelu {
            bias: TensorData::from_vec(&[4], vec![0.1f32, -0.2, 0.3, -0.4]),
        }
    }
}

impl Module for AddRelu {
    fn parameters(&self) -> Vec<(&str, &TensorData)> {
        vec![("bias", &self.bias)]
    }

    fn forward(&self, tracer: &mut Tracer, inputs: &[Value]) -> Result<Vec<Value>, ExportError> {
        let bias = tracer.param("bias")?;
        let sum = tracer.binary("Add", &inputs[0], &bias)?;
        let out = tracer.unary("Relu", &sum)?;
        Ok(vec![out])
    }
}

/// A small MLP whose depth depends on a sample input value.
struct Mlp {
    weights: Vec<(String, TensorData)>,
}

impl Mlp {
    fn new(layers: usize, seed: u64) -> Self {
        let mut rng = fastrand::Rng::with_seed(seed);
        let weights = (0..layers)
            .map(|i| {
                let data: Vec<f32> = (0..16).map(|_| rng.f32() - 0.5).collect();
                (format!("layer{}.weight", i), TensorData::from_vec(&[4, 4], data))
            })
            .collect();
        Mlp { weights }
    }
}

impl Module for Mlp {
    fn parameters(&self) -> Vec<(&str, &TensorData)> {
        self.weights.iter().map(|(n, w)| (n.as_str(), w)).collect()
    }

    fn forward(&self, tracer: &mut Tracer, inputs: &[Value]) -> Result<Vec<Value>, ExportError> {
        let depth = tracer
            .sample_value(&inputs[1])
            .and_then(|t| t.to_vec::<i64>())
            .and_then(|v| v.first().copied())
            .unwrap_or(0) as usize;

        let mut x = inputs[0].clone();
        for (i, (name, _)) in self.weights.iter().enumerate().take(depth) {
            let weight = tracer.param(name)?;
            x = tracer.scope(&format!("layer{}", i), |t| {
                let y = t.binary("MatMul", &x, &weight)?;
                t.apply1("Gelu", &[(&y).into()], Attrs::new().with("approximate", "tanh"))
            })?;
        }
        let probs = tracer.apply1("Softmax", &[(&x).into()], Attrs::new().with("axis", -1))?;
        let label = tracer.apply1(
            "ArgMax",
            &[(&probs).into()],
            Attrs::new().with("axis", 1).with("keepdims", 0),
        )?;
        Ok(vec![probs, label])
    }
}

fn quiet() -> ExportOptions {
    let mut options = ExportOptions::new();
    options.diagnostics(DiagnosticLevel::Off);
    options
}

fn add_relu_samples() -> Vec<(&'static str, TensorData)> {
    vec![("input", TensorData::zeros(DataType::Float32, &[1, 4]))]
}

fn mlp_samples(depth: i64) -> Vec<(&'static str, TensorData)> {
    vec![
        ("x", TensorData::zeros(DataType::Float32, &[2, 4])),
        ("depth", TensorData::scalar(depth)),
    ]
}

#[test]
fn test_add_relu_round_trip() {
    let bytes = export_to_bytes(&AddRelu::new(), &add_relu_samples(), &quiet()).unwrap();
    let graph = decode(&bytes).unwrap();

    assert_eq!(graph.outputs().len(), 1);
    let output = &graph.outputs()[0];
    assert_eq!(output.name, "output");
    assert_eq!(output.dtype, DataType::Float32);
    assert_eq!(output.shape, dims![1, 4]);

    let nodes: Vec<_> = graph
        .nodes()
        .iter()
        .map(|n| (n.op, n.inputs.join(","), n.outputs.join(",")))
        .collect();
    assert_eq!(
        nodes,
        [
            (OpKind::Add, "input,bias".to_string(), "t1".to_string()),
            (OpKind::Relu, "t1".to_string(), "output".to_string()),
        ]
    );

    let bias = graph.initializer("bias").unwrap();
    assert_eq!(bias.data.shape(), [4]);
    assert_eq!(bias.data.to_vec::<f32>(), Some(vec![0.1, -0.2, 0.3, -0.4]));
}

#[test]
fn test_encoding_is_deterministic() {
    let model = Mlp::new(3, 1234);
    let first = export_to_bytes(&model, &mlp_samples(3), &quiet()).unwrap();
    let second = export_to_bytes(&model, &mlp_samples(3), &quiet()).unwrap();
    assert_bytes_eq(&first, &second);

    let graph = decode(&first).unwrap();
    let reencoded = encode(&graph, &EncodeOptions::default()).unwrap();
    assert_bytes_eq(&first, &reencoded);
}

#[test]
fn test_round_trip_preserves_graph() {
    let mut options = quiet();
    options
        .dynamic_dim("x", 0, "batch")
        .property("task", "classification")
        .output_names(&["probs", "label"]);
    let graph = export(&Mlp::new(2, 7), &mlp_samples(2), &options).unwrap();

    for checksum in [true, false] {
        let bytes = encode(&graph, &EncodeOptions { checksum }).unwrap();
        assert_eq!(decode(&bytes).unwrap(), graph);
    }

    assert_eq!(graph.outputs()[0].shape, dims!["batch", 4]);
    assert_eq!(graph.outputs()[1].dtype, DataType::Int64);
    assert_eq!(graph.outputs()[1].shape, dims!["batch"]);
    assert_eq!(
        graph.nodes()[2].provenance.as_deref(),
        Some("layer1"),
        "{:?}",
        graph.nodes()
    );
}

#[test]
fn test_topological_order() {
    let graph = export(&Mlp::new(4, 99), &mlp_samples(4), &quiet()).unwrap();

    let mut defined: Vec<&str> = graph.inputs().iter().map(|i| i.name.as_str()).collect();
    defined.extend(graph.initializers().keys().map(|k| k.as_str()));
    for node in graph.nodes() {
        for input in &node.inputs {
            assert!(
                defined.contains(&input.as_str()),
                "{} used before definition",
                input
            );
        }
        defined.extend(node.outputs.iter().map(|o| o.as_str()));
    }
}

#[test]
fn test_single_path_capture() {
    #[derive(Debug)]
    struct Case {
        depth: i64,
        matmuls: usize,
        initializers: usize,
    }

    let cases = [
        Case {
            depth: 0,
            matmuls: 0,
            initializers: 0,
        },
        Case {
            depth: 2,
            matmuls: 2,
            initializers: 2,
        },
        Case {
            depth: 3,
            matmuls: 3,
            initializers: 3,
        },
    ];

    cases.test_each(|case| {
        let graph = export(&Mlp::new(3, 5), &mlp_samples(case.depth), &quiet()).unwrap();
        let matmuls = graph
            .nodes()
            .iter()
            .filter(|n| n.op == OpKind::MatMul)
            .count();
        assert_eq!(matmuls, case.matmuls);
        assert_eq!(graph.initializers().len(), case.initializers);
    })
}

#[test]
fn test_shape_mismatch() {
    struct Mismatch;

    impl Module for Mismatch {
        fn parameters(&self) -> Vec<(&str, &TensorData)> {
            Vec::new()
        }

        fn forward(
            &self,
            tracer: &mut Tracer,
            inputs: &[Value],
        ) -> Result<Vec<Value>, ExportError> {
            Ok(vec![tracer.binary("Add", &inputs[0], &inputs[1])?])
        }
    }

    let samples = [
        ("a", TensorData::zeros(DataType::Float32, &[2, 3])),
        ("b", TensorData::zeros(DataType::Float32, &[4, 5])),
    ];
    let err = export(&Mismatch, &samples, &quiet()).unwrap_err();
    let ExportError::ShapeMismatch { node, shapes, .. } = &err else {
        panic!("unexpected error {:?}", err);
    };
    assert_eq!(node.as_ref().map(|n| n.index), Some(0));
    assert_eq!(shapes, &[dims![2, 3], dims![4, 5]]);
}

#[test]
fn test_unsupported_operator_writes_no_file() {
    struct UsesLoop;

    impl Module for UsesLoop {
        fn parameters(&self) -> Vec<(&str, &TensorData)> {
            Vec::new()
        }

        fn forward(
            &self,
            tracer: &mut Tracer,
            inputs: &[Value],
        ) -> Result<Vec<Value>, ExportError> {
            let x = tracer.unary("Relu", &inputs[0])?;
            Ok(vec![tracer.unary("Loop", &x)?])
        }
    }

    let path = std::env::temp_dir().join(format!("gcap-unsupported-{}.gcap", std::process::id()));
    let err = export_to_file(&UsesLoop, &add_relu_samples(), &path, &quiet()).unwrap_err();
    assert!(matches!(
        err,
        ExportError::UnsupportedOperator { node: 1, ref op } if op == "Loop"
    ));
    assert!(!path.exists());
}

#[test]
fn test_version_gate() {
    let mut bytes = export_to_bytes(&AddRelu::new(), &add_relu_samples(), &quiet()).unwrap();
    bytes[4..6].copy_from_slice(&(FORMAT_MAJOR + 1).to_le_bytes());
    bytes.truncate(Header::LEN);

    let err = decode(&bytes).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedVersion);
}

#[test]
fn test_corrupt_artifacts() {
    let bytes = export_to_bytes(&AddRelu::new(), &add_relu_samples(), &quiet()).unwrap();

    let err = decode(&bytes[..bytes.len() / 2]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TruncatedInput);

    let mut flipped = bytes.clone();
    flipped[Header::LEN + 10] ^= 0x80;
    let err = decode(&flipped).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChecksumMismatch);

    let mut bad_magic = bytes.clone();
    bad_magic[0] = b'X';
    let err = decode(&bad_magic).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptField);
}

#[test]
fn test_export_batch() {
    let small = Mlp::new(1, 1);
    let large = Mlp::new(3, 2);
    let add_relu = AddRelu::new();

    let mut named = quiet();
    named.output_names(&["y"]);

    let jobs = [
        ExportJob {
            module: &small,
            samples: mlp_samples(1)
                .into_iter()
                .map(|(n, t)| (n.to_string(), t))
                .collect(),
            options: quiet(),
        },
        ExportJob {
            module: &add_relu,
            samples: vec![(
                "input".to_string(),
                TensorData::zeros(DataType::Float32, &[3, 4]),
            )],
            options: named,
        },
        ExportJob {
            module: &large,
            samples: mlp_samples(3)
                .into_iter()
                .map(|(n, t)| (n.to_string(), t))
                .collect(),
            options: quiet(),
        },
    ];

    let results = export_batch(&jobs);
    let graphs: Vec<_> = results
        .into_iter()
        .map(|bytes| decode(&bytes.unwrap()).unwrap())
        .collect();

    assert_eq!(graphs[0].initializers().len(), 1);
    assert_eq!(graphs[1].outputs()[0].name, "y");
    assert_eq!(graphs[1].outputs()[0].shape, dims![3, 4]);
    assert_eq!(graphs[2].initializers().len(), 3);
}
