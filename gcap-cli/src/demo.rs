use gcap::{Attrs, DataType, ExportError, Module, Operand, TensorData, Tracer, Value};

/// Number of classes predicted by the demo classifier.
pub const NUM_CLASSES: usize = 10;

const IN_CHANNELS: usize = 3;
const HIDDEN_CHANNELS: usize = 16;

/// Small convolutional image classifier with random weights.
///
/// Conv -> BatchNorm -> Relu -> MaxPool -> GlobalAveragePool -> Flatten ->
/// Gemm.
pub struct ConvNet {
    params: Vec<(String, TensorData)>,
}

fn random_tensor(rng: &mut fastrand::Rng, shape: &[usize], scale: f32) -> TensorData {
    let len = shape.iter().product();
    let data: Vec<f32> = (0..len).map(|_| (rng.f32() * 2. - 1.) * scale).collect();
    TensorData::from_vec(shape, data)
}

impl ConvNet {
    pub fn new(rng: &mut fastrand::Rng) -> ConvNet {
        let c = HIDDEN_CHANNELS;
        let params = vec![
            (
                "conv1.weight".to_string(),
                random_tensor(rng, &[c, IN_CHANNELS, 3, 3], 0.2),
            ),
            ("conv1.bias".to_string(), random_tensor(rng, &[c], 0.1)),
            (
                "bn1.weight".to_string(),
                TensorData::from_vec(&[c], vec![1.0f32; c]),
            ),
            ("bn1.bias".to_string(), TensorData::zeros(DataType::Float32, &[c])),
            ("bn1.running_mean".to_string(), random_tensor(rng, &[c], 0.1)),
            (
                "bn1.running_var".to_string(),
                TensorData::from_vec(&[c], vec![1.0f32; c]),
            ),
            (
                "fc.weight".to_string(),
                random_tensor(rng, &[NUM_CLASSES, c], 0.3),
            ),
            ("fc.bias".to_string(), random_tensor(rng, &[NUM_CLASSES], 0.1)),
        ];
        ConvNet { params }
    }

    /// Generate a random sample input of shape `[batch, 3, size, size]`.
    pub fn sample_input(rng: &mut fastrand::Rng, batch: usize, size: usize) -> TensorData {
        random_tensor(rng, &[batch, IN_CHANNELS, size, size], 1.0)
    }
}

impl Module for ConvNet {
    fn parameters(&self) -> Vec<(&str, &TensorData)> {
        self.params.iter().map(|(name, t)| (name.as_str(), t)).collect()
    }

    fn forward(&self, tracer: &mut Tracer, inputs: &[Value]) -> Result<Vec<Value>, ExportError> {
        let x = tracer.scope("conv1", |t| {
            let weight = t.param("conv1.weight")?;
            let bias = t.param("conv1.bias")?;
            t.apply1(
                "Conv",
                &[(&inputs[0]).into(), weight.into(), bias.into()],
                Attrs::new()
                    .with("kernel_shape", vec![3i64, 3])
                    .with("pads", vec![1i64, 1, 1, 1])
                    .with("strides", vec![1i64, 1]),
            )
        })?;

        let x = tracer.scope("bn1", |t| {
            let operands: [Operand; 5] = [
                (&x).into(),
                t.param("bn1.weight")?.into(),
                t.param("bn1.bias")?.into(),
                t.param("bn1.running_mean")?.into(),
                t.param("bn1.running_var")?.into(),
            ];
            t.apply1(
                "BatchNormalization",
                &operands,
                Attrs::new().with("epsilon", 1e-5).with("momentum", 0.9),
            )
        })?;

        let x = tracer.unary("Relu", &x)?;
        let x = tracer.apply1(
            "MaxPool",
            &[(&x).into()],
            Attrs::new()
                .with("kernel_shape", vec![2i64, 2])
                .with("strides", vec![2i64, 2]),
        )?;
        let x = tracer.unary("GlobalAveragePool", &x)?;
        let x = tracer.apply1("Flatten", &[(&x).into()], Attrs::new().with("axis", 1))?;

        let logits = tracer.scope("fc", |t| {
            let weight = t.param("fc.weight")?;
            let bias = t.param("fc.bias")?;
            t.apply1(
                "Gemm",
                &[(&x).into(), weight.into(), bias.into()],
                Attrs::new().with("transB", 1),
            )
        })?;

        Ok(vec![logits])
    }
}

#[cfg(test)]
mod tests {
    use gcap::{dims, export, DiagnosticLevel, ExportOptions, OpKind};

    use super::{ConvNet, NUM_CLASSES};

    #[test]
    fn test_export_convnet() {
        let mut rng = fastrand::Rng::with_seed(0);
        let model = ConvNet::new(&mut rng);
        let samples = [("input", ConvNet::sample_input(&mut rng, 2, 32))];

        let mut options = ExportOptions::new();
        options
            .diagnostics(DiagnosticLevel::Off)
            .dynamic_dim("input", 0, "batch");
        let graph = export(&model, &samples, &options).unwrap();

        let ops: Vec<_> = graph.nodes().iter().map(|n| n.op).collect();
        assert_eq!(
            ops,
            [
                OpKind::Conv,
                OpKind::BatchNormalization,
                OpKind::Relu,
                OpKind::MaxPool,
                OpKind::GlobalAveragePool,
                OpKind::Flatten,
                OpKind::Gemm,
            ]
        );
        assert_eq!(graph.outputs()[0].shape, dims!["batch", NUM_CLASSES]);
        assert_eq!(graph.initializers().len(), 8);
        assert_eq!(graph.nodes()[0].provenance.as_deref(), Some("conv1"));

        let fc_weight = &graph.initializer("fc.weight").unwrap().data;
        assert_eq!(fc_weight.shape(), [NUM_CLASSES, 16]);
    }
}
