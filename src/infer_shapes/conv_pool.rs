use smallvec::{smallvec, SmallVec};

use super::{same_dtype, Input, InferShapesError, SymbolGen};
use crate::attrs::Attrs;
use crate::value::{Dimension, Shape, ValueInfo};

/// Padding, stride and dilation for one spatial dimension.
struct Window {
    kernel: usize,
    stride: usize,
    dilation: usize,
    pad_start: usize,
    pad_end: usize,
    ceil_mode: bool,
}

impl Window {
    /// Return the output size for a spatial dimension in a convolution or
    /// pooling operation.
    fn output_size(&self, in_size: usize) -> Result<usize, String> {
        let too_large = || "padded input size is too large".to_string();
        let padded = in_size
            .checked_add(self.pad_start)
            .and_then(|x| x.checked_add(self.pad_end))
            .ok_or_else(too_large)?;
        let effective_kernel = self
            .kernel
            .checked_sub(1)
            .ok_or_else(|| "kernel size must be positive".to_string())?
            .checked_mul(self.dilation)
            .and_then(|x| x.checked_add(1))
            .ok_or_else(|| "dilated kernel size is too large".to_string())?;
        if effective_kernel > padded {
            return Err(format!(
                "kernel size {} exceeds padded input size {}",
                effective_kernel, padded
            ));
        }
        let span = padded - effective_kernel;
        if !self.ceil_mode {
            return Ok(span / self.stride + 1);
        }

        // In ceil mode the last window must start within the input or the
        // start padding.
        let out = span.div_ceil(self.stride) + 1;
        let last_start = (out - 1).checked_mul(self.stride).ok_or_else(too_large)?;
        if last_start >= in_size + self.pad_start {
            Ok(out - 1)
        } else {
            Ok(out)
        }
    }
}

/// Read a per-spatial-dimension attribute such as `strides`, whose values
/// must be positive.
fn spatial_attr(
    attrs: &Attrs,
    name: &str,
    spatial_dims: usize,
    default: usize,
) -> Result<SmallVec<[usize; 4]>, InferShapesError> {
    let Some(values) = attrs.ints(name) else {
        return Ok(smallvec![default; spatial_dims]);
    };
    if values.len() != spatial_dims {
        return Err(InferShapesError::attr(
            name,
            format!("expected {} values but got {}", spatial_dims, values.len()),
        ));
    }
    values
        .iter()
        .map(|&x| {
            usize::try_from(x)
                .ok()
                .filter(|&x| x > 0)
                .ok_or_else(|| InferShapesError::attr(name, format!("invalid value {}", x)))
        })
        .collect()
}

/// Read the `pads` attribute, given as `[starts..., ends...]`.
fn pads_attr(
    attrs: &Attrs,
    spatial_dims: usize,
) -> Result<SmallVec<[usize; 8]>, InferShapesError> {
    let Some(values) = attrs.ints("pads") else {
        return Ok(smallvec![0; spatial_dims * 2]);
    };
    if values.len() != spatial_dims * 2 {
        return Err(InferShapesError::attr(
            "pads",
            format!(
                "expected {} values but got {}",
                spatial_dims * 2,
                values.len()
            ),
        ));
    }
    values
        .iter()
        .map(|&x| {
            usize::try_from(x)
                .map_err(|_| InferShapesError::attr("pads", format!("invalid value {}", x)))
        })
        .collect()
}

/// Compute the spatial output dimensions for a windowed operator.
///
/// `kernel` gives the kernel size for each spatial dimension, or `None` if
/// the size is symbolic.
fn spatial_output(
    attrs: &Attrs,
    data: &Input,
    kernel: &[Option<usize>],
    dilations: &[usize],
    sym_gen: &mut SymbolGen,
) -> Result<Shape, InferShapesError> {
    let spatial_dims = kernel.len();
    let strides = spatial_attr(attrs, "strides", spatial_dims, 1)?;
    let pads = pads_attr(attrs, spatial_dims)?;
    let ceil_mode = attrs.int("ceil_mode").unwrap_or(0) != 0;

    let mut out_shape = Shape::with_capacity(spatial_dims);
    for (i, in_dim) in data.shape()[2..].iter().enumerate() {
        let (Dimension::Fixed(in_size), Some(kernel)) = (in_dim, kernel[i]) else {
            out_shape.push(sym_gen.gen());
            continue;
        };
        let window = Window {
            kernel,
            stride: strides[i],
            dilation: dilations[i],
            pad_start: pads[i],
            pad_end: pads[spatial_dims + i],
            ceil_mode,
        };
        let out_size = window
            .output_size(*in_size)
            .map_err(|detail| InferShapesError::rank(data.shape(), detail))?;
        out_shape.push(Dimension::Fixed(out_size));
    }
    Ok(out_shape)
}

fn check_spatial_rank(data: &Input) -> Result<usize, InferShapesError> {
    if data.ndim() < 3 {
        return Err(InferShapesError::rank(
            data.shape(),
            "expected batch, channel and spatial dimensions",
        ));
    }
    Ok(data.ndim() - 2)
}

pub(super) fn conv(
    attrs: &Attrs,
    inputs: &[Input],
    sym_gen: &mut SymbolGen,
) -> Result<ValueInfo, InferShapesError> {
    let [data, weights, bias @ ..] = inputs else {
        return Err(InferShapesError::IncorrectInputCount);
    };
    if bias.len() > 1 {
        return Err(InferShapesError::IncorrectInputCount);
    }
    same_dtype(data, weights)?;

    let spatial_dims = check_spatial_rank(data)?;
    if weights.ndim() != data.ndim() {
        return Err(InferShapesError::incompatible(
            &[data.shape(), weights.shape()],
            "weights must have the same rank as the input",
        ));
    }

    let group = attrs.int("group").unwrap_or(1);
    let group = usize::try_from(group)
        .ok()
        .filter(|&g| g > 0)
        .ok_or_else(|| InferShapesError::attr("group", format!("invalid value {}", group)))?;

    let in_channels = &data.shape()[1];
    let out_channels = &weights.shape()[0];
    if let (Dimension::Fixed(in_c), Dimension::Fixed(group_c)) = (in_channels, &weights.shape()[1]) {
        let expected = group_c.checked_mul(group);
        if expected != Some(*in_c) {
            return Err(InferShapesError::incompatible(
                &[data.shape(), weights.shape()],
                format!(
                    "input has {} channels but weights expect {} per group in {} groups",
                    in_c, group_c, group
                ),
            ));
        }
    }
    if let Dimension::Fixed(out_c) = out_channels {
        if out_c % group != 0 {
            return Err(InferShapesError::attr(
                "group",
                format!("{} output channels are not divisible into {} groups", out_c, group),
            ));
        }
    }

    let kernel: SmallVec<[Option<usize>; 4]> =
        weights.shape()[2..].iter().map(|d| d.fixed()).collect();
    if let Some(kernel_shape) = attrs.ints("kernel_shape") {
        let matches = kernel_shape.len() == spatial_dims
            && kernel_shape
                .iter()
                .zip(&kernel)
                .all(|(&k, w)| w.is_none_or(|w| w as i64 == k));
        if !matches {
            return Err(InferShapesError::attr(
                "kernel_shape",
                format!("{:?} does not match the weight shape", kernel_shape),
            ));
        }
    }

    if let [bias] = bias {
        same_dtype(data, bias)?;
        let valid = match bias.shape() {
            [size] => *size == *out_channels || size.fixed().is_none() || out_channels.fixed().is_none(),
            _ => false,
        };
        if !valid {
            return Err(InferShapesError::incompatible(
                &[bias.shape(), weights.shape()],
                "bias must be a vector with one element per output channel",
            ));
        }
    }

    let dilations = spatial_attr(attrs, "dilations", spatial_dims, 1)?;
    let spatial = spatial_output(attrs, data, &kernel, &dilations, sym_gen)?;

    let mut out_shape: Shape = [data.shape()[0].clone(), out_channels.clone()]
        .into_iter()
        .collect();
    out_shape.extend(spatial);
    Ok(ValueInfo::new(data.dtype(), out_shape))
}

pub(super) fn pool(
    attrs: &Attrs,
    inputs: &[Input],
    sym_gen: &mut SymbolGen,
) -> Result<ValueInfo, InferShapesError> {
    let [data] = inputs else {
        return Err(InferShapesError::IncorrectInputCount);
    };
    let spatial_dims = check_spatial_rank(data)?;
    if attrs.ints("kernel_shape").is_none() {
        return Err(InferShapesError::attr(
            "kernel_shape",
            "required attribute is missing",
        ));
    }
    let kernel: SmallVec<[Option<usize>; 4]> = spatial_attr(attrs, "kernel_shape", spatial_dims, 1)?
        .into_iter()
        .map(Some)
        .collect();
    let dilations: SmallVec<[usize; 4]> = smallvec![1; spatial_dims];
    let spatial = spatial_output(attrs, data, &kernel, &dilations, sym_gen)?;

    let mut out_shape: Shape = data.shape()[..2].iter().cloned().collect();
    out_shape.extend(spatial);
    Ok(ValueInfo::new(data.dtype(), out_shape))
}

pub(super) fn global_pool(inputs: &[Input]) -> Result<ValueInfo, InferShapesError> {
    let [data] = inputs else {
        return Err(InferShapesError::IncorrectInputCount);
    };
    let spatial_dims = check_spatial_rank(data)?;
    let mut out_shape: Shape = data.shape()[..2].iter().cloned().collect();
    out_shape.extend(std::iter::repeat_n(Dimension::Fixed(1), spatial_dims));
    Ok(ValueInfo::new(data.dtype(), out_shape))
}

/// `BatchNormalization` takes the input followed by the scale, bias, mean
/// and variance vectors.
pub(super) fn batch_norm(inputs: &[Input]) -> Result<ValueInfo, InferShapesError> {
    let [data, params @ ..] = inputs else {
        return Err(InferShapesError::IncorrectInputCount);
    };
    if params.len() != 4 {
        return Err(InferShapesError::IncorrectInputCount);
    }
    if data.ndim() < 2 {
        return Err(InferShapesError::rank(
            data.shape(),
            "expected batch and channel dimensions",
        ));
    }
    let channels = &data.shape()[1];
    for param in params {
        same_dtype(data, param)?;
        let valid = match param.shape() {
            [Dimension::Fixed(size)] => channels.fixed().is_none_or(|c| c == *size),
            [Dimension::Symbolic(_)] => true,
            _ => false,
        };
        if !valid {
            return Err(InferShapesError::incompatible(
                &[data.shape(), param.shape()],
                "parameters must be vectors with one element per channel",
            ));
        }
    }
    Ok(data.info.clone())
}
