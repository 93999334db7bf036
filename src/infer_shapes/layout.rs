use smallvec::SmallVec;

use super::{dim_product, resolve_axes, resolve_axis, same_dtype, Input, InferShapesError, SymbolGen};
use crate::attrs::Attrs;
use crate::value::{element_count, fixed_shape, format_shape, DataType, Dimension, Shape, ValueInfo};

/// Fixed sizes and symbols making up the element count of a shape.
struct ElementCount {
    fixed: usize,
    symbols: SmallVec<[String; 2]>,
}

impl ElementCount {
    /// Count the elements of `dims`, failing if the fixed part overflows.
    fn of(dims: &[Dimension]) -> Result<ElementCount, InferShapesError> {
        let mut sizes = SmallVec::<[usize; 4]>::new();
        let mut symbols = SmallVec::new();
        for dim in dims {
            match dim {
                Dimension::Fixed(size) => sizes.push(*size),
                Dimension::Symbolic(name) => symbols.push(name.clone()),
            }
        }
        let fixed = element_count(&sizes)
            .ok_or_else(|| InferShapesError::incompatible(&[dims], "element count overflows"))?;
        Ok(ElementCount { fixed, symbols })
    }
}

/// Infer the size of the `-1` dimension in a reshape target.
///
/// Symbols that appear in both the input and the rest of the target cancel
/// out. If no symbols remain the size is fixed, if exactly one remains and
/// the fixed sizes match it is that symbol, otherwise it is a new symbol.
fn infer_reshape_dim(
    input: &[Dimension],
    target: &[Dimension],
    sym_gen: &mut SymbolGen,
) -> Result<Dimension, InferShapesError> {
    let mut in_count = ElementCount::of(input)?;
    let out_count = ElementCount::of(target)?;

    for symbol in &out_count.symbols {
        match in_count.symbols.iter().position(|s| s == symbol) {
            Some(pos) => {
                in_count.symbols.remove(pos);
            }
            None => return Ok(sym_gen.gen()),
        }
    }

    let divides = out_count.fixed != 0 && in_count.fixed % out_count.fixed == 0;
    match in_count.symbols.as_slice() {
        [] if divides => Ok(Dimension::Fixed(in_count.fixed / out_count.fixed)),
        [] => Err(InferShapesError::incompatible(
            &[input, target],
            format!(
                "cannot reshape {} elements into groups of {}",
                in_count.fixed, out_count.fixed
            ),
        )),
        [symbol] if divides && in_count.fixed == out_count.fixed => {
            Ok(Dimension::Symbolic(symbol.clone()))
        }
        _ => Ok(sym_gen.gen()),
    }
}

pub(super) fn reshape(
    attrs: &Attrs,
    inputs: &[Input],
    sym_gen: &mut SymbolGen,
) -> Result<ValueInfo, InferShapesError> {
    let (data, target) = match inputs {
        [data] => {
            let target = attrs.ints("shape").ok_or_else(|| {
                InferShapesError::attr(
                    "shape",
                    "target shape must be given as an attribute or a second input",
                )
            })?;
            (data, target.to_vec())
        }
        [data, shape] => {
            if shape.dtype() != DataType::Int64 {
                return Err(InferShapesError::TypeMismatch {
                    expected: DataType::Int64.to_string(),
                    actual: shape.dtype().to_string(),
                });
            }
            if shape.ndim() != 1 {
                return Err(InferShapesError::rank(
                    shape.shape(),
                    "target shape must be a vector",
                ));
            }
            match shape.constant.and_then(|c| c.to_i64_vec()) {
                Some(target) => (data, target),

                // The target shape is only known when the graph runs, so
                // only the output rank can be inferred.
                None => {
                    let Dimension::Fixed(ndim) = shape.shape()[0] else {
                        return Err(InferShapesError::rank(
                            shape.shape(),
                            "target shape length must be fixed",
                        ));
                    };
                    let out_shape = (0..ndim).map(|_| sym_gen.gen()).collect();
                    return Ok(ValueInfo::new(data.dtype(), out_shape));
                }
            }
        }
        _ => return Err(InferShapesError::IncorrectInputCount),
    };

    let mut out_shape = Shape::with_capacity(target.len());
    let mut infer_index = None;
    for (i, &size) in target.iter().enumerate() {
        let dim = match size {
            -1 if infer_index.is_some() => {
                return Err(InferShapesError::attr(
                    "shape",
                    "at most one dimension may be -1",
                ))
            }
            -1 => {
                infer_index = Some(i);
                Dimension::Fixed(1)
            }
            0 => data.shape().get(i).cloned().ok_or_else(|| {
                InferShapesError::attr(
                    "shape",
                    format!("size 0 at index {} has no matching input dimension", i),
                )
            })?,
            size if size > 0 => Dimension::Fixed(size as usize),
            size => {
                return Err(InferShapesError::attr(
                    "shape",
                    format!("invalid dimension size {}", size),
                ))
            }
        };
        out_shape.push(dim);
    }

    if let Some(index) = infer_index {
        let mut rest = out_shape.clone();
        rest.remove(index);
        out_shape[index] = infer_reshape_dim(data.shape(), &rest, sym_gen)?;
    } else {
        let in_count = ElementCount::of(data.shape())?;
        let out_count = ElementCount::of(&out_shape)?;
        if in_count.symbols.is_empty()
            && out_count.symbols.is_empty()
            && in_count.fixed != out_count.fixed
        {
            return Err(InferShapesError::incompatible(
                &[data.shape(), &out_shape],
                format!(
                    "cannot reshape {} elements into {}",
                    in_count.fixed,
                    format_shape(&out_shape)
                ),
            ));
        }
    }

    Ok(ValueInfo::new(data.dtype(), out_shape))
}

pub(super) fn flatten(
    attrs: &Attrs,
    inputs: &[Input],
    sym_gen: &mut SymbolGen,
) -> Result<ValueInfo, InferShapesError> {
    let [data] = inputs else {
        return Err(InferShapesError::IncorrectInputCount);
    };

    // Unlike most axis attributes, `axis` may equal the rank.
    let axis = resolve_axis(data.ndim() + 1, attrs.int("axis").unwrap_or(1), "axis")?;
    let (outer, inner) = data.shape().split_at(axis);
    let outer = dim_product(outer, sym_gen)?;
    let inner = dim_product(inner, sym_gen)?;
    Ok(ValueInfo::new(
        data.dtype(),
        [outer, inner].into_iter().collect(),
    ))
}

pub(super) fn transpose(attrs: &Attrs, inputs: &[Input]) -> Result<ValueInfo, InferShapesError> {
    let [data] = inputs else {
        return Err(InferShapesError::IncorrectInputCount);
    };
    let perm: SmallVec<[usize; 4]> = match attrs.ints("perm") {
        Some(perm) => {
            if perm.len() != data.ndim() {
                return Err(InferShapesError::attr(
                    "perm",
                    format!("expected {} values but got {}", data.ndim(), perm.len()),
                ));
            }
            resolve_axes(data.ndim(), perm, "perm")?
        }
        None => (0..data.ndim()).rev().collect(),
    };
    let out_shape = perm.iter().map(|&i| data.shape()[i].clone()).collect();
    Ok(ValueInfo::new(data.dtype(), out_shape))
}

pub(super) fn squeeze(attrs: &Attrs, inputs: &[Input]) -> Result<ValueInfo, InferShapesError> {
    let [data] = inputs else {
        return Err(InferShapesError::IncorrectInputCount);
    };

    let out_shape = match attrs.ints("axes") {
        Some(axes) => {
            let axes = resolve_axes(data.ndim(), axes, "axes")?;
            for &axis in &axes {
                if let Dimension::Fixed(size) = data.shape()[axis] {
                    if size != 1 {
                        return Err(InferShapesError::rank(
                            data.shape(),
                            format!("cannot squeeze axis {} of size {}", axis, size),
                        ));
                    }
                }
            }
            data.shape()
                .iter()
                .enumerate()
                .filter(|(i, _)| !axes.contains(i))
                .map(|(_, dim)| dim.clone())
                .collect()
        }
        None => data
            .shape()
            .iter()
            .filter(|dim| dim.fixed() != Some(1))
            .cloned()
            .collect(),
    };
    Ok(ValueInfo::new(data.dtype(), out_shape))
}

pub(super) fn unsqueeze(attrs: &Attrs, inputs: &[Input]) -> Result<ValueInfo, InferShapesError> {
    let [data] = inputs else {
        return Err(InferShapesError::IncorrectInputCount);
    };
    let axes = attrs.ints("axes").unwrap_or_default();
    let out_ndim = data.ndim() + axes.len();
    let axes = resolve_axes(out_ndim, axes, "axes")?;

    let mut in_dims = data.shape().iter();
    let out_shape = (0..out_ndim)
        .map(|i| {
            if axes.contains(&i) {
                Some(Dimension::Fixed(1))
            } else {
                in_dims.next().cloned()
            }
        })
        .collect::<Option<Shape>>()
        .unwrap_or_default();
    Ok(ValueInfo::new(data.dtype(), out_shape))
}

pub(super) fn concat(
    attrs: &Attrs,
    inputs: &[Input],
    sym_gen: &mut SymbolGen,
) -> Result<ValueInfo, InferShapesError> {
    let [first, rest @ ..] = inputs else {
        return Err(InferShapesError::IncorrectInputCount);
    };
    let axis = resolve_axis(first.ndim(), attrs.int("axis").unwrap_or(0), "axis")?;

    let mut out_shape: Shape = first.shape().into();
    for input in rest {
        same_dtype(first, input)?;
        if input.ndim() != first.ndim() {
            return Err(InferShapesError::incompatible(
                &[first.shape(), input.shape()],
                "inputs must have the same rank",
            ));
        }
        for (i, (out_dim, in_dim)) in out_shape.iter_mut().zip(input.shape()).enumerate() {
            if i == axis {
                continue;
            }
            let merged = match (&*out_dim, in_dim) {
                (Dimension::Fixed(x), Dimension::Fixed(y)) if x != y => {
                    return Err(InferShapesError::incompatible(
                        &[first.shape(), input.shape()],
                        format!("sizes {} and {} differ at dimension {}", x, y, i),
                    ));
                }
                (Dimension::Symbolic(_), Dimension::Fixed(_)) => Some(in_dim.clone()),
                _ => None,
            };
            if let Some(dim) = merged {
                *out_dim = dim;
            }
        }
    }

    let axis_dims: SmallVec<[Dimension; 4]> =
        inputs.iter().map(|input| input.shape()[axis].clone()).collect();
    out_shape[axis] = match axis_dims.as_slice() {
        [dim] => dim.clone(),
        dims => match fixed_shape(dims) {
            Some(sizes) => {
                let total = sizes.iter().try_fold(0usize, |acc, &size| acc.checked_add(size));
                let Some(total) = total else {
                    let shapes: Vec<&[Dimension]> = inputs.iter().map(|input| input.shape()).collect();
                    return Err(InferShapesError::incompatible(
                        &shapes,
                        format!("concatenated size of axis {} overflows", axis),
                    ));
                };
                Dimension::Fixed(total)
            }
            None => sym_gen.gen(),
        },
    };

    Ok(ValueInfo::new(first.dtype(), out_shape))
}

pub(super) fn gather(attrs: &Attrs, inputs: &[Input]) -> Result<ValueInfo, InferShapesError> {
    let [data, indices] = inputs else {
        return Err(InferShapesError::IncorrectInputCount);
    };
    if !matches!(indices.dtype(), DataType::Int32 | DataType::Int64) {
        return Err(InferShapesError::TypeMismatch {
            expected: "integer indices".into(),
            actual: indices.dtype().to_string(),
        });
    }
    let axis = resolve_axis(data.ndim(), attrs.int("axis").unwrap_or(0), "axis")?;

    let mut out_shape: Shape = data.shape()[..axis].into();
    out_shape.extend(indices.shape().iter().cloned());
    out_shape.extend(data.shape()[axis + 1..].iter().cloned());
    Ok(ValueInfo::new(data.dtype(), out_shape))
}

pub(super) fn split(
    attrs: &Attrs,
    inputs: &[Input],
    sym_gen: &mut SymbolGen,
) -> Result<Vec<ValueInfo>, InferShapesError> {
    let [data] = inputs else {
        return Err(InferShapesError::IncorrectInputCount);
    };
    let axis = resolve_axis(data.ndim(), attrs.int("axis").unwrap_or(0), "axis")?;
    let split_dim = &data.shape()[axis];

    let sizes: Vec<Dimension> = match (attrs.ints("split"), attrs.int("num_outputs")) {
        (Some(_), Some(_)) => {
            return Err(InferShapesError::attr(
                "split",
                "split and num_outputs cannot both be set",
            ))
        }
        (None, None) => {
            return Err(InferShapesError::attr(
                "split",
                "either split or num_outputs is required",
            ))
        }
        (Some(split), None) => {
            let sizes: Option<Vec<usize>> = split.iter().map(|&x| usize::try_from(x).ok()).collect();
            let sizes = sizes
                .filter(|s| !s.is_empty())
                .ok_or_else(|| InferShapesError::attr("split", format!("invalid sizes {:?}", split)))?;
            if let Dimension::Fixed(size) = split_dim {
                let total = sizes.iter().try_fold(0usize, |acc, &size| acc.checked_add(size));
                if total != Some(*size) {
                    return Err(InferShapesError::rank(
                        data.shape(),
                        format!(
                            "split sizes {:?} do not sum to size {} of axis {}",
                            split, size, axis
                        ),
                    ));
                }
            }
            sizes.into_iter().map(Dimension::Fixed).collect()
        }
        (None, Some(n)) => {
            let n = usize::try_from(n).ok().filter(|&n| n > 0).ok_or_else(|| {
                InferShapesError::attr("num_outputs", format!("invalid value {}", n))
            })?;
            match split_dim {
                // Chunks have equal size, except the last which may be
                // smaller.
                Dimension::Fixed(size) if n > (*size).max(1) => {
                    return Err(InferShapesError::rank(
                        data.shape(),
                        format!("axis {} of size {} cannot be split into {} outputs", axis, size, n),
                    ));
                }
                Dimension::Fixed(size) => {
                    let chunk = size.div_ceil(n);
                    let Some(last) = size.checked_sub(chunk * (n - 1)) else {
                        return Err(InferShapesError::rank(
                            data.shape(),
                            format!("axis {} of size {} cannot be split into {} outputs", axis, size, n),
                        ));
                    };
                    let mut sizes = vec![Dimension::Fixed(chunk); n - 1];
                    sizes.push(Dimension::Fixed(last));
                    sizes
                }
                Dimension::Symbolic(_) => (0..n).map(|_| sym_gen.gen()).collect(),
            }
        }
    };

    Ok(sizes
        .into_iter()
        .map(|size| {
            let mut shape: Shape = data.shape().into();
            shape[axis] = size;
            ValueInfo::new(data.dtype(), shape)
        })
        .collect())
}

pub(super) fn shape(inputs: &[Input]) -> Result<ValueInfo, InferShapesError> {
    let [data] = inputs else {
        return Err(InferShapesError::IncorrectInputCount);
    };
    Ok(ValueInfo::fixed(DataType::Int64, &[data.ndim()]))
}
