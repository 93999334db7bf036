use smallvec::SmallVec;

use super::{resolve_axes, resolve_axis, Input, InferShapesError};
use crate::attrs::Attrs;
use crate::value::{DataType, Dimension, Shape, ValueInfo};

/// Remove the dimensions at `axes` or, if `keep_dims` is true, replace them
/// with 1.
fn reduce_shape(shape: &[Dimension], axes: &[usize], keep_dims: bool) -> Shape {
    shape
        .iter()
        .enumerate()
        .filter_map(|(i, dim)| {
            if !axes.contains(&i) {
                Some(dim.clone())
            } else if keep_dims {
                Some(Dimension::Fixed(1))
            } else {
                None
            }
        })
        .collect()
}

/// Shape inference for reduction operators.
///
/// If the `axes` attribute is absent, all dimensions are reduced.
pub(super) fn reduce(attrs: &Attrs, inputs: &[Input]) -> Result<ValueInfo, InferShapesError> {
    let [data] = inputs else {
        return Err(InferShapesError::IncorrectInputCount);
    };
    let keep_dims = attrs.int("keepdims").unwrap_or(1) != 0;
    let axes: SmallVec<[usize; 4]> = match attrs.ints("axes") {
        Some(axes) => resolve_axes(data.ndim(), axes, "axes")?,
        None => (0..data.ndim()).collect(),
    };
    Ok(ValueInfo::new(
        data.dtype(),
        reduce_shape(data.shape(), &axes, keep_dims),
    ))
}

pub(super) fn arg_max(attrs: &Attrs, inputs: &[Input]) -> Result<ValueInfo, InferShapesError> {
    let [data] = inputs else {
        return Err(InferShapesError::IncorrectInputCount);
    };
    let keep_dims = attrs.int("keepdims").unwrap_or(1) != 0;
    let axis = resolve_axis(data.ndim(), attrs.int("axis").unwrap_or(0), "axis")?;
    Ok(ValueInfo::new(
        DataType::Int64,
        reduce_shape(data.shape(), &[axis], keep_dims),
    ))
}

#[cfg(test)]
mod tests {
    use gcap_testing::TestCases;

    use crate::attrs::Attrs;
    use crate::dims;
    use crate::infer_shapes::tests::{f32_info, infer};
    use crate::op_registry::OpKind;
    use crate::value::{DataType, ValueInfo};
    use crate::Shape;

    #[test]
    fn test_reduce() {
        #[derive(Debug)]
        struct Case {
            attrs: Attrs,
            expected: Option<Shape>,
        }

        let cases = [
            Case {
                attrs: Attrs::new(),
                expected: Some(dims![1, 1, 1]),
            },
            Case {
                attrs: Attrs::new().with("keepdims", 0),
                expected: Some(dims![]),
            },
            Case {
                attrs: Attrs::new().with("axes", vec![-1i64]),
                expected: Some(dims!["batch", 8, 1]),
            },
            Case {
                attrs: Attrs::new()
                    .with("axes", vec![2i64, 1])
                    .with("keepdims", 0),
                expected: Some(dims!["batch"]),
            },
            Case {
                attrs: Attrs::new().with("axes", vec![3i64]),
                expected: None,
            },
        ];

        cases.test_each(|case| {
            let input = f32_info(dims!["batch", 8, 16]);
            let result = infer(OpKind::ReduceMean, case.attrs.clone(), &[input]);
            assert_eq!(result.ok().map(|out| out[0].shape.clone()), case.expected);
        });
    }

    #[test]
    fn test_arg_max() {
        let input = f32_info(dims!["batch", 10]);
        let attrs = Attrs::new().with("axis", 1).with("keepdims", 0);
        let out = infer(OpKind::ArgMax, attrs, &[input]).unwrap();
        assert_eq!(out[0], ValueInfo::new(DataType::Int64, dims!["batch"]));
    }
}
