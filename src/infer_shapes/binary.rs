use smallvec::SmallVec;

use super::{same_dtype, Input, InferShapesError, SymbolGen};
use crate::attrs::Attrs;
use crate::value::{DataType, Dimension, Shape, ValueInfo};

/// Broadcast two shapes together.
///
/// Shapes are aligned from the trailing dimension. Each pair of dimensions
/// must be equal or one of them must be 1. A symbolic dimension paired with a
/// fixed size other than 1 resolves to the fixed size, since execution can
/// only succeed if they match. Two different symbols resolve to a new symbol.
pub fn broadcast_shapes(
    a: &[Dimension],
    b: &[Dimension],
    sym_gen: &mut SymbolGen,
) -> Result<Shape, InferShapesError> {
    let ndim = a.len().max(b.len());
    let one = Dimension::Fixed(1);

    // Compare from the trailing dimension so the first conflict reported is
    // the innermost one.
    let mut out_shape = Shape::with_capacity(ndim);
    for i in 0..ndim {
        let a_dim = a.len().checked_sub(i + 1).map_or(&one, |d| &a[d]);
        let b_dim = b.len().checked_sub(i + 1).map_or(&one, |d| &b[d]);
        let dim = match (a_dim, b_dim) {
            (x, y) if x == y => x.clone(),

            // If either size is 1, it will be broadcast against the other
            // size.
            (Dimension::Fixed(1), y) => y.clone(),
            (x, Dimension::Fixed(1)) => x.clone(),

            (Dimension::Fixed(x), Dimension::Fixed(y)) => {
                return Err(InferShapesError::incompatible(
                    &[a, b],
                    format!("dimension sizes {} and {} cannot be broadcast", x, y),
                ));
            }

            (Dimension::Symbolic(_), Dimension::Fixed(y)) => Dimension::Fixed(*y),
            (Dimension::Fixed(x), Dimension::Symbolic(_)) => Dimension::Fixed(*x),
            (Dimension::Symbolic(_), Dimension::Symbolic(_)) => sym_gen.gen(),
        };
        out_shape.push(dim);
    }
    out_shape.reverse();

    Ok(out_shape)
}

/// Return true if two dimensions may have the same size.
fn dims_compatible(a: &Dimension, b: &Dimension) -> bool {
    match (a, b) {
        (Dimension::Fixed(x), Dimension::Fixed(y)) => x == y,
        _ => true,
    }
}

pub(super) fn arithmetic(
    inputs: &[Input],
    sym_gen: &mut SymbolGen,
) -> Result<ValueInfo, InferShapesError> {
    let [a, b] = inputs else {
        return Err(InferShapesError::IncorrectInputCount);
    };
    same_dtype(a, b)?;
    let shape = broadcast_shapes(a.shape(), b.shape(), sym_gen)?;
    Ok(ValueInfo::new(a.dtype(), shape))
}

/// The exponent of `Pow` may have a different numeric type than the base.
pub(super) fn pow(inputs: &[Input], sym_gen: &mut SymbolGen) -> Result<ValueInfo, InferShapesError> {
    let [base, exp] = inputs else {
        return Err(InferShapesError::IncorrectInputCount);
    };
    if !exp.dtype().is_numeric() {
        return Err(InferShapesError::TypeMismatch {
            expected: "a numeric exponent".into(),
            actual: exp.dtype().to_string(),
        });
    }
    let shape = broadcast_shapes(base.shape(), exp.shape(), sym_gen)?;
    Ok(ValueInfo::new(base.dtype(), shape))
}

pub(super) fn compare(
    inputs: &[Input],
    sym_gen: &mut SymbolGen,
) -> Result<ValueInfo, InferShapesError> {
    let ValueInfo { shape, .. } = arithmetic(inputs, sym_gen)?;
    Ok(ValueInfo::new(DataType::Bool, shape))
}

pub(super) fn where_op(
    inputs: &[Input],
    sym_gen: &mut SymbolGen,
) -> Result<ValueInfo, InferShapesError> {
    let [cond, x, y] = inputs else {
        return Err(InferShapesError::IncorrectInputCount);
    };
    if cond.dtype() != DataType::Bool {
        return Err(InferShapesError::TypeMismatch {
            expected: DataType::Bool.to_string(),
            actual: cond.dtype().to_string(),
        });
    }
    same_dtype(x, y)?;
    let shape = broadcast_shapes(cond.shape(), x.shape(), sym_gen)?;
    let shape = broadcast_shapes(&shape, y.shape(), sym_gen)?;
    Ok(ValueInfo::new(x.dtype(), shape))
}

/// `Clip` takes optional scalar `min` and `max` inputs.
pub(super) fn clip(inputs: &[Input]) -> Result<ValueInfo, InferShapesError> {
    let [data, bounds @ ..] = inputs else {
        return Err(InferShapesError::IncorrectInputCount);
    };
    if bounds.len() > 2 {
        return Err(InferShapesError::IncorrectInputCount);
    }
    for bound in bounds {
        same_dtype(data, bound)?;
        if bound.ndim() != 0 {
            return Err(InferShapesError::rank(
                bound.shape(),
                "clip bounds must be scalars",
            ));
        }
    }
    Ok(data.info.clone())
}

pub(super) fn matmul(
    inputs: &[Input],
    sym_gen: &mut SymbolGen,
) -> Result<ValueInfo, InferShapesError> {
    let [a, b] = inputs else {
        return Err(InferShapesError::IncorrectInputCount);
    };
    same_dtype(a, b)?;

    for input in [a, b] {
        if input.ndim() == 0 {
            return Err(InferShapesError::rank(
                input.shape(),
                "matmul operands must have at least one dimension",
            ));
        }
    }

    // 1-D operands are promoted to matrices, then the added dimension is
    // removed from the output.
    let one = Dimension::Fixed(1);
    let a_shape: SmallVec<[Dimension; 4]> = if a.ndim() == 1 {
        [one.clone(), a.shape()[0].clone()].into_iter().collect()
    } else {
        a.shape().into()
    };
    let b_shape: SmallVec<[Dimension; 4]> = if b.ndim() == 1 {
        [b.shape()[0].clone(), one].into_iter().collect()
    } else {
        b.shape().into()
    };

    let (a_batch, a_mat) = a_shape.split_at(a_shape.len() - 2);
    let (b_batch, b_mat) = b_shape.split_at(b_shape.len() - 2);

    if !dims_compatible(&a_mat[1], &b_mat[0]) {
        return Err(InferShapesError::incompatible(
            &[a.shape(), b.shape()],
            format!(
                "inner dimensions {} and {} do not match",
                a_mat[1], b_mat[0]
            ),
        ));
    }

    let mut out_shape = broadcast_shapes(a_batch, b_batch, sym_gen)?;
    if a.ndim() > 1 {
        out_shape.push(a_mat[0].clone());
    }
    if b.ndim() > 1 {
        out_shape.push(b_mat[1].clone());
    }
    Ok(ValueInfo::new(a.dtype(), out_shape))
}

pub(super) fn gemm(
    attrs: &Attrs,
    inputs: &[Input],
    sym_gen: &mut SymbolGen,
) -> Result<ValueInfo, InferShapesError> {
    let [a, b, c @ ..] = inputs else {
        return Err(InferShapesError::IncorrectInputCount);
    };
    same_dtype(a, b)?;

    for input in [a, b] {
        if input.ndim() != 2 {
            return Err(InferShapesError::rank(
                input.shape(),
                "gemm operands must be matrices",
            ));
        }
    }

    let trans_a = attrs.int("transA").unwrap_or(0) != 0;
    let trans_b = attrs.int("transB").unwrap_or(0) != 0;
    let (m, k_a) = if trans_a {
        (&a.shape()[1], &a.shape()[0])
    } else {
        (&a.shape()[0], &a.shape()[1])
    };
    let (k_b, n) = if trans_b {
        (&b.shape()[1], &b.shape()[0])
    } else {
        (&b.shape()[0], &b.shape()[1])
    };

    if !dims_compatible(k_a, k_b) {
        return Err(InferShapesError::incompatible(
            &[a.shape(), b.shape()],
            format!("inner dimensions {} and {} do not match", k_a, k_b),
        ));
    }

    let out_shape: Shape = [m.clone(), n.clone()].into_iter().collect();

    match c {
        [] => {}
        [c] => {
            same_dtype(a, c)?;
            let broadcast = broadcast_shapes(c.shape(), &out_shape, sym_gen)?;
            if broadcast != out_shape {
                return Err(InferShapesError::incompatible(
                    &[c.shape(), &out_shape],
                    "bias cannot be broadcast to the output shape",
                ));
            }
        }
        _ => return Err(InferShapesError::IncorrectInputCount),
    }

    Ok(ValueInfo::new(a.dtype(), out_shape))
}
