//! Element types, shapes and tensor values.

use std::fmt;

use smallvec::SmallVec;

use crate::error::ExportError;
use crate::number::Element;

/// Element type of a tensor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataType {
    Float32,
    Float64,
    Int8,
    UInt8,
    Int32,
    Int64,
    Bool,
}

impl DataType {
    /// All supported data types, in wire tag order.
    pub const ALL: [DataType; 7] = [
        DataType::Float32,
        DataType::Float64,
        DataType::Int8,
        DataType::UInt8,
        DataType::Int32,
        DataType::Int64,
        DataType::Bool,
    ];

    /// Return the size of elements of this type in bytes.
    pub fn size(self) -> usize {
        match self {
            DataType::Float64 | DataType::Int64 => 8,
            DataType::Float32 | DataType::Int32 => 4,
            DataType::Int8 | DataType::UInt8 | DataType::Bool => 1,
        }
    }

    /// Return true if this is a floating point type.
    pub fn is_float(self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float64)
    }

    /// Return true if this is a type that supports arithmetic.
    pub fn is_numeric(self) -> bool {
        self != DataType::Bool
    }

    /// Return the tag used to identify this type in serialized artifacts.
    pub fn tag(self) -> u8 {
        match self {
            DataType::Float32 => 1,
            DataType::Float64 => 2,
            DataType::Int8 => 3,
            DataType::UInt8 => 4,
            DataType::Int32 => 5,
            DataType::Int64 => 6,
            DataType::Bool => 7,
        }
    }

    /// Return the data type with a given tag, if any.
    pub fn from_tag(tag: u8) -> Option<DataType> {
        Self::ALL.into_iter().find(|dtype| dtype.tag() == tag)
    }
}

impl fmt::Display for DataType {
    /// Format this enum value in the style of the corresponding Rust type (eg.
    /// "i32" for `DataType::Int32`).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Float32 => "f32",
            DataType::Float64 => "f64",
            DataType::Int8 => "i8",
            DataType::UInt8 => "u8",
            DataType::Int32 => "i32",
            DataType::Int64 => "i64",
            DataType::Bool => "bool",
        };
        f.write_str(name)
    }
}

/// Size of a single tensor dimension.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Dimension {
    /// A dimension whose size is fixed.
    Fixed(usize),

    /// A dimension whose size is only known when the graph runs. The symbol
    /// identifies dimensions which share a size.
    Symbolic(String),
}

impl Dimension {
    /// Return the size if this dimension is fixed.
    pub fn fixed(&self) -> Option<usize> {
        match self {
            Dimension::Fixed(size) => Some(*size),
            Dimension::Symbolic(_) => None,
        }
    }
}

impl From<usize> for Dimension {
    fn from(val: usize) -> Dimension {
        Dimension::Fixed(val)
    }
}

impl From<String> for Dimension {
    fn from(name: String) -> Dimension {
        Dimension::Symbolic(name)
    }
}

impl<'a> From<&'a str> for Dimension {
    fn from(name: &'a str) -> Dimension {
        Dimension::Symbolic(name.into())
    }
}

impl fmt::Debug for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(size) => write!(f, "{}", size),
            Self::Symbolic(name) => write!(f, "\"{}\"", name),
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(size) => write!(f, "{}", size),
            Self::Symbolic(name) => f.write_str(name),
        }
    }
}

/// Shape of a tensor, as a list of fixed or symbolic dimensions.
pub type Shape = SmallVec<[Dimension; 4]>;

/// Create a [`Shape`] from a list of symbolic names and fixed sizes.
#[macro_export]
macro_rules! dims {
    ($($x:expr),* $(,)?) => {
        $crate::Shape::from_iter([$($crate::Dimension::from($x)),*])
    };
}

/// Format a shape as eg. `[batch, 3, 224, 224]`.
pub fn format_shape(shape: &[Dimension]) -> String {
    let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
    format!("[{}]", dims.join(", "))
}

/// Return the shape as a list of sizes, if all dimensions are fixed.
pub fn fixed_shape(shape: &[Dimension]) -> Option<Vec<usize>> {
    shape.iter().map(|d| d.fixed()).collect()
}

/// Element type and shape of a value, without a name.
///
/// This is what shape inference computes for each operator output.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueInfo {
    pub dtype: DataType,
    pub shape: Shape,
}

impl ValueInfo {
    pub fn new(dtype: DataType, shape: Shape) -> ValueInfo {
        ValueInfo { dtype, shape }
    }

    /// Create value info for a tensor whose dimensions are all fixed.
    pub fn fixed(dtype: DataType, shape: &[usize]) -> ValueInfo {
        ValueInfo {
            dtype,
            shape: shape.iter().copied().map(Dimension::Fixed).collect(),
        }
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }
}

impl fmt::Display for ValueInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.dtype, format_shape(&self.shape))
    }
}

/// Descriptor for a named tensor value in a graph.
///
/// Names are unique within a graph.
#[derive(Clone, Debug, PartialEq)]
pub struct TensorDesc {
    pub name: String,
    pub dtype: DataType,
    pub shape: Shape,
}

impl TensorDesc {
    pub fn new(name: impl Into<String>, dtype: DataType, shape: Shape) -> TensorDesc {
        TensorDesc {
            name: name.into(),
            dtype,
            shape,
        }
    }

    /// Create a descriptor from a name and inferred value info.
    pub fn with_info(name: impl Into<String>, info: ValueInfo) -> TensorDesc {
        TensorDesc::new(name, info.dtype, info.shape)
    }

    /// Return the type and shape of this value without the name.
    pub fn info(&self) -> ValueInfo {
        ValueInfo::new(self.dtype, self.shape.clone())
    }
}

impl fmt::Display for TensorDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\"{}\": {} {}",
            self.name,
            self.dtype,
            format_shape(&self.shape)
        )
    }
}

/// Return the number of elements in a tensor with a given shape, or `None`
/// if the count overflows.
///
/// A shape with a zero-size dimension has no elements, however large its
/// other dimensions are.
pub fn element_count(shape: &[usize]) -> Option<usize> {
    if shape.contains(&0) {
        return Some(0);
    }
    shape.iter().try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
}

/// Return the number of bytes a tensor with a given type and shape occupies,
/// or `None` if the size overflows.
pub fn byte_len(dtype: DataType, shape: &[usize]) -> Option<usize> {
    element_count(shape)?.checked_mul(dtype.size())
}

/// A tensor with concrete shape and data.
///
/// Data is stored as little-endian bytes so that tensors of any element type
/// can be held and serialized uniformly. This is used for sample inputs,
/// learned parameters, constant operands and tensor-valued attributes.
#[derive(Clone, PartialEq)]
pub struct TensorData {
    dtype: DataType,
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

impl TensorData {
    /// Create a tensor from a shape and elements.
    ///
    /// Panics if the number of elements does not match the shape.
    pub fn from_vec<T: Element>(shape: &[usize], data: Vec<T>) -> TensorData {
        let len = element_count(shape);
        assert_eq!(
            len,
            Some(data.len()),
            "element count {} does not match shape {:?}",
            data.len(),
            shape
        );
        let dtype = T::dtype_of();
        let mut bytes = Vec::with_capacity(data.len() * dtype.size());
        for x in data {
            x.extend_le(&mut bytes);
        }
        TensorData {
            dtype,
            shape: shape.to_vec(),
            bytes,
        }
    }

    /// Create a scalar (zero-dimensional) tensor.
    pub fn scalar<T: Element>(value: T) -> TensorData {
        Self::from_vec(&[], vec![value])
    }

    /// Create a tensor filled with zero bytes.
    ///
    /// Panics if the byte length of the tensor overflows.
    pub fn zeros(dtype: DataType, shape: &[usize]) -> TensorData {
        let len = byte_len(dtype, shape).unwrap_or_else(|| {
            panic!("size of {} tensor with shape {:?} overflows", dtype, shape)
        });
        TensorData {
            dtype,
            shape: shape.to_vec(),
            bytes: vec![0; len],
        }
    }

    /// Create a tensor from raw little-endian bytes.
    ///
    /// Fails with [`ExportError::TypeMismatch`] if the byte length is
    /// inconsistent with the type and shape.
    pub fn from_bytes(
        dtype: DataType,
        shape: &[usize],
        bytes: Vec<u8>,
    ) -> Result<TensorData, ExportError> {
        let expected = byte_len(dtype, shape);
        if expected != Some(bytes.len()) {
            return Err(ExportError::TypeMismatch {
                node: None,
                expected: format!(
                    "{} bytes for {} {:?}",
                    expected.map(|n| n.to_string()).unwrap_or("(overflow)".into()),
                    dtype,
                    shape
                ),
                actual: format!("{} bytes", bytes.len()),
            });
        }
        Ok(TensorData {
            dtype,
            shape: shape.to_vec(),
            bytes,
        })
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Return the number of elements in the tensor.
    pub fn len(&self) -> usize {
        self.bytes.len() / self.dtype.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the little-endian encoded element data.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Return the element type and shape of this tensor.
    pub fn info(&self) -> ValueInfo {
        ValueInfo::fixed(self.dtype, &self.shape)
    }

    /// Decode the elements of this tensor, or return `None` if `T` does not
    /// match the element type.
    pub fn to_vec<T: Element>(&self) -> Option<Vec<T>> {
        if T::dtype_of() != self.dtype {
            return None;
        }
        Some(
            self.bytes
                .chunks_exact(self.dtype.size())
                .map(T::from_le_slice)
                .collect(),
        )
    }

    /// Decode the elements of an integer tensor as `i64` values.
    pub fn to_i64_vec(&self) -> Option<Vec<i64>> {
        match self.dtype {
            DataType::Int64 => self.to_vec::<i64>(),
            DataType::Int32 => self
                .to_vec::<i32>()
                .map(|xs| xs.into_iter().map(|x| x as i64).collect()),
            _ => None,
        }
    }
}

impl fmt::Debug for TensorData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorData")
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}
