use crate::value::DataType;

/// Convert between a primitive type and an array of bytes in little-endian
/// order.
pub trait LeBytes {
    /// The `[u8; N]` array type holding the serialized bytes for this value.
    type Bytes: AsRef<[u8]> + for<'a> TryFrom<&'a [u8], Error = std::array::TryFromSliceError>;

    fn from_le_bytes(bytes: Self::Bytes) -> Self;
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_le_bytes {
    ($type:ty, $size:literal) => {
        impl LeBytes for $type {
            type Bytes = [u8; $size];

            fn from_le_bytes(bytes: Self::Bytes) -> Self {
                <$type>::from_le_bytes(bytes)
            }

            fn to_le_bytes(self) -> Self::Bytes {
                <$type>::to_le_bytes(self)
            }
        }
    };
}

impl_le_bytes!(i8, 1);
impl_le_bytes!(u8, 1);
impl_le_bytes!(u16, 2);
impl_le_bytes!(i32, 4);
impl_le_bytes!(u32, 4);
impl_le_bytes!(f32, 4);
impl_le_bytes!(i64, 8);
impl_le_bytes!(u64, 8);
impl_le_bytes!(f64, 8);

/// Get the [`DataType`] that corresponds to a given type.
pub trait DataTypeOf {
    /// Return the data type that corresponds to the `Self` type.
    fn dtype_of() -> DataType;
}

/// Element types which can be stored in a [`TensorData`](crate::TensorData).
///
/// Elements are always stored in little-endian order, using
/// [`DataType::size`] bytes per element.
pub trait Element: Copy + DataTypeOf {
    /// Append the little-endian encoding of `self` to `buf`.
    fn extend_le(self, buf: &mut Vec<u8>);

    /// Decode an element from a slice of exactly `Self::dtype_of().size()`
    /// bytes.
    fn from_le_slice(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($type:ty, $dtype:ident) => {
        impl DataTypeOf for $type {
            fn dtype_of() -> DataType {
                DataType::$dtype
            }
        }

        impl Element for $type {
            fn extend_le(self, buf: &mut Vec<u8>) {
                buf.extend(LeBytes::to_le_bytes(self));
            }

            fn from_le_slice(bytes: &[u8]) -> Self {
                // Callers pass exactly `size_of::<$type>()` bytes.
                <$type as LeBytes>::from_le_bytes(bytes.try_into().unwrap())
            }
        }
    };
}

impl_element!(f32, Float32);
impl_element!(f64, Float64);
impl_element!(i8, Int8);
impl_element!(u8, UInt8);
impl_element!(i32, Int32);
impl_element!(i64, Int64);

impl DataTypeOf for bool {
    fn dtype_of() -> DataType {
        DataType::Bool
    }
}

impl Element for bool {
    fn extend_le(self, buf: &mut Vec<u8>) {
        buf.push(self as u8);
    }

    fn from_le_slice(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

#[cfg(test)]
mod tests {
    use super::{DataTypeOf, Element, LeBytes};
    use crate::value::DataType;

    #[test]
    fn test_le_bytes() {
        assert_eq!(LeBytes::to_le_bytes(0x0102u16), [0x02, 0x01]);
        assert_eq!(<u32 as LeBytes>::from_le_bytes([1, 0, 0, 0]), 1);
        assert_eq!(LeBytes::to_le_bytes(-1i64), [0xff; 8]);
    }

    #[test]
    fn test_element_encoding() {
        let mut buf = Vec::new();
        1.5f32.extend_le(&mut buf);
        true.extend_le(&mut buf);
        (-2i64).extend_le(&mut buf);
        assert_eq!(buf.len(), 4 + 1 + 8);

        assert_eq!(f32::from_le_slice(&buf[0..4]), 1.5);
        assert!(bool::from_le_slice(&buf[4..5]));
        assert_eq!(i64::from_le_slice(&buf[5..]), -2);
    }

    #[test]
    fn test_dtype_of() {
        assert_eq!(f32::dtype_of(), DataType::Float32);
        assert_eq!(i64::dtype_of(), DataType::Int64);
        assert_eq!(bool::dtype_of(), DataType::Bool);
    }
}
