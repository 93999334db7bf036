//! Operator attributes.

use std::collections::BTreeMap;
use std::fmt;

use crate::value::TensorData;

/// Type of an attribute value.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AttrType {
    Int,
    Float,
    String,
    Tensor,
    Ints,
    Floats,
    Strings,
}

impl AttrType {
    const ALL: [AttrType; 7] = [
        AttrType::Int,
        AttrType::Float,
        AttrType::String,
        AttrType::Tensor,
        AttrType::Ints,
        AttrType::Floats,
        AttrType::Strings,
    ];

    /// Return the tag used to identify this type in serialized artifacts.
    pub fn tag(self) -> u8 {
        match self {
            AttrType::Int => 1,
            AttrType::Float => 2,
            AttrType::String => 3,
            AttrType::Tensor => 4,
            AttrType::Ints => 5,
            AttrType::Floats => 6,
            AttrType::Strings => 7,
        }
    }

    pub fn from_tag(tag: u8) -> Option<AttrType> {
        Self::ALL.into_iter().find(|ty| ty.tag() == tag)
    }
}

impl fmt::Display for AttrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttrType::Int => "int",
            AttrType::Float => "float",
            AttrType::String => "string",
            AttrType::Tensor => "tensor",
            AttrType::Ints => "ints",
            AttrType::Floats => "floats",
            AttrType::Strings => "strings",
        };
        f.write_str(name)
    }
}

/// Value of an operator attribute.
#[derive(Clone, Debug, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Float(f32),
    String(String),
    Tensor(TensorData),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
    Strings(Vec<String>),
}

impl AttrValue {
    pub fn attr_type(&self) -> AttrType {
        match self {
            AttrValue::Int(_) => AttrType::Int,
            AttrValue::Float(_) => AttrType::Float,
            AttrValue::String(_) => AttrType::String,
            AttrValue::Tensor(_) => AttrType::Tensor,
            AttrValue::Ints(_) => AttrType::Ints,
            AttrValue::Floats(_) => AttrType::Floats,
            AttrValue::Strings(_) => AttrType::Strings,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Int(x) => write!(f, "{}", x),
            AttrValue::Float(x) => write!(f, "{}", x),
            AttrValue::String(x) => write!(f, "\"{}\"", x),
            AttrValue::Tensor(t) => write!(f, "tensor<{} {:?}>", t.dtype(), t.shape()),
            AttrValue::Ints(xs) => write!(f, "{:?}", xs),
            AttrValue::Floats(xs) => write!(f, "{:?}", xs),
            AttrValue::Strings(xs) => write!(f, "{:?}", xs),
        }
    }
}

macro_rules! impl_attr_from {
    ($type:ty, $variant:ident) => {
        impl From<$type> for AttrValue {
            fn from(val: $type) -> AttrValue {
                AttrValue::$variant(val.into())
            }
        }
    };
}

impl_attr_from!(i64, Int);
impl_attr_from!(f32, Float);
impl_attr_from!(String, String);
impl_attr_from!(&str, String);
impl_attr_from!(TensorData, Tensor);
impl_attr_from!(Vec<i64>, Ints);
impl_attr_from!(&[i64], Ints);
impl_attr_from!(Vec<f32>, Floats);
impl_attr_from!(Vec<String>, Strings);

// Unsuffixed literals default to `i32` and `f64`.
impl From<i32> for AttrValue {
    fn from(val: i32) -> AttrValue {
        AttrValue::Int(val as i64)
    }
}

impl From<f64> for AttrValue {
    fn from(val: f64) -> AttrValue {
        AttrValue::Float(val as f32)
    }
}

/// Attributes of a graph node, keyed by name.
///
/// Attributes are kept sorted by name so that iteration, and hence
/// serialization, order is stable.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Attrs {
    map: BTreeMap<String, AttrValue>,
}

impl Attrs {
    pub fn new() -> Attrs {
        Attrs::default()
    }

    /// Return `self` with an attribute added.
    pub fn with(mut self, name: &str, value: impl Into<AttrValue>) -> Attrs {
        self.insert(name, value);
        self
    }

    /// Set an attribute, returning the previous value if any.
    pub fn insert(&mut self, name: &str, value: impl Into<AttrValue>) -> Option<AttrValue> {
        self.map.insert(name.to_string(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.map.get(name)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            AttrValue::Int(x) => Some(*x),
            _ => None,
        }
    }

    pub fn float(&self, name: &str) -> Option<f32> {
        match self.get(name)? {
            AttrValue::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn string(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            AttrValue::String(x) => Some(x),
            _ => None,
        }
    }

    pub fn tensor(&self, name: &str) -> Option<&TensorData> {
        match self.get(name)? {
            AttrValue::Tensor(x) => Some(x),
            _ => None,
        }
    }

    pub fn ints(&self, name: &str) -> Option<&[i64]> {
        match self.get(name)? {
            AttrValue::Ints(x) => Some(x),
            _ => None,
        }
    }

    pub fn floats(&self, name: &str) -> Option<&[f32]> {
        match self.get(name)? {
            AttrValue::Floats(x) => Some(x),
            _ => None,
        }
    }

    /// Iterate over attributes in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
