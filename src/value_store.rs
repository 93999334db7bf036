use rustc_hash::FxHashMap;

use crate::error::ExportError;
use crate::value::{fixed_shape, format_shape, TensorData, TensorDesc};

struct Entry {
    desc: TensorDesc,
    data: Option<TensorData>,
}

/// Named tensor values that are live during a trace.
///
/// Each value has a descriptor (type and shape) and, if it is a constant,
/// its data. Values are kept in declaration order so that iteration is
/// deterministic.
#[derive(Default)]
pub struct ValueStore {
    values: FxHashMap<String, Entry>,
    order: Vec<String>,
}

impl ValueStore {
    pub fn new() -> ValueStore {
        ValueStore::default()
    }

    /// Declare a new value.
    ///
    /// Fails with [`ExportError::DuplicateName`] if the name is taken.
    pub fn declare(&mut self, desc: TensorDesc) -> Result<(), ExportError> {
        if self.values.contains_key(&desc.name) {
            return Err(ExportError::DuplicateName { name: desc.name });
        }
        self.order.push(desc.name.clone());
        self.values.insert(desc.name.clone(), Entry { desc, data: None });
        Ok(())
    }

    /// Declare a value and bind its data in one step.
    pub fn declare_constant(&mut self, name: &str, data: TensorData) -> Result<(), ExportError> {
        self.declare(TensorDesc::with_info(name, data.info()))?;
        if let Some(entry) = self.values.get_mut(name) {
            entry.data = Some(data);
        }
        Ok(())
    }

    /// Bind constant data to a declared value.
    ///
    /// Fails with [`ExportError::TypeMismatch`] if the length of `bytes` is
    /// inconsistent with the value's element type and shape, or if the shape
    /// has symbolic dimensions.
    pub fn bind_constant(&mut self, name: &str, bytes: Vec<u8>) -> Result<(), ExportError> {
        let Some(entry) = self.values.get_mut(name) else {
            return Err(ExportError::UseBeforeDefinition {
                node: None,
                name: name.to_string(),
            });
        };
        let Some(shape) = fixed_shape(&entry.desc.shape) else {
            return Err(ExportError::TypeMismatch {
                node: None,
                expected: "a constant with a fixed shape".into(),
                actual: format_shape(&entry.desc.shape),
            });
        };
        entry.data = Some(TensorData::from_bytes(entry.desc.dtype, &shape, bytes)?);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TensorDesc> {
        self.values.get(name).map(|entry| &entry.desc)
    }

    /// Return the data bound to a value, if it is a constant.
    pub fn constant(&self, name: &str) -> Option<&TensorData> {
        self.values.get(name).and_then(|entry| entry.data.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Give a value a new name, keeping its position in declaration order.
    pub fn rename(&mut self, old_name: &str, new_name: &str) -> Result<(), ExportError> {
        if self.values.contains_key(new_name) {
            return Err(ExportError::DuplicateName {
                name: new_name.to_string(),
            });
        }
        let Some(mut entry) = self.values.remove(old_name) else {
            return Err(ExportError::UseBeforeDefinition {
                node: None,
                name: old_name.to_string(),
            });
        };
        entry.desc.name = new_name.to_string();
        self.values.insert(new_name.to_string(), entry);
        if let Some(pos) = self.order.iter().position(|n| n == old_name) {
            self.order[pos] = new_name.to_string();
        }
        Ok(())
    }

    /// Remove a value, returning its descriptor.
    pub fn remove(&mut self, name: &str) -> Option<TensorDesc> {
        let entry = self.values.remove(name)?;
        self.order.retain(|n| n != name);
        Some(entry.desc)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Iterate over value descriptors in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &TensorDesc> {
        self.order.iter().filter_map(|name| self.get(name))
    }

    /// Consume the store and return the constant values, in declaration
    /// order.
    pub fn into_constants(mut self) -> Vec<(String, TensorData)> {
        self.order
            .into_iter()
            .filter_map(|name| {
                let data = self.values.remove(&name)?.data?;
                Some((name, data))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::ValueStore;
    use crate::dims;
    use crate::error::ErrorKind;
    use crate::value::{DataType, TensorData, TensorDesc};

    #[test]
    fn test_declare() {
        let mut store = ValueStore::new();
        store
            .declare(TensorDesc::new("x", DataType::Float32, dims![1, 4]))
            .unwrap();
        assert!(store.contains("x"));
        assert_eq!(store.get("x").unwrap().shape, dims![1, 4]);

        let err = store
            .declare(TensorDesc::new("x", DataType::Int64, dims![2]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateName);
        assert_eq!(err.to_string(), "value \"x\" is already declared");
    }

    #[test]
    fn test_bind_constant() {
        let mut store = ValueStore::new();
        store
            .declare(TensorDesc::new("bias", DataType::Float32, dims![4]))
            .unwrap();

        let err = store.bind_constant("bias", vec![0; 12]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
        assert!(store.constant("bias").is_none());

        store.bind_constant("bias", vec![0; 16]).unwrap();
        assert_eq!(store.constant("bias").unwrap().len(), 4);

        store
            .declare(TensorDesc::new("x", DataType::Float32, dims!["batch", 4]))
            .unwrap();
        let err = store.bind_constant("x", vec![0; 16]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);

        let err = store.bind_constant("missing", vec![]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UseBeforeDefinition);
    }

    #[test]
    fn test_rename_keeps_order() {
        let mut store = ValueStore::new();
        store
            .declare_constant("a", TensorData::scalar(1.0f32))
            .unwrap();
        store
            .declare(TensorDesc::new("t1", DataType::Float32, dims![]))
            .unwrap();
        store
            .declare_constant("b", TensorData::scalar(2i64))
            .unwrap();

        store.rename("t1", "output").unwrap();
        let names: Vec<_> = store.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["a", "output", "b"]);

        let err = store.rename("output", "a").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateName);

        store.remove("a");
        let constants: Vec<_> = store
            .into_constants()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(constants, ["b"]);
    }
}
