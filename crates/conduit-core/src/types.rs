use crate::CoreError;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Keyed data carried through a flow instance
///
/// Values are stored as JSON so that a paused instance, including everything
/// its steps have written, can be serialized and resumed in another process.
/// Writes append or overwrite by key.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct DataBag {
    entries: BTreeMap<String, Value>,
}

impl DataBag {
    /// Create an empty data bag
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a data bag from a JSON object; any other value yields an empty bag
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self {
                entries: map.into_iter().collect(),
            },
            _ => Self::default(),
        }
    }

    /// Insert a serializable value, overwriting any previous value under `key`
    pub fn insert<T: Serialize + ?Sized>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), CoreError> {
        let value = serde_json::to_value(value)?;
        self.entries.insert(key.into(), value);
        Ok(())
    }

    /// Insert a raw JSON value
    #[inline]
    pub fn insert_value(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    /// Read and deserialize the value stored under `key`
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, CoreError> {
        let value = self
            .lookup(key)
            .ok_or_else(|| CoreError::DataBagMissingKey(key.to_string()))?;
        serde_json::from_value(value.clone()).map_err(|e| {
            CoreError::ValidationError(format!("data bag key '{}' has an unexpected type: {}", key, e))
        })
    }

    /// Raw JSON value stored under `key`
    #[inline]
    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Resolve a key or a dotted path into nested objects.
    ///
    /// An exact key match wins; otherwise `a.b.c` walks into the object stored
    /// under the longest matching prefix.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        if let Some(value) = self.entries.get(path) {
            return Some(value);
        }
        let mut split = path.len();
        while let Some(idx) = path[..split].rfind('.') {
            if let Some(root) = self.entries.get(&path[..idx]) {
                return walk(root, &path[idx + 1..]);
            }
            split = idx;
        }
        None
    }

    /// Whether the key (or dotted path) resolves to a value
    #[inline]
    pub fn contains(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    /// Whether the key resolves to a truthy value
    pub fn is_truthy(&self, key: &str) -> bool {
        self.lookup(key).map(is_truthy).unwrap_or(false)
    }

    /// Remove a key, returning its value
    #[inline]
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    /// Copy every entry of `other` into this bag, overwriting on conflict
    pub fn merge(&mut self, other: DataBag) {
        self.entries.extend(other.entries);
    }

    /// A new bag holding only the listed keys that are present
    pub fn project(&self, keys: &[String]) -> DataBag {
        let entries = keys
            .iter()
            .filter_map(|key| self.entries.get(key).map(|v| (key.clone(), v.clone())))
            .collect();
        DataBag { entries }
    }

    /// Iterate over the keys
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// Number of entries
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the bag is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Convert into a JSON object
    pub fn to_value(&self) -> Value {
        Value::Object(self.entries.clone().into_iter().collect())
    }
}

impl FromIterator<(String, Value)> for DataBag {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

fn walk<'a>(root: &'a Value, rest: &str) -> Option<&'a Value> {
    rest.split('.').try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// JSON truthiness: `null`, `false`, zero and empty strings/arrays/objects are false
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Expected JSON shape of a data bag entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// Any value
    Any,
    /// A string
    String,
    /// Any number
    Number,
    /// An integer
    Integer,
    /// A boolean
    Boolean,
    /// A JSON object
    Object,
    /// A JSON array
    Array,
}

impl DataType {
    /// Whether `value` has this shape
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            DataType::Any => true,
            DataType::String => value.is_string(),
            DataType::Number => value.is_number(),
            DataType::Integer => value.is_i64() || value.is_u64(),
            DataType::Boolean => value.is_boolean(),
            DataType::Object => value.is_object(),
            DataType::Array => value.is_array(),
        }
    }
}

/// A data bag key a step or flow expects, with its type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRequirement {
    /// Data bag key
    pub key: String,
    /// Expected type
    pub data_type: DataType,
}

impl DataRequirement {
    /// Create a new requirement
    pub fn new(key: impl Into<String>, data_type: DataType) -> Self {
        Self {
            key: key.into(),
            data_type,
        }
    }

    /// Check the requirement against a bag
    pub fn check(&self, data: &DataBag) -> Result<(), CoreError> {
        let value = data
            .lookup(&self.key)
            .ok_or_else(|| CoreError::DataBagMissingKey(self.key.clone()))?;
        if self.data_type.matches(value) {
            Ok(())
        } else {
            Err(CoreError::ValidationError(format!(
                "data bag key '{}' is not of type {:?}",
                self.key, self.data_type
            )))
        }
    }
}
