//! Heterogeneous maps.
//!
//! A [`HeteroMap`] is an ordered map whose entries each carry the type ids
//! of their key and value. On the wire:
//!
//! ```text
//! int32 count
//! count × [int32 key_type][key][int32 value_type][value]
//! ```
//!
//! Each type id is resolved through the [`PackerRegistry`]. Id 998 means
//! "nested heterogeneous map over built-in types", which is how GETINFO
//! replies build nested structures. Unpacking refuses maps nested more
//! than [`MAX_NESTING`] levels deep.

use std::sync::Weak;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Serialize, Serializer};

use super::primitives::{ids, Int32};
use super::registry::PackerRegistry;
use super::value::serialize_pairs;
use super::{read_count, write_count, Packer, Value};
use crate::error::{Error, Result};

/// Deepest nesting of maps inside maps accepted when unpacking.
pub const MAX_NESTING: usize = 64;

/// One map entry with its key and value type ids.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub key: Value,
    pub key_type: i32,
    pub value: Value,
    pub value_type: i32,
}

/// Ordered map of self-describing entries.
///
/// # Example
///
/// ```
/// use objwire::packers::{HeteroMap, Value};
///
/// let mut map = HeteroMap::new();
/// map.insert("name", "calculator").unwrap();
/// map.insert("version", 3).unwrap();
/// map.new_map("extra").unwrap().insert(1, true).unwrap();
///
/// assert_eq!(map.get("name"), Some(&Value::from("calculator")));
/// assert_eq!(map.len(), 3);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeteroMap {
    entries: Vec<Entry>,
}

impl HeteroMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert with explicit type ids, replacing an existing key in place.
    pub fn add(&mut self, key: impl Into<Value>, key_type: i32, value: impl Into<Value>, value_type: i32) {
        let entry = Entry {
            key: key.into(),
            key_type,
            value: value.into(),
            value_type,
        };
        match self.entries.iter_mut().find(|e| e.key == entry.key) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    /// Insert, inferring both type ids from the values.
    ///
    /// Fails for containers and records, which need [`HeteroMap::add`].
    pub fn insert(&mut self, key: impl Into<Value>, value: impl Into<Value>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        let key_type = key.infer_type_id()?;
        let value_type = value.infer_type_id()?;
        self.add(key, key_type, value, value_type);
        Ok(())
    }

    /// Insert an empty nested map under `key` and return it.
    pub fn new_map(&mut self, key: impl Into<Value>) -> Result<&mut HeteroMap> {
        let key = key.into();
        let key_type = key.infer_type_id()?;
        self.add(key.clone(), key_type, HeteroMap::new(), ids::BUILTIN_HETERO_MAP);

        match self.entries.iter_mut().find(|e| e.key == key).map(|e| &mut e.value) {
            Some(Value::HeteroMap(map)) => Ok(map),
            _ => Err(Error::Usage(format!("nested map under {:?} vanished", key))),
        }
    }

    pub fn get(&self, key: impl Into<Value>) -> Option<&Value> {
        let key = key.into();
        self.entry(&key).map(|e| &e.value)
    }

    pub fn entry(&self, key: &Value) -> Option<&Entry> {
        self.entries.iter().find(|e| e.key == *key)
    }

    pub fn contains_key(&self, key: impl Into<Value>) -> bool {
        let key = key.into();
        self.entry(&key).is_some()
    }

    pub fn remove(&mut self, key: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let pos = self.entries.iter().position(|e| e.key == key)?;
        Some(self.entries.remove(pos).value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Key/value pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> + Clone {
        self.entries.iter().map(|e| (&e.key, &e.value))
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Render as pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::packing(e.to_string()))
    }
}

impl Serialize for HeteroMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serialize_pairs(serializer, self.iter(), self.len())
    }
}

/// Packer for [`HeteroMap`]s, resolving entry type ids through a registry.
pub struct HeteroMapPacker {
    id: i32,
    registry: Weak<PackerRegistry>,
    builtin_only: bool,
}

impl HeteroMapPacker {
    pub(crate) fn new(id: i32, registry: Weak<PackerRegistry>, builtin_only: bool) -> Self {
        Self {
            id,
            registry,
            builtin_only,
        }
    }

    fn with_registry<T>(&self, f: impl FnOnce(&PackerRegistry) -> Result<T>) -> Result<T> {
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| Error::Usage("packer registry was dropped".to_string()))?;
        f(&registry)
    }

    fn unpack_nested(&self, registry: &PackerRegistry, buf: &mut Bytes, depth: usize) -> Result<HeteroMap> {
        if depth > MAX_NESTING {
            return Err(Error::protocol(format!(
                "heteromap nesting exceeds {} levels",
                MAX_NESTING
            )));
        }
        let count = read_count(buf)?;
        let mut map = HeteroMap::new();
        for _ in 0..count {
            let key_type = Int32.unpack(buf)?;
            let key = self.unpack_entry(registry, key_type, buf, depth)?;
            let value_type = Int32.unpack(buf)?;
            let value = self.unpack_entry(registry, value_type, buf, depth)?;
            map.add(key, key_type, value, value_type);
        }
        Ok(map)
    }

    /// Nested maps are unpacked here instead of through the registry so the
    /// depth carries over.
    fn unpack_entry(&self, registry: &PackerRegistry, type_id: i32, buf: &mut Bytes, depth: usize) -> Result<Value> {
        let packer = registry.resolve(type_id, self.builtin_only)?;
        let nested = match type_id {
            ids::BUILTIN_HETERO_MAP => registry.builtin_heteromap(),
            ids::HETERO_MAP => registry.heteromap(),
            _ => return packer.unpack_value(buf),
        };
        nested
            .unpack_nested(registry, buf, depth + 1)
            .map(Value::HeteroMap)
    }
}

impl Packer for HeteroMapPacker {
    type Item = HeteroMap;

    fn id(&self) -> i32 {
        self.id
    }

    fn pack(&self, item: &HeteroMap, buf: &mut BytesMut) -> Result<()> {
        self.with_registry(|registry| {
            write_count(buf, item.len())?;
            for entry in item.entries() {
                let key_packer = registry.resolve(entry.key_type, self.builtin_only)?;
                let value_packer = registry.resolve(entry.value_type, self.builtin_only)?;
                buf.put_i32(entry.key_type);
                key_packer.pack_value(&entry.key, buf)?;
                buf.put_i32(entry.value_type);
                value_packer.pack_value(&entry.value, buf)?;
            }
            Ok(())
        })
    }

    fn unpack(&self, buf: &mut Bytes) -> Result<HeteroMap> {
        self.with_registry(|registry| self.unpack_nested(registry, buf, 0))
    }
}
