//! Container packers.
//!
//! Encoding is the same for all of them: an int32 count followed by that
//! many elements (maps: key then value per entry). Sets are written in
//! iteration order, which is not preserved across the wire. A negative count
//! on unpack is a protocol error.
//!
//! [`ListOf`], [`SetOf`] and [`MapOf`] are typed. [`DynSeqOf`] and
//! [`DynMapOf`] work on [`Value`]s and are what the built-in registry holds
//! for the 800/820/850 families.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use super::primitives::{ids, Bool, Buffer, Date, Float, Int16, Int32, Int64, Int8, Str};
use super::{read_count, write_count, DynPacker, Packer, Value};
use crate::error::Result;

/// Upper bound for pre-allocation, so a bogus count cannot exhaust memory.
fn capacity_hint(count: usize, buf: &Bytes) -> usize {
    count.min(buf.len())
}

/// `list<T>`: items in order.
pub struct ListOf<P> {
    id: i32,
    elem: P,
}

impl<P: Packer> ListOf<P> {
    pub fn new(id: i32, elem: P) -> Self {
        Self { id, elem }
    }
}

impl<P: Packer> Packer for ListOf<P> {
    type Item = Vec<P::Item>;

    fn id(&self) -> i32 {
        self.id
    }

    fn pack(&self, item: &Self::Item, buf: &mut BytesMut) -> Result<()> {
        write_count(buf, item.len())?;
        for elem in item {
            self.elem.pack(elem, buf)?;
        }
        Ok(())
    }

    fn unpack(&self, buf: &mut Bytes) -> Result<Self::Item> {
        let count = read_count(buf)?;
        let mut items = Vec::with_capacity(capacity_hint(count, buf));
        for _ in 0..count {
            items.push(self.elem.unpack(buf)?);
        }
        Ok(items)
    }
}

/// `set<T>`: items in unspecified order.
pub struct SetOf<P> {
    id: i32,
    elem: P,
}

impl<P: Packer> SetOf<P> {
    pub fn new(id: i32, elem: P) -> Self {
        Self { id, elem }
    }
}

impl<P> Packer for SetOf<P>
where
    P: Packer,
    P::Item: Eq + Hash,
{
    type Item = HashSet<P::Item>;

    fn id(&self) -> i32 {
        self.id
    }

    fn pack(&self, item: &Self::Item, buf: &mut BytesMut) -> Result<()> {
        write_count(buf, item.len())?;
        for elem in item {
            self.elem.pack(elem, buf)?;
        }
        Ok(())
    }

    fn unpack(&self, buf: &mut Bytes) -> Result<Self::Item> {
        let count = read_count(buf)?;
        let mut items = HashSet::with_capacity(capacity_hint(count, buf));
        for _ in 0..count {
            items.insert(self.elem.unpack(buf)?);
        }
        Ok(items)
    }
}

/// `map<K, V>`.
pub struct MapOf<K, V> {
    id: i32,
    key: K,
    value: V,
}

impl<K: Packer, V: Packer> MapOf<K, V> {
    pub fn new(id: i32, key: K, value: V) -> Self {
        Self { id, key, value }
    }
}

impl<K, V> Packer for MapOf<K, V>
where
    K: Packer,
    K::Item: Eq + Hash,
    V: Packer,
{
    type Item = HashMap<K::Item, V::Item>;

    fn id(&self) -> i32 {
        self.id
    }

    fn pack(&self, item: &Self::Item, buf: &mut BytesMut) -> Result<()> {
        write_count(buf, item.len())?;
        for (k, v) in item {
            self.key.pack(k, buf)?;
            self.value.pack(v, buf)?;
        }
        Ok(())
    }

    fn unpack(&self, buf: &mut Bytes) -> Result<Self::Item> {
        let count = read_count(buf)?;
        let mut map = HashMap::with_capacity(capacity_hint(count, buf));
        for _ in 0..count {
            let k = self.key.unpack(buf)?;
            let v = self.value.unpack(buf)?;
            map.insert(k, v);
        }
        Ok(map)
    }
}

/// Dynamic list or set over any [`DynPacker`].
pub struct DynSeqOf {
    id: i32,
    elem: Arc<dyn DynPacker>,
    is_set: bool,
}

impl DynSeqOf {
    pub fn list(id: i32, elem: Arc<dyn DynPacker>) -> Self {
        Self {
            id,
            elem,
            is_set: false,
        }
    }

    pub fn set(id: i32, elem: Arc<dyn DynPacker>) -> Self {
        Self {
            id,
            elem,
            is_set: true,
        }
    }
}

impl DynPacker for DynSeqOf {
    fn packer_id(&self) -> i32 {
        self.id
    }

    fn pack_value(&self, value: &Value, buf: &mut BytesMut) -> Result<()> {
        let items = value
            .as_list()
            .ok_or_else(|| value.mismatch(if self.is_set { "set" } else { "list" }))?;
        write_count(buf, items.len())?;
        for item in items {
            self.elem.pack_value(item, buf)?;
        }
        Ok(())
    }

    fn unpack_value(&self, buf: &mut Bytes) -> Result<Value> {
        let count = read_count(buf)?;
        let mut items = Vec::with_capacity(capacity_hint(count, buf));
        for _ in 0..count {
            let item = self.elem.unpack_value(buf)?;
            if !self.is_set || !items.contains(&item) {
                items.push(item);
            }
        }
        Ok(if self.is_set {
            Value::Set(items)
        } else {
            Value::List(items)
        })
    }
}

/// Dynamic map over any key and value [`DynPacker`]s.
pub struct DynMapOf {
    id: i32,
    key: Arc<dyn DynPacker>,
    value: Arc<dyn DynPacker>,
}

impl DynMapOf {
    pub fn new(id: i32, key: Arc<dyn DynPacker>, value: Arc<dyn DynPacker>) -> Self {
        Self { id, key, value }
    }
}

impl DynPacker for DynMapOf {
    fn packer_id(&self) -> i32 {
        self.id
    }

    fn pack_value(&self, value: &Value, buf: &mut BytesMut) -> Result<()> {
        let Value::Map(pairs) = value else {
            return Err(value.mismatch("map"));
        };
        write_count(buf, pairs.len())?;
        for (k, v) in pairs {
            self.key.pack_value(k, buf)?;
            self.value.pack_value(v, buf)?;
        }
        Ok(())
    }

    fn unpack_value(&self, buf: &mut Bytes) -> Result<Value> {
        let count = read_count(buf)?;
        let mut pairs: Vec<(Value, Value)> = Vec::with_capacity(capacity_hint(count, buf));
        for _ in 0..count {
            let k = self.key.unpack_value(buf)?;
            let v = self.value.unpack_value(buf)?;
            match pairs.iter_mut().find(|(existing, _)| *existing == k) {
                Some(slot) => slot.1 = v,
                None => pairs.push((k, v)),
            }
        }
        Ok(Value::Map(pairs))
    }
}

macro_rules! builtin_containers {
    ($($kind:ident $name:ident($id:path) = $($elem:ident),+;)*) => {
        $(
            pub fn $name() -> $kind<$($elem),+> {
                $kind::new($id, $($elem),+)
            }
        )*
    };
}

builtin_containers! {
    ListOf list_of_int8(ids::LIST_OF_INT8) = Int8;
    ListOf list_of_bool(ids::LIST_OF_BOOL) = Bool;
    ListOf list_of_int16(ids::LIST_OF_INT16) = Int16;
    ListOf list_of_int32(ids::LIST_OF_INT32) = Int32;
    ListOf list_of_int64(ids::LIST_OF_INT64) = Int64;
    ListOf list_of_float(ids::LIST_OF_FLOAT) = Float;
    ListOf list_of_buffer(ids::LIST_OF_BUFFER) = Buffer;
    ListOf list_of_date(ids::LIST_OF_DATE) = Date;
    ListOf list_of_str(ids::LIST_OF_STR) = Str;
    SetOf set_of_int8(ids::SET_OF_INT8) = Int8;
    SetOf set_of_bool(ids::SET_OF_BOOL) = Bool;
    SetOf set_of_int16(ids::SET_OF_INT16) = Int16;
    SetOf set_of_int32(ids::SET_OF_INT32) = Int32;
    SetOf set_of_int64(ids::SET_OF_INT64) = Int64;
    SetOf set_of_buffer(ids::SET_OF_BUFFER) = Buffer;
    SetOf set_of_date(ids::SET_OF_DATE) = Date;
    SetOf set_of_str(ids::SET_OF_STR) = Str;
    MapOf map_of_int32_int32(ids::MAP_OF_INT32_INT32) = Int32, Int32;
    MapOf map_of_int32_str(ids::MAP_OF_INT32_STR) = Int32, Str;
    MapOf map_of_str_int32(ids::MAP_OF_STR_INT32) = Str, Int32;
    MapOf map_of_str_str(ids::MAP_OF_STR_STR) = Str, Str;
}
