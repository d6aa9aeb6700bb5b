//! Dynamic values.
//!
//! [`Value`] is the self-describing form of anything a packer can carry. It
//! is what heterogeneous maps store and what [`super::DynPacker`] speaks.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

use super::heteromap::HeteroMap;
use super::primitives::ids;
use crate::error::{PackingError, Result};

/// A dynamically typed wire value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float(f64),
    Buffer(Bytes),
    Date(DateTime<Utc>),
    Str(String),
    List(Vec<Value>),
    Set(Vec<Value>),
    Map(Vec<(Value, Value)>),
    HeteroMap(HeteroMap),
    /// A service record, as named fields in declaration order.
    Record(Vec<(String, Value)>),
}

impl Value {
    /// An integer as `Int32` when it fits, `Int64` otherwise.
    pub fn int(value: i64) -> Value {
        match i32::try_from(value) {
            Ok(small) => Value::Int32(small),
            Err(_) => Value::Int64(value),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int8(_) => "int8",
            Value::Int16(_) => "int16",
            Value::Int32(_) => "int32",
            Value::Int64(_) => "int64",
            Value::Float(_) => "float",
            Value::Buffer(_) => "buffer",
            Value::Date(_) => "date",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Map(_) => "map",
            Value::HeteroMap(_) => "heteromap",
            Value::Record(_) => "record",
        }
    }

    /// The built-in type id a heterogeneous map uses for this value.
    ///
    /// Containers and records have no single natural id and must be added
    /// to a map with an explicit one.
    pub fn infer_type_id(&self) -> Result<i32> {
        let id = match self {
            Value::Null => ids::NULL,
            Value::Bool(_) => ids::BOOL,
            Value::Int8(_) => ids::INT8,
            Value::Int16(_) => ids::INT16,
            Value::Int32(_) => ids::INT32,
            Value::Int64(_) => ids::INT64,
            Value::Float(_) => ids::FLOAT,
            Value::Buffer(_) => ids::BUFFER,
            Value::Date(_) => ids::DATE,
            Value::Str(_) => ids::STR,
            Value::HeteroMap(_) => ids::BUILTIN_HETERO_MAP,
            other => {
                return Err(PackingError::Custom(format!(
                    "cannot deduce packer for {} value",
                    other.type_name()
                ))
                .into())
            }
        };
        Ok(id)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Any integer variant widened to i64.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int8(v) => Some(v.into()),
            Value::Int16(v) => Some(v.into()),
            Value::Int32(v) => Some(v.into()),
            Value::Int64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_heteromap(&self) -> Option<&HeteroMap> {
        match self {
            Value::HeteroMap(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) | Value::Set(items) => Some(items),
            _ => None,
        }
    }

    /// Named field of a record value.
    pub fn field(&self, name: &str) -> Result<&Value> {
        match self {
            Value::Record(fields) => fields
                .iter()
                .find(|(field, _)| field == name)
                .map(|(_, value)| value)
                .ok_or_else(|| PackingError::Custom(format!("record has no field '{}'", name)).into()),
            other => Err(other.mismatch("record")),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub(crate) fn mismatch(&self, expected: &'static str) -> crate::error::Error {
        PackingError::TypeMismatch {
            expected,
            found: self.type_name().to_string(),
        }
        .into()
    }
}

/// Serializes maps with string keys as JSON objects and everything else
/// as arrays of `[key, value]` pairs.
pub(crate) fn serialize_pairs<'a, S, I>(serializer: S, pairs: I, len: usize) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
    I: Iterator<Item = (&'a Value, &'a Value)> + Clone,
{
    if pairs.clone().all(|(k, _)| matches!(k, Value::Str(_))) {
        let mut map = serializer.serialize_map(Some(len))?;
        for (k, v) in pairs {
            map.serialize_entry(k, v)?;
        }
        map.end()
    } else {
        let mut seq = serializer.serialize_seq(Some(len))?;
        for pair in pairs {
            seq.serialize_element(&pair)?;
        }
        seq.end()
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int8(v) => serializer.serialize_i8(*v),
            Value::Int16(v) => serializer.serialize_i16(*v),
            Value::Int32(v) => serializer.serialize_i32(*v),
            Value::Int64(v) => serializer.serialize_i64(*v),
            Value::Float(v) => serializer.serialize_f64(*v),
            Value::Buffer(b) => serializer.collect_seq(b.iter()),
            Value::Date(d) => serializer.serialize_str(&d.to_rfc3339()),
            Value::Str(s) => serializer.serialize_str(s),
            Value::List(items) | Value::Set(items) => serializer.collect_seq(items),
            Value::Map(pairs) => serialize_pairs(serializer, pairs.iter().map(|(k, v)| (k, v)), pairs.len()),
            Value::HeteroMap(map) => map.serialize(serializer),
            Value::Record(fields) => {
                let mut map = serializer.serialize_map(Some(fields.len()))?;
                for (name, value) in fields {
                    map.serialize_entry(name, value)?;
                }
                map.end()
            }
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v.into())
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    f64 => Float,
    Bytes => Buffer,
    Vec<u8> => Buffer,
    DateTime<Utc> => Date,
    String => Str,
    &str => Str,
    HeteroMap => HeteroMap,
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

/// Conversion between a packer's typed item and [`Value`].
///
/// `Value::Null` converts to the zero value of primitive types. Dates,
/// containers and records refuse it.
pub trait Dynamic: Sized {
    fn into_value(self) -> Value;

    fn from_value(value: &Value) -> Result<Self>;
}

impl Dynamic for Value {
    fn into_value(self) -> Value {
        self
    }

    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl Dynamic for () {
    fn into_value(self) -> Value {
        Value::Null
    }

    fn from_value(_value: &Value) -> Result<Self> {
        Ok(())
    }
}

impl Dynamic for bool {
    fn into_value(self) -> Value {
        Value::Bool(self)
    }

    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(false),
            Value::Bool(b) => Ok(*b),
            other => Err(other.mismatch("bool")),
        }
    }
}

macro_rules! dynamic_int {
    ($($ty:ty => $variant:ident, $name:literal);* $(;)?) => {
        $(
            impl Dynamic for $ty {
                fn into_value(self) -> Value {
                    Value::$variant(self)
                }

                fn from_value(value: &Value) -> Result<Self> {
                    if value.is_null() {
                        return Ok(0);
                    }
                    let wide = value.as_i64().ok_or_else(|| value.mismatch($name))?;
                    <$ty>::try_from(wide).map_err(|_| {
                        PackingError::Custom(format!("{} does not fit in {}", wide, $name)).into()
                    })
                }
            }
        )*
    };
}

dynamic_int! {
    i8 => Int8, "int8";
    i16 => Int16, "int16";
    i32 => Int32, "int32";
    i64 => Int64, "int64";
}

impl Dynamic for f64 {
    fn into_value(self) -> Value {
        Value::Float(self)
    }

    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(0.0),
            Value::Float(v) => Ok(*v),
            other => other
                .as_i64()
                .map(|v| v as f64)
                .ok_or_else(|| other.mismatch("float")),
        }
    }
}

impl Dynamic for Bytes {
    fn into_value(self) -> Value {
        Value::Buffer(self)
    }

    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Bytes::new()),
            Value::Buffer(b) => Ok(b.clone()),
            other => Err(other.mismatch("buffer")),
        }
    }
}

impl Dynamic for String {
    fn into_value(self) -> Value {
        Value::Str(self)
    }

    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(String::new()),
            Value::Str(s) => Ok(s.clone()),
            other => Err(other.mismatch("string")),
        }
    }
}

impl Dynamic for DateTime<Utc> {
    fn into_value(self) -> Value {
        Value::Date(self)
    }

    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Date(d) => Ok(*d),
            other => Err(other.mismatch("date")),
        }
    }
}

impl<T: Dynamic> Dynamic for Vec<T> {
    fn into_value(self) -> Value {
        Value::List(self.into_iter().map(Dynamic::into_value).collect())
    }

    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::List(items) | Value::Set(items) => items.iter().map(T::from_value).collect(),
            other => Err(other.mismatch("list")),
        }
    }
}

impl<T: Dynamic + Eq + Hash> Dynamic for HashSet<T> {
    fn into_value(self) -> Value {
        Value::Set(self.into_iter().map(Dynamic::into_value).collect())
    }

    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Set(items) | Value::List(items) => items.iter().map(T::from_value).collect(),
            other => Err(other.mismatch("set")),
        }
    }
}

impl<K: Dynamic + Eq + Hash, V: Dynamic> Dynamic for HashMap<K, V> {
    fn into_value(self) -> Value {
        Value::Map(
            self.into_iter()
                .map(|(k, v)| (k.into_value(), v.into_value()))
                .collect(),
        )
    }

    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Map(pairs) => pairs
                .iter()
                .map(|(k, v)| -> Result<(K, V)> { Ok((K::from_value(k)?, V::from_value(v)?)) })
                .collect(),
            other => Err(other.mismatch("map")),
        }
    }
}

impl Dynamic for HeteroMap {
    fn into_value(self) -> Value {
        Value::HeteroMap(self)
    }

    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::HeteroMap(map) => Ok(map.clone()),
            other => Err(other.mismatch("heteromap")),
        }
    }
}
