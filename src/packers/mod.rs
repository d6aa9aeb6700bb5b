//! Packers - type-directed binary codecs.
//!
//! Every value that crosses the wire goes through a [`Packer`]: a stateless
//! encoder/decoder for one semantic type with a stable numeric type id.
//! All integers are big-endian and fixed width.
//!
//! - [`primitives`]: int8/16/32/64, float, bool, buffer, string, date, null
//! - [`containers`]: list-of, set-of and map-of, parameterized by element packers
//! - [`heteromap`]: self-describing maps whose entries carry their own type ids
//! - [`objref`]: object references as 64-bit handles
//!
//! Packers that work on a typed `Item` also work on dynamic [`Value`]s through
//! [`DynPacker`], which is what heterogeneous maps use.

pub mod containers;
pub mod heteromap;
pub mod objref;
pub mod primitives;
mod registry;
mod value;

pub use containers::{DynMapOf, DynSeqOf, ListOf, MapOf, SetOf};
pub use heteromap::{Entry, HeteroMap, HeteroMapPacker};
pub use objref::{ObjRefPacker, ProxyRefPacker};
pub use primitives::{ids, Bool, Buffer, Date, Float, Int16, Int32, Int64, Int8, Null, Str};
pub use registry::{PackerRegistry, RegistryBuilder};
pub use value::{Dynamic, Value};

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Encoder/decoder for one wire type.
///
/// # Example
///
/// ```
/// use bytes::BytesMut;
/// use objwire::packers::{Int32, Packer};
///
/// let mut buf = BytesMut::new();
/// Int32.pack(&7, &mut buf).unwrap();
/// assert_eq!(&buf[..], &[0, 0, 0, 7]);
///
/// let mut bytes = buf.freeze();
/// assert_eq!(Int32.unpack(&mut bytes).unwrap(), 7);
/// ```
pub trait Packer: Send + Sync {
    type Item;

    /// Numeric type id, unique per process.
    fn id(&self) -> i32;

    fn pack(&self, item: &Self::Item, buf: &mut BytesMut) -> Result<()>;

    fn unpack(&self, buf: &mut Bytes) -> Result<Self::Item>;
}

impl<P: Packer + ?Sized> Packer for &P {
    type Item = P::Item;

    fn id(&self) -> i32 {
        (**self).id()
    }

    fn pack(&self, item: &Self::Item, buf: &mut BytesMut) -> Result<()> {
        (**self).pack(item, buf)
    }

    fn unpack(&self, buf: &mut Bytes) -> Result<Self::Item> {
        (**self).unpack(buf)
    }
}

/// Object-safe packer working on [`Value`]s.
pub trait DynPacker: Send + Sync {
    fn packer_id(&self) -> i32;

    fn pack_value(&self, value: &Value, buf: &mut BytesMut) -> Result<()>;

    fn unpack_value(&self, buf: &mut Bytes) -> Result<Value>;
}

impl<P> DynPacker for P
where
    P: Packer,
    P::Item: Dynamic,
{
    fn packer_id(&self) -> i32 {
        self.id()
    }

    fn pack_value(&self, value: &Value, buf: &mut BytesMut) -> Result<()> {
        let item = P::Item::from_value(value)?;
        self.pack(&item, buf)
    }

    fn unpack_value(&self, buf: &mut Bytes) -> Result<Value> {
        self.unpack(buf).map(Dynamic::into_value)
    }
}

/// Fail with a frame-boundary error unless `n` more bytes are available.
pub(crate) fn ensure_remaining(buf: &Bytes, n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(Error::FrameBoundary {
            requested: n,
            available: buf.remaining(),
        });
    }
    Ok(())
}

/// Read an int32 element count, rejecting negative values.
pub(crate) fn read_count(buf: &mut Bytes) -> Result<usize> {
    ensure_remaining(buf, 4)?;
    let count = buf.get_i32();
    if count < 0 {
        return Err(Error::protocol(format!("negative length: {}", count)));
    }
    Ok(count as usize)
}

/// Write an element count as int32.
pub(crate) fn write_count(buf: &mut BytesMut, count: usize) -> Result<()> {
    use bytes::BufMut;

    let count = i32::try_from(count)
        .map_err(|_| Error::Packing(crate::error::PackingError::LengthOverflow(count)))?;
    buf.put_i32(count);
    Ok(())
}
