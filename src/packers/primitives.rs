//! Primitive packers.
//!
//! Fixed-width big-endian integers, IEEE-754 doubles, length-prefixed
//! buffers and UTF-8 strings, and timestamps as int64 microseconds since
//! 0001-01-01T00:00:00Z.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use super::{ensure_remaining, read_count, write_count, Packer};
use crate::error::{PackingError, Result};

/// Reserved built-in type ids.
pub mod ids {
    pub const INT8: i32 = 1;
    pub const BOOL: i32 = 2;
    pub const INT16: i32 = 3;
    pub const INT32: i32 = 4;
    pub const INT64: i32 = 5;
    pub const FLOAT: i32 = 6;
    pub const BUFFER: i32 = 7;
    pub const DATE: i32 = 8;
    pub const STR: i32 = 9;
    pub const NULL: i32 = 10;

    pub const LIST_OF_INT8: i32 = 800;
    pub const LIST_OF_BOOL: i32 = 801;
    pub const LIST_OF_INT16: i32 = 802;
    pub const LIST_OF_INT32: i32 = 803;
    pub const LIST_OF_INT64: i32 = 804;
    pub const LIST_OF_FLOAT: i32 = 805;
    pub const LIST_OF_BUFFER: i32 = 806;
    pub const LIST_OF_DATE: i32 = 807;
    pub const LIST_OF_STR: i32 = 808;

    pub const SET_OF_INT8: i32 = 820;
    pub const SET_OF_BOOL: i32 = 821;
    pub const SET_OF_INT16: i32 = 822;
    pub const SET_OF_INT32: i32 = 823;
    pub const SET_OF_INT64: i32 = 824;
    pub const SET_OF_FLOAT: i32 = 825;
    pub const SET_OF_BUFFER: i32 = 826;
    pub const SET_OF_DATE: i32 = 827;
    pub const SET_OF_STR: i32 = 828;

    pub const MAP_OF_INT32_INT32: i32 = 850;
    pub const MAP_OF_INT32_STR: i32 = 851;
    pub const MAP_OF_STR_INT32: i32 = 852;
    pub const MAP_OF_STR_STR: i32 = 853;

    /// Heterogeneous map resolving built-in ids only.
    pub const BUILTIN_HETERO_MAP: i32 = 998;
    /// Heterogeneous map resolving built-in and service ids.
    pub const HETERO_MAP: i32 = 999;

    /// Ids at or above this value belong to a service.
    pub const SERVICE_BASE: i32 = 900_000;
}

/// Microseconds between 0001-01-01 and 1970-01-01.
pub const UNIX_EPOCH_MICROS: i64 = 62_135_596_800_000_000;

pub struct Int8;

impl Packer for Int8 {
    type Item = i8;

    fn id(&self) -> i32 {
        ids::INT8
    }

    fn pack(&self, item: &i8, buf: &mut BytesMut) -> Result<()> {
        buf.put_i8(*item);
        Ok(())
    }

    fn unpack(&self, buf: &mut Bytes) -> Result<i8> {
        ensure_remaining(buf, 1)?;
        Ok(buf.get_i8())
    }
}

/// Booleans travel as a single int8; any non-zero byte reads as `true`.
pub struct Bool;

impl Packer for Bool {
    type Item = bool;

    fn id(&self) -> i32 {
        ids::BOOL
    }

    fn pack(&self, item: &bool, buf: &mut BytesMut) -> Result<()> {
        buf.put_i8(i8::from(*item));
        Ok(())
    }

    fn unpack(&self, buf: &mut Bytes) -> Result<bool> {
        Ok(Int8.unpack(buf)? != 0)
    }
}

pub struct Int16;

impl Packer for Int16 {
    type Item = i16;

    fn id(&self) -> i32 {
        ids::INT16
    }

    fn pack(&self, item: &i16, buf: &mut BytesMut) -> Result<()> {
        buf.put_i16(*item);
        Ok(())
    }

    fn unpack(&self, buf: &mut Bytes) -> Result<i16> {
        ensure_remaining(buf, 2)?;
        Ok(buf.get_i16())
    }
}

pub struct Int32;

impl Packer for Int32 {
    type Item = i32;

    fn id(&self) -> i32 {
        ids::INT32
    }

    fn pack(&self, item: &i32, buf: &mut BytesMut) -> Result<()> {
        buf.put_i32(*item);
        Ok(())
    }

    fn unpack(&self, buf: &mut Bytes) -> Result<i32> {
        ensure_remaining(buf, 4)?;
        Ok(buf.get_i32())
    }
}

pub struct Int64;

impl Packer for Int64 {
    type Item = i64;

    fn id(&self) -> i32 {
        ids::INT64
    }

    fn pack(&self, item: &i64, buf: &mut BytesMut) -> Result<()> {
        buf.put_i64(*item);
        Ok(())
    }

    fn unpack(&self, buf: &mut Bytes) -> Result<i64> {
        ensure_remaining(buf, 8)?;
        Ok(buf.get_i64())
    }
}

pub struct Float;

impl Packer for Float {
    type Item = f64;

    fn id(&self) -> i32 {
        ids::FLOAT
    }

    fn pack(&self, item: &f64, buf: &mut BytesMut) -> Result<()> {
        buf.put_f64(*item);
        Ok(())
    }

    fn unpack(&self, buf: &mut Bytes) -> Result<f64> {
        ensure_remaining(buf, 8)?;
        Ok(buf.get_f64())
    }
}

/// Opaque bytes: int32 length followed by the raw bytes.
pub struct Buffer;

impl Packer for Buffer {
    type Item = Bytes;

    fn id(&self) -> i32 {
        ids::BUFFER
    }

    fn pack(&self, item: &Bytes, buf: &mut BytesMut) -> Result<()> {
        write_count(buf, item.len())?;
        buf.extend_from_slice(item);
        Ok(())
    }

    fn unpack(&self, buf: &mut Bytes) -> Result<Bytes> {
        let len = read_count(buf)?;
        ensure_remaining(buf, len)?;
        Ok(buf.split_to(len))
    }
}

/// UTF-8 text, encoded like a [`Buffer`].
pub struct Str;

impl Packer for Str {
    type Item = String;

    fn id(&self) -> i32 {
        ids::STR
    }

    fn pack(&self, item: &String, buf: &mut BytesMut) -> Result<()> {
        write_count(buf, item.len())?;
        buf.extend_from_slice(item.as_bytes());
        Ok(())
    }

    fn unpack(&self, buf: &mut Bytes) -> Result<String> {
        let raw = Buffer.unpack(buf)?;
        String::from_utf8(raw.to_vec()).map_err(|_| PackingError::InvalidUtf8.into())
    }
}

/// Timestamps as int64 microseconds since 0001-01-01 UTC.
///
/// Values in other time zones must be converted with
/// `with_timezone(&Utc)` before packing; unpacking always yields UTC.
pub struct Date;

impl Date {
    pub fn to_micros(value: &DateTime<Utc>) -> Result<i64> {
        let unix = value.timestamp_micros();
        unix.checked_add(UNIX_EPOCH_MICROS)
            .ok_or_else(|| PackingError::DateOutOfRange(unix).into())
    }

    pub fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
        micros
            .checked_sub(UNIX_EPOCH_MICROS)
            .and_then(DateTime::<Utc>::from_timestamp_micros)
            .ok_or_else(|| PackingError::DateOutOfRange(micros).into())
    }
}

impl Packer for Date {
    type Item = DateTime<Utc>;

    fn id(&self) -> i32 {
        ids::DATE
    }

    fn pack(&self, item: &DateTime<Utc>, buf: &mut BytesMut) -> Result<()> {
        buf.put_i64(Date::to_micros(item)?);
        Ok(())
    }

    fn unpack(&self, buf: &mut Bytes) -> Result<DateTime<Utc>> {
        Date::from_micros(Int64.unpack(buf)?)
    }
}

/// The void type: writes and reads nothing.
pub struct Null;

impl Packer for Null {
    type Item = ();

    fn id(&self) -> i32 {
        ids::NULL
    }

    fn pack(&self, _item: &(), _buf: &mut BytesMut) -> Result<()> {
        Ok(())
    }

    fn unpack(&self, _buf: &mut Bytes) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use chrono::TimeZone;

    fn encode<P: Packer>(packer: &P, item: &P::Item) -> BytesMut {
        let mut buf = BytesMut::new();
        packer.pack(item, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_integers_are_big_endian() {
        assert_eq!(&encode(&Int16, &0x0102)[..], &[1, 2]);
        assert_eq!(&encode(&Int32, &-2)[..], &[0xFF, 0xFF, 0xFF, 0xFE]);
        assert_eq!(&encode(&Int64, &1)[..], &[0, 0, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_bool_is_one_byte() {
        assert_eq!(&encode(&Bool, &true)[..], &[1]);
        let mut bytes = Bytes::from_static(&[7]);
        assert!(Bool.unpack(&mut bytes).unwrap());
    }

    #[test]
    fn test_float_roundtrip() {
        let mut bytes = encode(&Float, &-1.25).freeze();
        assert_eq!(Float.unpack(&mut bytes).unwrap(), -1.25);
    }

    #[test]
    fn test_str_is_length_prefixed_utf8() {
        let buf = encode(&Str, &"héllo".to_string());
        assert_eq!(&buf[..4], &[0, 0, 0, 6]);

        let mut bytes = buf.freeze();
        assert_eq!(Str.unpack(&mut bytes).unwrap(), "héllo");
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_str_rejects_invalid_utf8() {
        let mut bytes = Bytes::from_static(&[0, 0, 0, 2, 0xC3, 0x28]);
        assert!(matches!(
            Str.unpack(&mut bytes),
            Err(Error::Packing(PackingError::InvalidUtf8))
        ));
    }

    #[test]
    fn test_buffer_truncated() {
        let mut bytes = Bytes::from_static(&[0, 0, 0, 9, 1, 2]);
        assert!(matches!(
            Buffer.unpack(&mut bytes),
            Err(Error::FrameBoundary { .. })
        ));
    }

    #[test]
    fn test_date_epoch() {
        let unix_epoch = Utc.timestamp_opt(0, 0).unwrap();
        let buf = encode(&Date, &unix_epoch);
        assert_eq!(&buf[..], &UNIX_EPOCH_MICROS.to_be_bytes());

        let stamp = Utc.with_ymd_and_hms(2011, 3, 14, 15, 9, 26).unwrap()
            + chrono::Duration::microseconds(535_897);
        let mut bytes = encode(&Date, &stamp).freeze();
        assert_eq!(Date.unpack(&mut bytes).unwrap(), stamp);
    }

    #[test]
    fn test_date_year_one() {
        let first = Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(Date::to_micros(&first).unwrap(), 0);
        assert_eq!(Date::from_micros(0).unwrap(), first);
    }

    #[test]
    fn test_null_writes_nothing() {
        assert!(encode(&Null, &()).is_empty());
    }
}
