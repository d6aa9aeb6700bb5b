//! Object reference packers.
//!
//! A remote object travels as an int64 handle, −1 meaning "no object".
//! The server side stores objects in its [`ObjectTable`] when packing them
//! and loads them back when unpacking. The client side turns handles into
//! cached [`Proxy`](crate::client::Proxy) wrappers.

use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};

use super::primitives::Int64;
use super::Packer;
use crate::client::{ClientUtils, RemoteObject};
use crate::error::{Error, PackingError, Result};
use crate::processor::{ObjectTable, ServedObject};

/// Handle value meaning "no object".
pub const NULL_HANDLE: i64 = -1;

/// Server-side packer for objects of class `T`.
pub struct ObjRefPacker<T> {
    id: i32,
    table: Arc<ObjectTable>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: ServedObject> ObjRefPacker<T> {
    pub fn new(id: i32, table: Arc<ObjectTable>) -> Self {
        Self {
            id,
            table,
            _marker: PhantomData,
        }
    }
}

impl<T: ServedObject> Packer for ObjRefPacker<T> {
    type Item = Option<Arc<T>>;

    fn id(&self) -> i32 {
        self.id
    }

    /// Storing counts as one more exposure of the object to the client.
    fn pack(&self, item: &Option<Arc<T>>, buf: &mut BytesMut) -> Result<()> {
        let handle = match item {
            Some(obj) => self.table.store(obj),
            None => NULL_HANDLE,
        };
        Int64.pack(&handle, buf)
    }

    fn unpack(&self, buf: &mut Bytes) -> Result<Option<Arc<T>>> {
        let handle = Int64.unpack(buf)?;
        self.table.load_as::<T>(handle)
    }
}

/// Client-side packer producing typed proxies of class `T`.
pub struct ProxyRefPacker<T> {
    id: i32,
    client: Weak<ClientUtils>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: RemoteObject> ProxyRefPacker<T> {
    pub fn new(id: i32, client: &Arc<ClientUtils>) -> Self {
        Self {
            id,
            client: Arc::downgrade(client),
            _marker: PhantomData,
        }
    }
}

impl<T: RemoteObject> Packer for ProxyRefPacker<T> {
    type Item = Option<T>;

    fn id(&self) -> i32 {
        self.id
    }

    fn pack(&self, item: &Option<T>, buf: &mut BytesMut) -> Result<()> {
        let handle = match item {
            Some(obj) => {
                let proxy = obj.proxy();
                if proxy.is_disposed() {
                    return Err(PackingError::BadObject(proxy.handle()).into());
                }
                proxy.handle()
            }
            None => NULL_HANDLE,
        };
        Int64.pack(&handle, buf)
    }

    fn unpack(&self, buf: &mut Bytes) -> Result<Option<T>> {
        let handle = Int64.unpack(buf)?;
        if handle == NULL_HANDLE {
            return Ok(None);
        }
        let client = self.client.upgrade().ok_or(Error::Closed)?;
        Ok(Some(T::from_proxy(client.proxy_for(handle))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter;

    impl ServedObject for Counter {
        fn idl_type(&self) -> &'static str {
            "Counter"
        }
    }

    #[test]
    fn test_server_objref_roundtrip() {
        let table = Arc::new(ObjectTable::new());
        let packer = ObjRefPacker::<Counter>::new(900_100, Arc::clone(&table));
        let counter = Arc::new(Counter);

        let mut buf = BytesMut::new();
        packer.pack(&Some(Arc::clone(&counter)), &mut buf).unwrap();
        packer.pack(&None, &mut buf).unwrap();

        let mut bytes = buf.freeze();
        let loaded = packer.unpack(&mut bytes).unwrap().unwrap();
        assert!(Arc::ptr_eq(&loaded, &counter));
        assert!(packer.unpack(&mut bytes).unwrap().is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_unknown_handle_fails() {
        let table = Arc::new(ObjectTable::new());
        let packer = ObjRefPacker::<Counter>::new(900_100, table);
        let mut bytes = Bytes::copy_from_slice(&12345i64.to_be_bytes());
        assert!(matches!(
            packer.unpack(&mut bytes),
            Err(Error::Packing(PackingError::BadObject(12345)))
        ));
    }
}
