//! Client-side proxies for remote objects.
//!
//! A [`Proxy`] stands for one server object handle. The client keeps at
//! most one live proxy per handle; every time the server hands the same
//! handle out again, the cached proxy takes over one more server-side
//! reference. Disposal releases all of them, one DECREF each.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::BytesMut;

use super::ClientUtils;
use crate::error::{Error, Result};
use crate::packers::{Int64, Packer};

/// Typed wrapper around a [`Proxy`], one per remote class.
pub trait RemoteObject: Sized + Send + Sync + 'static {
    fn from_proxy(proxy: Proxy) -> Self;

    fn proxy(&self) -> &Proxy;
}

pub(crate) struct ProxyInner {
    client: Arc<ClientUtils>,
    handle: i64,
    owned: AtomicU32,
    disposed: AtomicBool,
}

impl ProxyInner {
    pub(crate) fn new(client: Arc<ClientUtils>, handle: i64) -> Self {
        Self {
            client,
            handle,
            owned: AtomicU32::new(1),
            disposed: AtomicBool::new(false),
        }
    }

    pub(crate) fn add_ref(&self) {
        self.owned.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl Drop for ProxyInner {
    fn drop(&mut self) {
        self.client.forget_proxy(self.handle, self);
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let refs = self.owned.swap(0, Ordering::AcqRel);
        self.client.release_later(self.handle, refs);
    }
}

/// Shared handle to a remote object.
///
/// Clones refer to the same proxy. When the last clone goes away without
/// [`dispose`](Self::dispose) having been called, the DECREFs are sent from
/// a background task, or with the next request if no runtime is running.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

impl Proxy {
    pub(crate) fn from_inner(inner: Arc<ProxyInner>) -> Self {
        Self { inner }
    }

    pub fn handle(&self) -> i64 {
        self.inner.handle
    }

    pub fn client(&self) -> &Arc<ClientUtils> {
        &self.inner.client
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Server-side references this proxy currently owns.
    pub fn owned_refs(&self) -> u32 {
        self.inner.owned.load(Ordering::Acquire)
    }

    /// Release the remote object. Later calls do nothing.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.client.forget_proxy(self.inner.handle, &self.inner);
        let refs = self.inner.owned.swap(0, Ordering::AcqRel);
        for _ in 0..refs {
            self.inner.client.decref(self.inner.handle).await;
        }
    }

    /// IDL class of the remote object.
    pub async fn remote_type(&self) -> Result<String> {
        self.inner.client.get_proxy_type(self.inner.handle).await
    }

    /// Whether the remote object is a `class` or derives from it.
    pub async fn is_instance_of(&self, class: &str) -> Result<bool> {
        self.inner.client.check_cast(self.inner.handle, class).await
    }

    /// Invoke a method or attribute accessor on the remote object.
    ///
    /// The handle goes first, then whatever `args` writes.
    pub async fn invoke<P, F>(&self, func_id: i32, result: P, args: F) -> Result<P::Item>
    where
        P: Packer + 'static,
        P::Item: Send + Sync + 'static,
        F: FnOnce(&mut BytesMut) -> Result<()>,
    {
        if self.is_disposed() {
            return Err(Error::Usage(format!("proxy {} is disposed", self.inner.handle)));
        }
        let handle = self.inner.handle;
        self.inner
            .client
            .invoke(func_id, result, |buf| {
                Int64.pack(&handle, buf)?;
                args(buf)
            })
            .await
    }
}

impl PartialEq for Proxy {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner.client, &other.inner.client) && self.inner.handle == other.inner.handle
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_disposed() {
            write!(f, "<proxy (disposed)>")
        } else {
            write!(f, "<proxy @ {}>", self.inner.handle)
        }
    }
}
