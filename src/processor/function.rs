//! Function dispatch table.
//!
//! Each entry bundles an argument decoder, an async handler and a result
//! encoder under a numeric function id. Generated bindings fill the table
//! once at startup; the processor only reads it.
//!
//! # Example
//!
//! ```
//! use objwire::packers::{Int32, Packer};
//! use objwire::processor::FunctionTable;
//!
//! let mut functions = FunctionTable::new();
//! functions.register(
//!     2001,
//!     |args: &mut bytes::Bytes| Ok((Int32.unpack(args)?, Int32.unpack(args)?)),
//!     Int32,
//!     |(a, b): (i32, i32)| async move { Ok(a + b) },
//! );
//! assert!(functions.get(2001).is_some());
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::error::{HandlerError, Result};
use crate::packers::Packer;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What an invocation produces: a deferred result encoder, or nothing.
pub struct Reply {
    body: Option<Box<dyn FnOnce(&mut BytesMut) -> Result<()> + Send>>,
}

impl Reply {
    /// A function with no return value: SUCCESS and nothing else.
    pub fn void() -> Self {
        Self { body: None }
    }

    /// A return value to be encoded with `packer`.
    pub fn value<P>(packer: Arc<P>, value: P::Item) -> Self
    where
        P: Packer + 'static,
        P::Item: Send + 'static,
    {
        Self {
            body: Some(Box::new(move |buf| packer.pack(&value, buf))),
        }
    }

    /// A return value with a custom encoder.
    pub fn encoded<F>(encode: F) -> Self
    where
        F: FnOnce(&mut BytesMut) -> Result<()> + Send + 'static,
    {
        Self {
            body: Some(Box::new(encode)),
        }
    }

    pub fn is_void(&self) -> bool {
        self.body.is_none()
    }

    pub(crate) fn encode(self, buf: &mut BytesMut) -> Result<()> {
        match self.body {
            Some(body) => body(buf),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reply").field("void", &self.is_void()).finish()
    }
}

/// One entry of the dispatch table.
pub trait Function: Send + Sync + 'static {
    /// Decode the arguments and start the handler.
    ///
    /// Decoding happens before the returned future runs, so argument errors
    /// never reach the handler.
    fn call(&self, args: &mut Bytes) -> Result<BoxFuture<'static, std::result::Result<Reply, HandlerError>>>;
}

/// [`Function`] built from an argument decoder, a handler and a result packer.
pub struct TypedFunction<U, P, H, A, Fut> {
    unpack_args: U,
    result: Arc<P>,
    handler: H,
    _phantom: PhantomData<fn(A) -> Fut>,
}

impl<U, P, H, A, Fut> TypedFunction<U, P, H, A, Fut>
where
    U: Fn(&mut Bytes) -> Result<A> + Send + Sync + 'static,
    P: Packer + 'static,
    P::Item: Send + 'static,
    H: Fn(A) -> Fut + Send + Sync + 'static,
    A: Send + 'static,
    Fut: Future<Output = std::result::Result<P::Item, HandlerError>> + Send + 'static,
{
    pub fn new(unpack_args: U, result: P, handler: H) -> Self {
        Self {
            unpack_args,
            result: Arc::new(result),
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<U, P, H, A, Fut> Function for TypedFunction<U, P, H, A, Fut>
where
    U: Fn(&mut Bytes) -> Result<A> + Send + Sync + 'static,
    P: Packer + 'static,
    P::Item: Send + 'static,
    H: Fn(A) -> Fut + Send + Sync + 'static,
    A: Send + 'static,
    Fut: Future<Output = std::result::Result<P::Item, HandlerError>> + Send + 'static,
{
    fn call(&self, args: &mut Bytes) -> Result<BoxFuture<'static, std::result::Result<Reply, HandlerError>>> {
        let args = (self.unpack_args)(args)?;
        let fut = (self.handler)(args);
        let packer = Arc::clone(&self.result);
        Ok(Box::pin(async move {
            let value = fut.await?;
            Ok(Reply::value(packer, value))
        }))
    }
}

/// [`Function`] for handlers without a return value.
pub struct VoidFunction<U, H, A, Fut> {
    unpack_args: U,
    handler: H,
    _phantom: PhantomData<fn(A) -> Fut>,
}

impl<U, H, A, Fut> Function for VoidFunction<U, H, A, Fut>
where
    U: Fn(&mut Bytes) -> Result<A> + Send + Sync + 'static,
    H: Fn(A) -> Fut + Send + Sync + 'static,
    A: Send + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    fn call(&self, args: &mut Bytes) -> Result<BoxFuture<'static, std::result::Result<Reply, HandlerError>>> {
        let args = (self.unpack_args)(args)?;
        let fut = (self.handler)(args);
        Ok(Box::pin(async move {
            fut.await?;
            Ok(Reply::void())
        }))
    }
}

/// Function table keyed by numeric function id.
#[derive(Default)]
pub struct FunctionTable {
    functions: HashMap<i32, Arc<dyn Function>>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function returning a value packed with `result`.
    ///
    /// A later registration under the same id replaces the earlier one.
    pub fn register<U, P, H, A, Fut>(&mut self, id: i32, unpack_args: U, result: P, handler: H)
    where
        U: Fn(&mut Bytes) -> Result<A> + Send + Sync + 'static,
        P: Packer + 'static,
        P::Item: Send + 'static,
        H: Fn(A) -> Fut + Send + Sync + 'static,
        A: Send + 'static,
        Fut: Future<Output = std::result::Result<P::Item, HandlerError>> + Send + 'static,
    {
        self.insert(id, Arc::new(TypedFunction::new(unpack_args, result, handler)));
    }

    /// Register a function with no return value.
    pub fn register_void<U, H, A, Fut>(&mut self, id: i32, unpack_args: U, handler: H)
    where
        U: Fn(&mut Bytes) -> Result<A> + Send + Sync + 'static,
        H: Fn(A) -> Fut + Send + Sync + 'static,
        A: Send + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        self.insert(
            id,
            Arc::new(VoidFunction {
                unpack_args,
                handler,
                _phantom: PhantomData,
            }),
        );
    }

    /// Register a hand-written [`Function`].
    pub fn insert(&mut self, id: i32, function: Arc<dyn Function>) {
        if self.functions.insert(id, function).is_some() {
            tracing::debug!(id, "function replaced");
        }
    }

    pub fn get(&self, id: i32) -> Option<&Arc<dyn Function>> {
        self.functions.get(&id)
    }

    /// Registered ids in ascending order.
    pub fn ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.functions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl std::fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionTable").field("ids", &self.ids()).finish()
    }
}

/// Argument decoder for functions that take no arguments.
pub fn no_args(_args: &mut Bytes) -> Result<()> {
    Ok(())
}
