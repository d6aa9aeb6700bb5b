//! Packed exception registry.
//!
//! Maps declared exception types to their packers so that:
//! - the server can recognise them in handler errors and encode them,
//! - the client can decode them by type id,
//! - native service errors can be converted into declared ones through an
//!   explicit conversion function.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::error::{Error, HandlerError, PackedException, PackingError, Result};
use crate::packers::Packer;

type Encode = Box<dyn Fn(&dyn PackedException, &mut BytesMut) -> Result<()> + Send + Sync>;
type Decode = Box<dyn Fn(&mut Bytes) -> Result<Box<dyn PackedException>> + Send + Sync>;
type Convert = Box<dyn Fn(HandlerError) -> std::result::Result<Box<dyn PackedException>, HandlerError> + Send + Sync>;

struct Codec {
    encode: Encode,
    decode: Decode,
}

/// Declared exception types by wire type id.
#[derive(Default)]
pub struct ExceptionRegistry {
    codecs: HashMap<i32, Codec>,
    recognisers: Vec<Convert>,
    natives: Vec<Convert>,
}

impl ExceptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a declared exception type with its packer.
    pub fn register<E, P>(&mut self, packer: P) -> &mut Self
    where
        E: PackedException,
        P: Packer<Item = E> + 'static,
    {
        let id = packer.id();
        let packer = Arc::new(packer);
        let decoder = Arc::clone(&packer);

        let codec = Codec {
            encode: Box::new(move |exc, buf| {
                let exc = exc.downcast_ref::<E>().ok_or_else(|| PackingError::TypeMismatch {
                    expected: std::any::type_name::<E>(),
                    found: exc.to_string(),
                })?;
                packer.pack(exc, buf)
            }),
            decode: Box::new(move |buf| {
                let exc = decoder.unpack(buf)?;
                Ok(Box::new(exc) as Box<dyn PackedException>)
            }),
        };
        if self.codecs.insert(id, codec).is_some() {
            tracing::warn!(id, "exception packer registered twice, keeping the last one");
        }

        self.recognisers.push(Box::new(|err: HandlerError| {
            err.downcast::<E>().map(|exc| exc as Box<dyn PackedException>)
        }));
        self
    }

    /// Map a native error type onto a declared exception.
    ///
    /// Handlers returning `N` then reply with the packed exception produced
    /// by `convert` instead of a generic exception.
    pub fn map_native<N, E, F>(&mut self, convert: F) -> &mut Self
    where
        N: std::error::Error + Send + Sync + 'static,
        E: PackedException,
        F: Fn(N) -> E + Send + Sync + 'static,
    {
        self.natives.push(Box::new(move |err: HandlerError| {
            err.downcast::<N>()
                .map(|native| Box::new(convert(*native)) as Box<dyn PackedException>)
        }));
        self
    }

    pub fn contains(&self, id: i32) -> bool {
        self.codecs.contains_key(&id)
    }

    /// Decode the fields of exception `id`.
    pub fn decode(&self, id: i32, buf: &mut Bytes) -> Result<Box<dyn PackedException>> {
        let codec = self
            .codecs
            .get(&id)
            .ok_or_else(|| Error::protocol(format!("unknown exception type id: {}", id)))?;
        (codec.decode)(buf)
    }

    /// Encode the fields of `exc` with its registered packer.
    pub fn encode(&self, exc: &dyn PackedException, buf: &mut BytesMut) -> Result<()> {
        let id = exc.exception_id();
        let codec = self.codecs.get(&id).ok_or_else(|| {
            Error::packing(format!("no packer registered for exception type id {}", id))
        })?;
        (codec.encode)(exc, buf)
    }

    /// Turn a handler error into a declared exception, if it is one.
    ///
    /// Declared types are tried first, then native conversions. Unrecognised
    /// errors are handed back unchanged.
    pub fn recognise(&self, err: HandlerError) -> std::result::Result<Box<dyn PackedException>, HandlerError> {
        let mut err = err;
        for convert in self.recognisers.iter().chain(&self.natives) {
            match convert(err) {
                Ok(exc) => return Ok(exc),
                Err(unmatched) => err = unmatched,
            }
        }
        Err(err)
    }
}

impl std::fmt::Debug for ExceptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<i32> = self.codecs.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("ExceptionRegistry")
            .field("ids", &ids)
            .field("natives", &self.natives.len())
            .finish()
    }
}
