//! Outbound requests and their pending replies.

use std::any::Any;
use std::marker::PhantomData;
use std::time::Duration;

use bytes::{Bytes, BytesMut};

use super::ClientUtils;
use crate::error::Result;
use crate::packers::Packer;
use crate::transport::WriteTransaction;

/// Decodes a SUCCESS reply body into the caller's result type.
pub(crate) type Decoder = Box<dyn FnOnce(&mut Bytes) -> Result<Box<dyn Any + Send + Sync>> + Send + Sync>;

pub(crate) fn decoder<T, F>(decode: F) -> Decoder
where
    T: Any + Send + Sync,
    F: FnOnce(&mut Bytes) -> Result<T> + Send + Sync + 'static,
{
    Box::new(move |buf| decode(buf).map(|value| Box::new(value) as Box<dyn Any + Send + Sync>))
}

pub(crate) fn packer_decoder<P>(packer: P) -> Decoder
where
    P: Packer + 'static,
    P::Item: Any + Send + Sync,
{
    decoder(move |buf| packer.unpack(buf))
}

/// Removes the reply slot unless the request was sent.
struct SlotGuard<'a> {
    client: &'a ClientUtils,
    seq: i32,
    armed: bool,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.client.forget_reply(self.seq);
        }
    }
}

/// A request being built under the write lock.
///
/// Arguments are packed into it, then [`send`](Self::send) emits the frame.
/// Dropping it instead sends nothing and forgets the reply slot, so a
/// failure while packing arguments never puts a partial request on the wire.
pub struct Invocation<'a, T> {
    txn: WriteTransaction<'a>,
    slot: SlotGuard<'a>,
    _result: PhantomData<fn() -> T>,
}

impl<'a, T: Any + Send> Invocation<'a, T> {
    pub(crate) fn new(client: &'a ClientUtils, txn: WriteTransaction<'a>) -> Self {
        let seq = txn.seq();
        Self {
            txn,
            slot: SlotGuard {
                client,
                seq,
                armed: true,
            },
            _result: PhantomData,
        }
    }

    pub fn seq(&self) -> i32 {
        self.slot.seq
    }

    /// Encode one argument.
    pub fn pack<P: Packer + ?Sized>(&mut self, packer: &P, item: &P::Item) -> Result<()> {
        self.txn.pack(packer, item)
    }

    /// Raw access to the request body.
    pub fn args(&mut self) -> &mut BytesMut {
        self.txn.buffer()
    }

    /// Send the request and release the write lock.
    pub async fn send(self) -> Result<PendingReply<'a, T>> {
        let Invocation { txn, mut slot, .. } = self;
        txn.commit().await?;
        slot.armed = false;
        Ok(PendingReply {
            client: slot.client,
            seq: slot.seq,
            _result: PhantomData,
        })
    }
}

/// A reply that has not been collected yet.
///
/// Dropping it discards the reply whenever it arrives.
pub struct PendingReply<'a, T> {
    client: &'a ClientUtils,
    seq: i32,
    _result: PhantomData<fn() -> T>,
}

impl<T: Any + Send> PendingReply<'_, T> {
    pub fn seq(&self) -> i32 {
        self.seq
    }

    /// Wait with the client's default timeout.
    pub async fn wait(self) -> Result<T> {
        self.client.get_reply(self.seq, None).await
    }

    pub async fn wait_timeout(self, timeout: Duration) -> Result<T> {
        self.client.get_reply(self.seq, Some(timeout)).await
    }
}

impl<T> Drop for PendingReply<'_, T> {
    fn drop(&mut self) {
        self.client.discard_reply(self.seq);
    }
}
