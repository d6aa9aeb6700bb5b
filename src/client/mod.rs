//! Client side of the protocol.
//!
//! [`ClientUtils`] issues requests and correlates replies by sequence
//! number. There is no background reader: whichever task waits for a reply
//! reads frames off the transport and files each one under its sequence
//! number, so replies may arrive in any order and any waiter may end up
//! delivering another waiter's reply.
//!
//! # Example
//!
//! ```no_run
//! use objwire::client::ClientUtils;
//! use objwire::packers::{Int32, Packer};
//! use objwire::transport::SocketTransport;
//!
//! # async fn run() -> objwire::Result<()> {
//! let transport = SocketTransport::connect("127.0.0.1:17731").await?;
//! let client = ClientUtils::builder(transport).build();
//!
//! let mut call = client.invocation(2001, Int32).await?;
//! call.pack(&Int32, &40)?;
//! call.pack(&Int32, &2)?;
//! let sum = call.send().await?.wait().await?;
//! assert_eq!(sum, 42);
//! # Ok(())
//! # }
//! ```

mod invocation;
mod proxy;

pub use invocation::{Invocation, PendingReply};
pub use proxy::{Proxy, RemoteObject};

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;

use invocation::{decoder, packer_decoder, Decoder};
use proxy::ProxyInner;

use crate::error::{Error, GenericException, ProtocolError, ProtocolErrorKind, Result};
use crate::packers::{Bool, HeteroMap, Int32, Packer, PackerRegistry, Str, Value};
use crate::processor::{ExceptionRegistry, PROTOCOL_VERSION};
use crate::protocol::{commands, info, replies};
use crate::transport::{ReadTransaction, Transport};

/// Client-wide settings.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Used by [`ClientUtils::get_reply`] when no timeout is given.
    pub default_timeout: Option<Duration>,
}

enum ReplySlot {
    /// Sent, nothing received yet.
    Empty(Decoder),
    /// A reader is decoding the reply right now.
    Decoding,
    /// The caller gave up; drop the reply when it arrives.
    Discarded,
    Ready(Result<Box<dyn Any + Send + Sync>>),
}

/// Builder for [`ClientUtils`].
pub struct ClientBuilder {
    transport: Arc<Transport>,
    exceptions: Arc<ExceptionRegistry>,
    registry: Arc<PackerRegistry>,
    config: ClientConfig,
}

impl ClientBuilder {
    /// Registry used to decode PACKED_EXCEPTION replies.
    pub fn exceptions(mut self, exceptions: impl Into<Arc<ExceptionRegistry>>) -> Self {
        self.exceptions = exceptions.into();
        self
    }

    pub fn registry(mut self, registry: Arc<PackerRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = Some(timeout);
        self
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Arc<ClientUtils> {
        Arc::new(ClientUtils {
            transport: self.transport,
            seq: AtomicI32::new(0),
            replies: DashMap::new(),
            proxies: Mutex::new(HashMap::new()),
            deferred_decrefs: Mutex::new(Vec::new()),
            exceptions: self.exceptions,
            registry: self.registry,
            config: self.config,
        })
    }
}

/// Request issuing and reply correlation for one transport.
pub struct ClientUtils {
    transport: Arc<Transport>,
    seq: AtomicI32,
    replies: DashMap<i32, ReplySlot>,
    proxies: Mutex<HashMap<i64, Weak<ProxyInner>>>,
    deferred_decrefs: Mutex<Vec<i64>>,
    exceptions: Arc<ExceptionRegistry>,
    registry: Arc<PackerRegistry>,
    config: ClientConfig,
}

fn invalid_seq(seq: i32) -> Error {
    Error::protocol(format!("invalid sequence number {}", seq))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ClientUtils {
    pub fn builder(transport: impl Into<Arc<Transport>>) -> ClientBuilder {
        ClientBuilder {
            transport: transport.into(),
            exceptions: Arc::new(ExceptionRegistry::new()),
            registry: PackerRegistry::builtin(),
            config: ClientConfig::default(),
        }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn registry(&self) -> &Arc<PackerRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn next_seq(&self) -> i32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Start a request: take the write lock and register an empty reply slot.
    async fn start<T: Any + Send>(&self, command: u8, decode: Decoder) -> Result<Invocation<'_, T>> {
        self.flush_deferred_decrefs().await;
        let seq = self.next_seq();
        let mut txn = self.transport.begin_write(seq).await?;
        txn.buffer().put_u8(command);
        self.replies.insert(seq, ReplySlot::Empty(decode));
        Ok(Invocation::new(self, txn))
    }

    /// Begin invoking function `func_id`; its result is decoded with `result`.
    ///
    /// Pack the arguments into the returned [`Invocation`], then send it.
    pub async fn invocation<P>(&self, func_id: i32, result: P) -> Result<Invocation<'_, P::Item>>
    where
        P: Packer + 'static,
        P::Item: Send + Sync + 'static,
    {
        let mut call = self.start(commands::INVOKE, packer_decoder(result)).await?;
        call.pack(&Int32, &func_id)?;
        Ok(call)
    }

    /// Invoke `func_id` and wait for its result.
    pub async fn invoke<P, F>(&self, func_id: i32, result: P, args: F) -> Result<P::Item>
    where
        P: Packer + 'static,
        P::Item: Send + Sync + 'static,
        F: FnOnce(&mut BytesMut) -> Result<()>,
    {
        let mut call = self.invocation(func_id, result).await?;
        args(call.args())?;
        call.send().await?.wait().await
    }

    /// Send a pre-built request body. The reply body comes back as raw bytes
    /// through [`get_reply::<Bytes>`](Self::get_reply).
    pub async fn tunnel_request(&self, blob: &[u8]) -> Result<i32> {
        self.flush_deferred_decrefs().await;
        let seq = self.next_seq();
        let mut txn = self.transport.begin_write(seq).await?;
        txn.write(blob);
        self.replies
            .insert(seq, ReplySlot::Empty(decoder(|buf: &mut Bytes| Ok(std::mem::take(buf)))));
        if let Err(err) = txn.commit().await {
            self.forget_reply(seq);
            return Err(err);
        }
        Ok(seq)
    }

    /// Wait for the reply to `seq`, reading incoming frames as needed.
    ///
    /// Returns the decoded value, or the remote error. The slot is gone
    /// afterwards. A timeout leaves the slot in place.
    pub async fn get_reply<T: Any + Send>(&self, seq: i32, timeout: Option<Duration>) -> Result<T> {
        let timeout = timeout.or(self.config.default_timeout);
        let deadline = timeout.map(|limit| (limit, tokio::time::Instant::now() + limit));

        loop {
            if let Some(reply) = self.take_ready(seq)? {
                return downcast(reply?);
            }

            let lock = match deadline {
                None => self.transport.reader().await?,
                Some((limit, at)) => tokio::time::timeout_at(at, self.transport.reader())
                    .await
                    .map_err(|_| Error::Timeout(limit))??,
            };

            // Another waiter may have delivered our reply while we queued.
            if let Some(reply) = self.take_ready(seq)? {
                drop(lock);
                return downcast(reply?);
            }

            let remaining = deadline.map(|(_, at)| at.saturating_duration_since(tokio::time::Instant::now()));
            let txn = lock.begin(remaining).await.map_err(|err| match (err, deadline) {
                (Error::Timeout(_), Some((limit, _))) => Error::Timeout(limit),
                (err, _) => err,
            })?;
            self.dispatch(txn)?;
        }
    }

    /// Read and file exactly one incoming reply.
    ///
    /// A PROTOCOL_ERROR reply is not filed; it is returned right here.
    pub async fn process_incoming(&self, timeout: Option<Duration>) -> Result<()> {
        let txn = self.transport.begin_read(timeout).await?;
        self.dispatch(txn)
    }

    /// Whether a reply for `seq` has arrived and waits to be collected.
    pub fn is_reply_ready(&self, seq: i32) -> bool {
        self.replies
            .get(&seq)
            .is_some_and(|slot| matches!(*slot, ReplySlot::Ready(_)))
    }

    /// Stop caring about `seq`. An arrived reply is dropped now, a pending
    /// one when it arrives.
    pub fn discard_reply(&self, seq: i32) {
        let arrived = match self.replies.get_mut(&seq) {
            Some(mut slot) => {
                if matches!(*slot, ReplySlot::Ready(_)) {
                    true
                } else {
                    *slot = ReplySlot::Discarded;
                    false
                }
            }
            None => false,
        };
        if arrived {
            self.replies.remove(&seq);
        }
    }

    pub(crate) fn forget_reply(&self, seq: i32) {
        self.replies.remove(&seq);
    }

    /// Number of replies sent for and not yet collected or discarded.
    pub fn pending_replies(&self) -> usize {
        self.replies.len()
    }

    fn take_ready(&self, seq: i32) -> Result<Option<Result<Box<dyn Any + Send + Sync>>>> {
        if let Some((_, slot)) = self
            .replies
            .remove_if(&seq, |_, slot| matches!(slot, ReplySlot::Ready(_)))
        {
            return match slot {
                ReplySlot::Ready(reply) => Ok(Some(reply)),
                _ => Err(invalid_seq(seq)),
            };
        }
        if self.replies.contains_key(&seq) {
            Ok(None)
        } else {
            Err(Error::Usage(format!("no reply pending for sequence number {}", seq)))
        }
    }

    fn dispatch(&self, mut txn: ReadTransaction<'_>) -> Result<()> {
        let seq = txn.seq();
        let mut payload = txn.read_all();
        txn.end();

        if payload.is_empty() {
            return Err(Error::protocol(format!("empty reply for sequence number {}", seq)));
        }
        let code = payload.get_u8();
        tracing::trace!(seq, code, "reply received");

        let decode = match self.claim(seq) {
            Ok(Some(decode)) => decode,
            Ok(None) => return self.drop_discarded(seq, code, &mut payload),
            Err(err) => {
                if code == replies::PROTOCOL_ERROR {
                    return Err(protocol_error(&mut payload));
                }
                return Err(err);
            }
        };

        let outcome = match code {
            replies::SUCCESS => decode(&mut payload),
            replies::PACKED_EXCEPTION => {
                let decoded = Int32
                    .unpack(&mut payload)
                    .and_then(|id| self.exceptions.decode(id, &mut payload));
                match decoded {
                    Ok(exc) => Err(Error::Packed(exc)),
                    Err(err) => {
                        self.forget_reply(seq);
                        return Err(err);
                    }
                }
            }
            replies::GENERIC_EXCEPTION => {
                let message = Str.unpack(&mut payload);
                let traceback = Str.unpack(&mut payload);
                match (message, traceback) {
                    (Ok(message), Ok(traceback)) => Err(Error::Generic(GenericException::new(message, traceback))),
                    (Err(err), _) | (_, Err(err)) => Err(err),
                }
            }
            replies::PROTOCOL_ERROR => {
                self.forget_reply(seq);
                return Err(protocol_error(&mut payload));
            }
            other => {
                self.forget_reply(seq);
                return Err(Error::protocol(format!("unknown reply code: {}", other)));
            }
        };

        self.fill(seq, outcome);
        Ok(())
    }

    /// Move the slot for `seq` into `Decoding` and hand out its decoder.
    ///
    /// `None` means the caller discarded the reply.
    fn claim(&self, seq: i32) -> Result<Option<Decoder>> {
        let mut slot = self.replies.get_mut(&seq).ok_or_else(|| invalid_seq(seq))?;
        match std::mem::replace(&mut *slot, ReplySlot::Decoding) {
            ReplySlot::Empty(decode) => Ok(Some(decode)),
            ReplySlot::Discarded => Ok(None),
            other => {
                *slot = other;
                Err(invalid_seq(seq))
            }
        }
    }

    fn fill(&self, seq: i32, outcome: Result<Box<dyn Any + Send + Sync>>) {
        if let Some(mut slot) = self.replies.get_mut(&seq) {
            if matches!(*slot, ReplySlot::Decoding) {
                *slot = ReplySlot::Ready(outcome);
                return;
            }
        }
        self.replies.remove(&seq);
    }

    fn drop_discarded(&self, seq: i32, code: u8, payload: &mut Bytes) -> Result<()> {
        self.forget_reply(seq);
        match code {
            replies::PROTOCOL_ERROR => Err(protocol_error(payload)),
            replies::SUCCESS | replies::PACKED_EXCEPTION | replies::GENERIC_EXCEPTION => {
                tracing::trace!(seq, "discarded reply dropped");
                Ok(())
            }
            other => Err(Error::protocol(format!("unknown reply code: {}", other))),
        }
    }

    /// Build, send and wait for a control request.
    async fn control<T, F>(&self, command: u8, decode: Decoder, fill: F, timeout: Option<Duration>) -> Result<T>
    where
        T: Any + Send,
        F: FnOnce(&mut BytesMut) -> Result<()>,
    {
        let mut request = self.start::<T>(command, decode).await?;
        fill(request.args())?;
        let pending = request.send().await?;
        match timeout {
            Some(limit) => pending.wait_timeout(limit).await,
            None => pending.wait().await,
        }
    }

    /// Round-trip `payload` through the server and return the elapsed time.
    pub async fn ping(&self, payload: &str, timeout: Option<Duration>) -> Result<Duration> {
        let started = Instant::now();
        let echoed: String = self
            .control(
                commands::PING,
                packer_decoder(Str),
                |buf| Str.pack(&payload.to_string(), buf),
                timeout,
            )
            .await?;
        if echoed != payload {
            return Err(Error::protocol("ping reply does not match payload"));
        }
        Ok(started.elapsed())
    }

    /// GETINFO for `code` (see [`crate::protocol::info`]).
    pub async fn get_service_info(&self, code: i32) -> Result<HeteroMap> {
        let registry = Arc::clone(&self.registry);
        self.control(
            commands::GETINFO,
            decoder(move |buf: &mut Bytes| registry.builtin_heteromap().unpack(buf)),
            |buf| Int32.pack(&code, buf),
            None,
        )
        .await
    }

    pub async fn check_cast(&self, handle: i64, class: &str) -> Result<bool> {
        self.control(
            commands::CHECK_CAST,
            packer_decoder(Bool),
            |buf| {
                buf.put_i64(handle);
                Str.pack(&class.to_string(), buf)
            },
            None,
        )
        .await
    }

    pub async fn get_proxy_type(&self, handle: i64) -> Result<String> {
        self.control(
            commands::QUERY_PROXY_TYPE,
            packer_decoder(Str),
            |buf| {
                buf.put_i64(handle);
                Ok(())
            },
            None,
        )
        .await
    }

    /// Send a fire-and-forget command: no reply slot, no reply frame.
    async fn notify(&self, command: u8, handle: i64) -> Result<()> {
        let mut txn = self.transport.begin_write(self.next_seq()).await?;
        txn.buffer().put_u8(command);
        txn.buffer().put_i64(handle);
        txn.commit().await
    }

    /// Release one server-side reference. Failures are logged and dropped.
    pub async fn decref(&self, handle: i64) {
        if let Err(err) = self.notify(commands::DECREF, handle).await {
            tracing::debug!(handle, "DECREF not sent: {}", err);
        }
    }

    /// Take one more server-side reference.
    pub async fn incref(&self, handle: i64) -> Result<()> {
        self.notify(commands::INCREF, handle).await
    }

    /// Ask the server to stop serving this connection.
    pub async fn quit(&self) -> Result<()> {
        let mut txn = self.transport.begin_write(self.next_seq()).await?;
        txn.buffer().put_u8(commands::QUIT);
        txn.commit().await
    }

    /// Check the server speaks this protocol version and serves
    /// `service_name`, and, if given, that it supports `client_version`.
    pub async fn assert_service_compatibility(&self, service_name: &str, client_version: Option<&str>) -> Result<()> {
        let meta = self.get_service_info(info::META).await?;
        let version = meta.get("AGNOS_PROTOCOL_VERSION").and_then(Value::as_str);
        if version != Some(PROTOCOL_VERSION) {
            return Err(ProtocolError::with_kind(
                ProtocolErrorKind::WrongVersion,
                format!("expected protocol '{}', found '{}'", PROTOCOL_VERSION, version.unwrap_or("")),
            )
            .into());
        }

        let service = self.get_service_info(info::SERVICE).await?;
        let name = service.get("SERVICE_NAME").and_then(Value::as_str).unwrap_or("");
        if name != service_name {
            return Err(ProtocolError::with_kind(
                ProtocolErrorKind::WrongServiceName,
                format!("expected service '{}', found '{}'", service_name, name),
            )
            .into());
        }

        if let Some(client_version) = client_version {
            let supported = service
                .get("SUPPORTED_VERSIONS")
                .and_then(Value::as_list)
                .is_some_and(|versions| versions.iter().any(|v| v.as_str() == Some(client_version)));
            if !supported {
                return Err(ProtocolError::with_kind(
                    ProtocolErrorKind::IncompatibleVersion,
                    format!("server does not support client version '{}'", client_version),
                )
                .into());
            }
        }
        Ok(())
    }

    /// The proxy for `handle`, counting one more server-side reference.
    pub fn proxy_for(self: &Arc<Self>, handle: i64) -> Proxy {
        let mut cache = lock(&self.proxies);
        let mut stale = None;
        if let Some(inner) = cache.get(&handle).and_then(Weak::upgrade) {
            if !inner.is_disposed() {
                inner.add_ref();
                return Proxy::from_inner(inner);
            }
            stale = Some(inner);
        }
        let inner = Arc::new(ProxyInner::new(Arc::clone(self), handle));
        cache.insert(handle, Arc::downgrade(&inner));
        drop(cache);
        drop(stale);
        Proxy::from_inner(inner)
    }

    /// Number of live cached proxies.
    pub fn cached_proxies(&self) -> usize {
        lock(&self.proxies)
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub(crate) fn forget_proxy(&self, handle: i64, proxy: &ProxyInner) {
        let mut cache = lock(&self.proxies);
        if cache
            .get(&handle)
            .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), proxy))
        {
            cache.remove(&handle);
        }
    }

    /// Queue `refs` DECREFs for a proxy dropped without disposal.
    pub(crate) fn release_later(self: &Arc<Self>, handle: i64, refs: u32) {
        if refs == 0 {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let client = Arc::clone(self);
                runtime.spawn(async move {
                    for _ in 0..refs {
                        client.decref(handle).await;
                    }
                });
            }
            Err(_) => {
                let mut deferred = lock(&self.deferred_decrefs);
                deferred.extend(std::iter::repeat(handle).take(refs as usize));
            }
        }
    }

    async fn flush_deferred_decrefs(&self) {
        let handles = std::mem::take(&mut *lock(&self.deferred_decrefs));
        for handle in handles {
            self.decref(handle).await;
        }
    }

    /// Close the transport. Pending replies will never arrive.
    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }
}

impl std::fmt::Debug for ClientUtils {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientUtils")
            .field("pending_replies", &self.replies.len())
            .field("config", &self.config)
            .finish()
    }
}

fn protocol_error(payload: &mut Bytes) -> Error {
    match Str.unpack(payload) {
        Ok(message) => Error::Protocol(ProtocolError::new(message)),
        Err(err) => err,
    }
}

fn downcast<T: Any>(reply: Box<dyn Any + Send + Sync>) -> Result<T> {
    reply
        .downcast::<T>()
        .map(|value| *value)
        .map_err(|_| Error::Usage(format!("reply is not a {}", std::any::type_name::<T>())))
}
