//! Request dispatch: one inbound frame in, at most one reply frame out.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::exceptions::ExceptionRegistry;
use super::function::{FunctionTable, Reply};
use super::object_table::ObjectTable;
use super::service::ServiceDescriptor;
use crate::error::{
    Error, GenericException, HandlerError, PackedException, PackingError, ProtocolError, Result,
};
use crate::packers::{Bool, Int32, Int64, Packer, PackerRegistry, Str};
use crate::protocol::{commands, replies};
use crate::transport::{Transport, WriteTransaction};

/// Default number of invocations [`Processor::serve`] runs at once.
pub const DEFAULT_MAX_CONCURRENT_INVOCATIONS: usize = 1;

/// What the serving loop should do after a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The client sent QUIT.
    Quit,
}

/// Builder shared by every connection of one service.
///
/// Cloning is cheap; call [`build`](Self::build) once per accepted transport.
#[derive(Clone)]
pub struct ProcessorBuilder {
    functions: Arc<FunctionTable>,
    exceptions: Arc<ExceptionRegistry>,
    service: Arc<ServiceDescriptor>,
    registry: Arc<PackerRegistry>,
    objects: Option<Arc<ObjectTable>>,
    max_concurrent_invocations: usize,
}

impl ProcessorBuilder {
    pub fn new() -> Self {
        Self {
            functions: Arc::new(FunctionTable::new()),
            exceptions: Arc::new(ExceptionRegistry::new()),
            service: Arc::new(ServiceDescriptor::default()),
            registry: PackerRegistry::builtin(),
            objects: None,
            max_concurrent_invocations: DEFAULT_MAX_CONCURRENT_INVOCATIONS,
        }
    }

    pub fn functions(mut self, functions: impl Into<Arc<FunctionTable>>) -> Self {
        self.functions = functions.into();
        self
    }

    pub fn exceptions(mut self, exceptions: impl Into<Arc<ExceptionRegistry>>) -> Self {
        self.exceptions = exceptions.into();
        self
    }

    pub fn service(mut self, service: impl Into<Arc<ServiceDescriptor>>) -> Self {
        self.service = service.into();
        self
    }

    pub fn registry(mut self, registry: Arc<PackerRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Object table the function table's object packers were built with.
    ///
    /// Without one, each processor gets a fresh table.
    pub fn objects(mut self, objects: Arc<ObjectTable>) -> Self {
        self.objects = Some(objects);
        self
    }

    /// How many INVOKE requests [`Processor::serve`] runs concurrently.
    ///
    /// Replies to concurrent invocations may leave in any order.
    /// Default: 1
    pub fn max_concurrent_invocations(mut self, limit: usize) -> Self {
        self.max_concurrent_invocations = limit.max(1);
        self
    }

    pub fn build(&self, transport: Arc<Transport>) -> Processor {
        Processor {
            transport,
            functions: Arc::clone(&self.functions),
            exceptions: Arc::clone(&self.exceptions),
            service: Arc::clone(&self.service),
            registry: Arc::clone(&self.registry),
            objects: self.objects.clone().unwrap_or_default(),
            max_concurrent_invocations: self.max_concurrent_invocations,
        }
    }
}

impl Default for ProcessorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Server side of one connection.
pub struct Processor {
    transport: Arc<Transport>,
    functions: Arc<FunctionTable>,
    exceptions: Arc<ExceptionRegistry>,
    service: Arc<ServiceDescriptor>,
    registry: Arc<PackerRegistry>,
    objects: Arc<ObjectTable>,
    max_concurrent_invocations: usize,
}

enum Outcome {
    Reply(Reply),
    Failure(Failure),
    Silent,
    Quit,
}

enum Failure {
    Protocol(String),
    Packed(Box<dyn PackedException>),
    Generic(GenericException),
}

impl Failure {
    fn from_error(err: Error, context: &str) -> Self {
        match err {
            Error::Protocol(err) => Failure::Protocol(err.message().to_string()),
            Error::FrameBoundary { .. } => Failure::Protocol(err.to_string()),
            Error::Packed(exc) => Failure::Packed(exc),
            Error::Generic(exc) => Failure::Generic(exc),
            other => Failure::Generic(GenericException::new(other.to_string(), traceback(context, &other))),
        }
    }
}

/// Render `err` and its source chain as remote traceback text.
fn traceback(context: &str, err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = format!("  in {}\n  {}", context, err);
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(&format!("\n  caused by: {}", cause));
        source = cause.source();
    }
    text
}

impl Processor {
    pub fn builder() -> ProcessorBuilder {
        ProcessorBuilder::new()
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn objects(&self) -> &Arc<ObjectTable> {
        &self.objects
    }

    pub fn service(&self) -> &ServiceDescriptor {
        &self.service
    }

    /// Read one request, handle it and send its reply, if any.
    pub async fn process(&self) -> Result<Flow> {
        let (seq, request) = self.read_request().await?;
        self.handle(seq, request).await
    }

    /// Process requests until the client quits or disconnects.
    ///
    /// A clean disconnect and QUIT both return `Ok`. Fatal transport errors
    /// are returned after in-flight invocations have finished.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let permits = Arc::new(Semaphore::new(self.max_concurrent_invocations));
        let mut in_flight = JoinSet::new();

        let result = loop {
            let (seq, request) = match self.read_request().await {
                Ok(request) => request,
                Err(Error::Closed) => {
                    tracing::debug!("client disconnected");
                    break Ok(());
                }
                Err(err) => break Err(err),
            };

            if self.max_concurrent_invocations > 1 && request.first() == Some(&commands::INVOKE) {
                let permit = match Arc::clone(&permits).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break Err(Error::Closed),
                };
                let this = Arc::clone(&self);
                in_flight.spawn(async move {
                    let _permit = permit;
                    this.handle(seq, request).await
                });
                continue;
            }

            match self.handle(seq, request).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Quit) => break Ok(()),
                Err(err) => break Err(err),
            }
        };

        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok(Err(err)) => tracing::error!("invocation failed to reply: {}", err),
                Err(err) => tracing::error!("invocation task panicked: {}", err),
                Ok(Ok(_)) => {}
            }
        }

        if let Err(err) = &result {
            tracing::error!("processor stopped: {}", err);
        }
        result
    }

    async fn read_request(&self) -> Result<(i32, Bytes)> {
        let mut txn = self.transport.begin_read(None).await?;
        let seq = txn.seq();
        let request = txn.read_all();
        txn.end();
        Ok((seq, request))
    }

    async fn handle(&self, seq: i32, mut request: Bytes) -> Result<Flow> {
        if request.is_empty() {
            return self.send(seq, Outcome::Failure(Failure::Protocol("empty request".into()))).await;
        }
        let command = request.get_u8();
        tracing::debug!(seq, command = commands::name(command), "request");

        let outcome = match command {
            commands::INVOKE => self.invoke(&mut request).await,
            _ => self
                .control(command, &mut request)
                .unwrap_or_else(|err| Outcome::Failure(Failure::from_error(err, commands::name(command)))),
        };
        self.send(seq, outcome).await
    }

    fn control(&self, command: u8, request: &mut Bytes) -> Result<Outcome> {
        let outcome = match command {
            commands::PING => {
                let payload = Str.unpack(request)?;
                Outcome::Reply(Reply::value(Arc::new(Str), payload))
            }
            commands::QUIT => {
                tracing::info!("QUIT received");
                Outcome::Quit
            }
            commands::DECREF => {
                self.objects.decref(Int64.unpack(request)?);
                Outcome::Silent
            }
            commands::INCREF => {
                self.objects.incref(Int64.unpack(request)?);
                Outcome::Silent
            }
            commands::GETINFO => {
                let code = Int32.unpack(request)?;
                let compression = self.transport.config().compression_threshold.is_some();
                let info = self.service.info(code, compression)?;
                let registry = Arc::clone(&self.registry);
                Outcome::Reply(Reply::encoded(move |buf| {
                    registry.builtin_heteromap().pack(&info, buf)
                }))
            }
            commands::CHECK_CAST => {
                let handle = Int64.unpack(request)?;
                let class = Str.unpack(request)?;
                let matches = self.objects.load(handle)?.is_some_and(|obj| {
                    obj.idl_type() == class || obj.idl_super_classes().iter().any(|c| *c == class)
                });
                Outcome::Reply(Reply::value(Arc::new(Bool), matches))
            }
            commands::QUERY_PROXY_TYPE => {
                let handle = Int64.unpack(request)?;
                let obj = self
                    .objects
                    .load(handle)?
                    .ok_or(PackingError::BadObject(handle))?;
                Outcome::Reply(Reply::value(Arc::new(Str), obj.idl_type().to_string()))
            }
            other => {
                tracing::warn!(command = other, "unknown command code");
                return Err(Error::protocol(format!("unknown command code: {}", other)));
            }
        };
        Ok(outcome)
    }

    async fn invoke(&self, request: &mut Bytes) -> Outcome {
        let id = match Int32.unpack(request) {
            Ok(id) => id,
            Err(err) => return Outcome::Failure(Failure::from_error(err, "INVOKE")),
        };
        let context = self.describe(id);

        let Some(function) = self.functions.get(id) else {
            tracing::warn!(id, "unknown function id");
            return Outcome::Failure(Failure::Protocol(format!("unknown function id: {}", id)));
        };

        let call = match function.call(request) {
            Ok(call) => call,
            Err(err) => return Outcome::Failure(Failure::from_error(err, &context)),
        };

        match call.await {
            Ok(reply) => Outcome::Reply(reply),
            Err(err) => Outcome::Failure(self.classify(err, &context)),
        }
    }

    fn describe(&self, id: i32) -> String {
        match self.service.functions.iter().find(|f| f.id == id) {
            Some(info) => format!("function {} ({})", info.name, id),
            None => format!("function {}", id),
        }
    }

    /// Decide how a handler error travels back.
    fn classify(&self, err: HandlerError, context: &str) -> Failure {
        let err = match err.downcast::<Error>() {
            Ok(err) => return Failure::from_error(*err, context),
            Err(err) => err,
        };
        let err = match err.downcast::<ProtocolError>() {
            Ok(err) => return Failure::Protocol(err.message().to_string()),
            Err(err) => err,
        };
        let err = match err.downcast::<GenericException>() {
            Ok(exc) => return Failure::Generic(*exc),
            Err(err) => err,
        };
        let err = match err.downcast::<PackingError>() {
            Ok(err) => return Failure::from_error(Error::Packing(*err), context),
            Err(err) => err,
        };
        match self.exceptions.recognise(err) {
            Ok(exc) => Failure::Packed(exc),
            Err(err) => {
                tracing::warn!("{} raised an undeclared error: {}", context, err);
                Failure::Generic(GenericException::new(err.to_string(), traceback(context, &*err)))
            }
        }
    }

    async fn send(&self, seq: i32, outcome: Outcome) -> Result<Flow> {
        let reply = match outcome {
            Outcome::Silent => return Ok(Flow::Continue),
            Outcome::Quit => return Ok(Flow::Quit),
            Outcome::Reply(reply) => Ok(reply),
            Outcome::Failure(failure) => Err(failure),
        };

        let mut txn = self.transport.begin_write(seq).await?;
        match reply {
            Ok(reply) => {
                txn.buffer().put_u8(replies::SUCCESS);
                let encoded = self.objects.undo_stores_on_error(|| reply.encode(txn.buffer()));
                if let Err(err) = encoded {
                    txn.restart();
                    self.write_failure(&mut txn, Failure::from_error(err, "result encoding"))?;
                }
            }
            Err(failure) => self.write_failure(&mut txn, failure)?,
        }
        txn.commit().await?;
        Ok(Flow::Continue)
    }

    fn write_failure(&self, txn: &mut WriteTransaction<'_>, failure: Failure) -> Result<()> {
        txn.restart();
        match failure {
            Failure::Protocol(message) => {
                txn.buffer().put_u8(replies::PROTOCOL_ERROR);
                txn.pack(&Str, &message)
            }
            Failure::Packed(exc) => {
                let id = exc.exception_id();
                txn.buffer().put_u8(replies::PACKED_EXCEPTION);
                txn.buffer().put_i32(id);
                match self
                    .objects
                    .undo_stores_on_error(|| self.exceptions.encode(&*exc, txn.buffer()))
                {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        tracing::warn!(id, "packed exception could not be encoded: {}", err);
                        let context = format!("exception {}", id);
                        let generic = GenericException::new(exc.to_string(), traceback(&context, &err));
                        self.write_failure(txn, Failure::Generic(generic))
                    }
                }
            }
            Failure::Generic(exc) => {
                txn.buffer().put_u8(replies::GENERIC_EXCEPTION);
                txn.pack(&Str, &exc.message)?;
                txn.pack(&Str, &exc.traceback)
            }
        }
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("service", &self.service.name)
            .field("functions", &self.functions.len())
            .field("objects", &self.objects.len())
            .finish()
    }
}
