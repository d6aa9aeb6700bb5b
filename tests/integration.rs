//! End-to-end tests: a served processor and a client talking over a
//! transport pair.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use objwire::client::{ClientUtils, Proxy, RemoteObject};
use objwire::packers::{Int32, Int64, ObjRefPacker, Packer, ProxyRefPacker, Str};
use objwire::processor::{
    no_args, ExceptionRegistry, FunctionInfo, FunctionTable, ObjectTable, Processor, ProcessorBuilder, ServedObject,
    ServiceDescriptor,
};
use objwire::protocol::info;
use objwire::transport::{SocketListener, SocketTransport, Transport};
use objwire::{Error, HandlerError, PackedException, ProtocolErrorKind};

const COUNTER_TYPE_ID: i32 = 900_700;
const OVERDRAWN_TYPE_ID: i32 = 900_201;

#[derive(Debug, Clone, PartialEq)]
struct Overdrawn {
    balance: i32,
    owner: String,
}

impl fmt::Display for Overdrawn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "account of {} overdrawn by {}", self.owner, -self.balance)
    }
}

impl std::error::Error for Overdrawn {}

impl PackedException for Overdrawn {
    fn exception_id(&self) -> i32 {
        OVERDRAWN_TYPE_ID
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct OverdrawnPacker;

impl Packer for OverdrawnPacker {
    type Item = Overdrawn;

    fn id(&self) -> i32 {
        OVERDRAWN_TYPE_ID
    }

    fn pack(&self, item: &Overdrawn, buf: &mut BytesMut) -> objwire::Result<()> {
        Int32.pack(&item.balance, buf)?;
        Str.pack(&item.owner, buf)
    }

    fn unpack(&self, buf: &mut Bytes) -> objwire::Result<Overdrawn> {
        Ok(Overdrawn {
            balance: Int32.unpack(buf)?,
            owner: Str.unpack(buf)?,
        })
    }
}

#[derive(Debug)]
struct LimitExceeded(i32);

impl fmt::Display for LimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "limit exceeded: {}", self.0)
    }
}

impl std::error::Error for LimitExceeded {}

#[derive(Default)]
struct Counter {
    value: AtomicI32,
}

impl ServedObject for Counter {
    fn idl_type(&self) -> &'static str {
        "Counter"
    }

    fn idl_super_classes(&self) -> &'static [&'static str] {
        &["Resettable"]
    }
}

struct CounterProxy(Proxy);

impl RemoteObject for CounterProxy {
    fn from_proxy(proxy: Proxy) -> Self {
        Self(proxy)
    }

    fn proxy(&self) -> &Proxy {
        &self.0
    }
}

impl CounterProxy {
    async fn add(&self, by: i32) -> objwire::Result<i32> {
        self.0.invoke(11, Int32, |buf| Int32.pack(&by, buf)).await
    }
}

fn exceptions() -> ExceptionRegistry {
    let mut registry = ExceptionRegistry::new();
    registry
        .register(OverdrawnPacker)
        .map_native(|native: LimitExceeded| Overdrawn {
            balance: -native.0,
            owner: "limits".into(),
        });
    registry
}

/// The service every test talks to.
fn service(objects: &Arc<ObjectTable>) -> ProcessorBuilder {
    let mut functions = FunctionTable::new();

    functions.register(42, no_args, Int32, |()| async { Ok(7) });
    functions.register(1, |args: &mut Bytes| Str.unpack(args), Str, |text: String| async move {
        Ok(text)
    });
    functions.register(2, |args: &mut Bytes| Int32.unpack(args), Int32, |delay: i32| async move {
        tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        Ok(delay)
    });
    functions.register(20, no_args, Int32, |()| async {
        Err::<i32, HandlerError>(Box::new(Overdrawn {
            balance: -250,
            owner: "alice".into(),
        }))
    });
    functions.register(21, no_args, Int32, |()| async {
        Err::<i32, HandlerError>(Box::new(LimitExceeded(40)))
    });
    functions.register(22, no_args, Int32, |()| async {
        Err::<i32, HandlerError>("oops".into())
    });

    let counter = Arc::new(Counter::default());
    functions.register(
        10,
        no_args,
        ObjRefPacker::<Counter>::new(COUNTER_TYPE_ID, Arc::clone(objects)),
        move |()| {
            let counter = Arc::clone(&counter);
            async move { Ok(Some(counter)) }
        },
    );
    let table = Arc::clone(objects);
    functions.register(
        11,
        move |args: &mut Bytes| {
            let counter = table.load_as::<Counter>(Int64.unpack(args)?)?;
            Ok((counter, Int32.unpack(args)?))
        },
        Int32,
        |(counter, by): (Option<Arc<Counter>>, i32)| async move {
            let counter = counter.ok_or("counter is null")?;
            Ok::<i32, HandlerError>(counter.value.fetch_add(by, Ordering::SeqCst) + by)
        },
    );

    let descriptor = ServiceDescriptor::new("counters", "c0ffee")
        .supported_version("1.0")
        .supported_version("1.1")
        .function(FunctionInfo::new(42, "answer", "int32"))
        .function(FunctionInfo::new(1, "echo", "string").arg("text", "string"));

    Processor::builder()
        .functions(functions)
        .exceptions(exceptions())
        .service(descriptor)
        .objects(Arc::clone(objects))
}

fn connect(builder: ProcessorBuilder) -> Arc<ClientUtils> {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let processor = Arc::new(builder.build(Arc::new(Transport::from_stream(a))));
    tokio::spawn(processor.serve());
    ClientUtils::builder(Transport::from_stream(b))
        .exceptions(exceptions())
        .default_timeout(Duration::from_secs(5))
        .build()
}

fn setup() -> (Arc<ClientUtils>, Arc<ObjectTable>) {
    let objects = Arc::new(ObjectTable::new());
    let client = connect(service(&objects));
    (client, objects)
}

#[tokio::test]
async fn test_invoke_without_arguments() {
    let (client, _) = setup();
    let answer = client.invoke(42, Int32, |_| Ok(())).await.unwrap();
    assert_eq!(answer, 7);
}

#[tokio::test]
async fn test_unknown_function_is_protocol_error() {
    let (client, _) = setup();
    let err = client.invoke(9999, Int32, |_| Ok(())).await.unwrap_err();
    match err {
        Error::Protocol(p) => assert!(p.message().contains("9999")),
        other => panic!("expected protocol error, got {:?}", other),
    }

    // The connection survives.
    assert_eq!(client.invoke(42, Int32, |_| Ok(())).await.unwrap(), 7);
}

#[tokio::test]
async fn test_concurrent_invocations_complete_out_of_order() {
    let objects = Arc::new(ObjectTable::new());
    let client = connect(service(&objects).max_concurrent_invocations(3));

    let mut pending = Vec::new();
    for delay in [90, 10, 50] {
        let mut call = client.invocation(2, Int32).await.unwrap();
        call.pack(&Int32, &delay).unwrap();
        pending.push(call.send().await.unwrap());
    }

    let mut results = Vec::new();
    for reply in pending {
        results.push(reply.wait().await.unwrap());
    }
    assert_eq!(results, vec![90, 10, 50]);
    assert_eq!(client.pending_replies(), 0);
}

#[tokio::test]
async fn test_parallel_callers_share_one_client() {
    let (client, _) = setup();

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..8 {
        let client = Arc::clone(&client);
        tasks.spawn(async move {
            let text = format!("call-{}", i);
            let echoed = client.invoke(1, Str, |buf| Str.pack(&text, buf)).await.unwrap();
            assert_eq!(echoed, text);
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap();
    }
    assert_eq!(client.pending_replies(), 0);
}

#[tokio::test]
async fn test_packed_exception_keeps_fields() {
    let (client, _) = setup();
    let err = client.invoke(20, Int32, |_| Ok(())).await.unwrap_err();
    let exc = err.packed::<Overdrawn>().expect("packed Overdrawn");
    assert_eq!(
        exc,
        &Overdrawn {
            balance: -250,
            owner: "alice".into()
        }
    );
}

#[tokio::test]
async fn test_native_error_maps_to_packed_exception() {
    let (client, _) = setup();
    let err = client.invoke(21, Int32, |_| Ok(())).await.unwrap_err();
    let exc = err.packed::<Overdrawn>().expect("packed Overdrawn");
    assert_eq!(exc.balance, -40);
    assert_eq!(exc.owner, "limits");
}

#[tokio::test]
async fn test_other_errors_become_generic() {
    let (client, _) = setup();
    match client.invoke(22, Int32, |_| Ok(())).await {
        Err(Error::Generic(exc)) => {
            assert_eq!(exc.message, "oops");
            assert!(!exc.traceback.is_empty());
        }
        other => panic!("expected generic exception, got {:?}", other),
    }
}

#[tokio::test]
async fn test_proxy_refcount_follows_exposures() {
    let (client, objects) = setup();
    let packer = || ProxyRefPacker::<CounterProxy>::new(COUNTER_TYPE_ID, &client);

    let first = client.invoke(10, packer(), |_| Ok(())).await.unwrap().unwrap();
    let second = client.invoke(10, packer(), |_| Ok(())).await.unwrap().unwrap();
    let handle = first.proxy().handle();

    assert_eq!(first.proxy(), second.proxy());
    assert_eq!(first.proxy().owned_refs(), 2);
    assert_eq!(objects.refcount(handle), 2);
    assert_eq!(client.cached_proxies(), 1);

    assert_eq!(first.add(5).await.unwrap(), 5);
    assert_eq!(second.add(2).await.unwrap(), 7);
    assert!(first.proxy().is_instance_of("Resettable").await.unwrap());
    assert!(!first.proxy().is_instance_of("Widget").await.unwrap());
    assert_eq!(first.proxy().remote_type().await.unwrap(), "Counter");

    drop(second);
    first.proxy().dispose().await;
    client.ping("sync", None).await.unwrap();
    assert!(objects.is_empty());

    let err = first.add(1).await.unwrap_err();
    assert!(matches!(err, Error::Usage(_)));
}

#[tokio::test]
async fn test_dropped_proxy_is_released() {
    let (client, objects) = setup();
    let packer = ProxyRefPacker::<CounterProxy>::new(COUNTER_TYPE_ID, &client);
    let counter = client.invoke(10, packer, |_| Ok(())).await.unwrap().unwrap();
    assert_eq!(objects.len(), 1);

    drop(counter);
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.ping("sync", None).await.unwrap();
    assert!(objects.is_empty());
}

#[tokio::test]
async fn test_incref_keeps_object_alive() {
    let (client, objects) = setup();
    let packer = ProxyRefPacker::<CounterProxy>::new(COUNTER_TYPE_ID, &client);
    let counter = client.invoke(10, packer, |_| Ok(())).await.unwrap().unwrap();
    let handle = counter.proxy().handle();

    client.incref(handle).await.unwrap();
    counter.proxy().dispose().await;
    client.ping("sync", None).await.unwrap();
    assert_eq!(objects.refcount(handle), 1);

    client.decref(handle).await;
    client.ping("sync", None).await.unwrap();
    assert!(objects.is_empty());
}

#[tokio::test]
async fn test_ping_and_service_info() {
    let (client, _) = setup();
    client.ping("hello", Some(Duration::from_secs(1))).await.unwrap();

    let service = client.get_service_info(info::SERVICE).await.unwrap();
    assert_eq!(service.get("SERVICE_NAME").and_then(|v| v.as_str()), Some("counters"));

    client.assert_service_compatibility("counters", Some("1.1")).await.unwrap();
    client.assert_service_compatibility("counters", None).await.unwrap();

    let err = client
        .assert_service_compatibility("accounts", None)
        .await
        .unwrap_err();
    assert!(matches!(&err, Error::Protocol(p) if p.kind() == ProtocolErrorKind::WrongServiceName));

    let err = client
        .assert_service_compatibility("counters", Some("2.0"))
        .await
        .unwrap_err();
    assert!(matches!(&err, Error::Protocol(p) if p.kind() == ProtocolErrorKind::IncompatibleVersion));
}

#[tokio::test]
async fn test_quit_stops_the_server() {
    let objects = Arc::new(ObjectTable::new());
    let (a, b) = tokio::io::duplex(64 * 1024);
    let processor = Arc::new(service(&objects).build(Arc::new(Transport::from_stream(a))));
    let server = tokio::spawn(processor.serve());

    let client = ClientUtils::builder(Transport::from_stream(b)).build();
    client.quit().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(1), server).await.unwrap();
    assert!(result.unwrap().is_ok());
}

#[tokio::test]
async fn test_compressed_frames_over_tcp() {
    let objects = Arc::new(ObjectTable::new());
    let builder = service(&objects);

    let listener = SocketListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client_transport = SocketTransport::connect(addr).await.unwrap();
    let (server_transport, _) = listener.accept().await.unwrap();

    assert!(server_transport.enable_compression());
    assert!(client_transport.enable_compression());

    tokio::spawn(Arc::new(builder.build(Arc::new(server_transport))).serve());
    let client = ClientUtils::builder(client_transport)
        .default_timeout(Duration::from_secs(5))
        .build();

    let text = "compressible ".repeat(10_000);
    let echoed = client.invoke(1, Str, |buf| Str.pack(&text, buf)).await.unwrap();
    assert_eq!(echoed, text);

    let short = client.invoke(1, Str, |buf| Str.pack(&"tiny".to_string(), buf)).await.unwrap();
    assert_eq!(short, "tiny");
}
