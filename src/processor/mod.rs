//! Server side of the protocol.
//!
//! A [`Processor`] owns one transport and answers requests on it:
//!
//! 1. read one frame and take its command byte
//! 2. INVOKE: look up the function id in the [`FunctionTable`], decode the
//!    arguments and run the handler
//! 3. everything else is a control command: PING, DECREF/INCREF on the
//!    [`ObjectTable`], GETINFO, CHECK_CAST, QUERY_PROXY_TYPE and QUIT
//! 4. reply with SUCCESS, PROTOCOL_ERROR, PACKED_EXCEPTION or
//!    GENERIC_EXCEPTION under the request's sequence number
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use objwire::packers::Int32;
//! use objwire::processor::{no_args, FunctionTable, Processor, ServiceDescriptor};
//! use objwire::transport::SocketListener;
//!
//! # async fn run() -> objwire::Result<()> {
//! let mut functions = FunctionTable::new();
//! functions.register(42, no_args, Int32, |()| async { Ok(7) });
//!
//! let builder = Processor::builder()
//!     .functions(functions)
//!     .service(ServiceDescriptor::new("answers", "0"));
//!
//! let listener = SocketListener::bind("127.0.0.1:0").await?;
//! loop {
//!     let (transport, _peer) = listener.accept().await?;
//!     let processor = Arc::new(builder.build(Arc::new(transport)));
//!     tokio::spawn(processor.serve());
//! }
//! # }
//! ```

mod dispatch;
mod exceptions;
mod function;
mod object_table;
mod service;

pub use dispatch::{Flow, Processor, ProcessorBuilder, DEFAULT_MAX_CONCURRENT_INVOCATIONS};
pub use exceptions::ExceptionRegistry;
pub use function::{no_args, BoxFuture, Function, FunctionTable, Reply, TypedFunction, VoidFunction};
pub use object_table::{ObjectTable, ServedObject};
pub use service::{meta_info, FunctionInfo, ServiceDescriptor, IMPLEMENTATION, PROTOCOL_VERSION, TOOLCHAIN_VERSION};

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::{Buf, BufMut, Bytes, BytesMut};

    use super::*;
    use crate::error::{Error, HandlerError};
    use crate::packers::{Int32, ObjRefPacker, Packer, PackerRegistry, Str};
    use crate::protocol::{commands, info, replies};
    use crate::transport::Transport;

    struct Widget;

    impl ServedObject for Widget {
        fn idl_type(&self) -> &'static str {
            "Widget"
        }

        fn idl_super_classes(&self) -> &'static [&'static str] {
            &["Gadget"]
        }
    }

    fn pair(builder: ProcessorBuilder) -> (Processor, Transport) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (builder.build(Arc::new(Transport::from_stream(a))), Transport::from_stream(b))
    }

    async fn send(client: &Transport, seq: i32, body: &[u8]) {
        let mut txn = client.begin_write(seq).await.unwrap();
        txn.write(body);
        txn.commit().await.unwrap();
    }

    async fn reply(client: &Transport) -> (i32, Bytes) {
        let mut txn = client
            .begin_read(Some(Duration::from_secs(1)))
            .await
            .unwrap();
        (txn.seq(), txn.read_all())
    }

    fn request(command: u8, fill: impl FnOnce(&mut BytesMut)) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(command);
        fill(&mut buf);
        buf
    }

    #[tokio::test]
    async fn test_ping_echoes() {
        let (processor, client) = pair(Processor::builder());
        let body = request(commands::PING, |b| Str.pack(&"hello".to_string(), b).unwrap());
        send(&client, 11, &body).await;

        assert_eq!(processor.process().await.unwrap(), Flow::Continue);
        let (seq, mut payload) = reply(&client).await;
        assert_eq!(seq, 11);
        assert_eq!(payload.get_u8(), replies::SUCCESS);
        assert_eq!(Str.unpack(&mut payload).unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_unknown_command_is_protocol_error() {
        let (processor, client) = pair(Processor::builder());
        send(&client, 1, &[0x42]).await;
        processor.process().await.unwrap();

        let (_, mut payload) = reply(&client).await;
        assert_eq!(payload.get_u8(), replies::PROTOCOL_ERROR);
        assert!(Str.unpack(&mut payload).unwrap().contains("66"));
    }

    #[tokio::test]
    async fn test_decref_sends_nothing_and_quit_stops() {
        let objects = Arc::new(ObjectTable::new());
        let handle = objects.store(&Arc::new(Widget));
        let (processor, client) = pair(Processor::builder().objects(Arc::clone(&objects)));

        send(&client, 1, &request(commands::DECREF, |b| b.put_i64(handle))).await;
        send(&client, 2, &[commands::QUIT]).await;

        assert_eq!(processor.process().await.unwrap(), Flow::Continue);
        assert!(objects.is_empty());
        assert_eq!(processor.process().await.unwrap(), Flow::Quit);

        let err = client
            .begin_read(Some(Duration::from_millis(50)))
            .await
            .err()
            .unwrap();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_check_cast_and_proxy_type() {
        let objects = Arc::new(ObjectTable::new());
        let handle = objects.store(&Arc::new(Widget));
        let (processor, client) = pair(Processor::builder().objects(objects));

        for (seq, class) in [(1, "Gadget"), (2, "Widget"), (3, "Gizmo")] {
            let body = request(commands::CHECK_CAST, |b| {
                b.put_i64(handle);
                Str.pack(&class.to_string(), b).unwrap();
            });
            send(&client, seq, &body).await;
            processor.process().await.unwrap();
        }
        let mut answers = Vec::new();
        for _ in 0..3 {
            let (_, mut payload) = reply(&client).await;
            assert_eq!(payload.get_u8(), replies::SUCCESS);
            answers.push(payload.get_u8() != 0);
        }
        assert_eq!(answers, vec![true, true, false]);

        send(&client, 4, &request(commands::QUERY_PROXY_TYPE, |b| b.put_i64(handle))).await;
        processor.process().await.unwrap();
        let (_, mut payload) = reply(&client).await;
        assert_eq!(payload.get_u8(), replies::SUCCESS);
        assert_eq!(Str.unpack(&mut payload).unwrap(), "Widget");
    }

    #[tokio::test]
    async fn test_getinfo_service() {
        let service = ServiceDescriptor::new("widgets", "abc").supported_version("2.0");
        let (processor, client) = pair(Processor::builder().service(service));

        send(&client, 5, &request(commands::GETINFO, |b| b.put_i32(info::SERVICE))).await;
        processor.process().await.unwrap();

        let (_, mut payload) = reply(&client).await;
        assert_eq!(payload.get_u8(), replies::SUCCESS);
        let registry = PackerRegistry::builtin();
        let map = registry.builtin_heteromap().unpack(&mut payload).unwrap();
        assert_eq!(map.get("SERVICE_NAME").and_then(|v| v.as_str()), Some("widgets"));
    }

    #[tokio::test]
    async fn test_handler_errors_become_generic() {
        let mut functions = FunctionTable::new();
        functions.register(7, no_args, Int32, |()| async {
            Err::<i32, HandlerError>("division by zero".into())
        });
        let (processor, client) = pair(Processor::builder().functions(functions));

        send(&client, 3, &request(commands::INVOKE, |b| b.put_i32(7))).await;
        processor.process().await.unwrap();

        let (_, mut payload) = reply(&client).await;
        assert_eq!(payload.get_u8(), replies::GENERIC_EXCEPTION);
        assert_eq!(Str.unpack(&mut payload).unwrap(), "division by zero");
        assert!(!Str.unpack(&mut payload).unwrap().is_empty());
    }

    /// Result type carrying an object reference followed by a field that
    /// cannot be encoded.
    struct WidgetAndLabel {
        widget: ObjRefPacker<Widget>,
    }

    impl Packer for WidgetAndLabel {
        type Item = Arc<Widget>;

        fn id(&self) -> i32 {
            900_300
        }

        fn pack(&self, item: &Arc<Widget>, buf: &mut BytesMut) -> crate::Result<()> {
            self.widget.pack(&Some(Arc::clone(item)), buf)?;
            Err(Error::packing("label is not encodable"))
        }

        fn unpack(&self, _buf: &mut Bytes) -> crate::Result<Arc<Widget>> {
            Err(Error::packing("not used"))
        }
    }

    #[tokio::test]
    async fn test_failed_result_encoding_releases_stored_objects() {
        let objects = Arc::new(ObjectTable::new());
        let mut functions = FunctionTable::new();
        let result = WidgetAndLabel {
            widget: ObjRefPacker::new(900_100, Arc::clone(&objects)),
        };
        functions.register(12, no_args, result, |()| async { Ok(Arc::new(Widget)) });
        let (processor, client) = pair(Processor::builder().functions(functions).objects(Arc::clone(&objects)));

        send(&client, 6, &request(commands::INVOKE, |b| b.put_i32(12))).await;
        processor.process().await.unwrap();

        let (_, mut payload) = reply(&client).await;
        assert_eq!(payload.get_u8(), replies::GENERIC_EXCEPTION);
        assert!(Str.unpack(&mut payload).unwrap().contains("label"));
        assert!(objects.is_empty());
    }

    #[tokio::test]
    async fn test_truncated_arguments_are_protocol_error() {
        let mut functions = FunctionTable::new();
        functions.register(8, |args: &mut Bytes| Int32.unpack(args), Int32, |x: i32| async move {
            Ok(x)
        });
        let (processor, client) = pair(Processor::builder().functions(functions));

        send(&client, 4, &request(commands::INVOKE, |b| {
            b.put_i32(8);
            b.put_u8(1);
        }))
        .await;
        processor.process().await.unwrap();

        let (_, mut payload) = reply(&client).await;
        assert_eq!(payload.get_u8(), replies::PROTOCOL_ERROR);
    }

    #[tokio::test]
    async fn test_serve_ends_on_disconnect() {
        let (processor, client) = pair(Processor::builder());
        let server = tokio::spawn(Arc::new(processor).serve());

        send(&client, 1, &request(commands::PING, |b| Str.pack(&String::new(), b).unwrap())).await;
        let (seq, _) = reply(&client).await;
        assert_eq!(seq, 1);

        client.close().await.unwrap();
        let result = server.await.unwrap();
        assert!(result.is_ok());
        assert!(!matches!(result, Err(Error::Closed)));
    }
}
