//! Calculator service - server and client in one process.
//!
//! This example demonstrates:
//! - Registering typed functions on a processor and serving TCP connections
//! - Declaring a packed exception shared by both sides
//! - Calling functions from a client and collecting replies out of order
//! - Checking service compatibility before the first call
//!
//! ```text
//! RUST_LOG=objwire=debug cargo run --example calculator
//! ```

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use objwire::client::ClientUtils;
use objwire::packers::{Int32, Packer};
use objwire::processor::{ExceptionRegistry, FunctionInfo, FunctionTable, Processor, ServiceDescriptor};
use objwire::transport::{SocketListener, SocketTransport};
use objwire::{Error, HandlerError, PackedException};

const ADD: i32 = 1;
const DIVIDE: i32 = 2;
const DIVISION_BY_ZERO_ID: i32 = 100_001;

#[derive(Debug, Clone)]
struct DivisionByZero {
    dividend: i32,
}

impl fmt::Display for DivisionByZero {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot divide {} by zero", self.dividend)
    }
}

impl std::error::Error for DivisionByZero {}

impl PackedException for DivisionByZero {
    fn exception_id(&self) -> i32 {
        DIVISION_BY_ZERO_ID
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct DivisionByZeroPacker;

impl Packer for DivisionByZeroPacker {
    type Item = DivisionByZero;

    fn id(&self) -> i32 {
        DIVISION_BY_ZERO_ID
    }

    fn pack(&self, item: &DivisionByZero, buf: &mut BytesMut) -> objwire::Result<()> {
        Int32.pack(&item.dividend, buf)
    }

    fn unpack(&self, buf: &mut Bytes) -> objwire::Result<DivisionByZero> {
        Ok(DivisionByZero {
            dividend: Int32.unpack(buf)?,
        })
    }
}

fn exceptions() -> ExceptionRegistry {
    let mut registry = ExceptionRegistry::new();
    registry.register(DivisionByZeroPacker);
    registry
}

fn two_ints(args: &mut Bytes) -> objwire::Result<(i32, i32)> {
    Ok((Int32.unpack(args)?, Int32.unpack(args)?))
}

fn calculator() -> FunctionTable {
    let mut functions = FunctionTable::new();
    functions.register(ADD, two_ints, Int32, |(a, b): (i32, i32)| async move {
        Ok(a.wrapping_add(b))
    });
    functions.register(DIVIDE, two_ints, Int32, |(a, b): (i32, i32)| async move {
        if b == 0 {
            return Err::<i32, HandlerError>(Box::new(DivisionByZero { dividend: a }));
        }
        Ok(a / b)
    });
    functions
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let service = ServiceDescriptor::new("calculator", "calc-1")
        .supported_version("1.0")
        .function(FunctionInfo::new(ADD, "add", "int32").arg("a", "int32").arg("b", "int32"))
        .function(FunctionInfo::new(DIVIDE, "divide", "int32").arg("a", "int32").arg("b", "int32"));
    let builder = Processor::builder()
        .functions(calculator())
        .exceptions(exceptions())
        .service(service)
        .max_concurrent_invocations(4);

    let listener = SocketListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "calculator listening");

    tokio::spawn(async move {
        loop {
            let (transport, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::error!("accept failed: {}", err);
                    return;
                }
            };
            let processor = Arc::new(builder.build(Arc::new(transport)));
            tokio::spawn(async move {
                if let Err(err) = processor.serve().await {
                    tracing::warn!(%peer, "connection ended: {}", err);
                }
            });
        }
    });

    let client = ClientUtils::builder(SocketTransport::connect(addr).await?)
        .exceptions(exceptions())
        .build();
    client.assert_service_compatibility("calculator", Some("1.0")).await?;
    let rtt = client.ping("hello", None).await?;
    tracing::info!(?rtt, "server is up");

    let mut pending = Vec::new();
    for (a, b) in [(40, 2), (1, 1), (-7, 10)] {
        let mut call = client.invocation(ADD, Int32).await?;
        call.pack(&Int32, &a)?;
        call.pack(&Int32, &b)?;
        pending.push(((a, b), call.send().await?));
    }
    for ((a, b), reply) in pending {
        tracing::info!("{} + {} = {}", a, b, reply.wait().await?);
    }

    let quotient = client
        .invoke(DIVIDE, Int32, |buf| {
            Int32.pack(&10, buf)?;
            Int32.pack(&0, buf)
        })
        .await;
    match quotient {
        Err(err) => match err.packed::<DivisionByZero>() {
            Some(exc) => tracing::info!("server refused: {}", exc),
            None => return Err(err.into()),
        },
        Ok(value) => tracing::info!("10 / 0 = {}", value),
    }

    if let Err(Error::Protocol(err)) = client.invoke(ADD, Int32, |buf| Int32.pack(&1, buf)).await {
        tracing::info!("truncated request rejected: {}", err);
    }

    client.quit().await?;
    client.close().await?;
    Ok(())
}
