//! # objwire
//!
//! Runtime for an object-oriented RPC protocol over framed byte streams.
//!
//! ## Architecture
//!
//! - **Protocol** ([`protocol`]): 12-byte frame header carrying a sequence
//!   number, command and reply codes, optional zlib compression
//! - **Transport** ([`transport`]): transactional reads and writes over any
//!   duplex stream, one frame per transaction
//! - **Packers** ([`packers`]): typed binary codecs identified by numeric
//!   type ids, plus the heterogeneous map used for service metadata
//! - **Processor** ([`processor`]): server loop dispatching INVOKE and the
//!   control commands, owning the served-object table
//! - **Client** ([`client`]): request issuing, out-of-order reply
//!   correlation and reference-counted remote object proxies
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use objwire::client::ClientUtils;
//! use objwire::packers::{Int32, Packer};
//! use objwire::processor::{FunctionTable, Processor};
//! use objwire::transport::Transport;
//!
//! # async fn run() -> objwire::Result<()> {
//! let (a, b) = tokio::io::duplex(64 * 1024);
//!
//! let mut functions = FunctionTable::new();
//! functions.register(1, |args| Int32.unpack(args), Int32, |x: i32| async move { Ok(x * 2) });
//! let processor = Processor::builder()
//!     .functions(functions)
//!     .build(Arc::new(Transport::from_stream(a)));
//! tokio::spawn(Arc::new(processor).serve());
//!
//! let client = ClientUtils::builder(Transport::from_stream(b)).build();
//! let doubled = client.invoke(1, Int32, |buf| Int32.pack(&21, buf)).await?;
//! assert_eq!(doubled, 42);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod packers;
pub mod processor;
pub mod protocol;
pub mod transport;

pub use error::{
    Error, GenericException, HandlerError, PackedException, PackingError, ProtocolError, ProtocolErrorKind, Result,
};
