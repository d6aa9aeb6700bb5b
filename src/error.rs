//! Error types for objwire.
//!
//! Wire-visible failures come in three mutually exclusive kinds:
//! [`ProtocolError`], packed (declared) exceptions and [`GenericException`].
//! Everything else is local: transport timeouts, fatal channel failures,
//! misuse of transactions and [`PackingError`]s raised while encoding.

use std::any::Any;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Main error type for all objwire operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No frame header arrived before the read deadline. Recoverable.
    #[error("Transport timeout: no data received within {0:?}")]
    Timeout(Duration),

    /// I/O error on the underlying channel. Fatal to the transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport was closed, either explicitly or after a fatal error.
    #[error("Transport closed")]
    Closed,

    /// Transaction misuse, e.g. a reentrant `begin_read`.
    #[error("Transport usage error: {0}")]
    Usage(String),

    /// A read asked for more bytes than the current frame holds.
    #[error("Read of {requested} bytes exceeds the {available} bytes left in the frame")]
    FrameBoundary { requested: usize, available: usize },

    /// Frame payload could not be compressed or inflated.
    #[error("Compression error: {0}")]
    Compression(String),

    /// The stream's framing or semantics were violated.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A value did not match the shape its packer expects.
    #[error("Packing error: {0}")]
    Packing(#[from] PackingError),

    /// A declared exception raised by the remote handler.
    #[error("{0}")]
    Packed(Box<dyn PackedException>),

    /// An undeclared exception raised by the remote handler.
    #[error("{0}")]
    Generic(#[from] GenericException),
}

impl Error {
    /// Shorthand for a plain protocol violation.
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(ProtocolError::new(message))
    }

    /// Shorthand for a packing failure with a free-form message.
    pub fn packing(message: impl Into<String>) -> Self {
        Error::Packing(PackingError::Custom(message.into()))
    }

    /// Whether this error is a read timeout (the caller may retry).
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// Whether the transport that produced this error is unusable afterwards.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Closed)
    }

    /// Borrow the packed exception as `T`, if this is one.
    pub fn packed<T: PackedException>(&self) -> Option<&T> {
        match self {
            Error::Packed(exc) => exc.downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl From<Box<dyn PackedException>> for Error {
    fn from(exc: Box<dyn PackedException>) -> Self {
        Error::Packed(exc)
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Error type returned by server-side handlers.
///
/// Handlers may return any error. The processor decides how it travels back:
/// [`ProtocolError`], [`GenericException`], registered packed exceptions and
/// registered native errors are recognised, everything else becomes a generic
/// exception.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Sub-classification of protocol errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// The stream violated framing or command semantics.
    Violation,
    /// The peer speaks a different protocol version.
    WrongVersion,
    /// The peer serves a different service.
    WrongServiceName,
    /// The peer does not support this client's version.
    IncompatibleVersion,
}

/// A violation of the stream's framing or semantics.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProtocolError {
    kind: ProtocolErrorKind,
    message: String,
}

impl ProtocolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_kind(ProtocolErrorKind::Violation, message)
    }

    pub fn with_kind(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ProtocolErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// An undeclared remote exception, reduced to its message and traceback text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct GenericException {
    pub message: String,
    pub traceback: String,
}

impl GenericException {
    pub fn new(message: impl Into<String>, traceback: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            traceback: traceback.into(),
        }
    }
}

impl fmt::Display for GenericException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\n---------------- Remote Traceback ----------------\n{}",
            self.message, self.traceback
        )
    }
}

/// Local failure while encoding or decoding a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PackingError {
    /// The value has the wrong shape for the packer.
    #[error("expected {expected}, found {found}")]
    TypeMismatch { expected: &'static str, found: String },

    /// A string payload is not valid UTF-8.
    #[error("invalid UTF-8 in string payload")]
    InvalidUtf8,

    /// A length or count does not fit the wire representation.
    #[error("length {0} does not fit in an int32")]
    LengthOverflow(usize),

    /// A timestamp lies outside the representable range.
    #[error("timestamp out of range: {0}")]
    DateOutOfRange(i64),

    /// An object handle does not name a live object of the expected class.
    #[error("object handle {0} is unknown or of the wrong class")]
    BadObject(i64),

    /// Anything else.
    #[error("{0}")]
    Custom(String),
}

/// A declared exception with a registered packer and numeric type id.
///
/// Implementors are plain records. `as_any` lets callers recover the concrete
/// type from a `Box<dyn PackedException>`:
///
/// ```
/// use std::any::Any;
/// use objwire::PackedException;
///
/// #[derive(Debug, Clone)]
/// struct Overdrawn { balance: i32 }
///
/// impl std::fmt::Display for Overdrawn {
///     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
///         write!(f, "Overdrawn(balance = {})", self.balance)
///     }
/// }
/// impl std::error::Error for Overdrawn {}
/// impl PackedException for Overdrawn {
///     fn exception_id(&self) -> i32 { 900_100 }
///     fn as_any(&self) -> &dyn Any { self }
/// }
///
/// let boxed: Box<dyn PackedException> = Box::new(Overdrawn { balance: -5 });
/// assert_eq!(boxed.downcast_ref::<Overdrawn>().unwrap().balance, -5);
/// ```
pub trait PackedException: std::error::Error + Send + Sync + 'static {
    /// Type id the exception's packer is registered under.
    fn exception_id(&self) -> i32;

    fn as_any(&self) -> &dyn Any;
}

impl dyn PackedException {
    pub fn is<T: PackedException>(&self) -> bool {
        self.as_any().is::<T>()
    }

    pub fn downcast_ref<T: PackedException>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}
