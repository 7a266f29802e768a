use std::error::Error as StdError;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCategory {
    /// Any failure that cannot be confidently attributed to the input,
    /// such as an unexpected state inside the library itself.
    Internal,

    /// The caller provided invalid, truncated, or tampered-with input.
    User,
}

/// Fine-grained condition flags for consumers that want to branch on error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The pickle stream contains an opcode outside the supported subset.
    UnsupportedOpcode,
    /// The pickle header is malformed or uses a protocol version above 5.
    UnsupportedProtocol,
    /// Input data ended before the expected component could be read.
    TruncatedInput,
    /// The pickle stream ended without a STOP opcode.
    MissingStop,
    /// The operand stack or mark state does not match what an opcode expects.
    StackMismatch,
    /// A LONG1 integer does not fit a 64-bit accumulator.
    IntegerOverflow,
    /// A value is too large for its wire-format length field.
    ValueTooLarge,
    /// The envelope does not start with the expected version byte.
    InvalidVersion,
    /// The decrypted plaintext carries inconsistent PKCS#7 padding.
    InvalidPadding,
    /// The envelope signature does not match (tampering or wrong secret).
    InvalidSignature,
    /// Envelope length fields or binary layout are invalid.
    BinaryFormat,
    /// Unexpected state reached within picklebox logic.
    InternalInvariant,
}

#[derive(Debug, Error)]
#[error("{msg}")]
pub struct PickleboxError {
    /// Broad error category, always provided.
    pub category: ErrorCategory,
    /// Optional specific condition tag for consumers that need to
    /// branch their behavior. Any code consuming errors MUST handle
    /// the absence of a defined kind.
    pub kind: Option<ErrorKind>,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    msg: String,
}

impl PickleboxError {
    /// Creates a new error with a required category and display message.
    pub fn new(category: ErrorCategory, msg: impl Into<String>) -> Self {
        Self {
            category,
            kind: None,
            source: None,
            msg: msg.into(),
        }
    }

    /// Creates a new error that also tags the failure with a kind.
    pub fn with_kind(category: ErrorCategory, kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            category,
            kind: Some(kind),
            source: None,
            msg: msg.into(),
        }
    }

    /// Creates a new error that retains the originating source error.
    pub fn with_source(
        category: ErrorCategory,
        msg: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            category,
            kind: None,
            source: Some(Box::new(source)),
            msg: msg.into(),
        }
    }

    /// The user-facing message carried by the error.
    pub fn message(&self) -> &str {
        &self.msg
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, PickleboxError>;
