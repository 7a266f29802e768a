//! Picklebox - Django-compatible signed encryption over a pickle codec
//!
//! Two independent layers, composed in a fixed order by the legacy
//! platform this crate interoperates with:
//!
//! - [`pickle`]: encodes/decodes a constrained value model ([`Value`]) in
//!   the pickle protocol 4 subset the legacy peer exchanges.
//! - [`envelope`]: signs and encrypts arbitrary bytes the way
//!   django-cryptography does ([`SecureEnvelope`]), so either side can
//!   verify and decrypt the other's output.
//!
//! [`seal_value`] and [`open_value`] compose the two in the reference
//! order (pickle, then encrypt; decrypt, then unpickle).

#![forbid(unsafe_code)]

pub mod envelope;
pub mod error;
pub mod pickle;
pub mod value;

pub use envelope::SecureEnvelope;
pub use error::{ErrorCategory, ErrorKind, PickleboxError, Result};
pub use value::Value;

/// Pickle a value and seal it in a signed, encrypted envelope.
pub fn seal_value(envelope: &SecureEnvelope, value: &Value) -> Result<Vec<u8>> {
    envelope.encrypt(&pickle::encode(value)?)
}

/// Verify and decrypt an envelope, then decode the pickled payload.
pub fn open_value(envelope: &SecureEnvelope, data: &[u8]) -> Result<Value> {
    pickle::decode(&envelope.decrypt(data)?)
}
