// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use thiserror::Error;

/// A specialized `Result` type for wrapper operations that return an
/// [`Error`][enum@Error] on failure.
pub type Result<T> = std::result::Result<T, Error>;

/// An error originating in the wrapper, or transported across the domain
/// boundary from the wrapped object.
///
/// Local mistakes (recovering from a local wrapper, touching a moved-out
/// payload) surface synchronously. Anything that happened on the server side
/// of the boundary travels back on the call's reply channel and is re-raised
/// as the `call` return value, most commonly as [`Error::Method`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The value behind this handle was moved to another domain and can no
    /// longer be used from here.
    #[error("value has been moved out of this domain")]
    Moved,

    /// The server is draining or has terminated and no longer accepts calls.
    #[error("wrapper is shutting down")]
    Closed,

    /// `recover_object` was called on a local wrapper, which shares the
    /// object with the caller instead of owning it.
    #[error("cannot recover an object from a local wrapper")]
    RecoveryNotPermitted,

    /// The wrapped object was already handed back by a previous recovery.
    #[error("object has already been recovered")]
    AlreadyRecovered,

    /// The wrapped object does not answer the named method.
    #[error("no method named `{0}`")]
    NoSuchMethod(String),

    /// A method tried to yield but the caller supplied no block.
    #[error("no block given")]
    NoBlock,

    /// A positional or named argument expected by the method was absent.
    #[error("missing argument `{0}`")]
    MissingArgument(String),

    /// A payload held a value of a different type than the one requested.
    #[error("payload is not a `{expected}`")]
    PayloadType {
        /// The type the access expected to find.
        expected: &'static str,
    },

    /// An error raised by the wrapped object's method, or by a caller's
    /// block, transported wholesale across the boundary.
    #[error(transparent)]
    Method(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wraps an arbitrary error (or message) as a raised method error.
    pub fn raised<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Method(error.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raised_preserves_message() {
        let error = Error::raised("Whoops");
        assert_eq!(error.to_string(), "Whoops");
    }

    #[test]
    fn raised_preserves_source_type() {
        let inner = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let error = Error::raised(inner);

        let Error::Method(boxed) = error else {
            panic!("expected a method error");
        };
        assert!(boxed.downcast_ref::<std::io::Error>().is_some());
    }
}
