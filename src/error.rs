//! Error type shared by every fallible operation in the crate.

use thiserror::Error;

/// Result alias using [`Ao2Error`].
pub type Result<T> = core::result::Result<T, Ao2Error>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ao2Error {
    /// The handle does not refer to a live object: its magic number is
    /// gone or its reference count already reached zero.
    #[error("not a live ao2 object")]
    InvalidObject,

    /// Lock requested on an object allocated with `LockKind::None`.
    #[error("ao2 object has no lock")]
    NoLock,
}
