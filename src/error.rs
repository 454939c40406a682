//! The engine error taxonomy and the `Result` carrier used by every fallible
//! public API.  Each error kind belongs to a category and maps to a stable
//! integer code: the codes are part of the wire contract with out-of-process
//! collaborators and must never be renumbered.

use thiserror::Error;

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// The error categories.  The Romfs and Import categories belong to external
/// collaborators (the read-only filesystem and the JSON importer); their
/// kinds are defined here so that every process shares one stable numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Store,
    Io,
    Romfs,
    Import,
}

#[derive(Debug, Error)]
pub enum Error {
    // -- Store --
    #[error("the store is full")]
    StoreFull,
    #[error("the store file header is corrupt")]
    CorruptHeader,
    #[error("the footer checksum is invalid")]
    BadFooterCrc,
    #[error("unsupported store version {0}")]
    UnsupportedVersion(u16),
    #[error("the store is already open for writing")]
    AlreadyOpen,

    // -- I/O --
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // -- Romfs --
    #[error("invalid argument")]
    InvalidArgument,
    #[error("no such entry")]
    NoSuchEntry,
    #[error("not a directory")]
    NotADirectory,

    // -- Importer --
    #[error("unexpected number")]
    UnexpectedNumber,
    #[error("unexpected boolean")]
    UnexpectedBoolean,
    #[error("unexpected null")]
    UnexpectedNull,
    #[error("unexpected string")]
    UnexpectedString,
    #[error("unexpected array")]
    UnexpectedArray,
    #[error("unexpected end of array")]
    UnexpectedEndArray,
    #[error("unexpected object")]
    UnexpectedObject,
    #[error("unexpected object key")]
    UnexpectedObjectKey,
    #[error("unexpected end of object")]
    UnexpectedEndObject,
}

impl Error {
    pub fn category(&self) -> Category {
        use Error::*;
        match self {
            StoreFull | CorruptHeader | BadFooterCrc | UnsupportedVersion(_) | AlreadyOpen => {
                Category::Store
            }
            Io(_) => Category::Io,
            InvalidArgument | NoSuchEntry | NotADirectory => Category::Romfs,
            _ => Category::Import,
        }
    }

    /// The stable integer code of this error within its category.  I/O
    /// errors without a stable mapping report `1000 + errno` so that distinct
    /// OS failures remain distinguishable.
    pub fn code(&self) -> u32 {
        use Error::*;
        match self {
            StoreFull => 1,
            CorruptHeader => 2,
            BadFooterCrc => 3,
            UnsupportedVersion(_) => 4,
            AlreadyOpen => 5,

            Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => 1,
                std::io::ErrorKind::PermissionDenied => 2,
                std::io::ErrorKind::Interrupted => 3,
                _ => 1000 + e.raw_os_error().unwrap_or(0) as u32,
            },

            InvalidArgument => 1,
            NoSuchEntry => 2,
            NotADirectory => 3,

            UnexpectedNumber => 1,
            UnexpectedBoolean => 2,
            UnexpectedNull => 3,
            UnexpectedString => 4,
            UnexpectedArray => 5,
            UnexpectedEndArray => 6,
            UnexpectedObject => 7,
            UnexpectedObjectKey => 8,
            UnexpectedEndObject => 9,
        }
    }
}

/// Applies a fallible function to the fields of a tuple result,
/// positionally.  This is the n-ary companion of `Result::and_then`: where
/// `and_then` hands the whole success value to its continuation, a tuple
/// result can be applied to a continuation taking one argument per field.
/// An error value propagates without invoking the continuation.
pub trait AndThenTuple<F, U, E> {
    fn and_then_tuple(self, f: F) -> std::result::Result<U, E>;
}

macro_rules! impl_and_then_tuple {
    ($($name:ident : $ty:ident),+) => {
        impl<$($ty,)+ U, E, F> AndThenTuple<F, U, E> for std::result::Result<($($ty,)+), E>
        where
            F: FnOnce($($ty),+) -> std::result::Result<U, E>,
        {
            fn and_then_tuple(self, f: F) -> std::result::Result<U, E> {
                self.and_then(|($($name,)+)| f($($name),+))
            }
        }
    };
}

impl_and_then_tuple!(a: A, b: B);
impl_and_then_tuple!(a: A, b: B, c: C);
impl_and_then_tuple!(a: A, b: B, c: C, d: D);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories() {
        assert_eq!(Error::StoreFull.category(), Category::Store);
        assert_eq!(Error::NoSuchEntry.category(), Category::Romfs);
        assert_eq!(Error::UnexpectedEndObject.category(), Category::Import);
        let io = Error::from(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert_eq!(io.category(), Category::Io);
        assert_eq!(io.code(), 1);
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::StoreFull.code(), 1);
        assert_eq!(Error::BadFooterCrc.code(), 3);
        assert_eq!(Error::UnexpectedNumber.code(), 1);
        assert_eq!(Error::UnexpectedEndObject.code(), 9);
    }

    #[test]
    fn bind_propagates_errors() {
        let f = |_: u64| -> Result<u64> { Err(Error::UnexpectedNumber) };
        let ok: Result<u64> = Ok(7);
        assert!(matches!(ok.and_then(f), Err(Error::UnexpectedNumber)));

        let mut called = false;
        let err: Result<u64> = Err(Error::StoreFull);
        let out = err.and_then(|v| {
            called = true;
            f(v)
        });
        assert!(matches!(out, Err(Error::StoreFull)));
        assert!(!called);
    }

    #[test]
    fn bind_tuple_applies_fields() {
        let ok: Result<(u64, u64)> = Ok((3, 4));
        let sum = ok.and_then_tuple(|a, b| Ok(a + b));
        assert!(matches!(sum, Ok(7)));

        let err: Result<(u64, u64)> = Err(Error::BadFooterCrc);
        let out = err.and_then_tuple(|a, b| -> Result<u64> { Ok(a + b) });
        assert!(matches!(out, Err(Error::BadFooterCrc)));
    }
}
