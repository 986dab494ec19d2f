//! Error types shared by the parsing and writing pipelines.
use thiserror::Error;

/// `Error` represents the possible failures that can occur while reading
/// or emitting a class file.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// A structural violation in the input: unknown tag, short buffer,
    /// out-of-range constant pool index, invalid attribute length.
    #[error("malformed class file: {0}")]
    Malformed(String),

    /// The class file major version is above the configured maximum.
    #[error("unsupported class file major version {0}")]
    UnsupportedVersion(u16),

    /// The constant pool grew past the 16-bit index space.
    #[error("class file too large: constant pool would need {0} entries")]
    ClassTooLarge(usize),

    /// A single method's code exceeded the limits of the Code attribute.
    #[error("method {name} too large: {size} bytecode bytes")]
    MethodTooLarge { name: String, size: usize },

    /// A sink method was called out of the prescribed order or with
    /// arguments that violate its documented constraints.
    #[error("invalid visit: {0}")]
    InvalidInvocation(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand used all over the parser for truncated or inconsistent input.
    pub(crate) fn malformed(what: impl Into<String>) -> Self {
        Self::Malformed(what.into())
    }

    pub(crate) fn invalid(what: impl Into<String>) -> Self {
        Self::InvalidInvocation(what.into())
    }
}
