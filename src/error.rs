use std::io;
use thiserror::Error;

/// type alias for all operations on a [`Store`] that could fail with a [`KvError`]
///
/// [`Store`]: ../store/struct.Store.html
pub type Result<T> = std::result::Result<T, KvError>;

/// Error variants used throughout the store.
/// It wraps any lower level errors from third party crates
#[derive(Error)]
pub enum KvError {
    /// variant for errors caused by std::io
    #[error("IO error")]
    Io {
        /// source of the IO Error
        #[from]
        source: io::Error,
    },

    /// variant for errors when a key was not found in the store
    #[error("Key not found")]
    KeyNotFound,

    /// a WAL entry, data file record, or index snapshot is malformed, or a
    /// record read back from the data file does not carry the key the index
    /// claimed it would
    #[error("corruption detected: {}", .0)]
    Corruption(String),

    /// variant for errors caused during type serialization/deserialization
    #[error("serialization/deserialization error")]
    Serialization(#[from] serde_json::Error),

    /// variant for errors when parsing strings to some other type
    #[error("{}", .0)]
    Parsing(String),

    /// a request line did not follow the wire protocol
    #[error("protocol error: {}", .0)]
    Protocol(String),

    /// synchronous replication did not get an `OK` from every healthy replica;
    /// the master's local state is already committed
    #[error("replication failed: {}", .0)]
    Replication(String),

    /// catch-all variant for reporting error message strings to clients
    #[error("{}", .0)]
    StringErr(String),
}

/// a custom Debug implementation that will write the entire error chain
impl std::fmt::Debug for KvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

/// writes the entire error chain of the given error `e`, to the formatter.
fn error_chain_fmt(
    e: &impl std::error::Error,
    f: &mut std::fmt::Formatter<'_>,
) -> std::fmt::Result {
    writeln!(f, "{}\n", e)?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by: {}", cause)?;
        current = cause.source();
    }
    Ok(())
}
