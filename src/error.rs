use recursor_proto::buffer::{ReaderError, WriterError};
use recursor_proto::name::NameError;

/// Library-wide error taxonomy.
///
/// Allocation failure has no variant: Rust aborts on OOM, there is nothing
/// to propagate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument")]
    InvalidArg,
    #[error("malformed wire data")]
    Proto,
    #[error("truncated or oversized stream message")]
    MsgSize,
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("not found in cache")]
    NotFound,
    #[error("cached entry expired")]
    Stale,
    #[error("name cannot be encoded in lookup form")]
    IlSeq,
    #[error("iteration limit exceeded")]
    Limit,
    #[error("storage backend: {0}")]
    Backend(#[source] redb::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<ReaderError> for Error {
    fn from(_value: ReaderError) -> Self {
        Self::Proto
    }
}

impl From<WriterError> for Error {
    fn from(_value: WriterError) -> Self {
        Self::MsgSize
    }
}

impl From<NameError> for Error {
    fn from(_value: NameError) -> Self {
        Self::IlSeq
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(value: redb::DatabaseError) -> Self {
        Self::Backend(value.into())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(value: redb::TransactionError) -> Self {
        Self::Backend(value.into())
    }
}

impl From<redb::TableError> for Error {
    fn from(value: redb::TableError) -> Self {
        Self::Backend(value.into())
    }
}

impl From<redb::StorageError> for Error {
    fn from(value: redb::StorageError) -> Self {
        Self::Backend(value.into())
    }
}

impl From<redb::CommitError> for Error {
    fn from(value: redb::CommitError) -> Self {
        Self::Backend(value.into())
    }
}
