use thiserror::Error;

use crate::wire::CompressionMethod;

/// Postgres SQLSTATE codes that signal transient lock contention.
const CONTENTION_CODES: [&str; 3] = ["40001", "40P01", "55P03"];

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lock contention ({code}): {message}")]
    LockContention { code: String, message: String },
    #[error("store command failed ({code}): {message}")]
    Store { code: String, message: String },
    #[error("no database shard {shard} (configured: {shards})")]
    UnknownShard { shard: usize, shards: usize },
    #[error("malformed {kind} namespace key: {key:?}")]
    MalformedKey { kind: &'static str, key: String },
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("invalid wire envelope: {0}")]
    InvalidEnvelope(&'static str),
    #[error("unsupported compression method: {0}")]
    UnsupportedCompression(CompressionMethod),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("decompressed payload exceeds {ceiling} bytes")]
    DecompressionLimit { ceiling: usize },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors a writer may retry immediately: lock conflicts,
    /// serialization failures and deadlock victims.
    pub fn is_lock_contention(&self) -> bool {
        match self {
            Error::LockContention { .. } => true,
            Error::Db(sqlx::Error::Database(db)) => db
                .code()
                .is_some_and(|code| CONTENTION_CODES.contains(&&*code)),
            Error::Context { source, .. } => source.is_lock_contention(),
            _ => false,
        }
    }

    /// Store-level error code, when the failing backend reported one.
    pub fn code(&self) -> Option<String> {
        match self {
            Error::LockContention { code, .. } | Error::Store { code, .. } => Some(code.clone()),
            Error::Db(sqlx::Error::Database(db)) => db.code().map(|c| c.into_owned()),
            Error::Context { source, .. } => source.code(),
            _ => None,
        }
    }
}

pub trait WithContext<T> {
    fn context(self, msg: impl Into<String>) -> Result<T>;
}

impl<T> WithContext<T> for Result<T> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Context {
            context: msg.into(),
            source: Box::new(e),
        })
    }
}
