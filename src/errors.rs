//! Error taxonomy for the CDC ingestion engine.
//!
//! Mirrors the propagation policy: anything that could cause message loss
//! (`Protocol`, `Catalog`, `Persistence`) is fatal to the session or retried
//! with backoff and never allows the LSN cursor to advance. `Cast` failures
//! are logged and the raw text is forwarded. `UnknownMessage` is logged and
//! skipped.

use thiserror::Error;

/// Errors raised anywhere in the replication pipeline.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Failure to establish or maintain the replication or catalog connection.
    #[error("connection error: {message}")]
    Connection { message: String },

    /// Invalid or missing configuration.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Malformed frame, tag mismatch, or Begin/Commit LSN disagreement.
    /// Fatal to the session: reconnect, do not ack.
    #[error("protocol error at offset {offset:?}: {message}")]
    Protocol {
        message: String,
        offset: Option<usize>,
    },

    /// `pg_index` lookup failure while resolving a relation's primary key.
    /// Retried with backoff; the relation's changes remain buffered.
    #[error("catalog error: {message}")]
    Catalog { message: String },

    /// The downstream `EventStore` failed to commit a transaction's batch.
    /// Retried; the LSN cursor must not advance until this succeeds.
    #[error("persistence error: {message}")]
    Persistence { message: String },

    /// A column's textual value could not be cast to its semantic type.
    /// Never fatal — callers forward the raw text instead.
    #[error("cast error for postgres type {pg_type}: {message}")]
    Cast { pg_type: String, message: String },

    /// An unrecognized frame tag or logical message type was encountered.
    /// Logged and skipped; does not advance the LSN.
    #[error("unknown message: {0}")]
    UnknownMessage(String),

    /// Underlying network I/O failure.
    #[error("network io error")]
    NetworkIO(#[from] std::io::Error),

    /// A spawned blocking task panicked or was cancelled.
    #[error("task execution error")]
    TaskExecution(#[from] tokio::task::JoinError),

    #[error("string conversion error")]
    StringConversion(#[from] std::string::FromUtf8Error),

    #[error("c string conversion error")]
    CStringConversion(#[from] std::ffi::NulError),
}

pub type ReplicationResult<T> = std::result::Result<T, ReplicationError>;

impl ReplicationError {
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
            offset: None,
        }
    }

    pub fn protocol_at<S: Into<String>>(message: S, offset: usize) -> Self {
        Self::Protocol {
            message: message.into(),
            offset: Some(offset),
        }
    }

    pub fn catalog<S: Into<String>>(message: S) -> Self {
        Self::Catalog {
            message: message.into(),
        }
    }

    pub fn persistence<S: Into<String>>(message: S) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    pub fn cast<T: Into<String>, S: Into<String>>(pg_type: T, message: S) -> Self {
        Self::Cast {
            pg_type: pg_type.into(),
            message: message.into(),
        }
    }

    /// Whether this error must block LSN advancement (the session's commit
    /// cursor may not move past a transaction that hit one of these).
    pub fn blocks_ack(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. } | Self::Catalog { .. } | Self::Persistence { .. }
        )
    }
}
