//! SQL plumbing for materialized reports: a typed value model and its
//! Postgres literal codec, the query template engine, a driver seam, and a
//! `Connection` which scopes work into reference-counted transactions.
pub mod codec;
pub mod connection;
pub mod driver;
pub mod query;
pub mod template;
pub mod value;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use codec::{encode, Codec};
pub use connection::{ConnectParams, Connection};
pub use driver::{Column, CommandTag, Driver, DriverError, DriverErrorKind, Escape, Outcome, PgDriver};
pub use query::{QueryResult, Row};
pub use template::{Limit, RunOptions};
pub use value::{Arguments, Sql, Value};

/// Error is the error type of all operations in this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed template: {0}")]
    Template(String),
    #[error("{value} has no SQL literal encoding: {reason}")]
    Escape { value: String, reason: &'static str },
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("{0}")]
    State(String),
    #[error("{0}")]
    Integrity(String),
    #[error("cannot decode {text:?} as {type_name}")]
    Decode { text: String, type_name: String },
    #[error("failed to encode or decode JSON")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Stable name of this error's kind, as recorded in a report run's error.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Template(_) => "TemplateError",
            Error::Escape { .. } => "EscapeError",
            Error::Driver(_) => "DriverError",
            Error::State(_) => "StateError",
            Error::Integrity(_) => "IntegrityError",
            Error::Decode { .. } => "DecodeError",
            Error::Json(_) => "JsonError",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
