//! Error types for sqlite-native-conn

use std::fmt;

use thiserror::Error;

/// A failure reported by the SQLite engine.
///
/// Carries both the primary result code and the extended result code so callers
/// can distinguish, for example, a foreign key violation from a unique constraint
/// violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteFailure {
   /// Primary result code (`SQLITE_BUSY`, `SQLITE_CONSTRAINT`, ...)
   pub code: i32,
   /// Extended result code as returned by `sqlite3_extended_errcode`
   pub extended_code: i32,
   /// Message from `sqlite3_errmsg`, or the generic text for the code
   pub message: String,
}

impl SqliteFailure {
   pub fn new(code: i32, extended_code: i32, message: impl Into<String>) -> Self {
      Self {
         code,
         extended_code,
         message: message.into(),
      }
   }

   /// Symbolic name of the primary result code, without the `SQLITE_` prefix.
   pub fn code_name(&self) -> &'static str {
      use libsqlite3_sys as ffi;

      match self.code & 0xff {
         ffi::SQLITE_ERROR => "ERROR",
         ffi::SQLITE_INTERNAL => "INTERNAL",
         ffi::SQLITE_PERM => "PERM",
         ffi::SQLITE_ABORT => "ABORT",
         ffi::SQLITE_BUSY => "BUSY",
         ffi::SQLITE_LOCKED => "LOCKED",
         ffi::SQLITE_NOMEM => "NOMEM",
         ffi::SQLITE_READONLY => "READONLY",
         ffi::SQLITE_INTERRUPT => "INTERRUPT",
         ffi::SQLITE_IOERR => "IOERR",
         ffi::SQLITE_CORRUPT => "CORRUPT",
         ffi::SQLITE_NOTFOUND => "NOTFOUND",
         ffi::SQLITE_FULL => "FULL",
         ffi::SQLITE_CANTOPEN => "CANTOPEN",
         ffi::SQLITE_PROTOCOL => "PROTOCOL",
         ffi::SQLITE_SCHEMA => "SCHEMA",
         ffi::SQLITE_TOOBIG => "TOOBIG",
         ffi::SQLITE_CONSTRAINT => "CONSTRAINT",
         ffi::SQLITE_MISMATCH => "MISMATCH",
         ffi::SQLITE_MISUSE => "MISUSE",
         ffi::SQLITE_RANGE => "RANGE",
         ffi::SQLITE_NOTADB => "NOTADB",
         _ => "UNKNOWN",
      }
   }

   /// True when the database was busy or a table was locked.
   pub fn is_locked(&self) -> bool {
      matches!(
         self.code & 0xff,
         libsqlite3_sys::SQLITE_BUSY | libsqlite3_sys::SQLITE_LOCKED
      )
   }
}

impl fmt::Display for SqliteFailure {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(
         f,
         "{} (code {} SQLITE_{})",
         self.message,
         self.extended_code,
         self.code_name()
      )
   }
}

impl std::error::Error for SqliteFailure {}

/// Errors that may occur when working with a native SQLite connection
#[derive(Error, Debug)]
pub enum Error {
   /// A caller supplied an argument that can never be valid, such as blank SQL
   /// text or SQL containing an interior NUL byte.
   #[error("invalid argument: {0}")]
   InvalidArgument(String),

   /// The configuration handed to `open` cannot be applied.
   #[error("invalid configuration: {0}")]
   InvalidConfiguration(String),

   /// The SQL text could not be compiled into a prepared statement.
   #[error("{failure}, while compiling: {sql}")]
   Compile { failure: SqliteFailure, sql: String },

   /// The number of bound arguments does not match the statement's parameters.
   #[error("Expected {expected} bind arguments but {actual} were provided.")]
   BindArity { expected: usize, actual: usize },

   /// A statement that might write was executed while the connection only
   /// allows read-only operations.
   #[error(
      "Cannot execute this statement because it might modify the database but the connection is read-only."
   )]
   ReadOnlyViolation,

   /// The operation was cancelled through its cancellation token.
   #[error("the operation was cancelled")]
   Cancelled,

   /// The engine reported an error while executing a statement.
   #[error(transparent)]
   Sqlite(#[from] SqliteFailure),

   /// The connection has already been closed.
   #[error("the connection has been closed")]
   ConnectionClosed,

   /// Registering collators or reindexing for a new locale failed.
   #[error("Failed to change locale for db '{label}' to '{locale}': {source}")]
   Locale {
      label: String,
      locale: String,
      #[source]
      source: Box<Error>,
   },

   /// A custom SQL function reported a failure.
   #[error("custom function failed: {0}")]
   Function(String),
}

impl Error {
   /// Extract a structured error code from the error type.
   ///
   /// This provides machine-readable error codes for error handling.
   pub fn error_code(&self) -> String {
      match self {
         Error::InvalidArgument(_) => "INVALID_ARGUMENT".to_string(),
         Error::InvalidConfiguration(_) => "INVALID_CONFIGURATION".to_string(),
         Error::Compile { failure, .. } => format!("SQLITE_{}", failure.code_name()),
         Error::BindArity { .. } => "BIND_ARITY".to_string(),
         Error::ReadOnlyViolation => "READ_ONLY_VIOLATION".to_string(),
         Error::Cancelled => "CANCELLED".to_string(),
         Error::Sqlite(failure) => format!("SQLITE_{}", failure.code_name()),
         Error::ConnectionClosed => "CONNECTION_CLOSED".to_string(),
         Error::Locale { .. } => "LOCALE_CHANGE_FAILED".to_string(),
         Error::Function(_) => "FUNCTION_ERROR".to_string(),
      }
   }

   /// True when the engine reported `SQLITE_BUSY` or `SQLITE_LOCKED`.
   pub fn is_locked(&self) -> bool {
      matches!(self, Error::Sqlite(failure) if failure.is_locked())
   }
}

/// A type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;
