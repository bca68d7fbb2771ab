//! # sqlite-native-conn
//!
//! A single-owner SQLite connection built directly on the C API, meant to sit
//! underneath a connection pool.
//!
//! ## Core Types
//!
//! - **[`Connection`]**: one native database handle with its statement cache
//! - **[`Configuration`]**: every setting that affects a connection
//! - **[`CancellationToken`]**: aborts a running statement from another thread
//! - **[`RowWindow`]**: bounded window of result rows for cursors
//! - **[`CustomFunction`]**: scalar SQL function backed by a Rust closure
//! - **[`Error`]**: error type for connection operations
//!
//! ## Architecture
//!
//! - **Statement cache**: prepared statements are kept in an LRU keyed by SQL
//!   text and reused across calls; statements that are executing are never
//!   handed out twice, even to reentrant calls
//! - **Idempotent configuration**: pragmas are read before they are written,
//!   so reopening with an unchanged configuration issues no SET statements
//! - **Cooperative cancellation**: a progress handler polls a flag set by the
//!   token, so long-running statements stop promptly
//! - **Operation log**: the 20 most recent operations are kept for `dump()`,
//!   and slow ones are reported through `tracing`
//!
//! ## Example
//!
//! ```
//! use sqlite_native_conn::{BindArg, Configuration, Connection};
//!
//! let mut conn = Connection::open(&Configuration::in_memory())?;
//! conn.execute("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT)", &[], None)?;
//!
//! let id = conn.execute_for_last_inserted_row_id(
//!    "INSERT INTO notes (body) VALUES (?)",
//!    &[BindArg::from("hello")],
//!    None,
//! )?;
//! assert_eq!(id, Some(1));
//!
//! conn.close();
//! # Ok::<(), sqlite_native_conn::Error>(())
//! ```

mod cancellation;
mod close_guard;
mod config;
mod connection;
mod error;
mod function;
mod native;
mod operation_log;
mod statement;
mod statement_cache;
mod stats;
mod value;
mod window;

// Re-export public types
pub use cancellation::{CancellationToken, OnCancel};
pub use config::{Configuration, MAX_SQL_CACHE_SIZE, MEMORY_DB_PATH, OpenFlags, PragmaDefaults};
pub use connection::{BlobStream, Connection, ConnectionOptions, LeakCallback};
pub use error::{Error, Result, SqliteFailure};
pub use function::{CustomFunction, FunctionCall};
pub use native::release_memory;
pub use operation_log::{MAX_RECENT_OPERATIONS, OperationLogHandle};
pub use statement::{StatementInfo, StatementKind};
pub use stats::{ConnectionStats, DbStats};
pub use value::{BindArg, ColumnValue};
pub use window::RowWindow;
