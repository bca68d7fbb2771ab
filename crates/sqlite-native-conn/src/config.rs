//! Configuration for native SQLite connections

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::function::CustomFunction;
use crate::{Error, Result};

/// Path that designates a private in-memory database.
pub const MEMORY_DB_PATH: &str = ":memory:";

/// Upper bound for [`Configuration::max_sql_cache_size`].
pub const MAX_SQL_CACHE_SIZE: usize = 100;

/// Flags that control how the database file is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenFlags {
   /// Open the database read-only. Pragmas that would write are skipped.
   pub read_only: bool,

   /// Create the database file if it does not exist.
   pub create_if_necessary: bool,

   /// Skip registration of the `LOCALIZED` and `UNICODE` collations and the
   /// locale bookkeeping that goes with them.
   pub no_localized_collators: bool,
}

impl OpenFlags {
   /// Read-write access, creating the file when missing.
   pub fn read_write_create() -> Self {
      Self {
         create_if_necessary: true,
         ..Default::default()
      }
   }
}

/// Engine defaults applied through pragmas when a connection is opened.
///
/// # Examples
///
/// ```
/// use sqlite_native_conn::PragmaDefaults;
///
/// let defaults = PragmaDefaults {
///    page_size: 4096,
///    ..Default::default()
/// };
/// assert_eq!(defaults.journal_mode, "delete");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PragmaDefaults {
   /// Page size used when creating a database.
   ///
   /// Default: 1024
   pub page_size: i64,

   /// Journal size limit in bytes.
   ///
   /// Default: 10000
   pub journal_size_limit: i64,

   /// WAL auto-checkpoint interval in pages. Values below 1 are treated as 1.
   ///
   /// Default: 1000
   pub wal_auto_checkpoint: i64,

   /// Journal mode used when write-ahead logging is disabled.
   ///
   /// Default: `delete`
   pub journal_mode: String,

   /// Synchronous mode used when write-ahead logging is disabled.
   ///
   /// Default: `normal`
   pub sync_mode: String,

   /// Synchronous mode used in write-ahead logging mode.
   ///
   /// Default: `normal`
   pub wal_sync_mode: String,
}

impl PragmaDefaults {
   pub(crate) fn effective_wal_auto_checkpoint(&self) -> i64 {
      self.wal_auto_checkpoint.max(1)
   }
}

impl Default for PragmaDefaults {
   fn default() -> Self {
      Self {
         page_size: 1024,
         journal_size_limit: 10000,
         wal_auto_checkpoint: 1000,
         journal_mode: "delete".to_string(),
         sync_mode: "normal".to_string(),
         wal_sync_mode: "normal".to_string(),
      }
   }
}

/// Snapshot of every setting that affects a connection.
///
/// The pool builds one of these and hands it to
/// [`Connection::open`](crate::Connection::open). The connection keeps its own
/// copy, so the pool may keep mutating its configuration while the connection
/// is in use; changes only reach the connection through
/// [`Connection::reconfigure`](crate::Connection::reconfigure).
///
/// # Examples
///
/// ```
/// use sqlite_native_conn::Configuration;
///
/// let config = Configuration::new("app.db")
///    .with_wal(true)
///    .with_foreign_keys(true);
///
/// assert_eq!(config.label, "app.db");
/// assert_eq!(config.max_sql_cache_size, 25);
/// ```
#[derive(Debug, Clone)]
pub struct Configuration {
   /// Database path, or [`MEMORY_DB_PATH`]
   pub path: PathBuf,

   /// Name used in diagnostics. Defaults to the path.
   pub label: String,

   /// How the database file is opened
   pub open_flags: OpenFlags,

   /// Scalar functions registered on every connection, in order
   pub custom_functions: Vec<CustomFunction>,

   /// Locale identifier used for the `LOCALIZED` collation (e.g. `en_US`)
   ///
   /// Default: `en_US`
   pub locale: String,

   /// Capacity of the prepared statement cache, between 1 and
   /// [`MAX_SQL_CACHE_SIZE`].
   ///
   /// Default: 25
   pub max_sql_cache_size: usize,

   /// Enable write-ahead logging
   pub wal_enabled: bool,

   /// Enforce foreign key constraints
   pub foreign_key_constraints_enabled: bool,

   /// Values for page size, journal and sync pragmas
   pub pragma_defaults: PragmaDefaults,

   /// Operations that take at least this long are logged with their details.
   /// `None` disables slow operation logging.
   pub slow_query_threshold: Option<Duration>,

   /// Emit every executed statement and its timing through `tracing`.
   pub trace_statements: bool,
}

impl Configuration {
   /// Creates a configuration for the database at `path` with default settings.
   pub fn new(path: impl Into<PathBuf>) -> Self {
      let path = path.into();
      Self {
         label: path.to_string_lossy().into_owned(),
         path,
         ..Default::default()
      }
   }

   /// Creates a configuration for a private in-memory database.
   pub fn in_memory() -> Self {
      Self::new(MEMORY_DB_PATH)
   }

   pub fn with_label(mut self, label: impl Into<String>) -> Self {
      self.label = label.into();
      self
   }

   pub fn with_open_flags(mut self, open_flags: OpenFlags) -> Self {
      self.open_flags = open_flags;
      self
   }

   pub fn with_wal(mut self, enabled: bool) -> Self {
      self.wal_enabled = enabled;
      self
   }

   pub fn with_foreign_keys(mut self, enabled: bool) -> Self {
      self.foreign_key_constraints_enabled = enabled;
      self
   }

   pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
      self.locale = locale.into();
      self
   }

   pub fn with_max_sql_cache_size(mut self, size: usize) -> Self {
      self.max_sql_cache_size = size;
      self
   }

   pub fn with_function(mut self, function: CustomFunction) -> Self {
      self.custom_functions.push(function);
      self
   }

   pub fn with_slow_query_threshold(mut self, threshold: Duration) -> Self {
      self.slow_query_threshold = Some(threshold);
      self
   }

   /// True when the path designates an in-memory database.
   pub fn is_in_memory_db(&self) -> bool {
      self.path.as_os_str() == MEMORY_DB_PATH
   }

   pub(crate) fn validate(&self) -> Result<()> {
      if self.max_sql_cache_size == 0 || self.max_sql_cache_size > MAX_SQL_CACHE_SIZE {
         return Err(Error::InvalidConfiguration(format!(
            "max_sql_cache_size must be between 1 and {MAX_SQL_CACHE_SIZE}, got {}",
            self.max_sql_cache_size
         )));
      }
      if self.locale.trim().is_empty() {
         return Err(Error::InvalidConfiguration(
            "locale must not be empty".to_string(),
         ));
      }
      Ok(())
   }
}

impl Default for Configuration {
   fn default() -> Self {
      Self {
         path: PathBuf::from(MEMORY_DB_PATH),
         label: MEMORY_DB_PATH.to_string(),
         open_flags: OpenFlags::read_write_create(),
         custom_functions: Vec::new(),
         locale: "en_US".to_string(),
         max_sql_cache_size: 25,
         wal_enabled: false,
         foreign_key_constraints_enabled: false,
         pragma_defaults: PragmaDefaults::default(),
         slow_query_threshold: None,
         trace_statements: false,
      }
   }
}
