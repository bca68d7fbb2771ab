//! A single native SQLite connection.
//!
//! ## Architecture
//!
//! A [`Connection`] owns exactly one native database handle together with:
//!
//! - **Statement cache**: an LRU of prepared statements keyed by SQL text
//! - **Operation log**: the 20 most recent operations, for diagnostics
//! - **Cancellation state**: how many tokens are attached to running statements
//!
//! Every execute method follows the same sequence: acquire a statement (from
//! the cache or freshly compiled), bind the arguments, attach the cancellation
//! token, step the statement, then detach and release in reverse order. The
//! release half runs from `Drop` impls, so it also runs when a step fails.
//!
//! ## Reentrancy
//!
//! Execute methods take `&self`. A custom SQL function invoked by a running
//! statement receives the connection through [`FunctionCall::connection`] and
//! may issue further queries on it. The statement that is still executing is
//! never handed out twice: a nested request for the same SQL compiles a
//! private copy that is finalized when the nested call completes.
//!
//! A connection is `Send` but not `Sync`. It is meant to be owned by one pool
//! slot and used by one thread at a time.

mod pragmas;

use std::cell::{Cell, RefCell};
use std::fmt::{self, Write as _};
use std::io::Cursor;
use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::time::Duration;

use libsqlite3_sys as ffi;
use tracing::{debug, warn};

use crate::cancellation::{CancellationToken, OnCancel};
use crate::close_guard::CloseGuard;
use crate::config::Configuration;
use crate::function::{CustomFunction, FunctionCall};
use crate::native::{self, DatabaseHandle, StatementHandle, Step};
use crate::operation_log::{OperationLog, OperationLogHandle};
use crate::statement::{StatementInfo, StatementKind, trim_sql_for_display};
use crate::statement_cache::{Lookup, StatementCache};
use crate::stats::{ConnectionStats, DbStats};
use crate::value::{BindArg, ColumnValue};
use crate::window::RowWindow;
use crate::{Error, Result, SqliteFailure};

/// Attempts made to step a statement while the database stays locked.
const MAX_LOCK_RETRIES: u32 = 50;

/// Pause between attempts to step a locked statement.
const LOCK_RETRY_PAUSE: Duration = Duration::from_millis(1);

/// Readable, seekable copy of a blob returned by
/// [`Connection::execute_for_blob_stream`].
pub type BlobStream = Cursor<Vec<u8>>;

/// Callback notified when a connection is dropped without being closed.
pub type LeakCallback = Arc<dyn Fn() + Send + Sync>;

/// Identity of a connection within its pool.
///
/// # Examples
///
/// ```
/// use sqlite_native_conn::ConnectionOptions;
///
/// let options = ConnectionOptions::default()
///    .with_connection_id(3)
///    .with_primary(false)
///    .with_on_leak(|| eprintln!("connection leaked"));
/// assert_eq!(options.connection_id, 3);
/// ```
#[derive(Clone)]
pub struct ConnectionOptions {
   /// Identifier used in diagnostics
   ///
   /// Default: 0
   pub connection_id: u32,

   /// Whether this is the pool's primary (writable) connection
   ///
   /// Default: true
   pub primary: bool,

   /// Called when the connection is dropped without [`Connection::close`]
   pub on_leak: Option<LeakCallback>,
}

impl ConnectionOptions {
   pub fn with_connection_id(mut self, connection_id: u32) -> Self {
      self.connection_id = connection_id;
      self
   }

   pub fn with_primary(mut self, primary: bool) -> Self {
      self.primary = primary;
      self
   }

   pub fn with_on_leak(mut self, on_leak: impl Fn() + Send + Sync + 'static) -> Self {
      self.on_leak = Some(Arc::new(on_leak));
      self
   }
}

impl Default for ConnectionOptions {
   fn default() -> Self {
      Self {
         connection_id: 0,
         primary: true,
         on_leak: None,
      }
   }
}

impl fmt::Debug for ConnectionOptions {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("ConnectionOptions")
         .field("connection_id", &self.connection_id)
         .field("primary", &self.primary)
         .field("on_leak", &self.on_leak.is_some())
         .finish()
   }
}

/// Address of the connection whose statement is currently stepping.
///
/// Custom functions are registered once, when the connection opens, but the
/// connection may move between operations. The slot is therefore only
/// non-null while one of the connection's own native calls is running.
#[derive(Debug, Default)]
struct ActiveConnection(AtomicPtr<Connection>);

impl ActiveConnection {
   fn current(&self) -> Option<&Connection> {
      let ptr = self.0.load(Ordering::Acquire);
      // SAFETY: the pointer is published by `Connection::enter` from a live
      // `&Connection` and cleared before that borrow ends. Functions only run
      // inside those native calls, on the thread that owns the connection.
      unsafe { ptr.as_ref() }
   }
}

/// Restores the previously active connection when a native call ends.
struct ActiveGuard<'c> {
   slot: &'c ActiveConnection,
   previous: *mut Connection,
}

impl Drop for ActiveGuard<'_> {
   fn drop(&mut self) {
      self.slot.0.store(self.previous, Ordering::Release);
   }
}

/// A statement checked out of the cache for one operation.
struct StatementLease<'c> {
   connection: &'c Connection,
   id: usize,
   handle: ManuallyDrop<StatementHandle>,
   num_parameters: usize,
   read_only: bool,
}

impl StatementLease<'_> {
   fn handle(&self) -> &StatementHandle {
      &self.handle
   }
}

impl Drop for StatementLease<'_> {
   fn drop(&mut self) {
      // SAFETY: the handle is taken exactly once, here.
      let handle = unsafe { ManuallyDrop::take(&mut self.handle) };
      self.connection.cache.borrow_mut().release(self.id, handle);
   }
}

/// Detaches a cancellation token when the operation ends.
struct CancellationScope<'c> {
   connection: &'c Connection,
   token: Option<&'c CancellationToken>,
}

impl Drop for CancellationScope<'_> {
   fn drop(&mut self) {
      if let Some(token) = self.token {
         self.connection.detach_cancellation(token);
      }
   }
}

/// Outcome of filling a row window.
struct WindowFill {
   actual_pos: usize,
   counted_rows: usize,
   filled_rows: usize,
}

/// A native SQLite connection with a prepared statement cache.
///
/// # Examples
///
/// ```
/// use sqlite_native_conn::{BindArg, Configuration, Connection};
///
/// let mut conn = Connection::open(&Configuration::in_memory())?;
/// conn.execute("CREATE TABLE t (a INTEGER)", &[], None)?;
/// conn.execute("INSERT INTO t VALUES (?)", &[BindArg::from(42)], None)?;
///
/// let value = conn.execute_for_long("SELECT a FROM t", &[], None)?;
/// assert_eq!(value, Some(42));
///
/// conn.close();
/// # Ok::<(), sqlite_native_conn::Error>(())
/// ```
pub struct Connection {
   connection_id: u32,
   primary: bool,
   on_leak: Option<LeakCallback>,
   config: Configuration,
   db: Option<DatabaseHandle>,
   cache: RefCell<StatementCache>,
   operations: Arc<OperationLog>,
   only_allow_read_only_operations: Cell<bool>,
   cancellation_depth: Cell<u32>,
   active: Arc<ActiveConnection>,
   stats: Cell<ConnectionStats>,
   close_guard: CloseGuard,
}

impl Connection {
   /// Opens the primary connection to the database described by `config`.
   pub fn open(config: &Configuration) -> Result<Self> {
      Self::open_with(config, ConnectionOptions::default())
   }

   /// Opens a connection and applies every setting in `config`.
   ///
   /// The configuration is copied, so later changes to `config` only reach the
   /// connection through [`reconfigure`](Self::reconfigure). If any step fails,
   /// everything acquired so far is released before the error is returned.
   pub fn open_with(config: &Configuration, options: ConnectionOptions) -> Result<Self> {
      config.validate()?;
      let db = DatabaseHandle::open(&config.path, config.open_flags)?;

      let mut connection = Self {
         connection_id: options.connection_id,
         primary: options.primary,
         on_leak: options.on_leak,
         config: config.clone(),
         db: Some(db),
         cache: RefCell::new(StatementCache::new(config.max_sql_cache_size)),
         operations: Arc::new(OperationLog::new(config.slow_query_threshold)),
         only_allow_read_only_operations: Cell::new(false),
         cancellation_depth: Cell::new(0),
         active: Arc::new(ActiveConnection::default()),
         stats: Cell::new(ConnectionStats::default()),
         close_guard: CloseGuard::armed(config.label.clone()),
      };

      if let Err(err) = connection.configure() {
         connection.dispose(false);
         return Err(err);
      }

      debug!(
         label = %connection.config.label,
         connection_id = connection.connection_id,
         "Opened connection"
      );
      Ok(connection)
   }

   fn configure(&self) -> Result<()> {
      if self.config.trace_statements {
         self.db()?.enable_trace()?;
      }

      self.set_page_size()?;
      self.set_foreign_key_mode()?;
      self.set_journal_size_limit()?;
      self.set_auto_checkpoint_interval()?;
      if !native::has_codec() {
         self.set_wal_mode()?;
         self.set_locale()?;
      }

      for function in &self.config.custom_functions {
         self.register_function(function)?;
      }
      Ok(())
   }

   /// Applies the parts of `config` that differ from the current
   /// configuration, without reopening the database.
   ///
   /// Newly added custom functions are registered; functions that are already
   /// registered are left alone. The foreign key, write-ahead logging and
   /// locale settings are re-applied only when they changed. Also lifts the
   /// read-only restriction set by
   /// [`set_only_allow_read_only_operations`](Self::set_only_allow_read_only_operations).
   pub fn reconfigure(&mut self, config: &Configuration) -> Result<()> {
      config.validate()?;
      self.only_allow_read_only_operations.set(false);

      for function in &config.custom_functions {
         if !self.config.custom_functions.contains(function) {
            self.register_function(function)?;
         }
      }

      let foreign_key_mode_changed =
         config.foreign_key_constraints_enabled != self.config.foreign_key_constraints_enabled;
      let wal_mode_changed = config.wal_enabled != self.config.wal_enabled;
      let locale_changed = config.locale != self.config.locale;

      self.config = config.clone();
      self.operations.set_slow_threshold(config.slow_query_threshold);
      self.cache.get_mut().resize(config.max_sql_cache_size);

      if foreign_key_mode_changed {
         self.set_foreign_key_mode()?;
      }
      if !native::has_codec() {
         if wal_mode_changed {
            self.set_wal_mode()?;
         }
         if locale_changed {
            self.set_locale()?;
         }
      }
      Ok(())
   }

   fn register_function(&self, function: &CustomFunction) -> Result<()> {
      let active = Arc::clone(&self.active);
      let callback = function.clone();
      self.db()?.register_function(
         function.name(),
         function.num_args(),
         Box::new(move |args| {
            let call = FunctionCall::new(args, active.current());
            callback.invoke(&call).map_err(|err| err.to_string())
         }),
      )?;
      self.bump(|stats| stats.functions_registered += 1);
      Ok(())
   }

   /// Closes the connection. Safe to call more than once.
   ///
   /// Every cached statement is finalized before the native handle is
   /// released. Never fails; problems are logged.
   pub fn close(&mut self) {
      self.dispose(false);
   }

   fn dispose(&mut self, finalized: bool) {
      if finalized {
         self.close_guard.warn_if_open();
      }
      self.close_guard.close();

      if let Some(db) = self.db.take() {
         let cookie = self.operations.begin("close", None, &[]);
         self.cache.get_mut().evict_all();
         drop(db);
         self.operations.end(cookie);
         debug!(label = %self.config.label, connection_id = self.connection_id, "Closed connection");
      }
   }

   pub fn is_closed(&self) -> bool {
      self.db.is_none()
   }

   pub fn connection_id(&self) -> u32 {
      self.connection_id
   }

   pub fn is_primary_connection(&self) -> bool {
      self.primary
   }

   pub fn label(&self) -> &str {
      &self.config.label
   }

   /// The configuration this connection currently applies.
   pub fn configuration(&self) -> &Configuration {
      &self.config
   }

   /// When set, statements that might modify the database fail with
   /// [`Error::ReadOnlyViolation`] before any argument is bound.
   pub fn set_only_allow_read_only_operations(&self, read_only: bool) {
      self.only_allow_read_only_operations.set(read_only);
   }

   /// True when a statement for exactly this SQL text is cached. Does not
   /// affect the cache's LRU order.
   pub fn is_prepared_statement_cached(&self, sql: &str) -> bool {
      self.cache.borrow().contains(sql)
   }

   fn db(&self) -> Result<&DatabaseHandle> {
      self.db.as_ref().ok_or(Error::ConnectionClosed)
   }

   fn bump(&self, update: impl FnOnce(&mut ConnectionStats)) {
      let mut stats = self.stats.get();
      update(&mut stats);
      self.stats.set(stats);
   }

   /// Counters describing the native work done by this connection.
   pub fn stats(&self) -> ConnectionStats {
      let cache = self.cache.borrow();
      ConnectionStats {
         statements_finalized: cache.finalized(),
         cache_hits: cache.hits(),
         cache_misses: cache.misses(),
         cache_size: cache.len(),
         ..self.stats.get()
      }
   }

   // ---------------------------------------------------------------------
   // Statement lifecycle
   // ---------------------------------------------------------------------

   fn acquire(&self, sql: &str) -> Result<StatementLease<'_>> {
      let db = self.db()?;

      let lookup = self.cache.borrow_mut().lookup(sql);
      let skip_cache = match lookup {
         Lookup::Available(id, handle) => return Ok(self.lease(id, handle)),
         // The cached statement is executing further up the stack.
         Lookup::Busy => true,
         Lookup::Missing => false,
      };

      let handle = db.prepare(sql)?;
      self.bump(|stats| stats.statements_prepared += 1);
      let id = self
         .cache
         .borrow_mut()
         .install(sql, &handle, StatementKind::of(sql), skip_cache);
      Ok(self.lease(id, handle))
   }

   fn lease(&self, id: usize, handle: StatementHandle) -> StatementLease<'_> {
      let cache = self.cache.borrow();
      let record = cache.record(id);
      StatementLease {
         connection: self,
         id,
         num_parameters: record.num_parameters,
         read_only: record.read_only,
         handle: ManuallyDrop::new(handle),
      }
   }

   fn check_statement_allowed(&self, lease: &StatementLease<'_>) -> Result<()> {
      if self.only_allow_read_only_operations.get() && !lease.read_only {
         return Err(Error::ReadOnlyViolation);
      }
      Ok(())
   }

   fn bind_arguments(&self, lease: &StatementLease<'_>, args: &[BindArg]) -> Result<()> {
      if args.len() != lease.num_parameters {
         return Err(Error::BindArity {
            expected: lease.num_parameters,
            actual: args.len(),
         });
      }

      let handle = lease.handle();
      for (i, arg) in args.iter().enumerate() {
         let index = i + 1;
         match arg {
            BindArg::Null => handle.bind_null(index)?,
            BindArg::Integer(value) => handle.bind_int64(index, *value)?,
            BindArg::Float(value) => handle.bind_double(index, *value)?,
            BindArg::Blob(value) => handle.bind_blob(index, value)?,
            BindArg::Bool(value) => handle.bind_int64(index, i64::from(*value))?,
            BindArg::Text(value) => handle.bind_text(index, value)?,
         }
         self.bump(|stats| stats.bind_calls += 1);
      }
      Ok(())
   }

   // ---------------------------------------------------------------------
   // Cancellation
   // ---------------------------------------------------------------------

   fn attach_cancellation<'c>(
      &'c self,
      token: Option<&'c CancellationToken>,
   ) -> Result<CancellationScope<'c>> {
      let Some(token) = token else {
         return Ok(CancellationScope {
            connection: self,
            token: None,
         });
      };
      token.check_cancelled()?;
      let db = self.db()?;

      let depth = self.cancellation_depth.get() + 1;
      self.cancellation_depth.set(depth);
      if depth == 1 {
         // Reset first: the listener fires immediately if the token is
         // cancelled between the check above and this point.
         db.reset_cancel(true);
         let canceller: Arc<dyn OnCancel> = db.canceller();
         token.set_listener(Some(canceller));
         self.bump(|stats| stats.cancellation_armed += 1);
      }

      Ok(CancellationScope {
         connection: self,
         token: Some(token),
      })
   }

   fn detach_cancellation(&self, token: &CancellationToken) {
      let depth = self.cancellation_depth.get().saturating_sub(1);
      self.cancellation_depth.set(depth);
      if depth == 0 {
         token.set_listener(None);
         if let Some(db) = &self.db {
            db.reset_cancel(false);
         }
         self.bump(|stats| stats.cancellation_disarmed += 1);
      }
   }

   /// Publishes this connection to custom functions for the duration of a
   /// native call.
   fn enter(&self) -> ActiveGuard<'_> {
      let current = ptr::from_ref(self).cast_mut();
      let previous = self.active.0.swap(current, Ordering::AcqRel);
      ActiveGuard {
         slot: &self.active,
         previous,
      }
   }

   // ---------------------------------------------------------------------
   // Execute family
   // ---------------------------------------------------------------------

   /// Records `body` as one operation in the log, logging it with the detail
   /// computed from its result when it was slow.
   fn operation<T>(
      &self,
      kind: &'static str,
      sql: &str,
      args: &[BindArg],
      body: impl FnOnce() -> Result<T>,
      detail: impl FnOnce(&T) -> Option<String>,
   ) -> Result<T> {
      if sql.trim().is_empty() {
         return Err(Error::InvalidArgument(
            "sql must not be null or empty".to_string(),
         ));
      }

      let cookie = self.operations.begin(kind, Some(sql), args);
      let result = body();
      if let Err(err) = &result {
         self.operations.fail(cookie, err);
      }
      if self.operations.end_defer_log(cookie) {
         let detail = result.as_ref().ok().and_then(detail);
         self.operations.log(cookie, detail.as_deref());
      }
      result
   }

   fn run_statement<T>(
      &self,
      kind: &'static str,
      sql: &str,
      args: &[BindArg],
      token: Option<&CancellationToken>,
      step: impl FnOnce(&StatementHandle) -> Result<T>,
      detail: impl FnOnce(&T) -> Option<String>,
   ) -> Result<T> {
      self.operation(
         kind,
         sql,
         args,
         || {
            let lease = self.acquire(sql)?;
            self.check_statement_allowed(&lease)?;
            self.bind_arguments(&lease, args)?;
            let _scope = self.attach_cancellation(token)?;
            let _active = self.enter();
            self.bump(|stats| stats.native_executions += 1);
            step(lease.handle())
         },
         detail,
      )
   }

   /// Compiles `sql` and describes it without binding or executing anything.
   ///
   /// The compiled statement is cached like any other, so preparing a query
   /// ahead of time makes its first execution cheaper.
   pub fn prepare(&self, sql: &str) -> Result<StatementInfo> {
      self.operation(
         "prepare",
         sql,
         &[],
         || {
            let lease = self.acquire(sql)?;
            let handle = lease.handle();
            Ok(StatementInfo {
               num_parameters: lease.num_parameters,
               read_only: lease.read_only,
               column_names: (0..handle.column_count())
                  .map(|i| handle.column_name(i))
                  .collect(),
            })
         },
         |_| None,
      )
   }

   /// Executes a statement that returns no rows.
   ///
   /// Fails if the statement produces a row; use one of the query methods for
   /// those.
   pub fn execute(
      &self,
      sql: &str,
      args: &[BindArg],
      token: Option<&CancellationToken>,
   ) -> Result<()> {
      self.run_statement("execute", sql, args, token, step_to_completion, |_| None)
   }

   /// Executes a statement and returns the first column of the first row as an
   /// integer, or `None` when there is no row.
   pub fn execute_for_long(
      &self,
      sql: &str,
      args: &[BindArg],
      token: Option<&CancellationToken>,
   ) -> Result<Option<i64>> {
      self.run_statement(
         "executeForLong",
         sql,
         args,
         token,
         |handle| {
            Ok(match handle.step()? {
               Step::Row if handle.column_count() >= 1 => Some(handle.column_int64(0)),
               _ => None,
            })
         },
         |_| None,
      )
   }

   /// Executes a statement and returns the first column of the first row as
   /// text, or `None` when there is no row or the value is `NULL`.
   pub fn execute_for_string(
      &self,
      sql: &str,
      args: &[BindArg],
      token: Option<&CancellationToken>,
   ) -> Result<Option<String>> {
      self.run_statement(
         "executeForString",
         sql,
         args,
         token,
         |handle| {
            Ok(match handle.step()? {
               Step::Row if handle.column_count() >= 1 => handle.column_text(0),
               _ => None,
            })
         },
         |_| None,
      )
   }

   /// Executes a statement and returns the first column of the first row as a
   /// readable stream of bytes, or `None` when there is no row or the value is
   /// `NULL`.
   pub fn execute_for_blob_stream(
      &self,
      sql: &str,
      args: &[BindArg],
      token: Option<&CancellationToken>,
   ) -> Result<Option<BlobStream>> {
      self.run_statement(
         "executeForBlobStream",
         sql,
         args,
         token,
         |handle| {
            Ok(match handle.step()? {
               Step::Row if handle.column_count() >= 1 => handle.column_blob(0).map(Cursor::new),
               _ => None,
            })
         },
         |_| None,
      )
   }

   /// Executes a statement and returns the number of rows it changed.
   pub fn execute_for_changed_row_count(
      &self,
      sql: &str,
      args: &[BindArg],
      token: Option<&CancellationToken>,
   ) -> Result<usize> {
      self.run_statement(
         "executeForChangedRowCount",
         sql,
         args,
         token,
         |handle| {
            step_to_completion(handle)?;
            Ok(usize::try_from(self.db()?.changes()).unwrap_or(0))
         },
         |changed| Some(format!("changedRows={changed}")),
      )
   }

   /// Executes a statement and returns the row id of the inserted row, or
   /// `None` when no row was changed.
   pub fn execute_for_last_inserted_row_id(
      &self,
      sql: &str,
      args: &[BindArg],
      token: Option<&CancellationToken>,
   ) -> Result<Option<i64>> {
      self.run_statement(
         "executeForLastInsertedRowId",
         sql,
         args,
         token,
         |handle| {
            step_to_completion(handle)?;
            let db = self.db()?;
            Ok((db.changes() > 0).then(|| db.last_insert_rowid()))
         },
         |_| None,
      )
   }

   /// Executes a query and copies part of its result into `window`.
   ///
   /// Rows before `start_pos` are skipped. If the window fills up before the
   /// row at `required_pos` has been copied, it is cleared and filling resumes
   /// from the current row, so the required row always ends up in the window.
   /// With `count_all_rows` the remaining rows are stepped and counted after
   /// the window is full.
   ///
   /// Returns the number of rows counted. The window's
   /// [`start_position`](RowWindow::start_position) is set to the position of
   /// its first row.
   #[allow(clippy::too_many_arguments)]
   pub fn execute_for_row_window(
      &self,
      sql: &str,
      args: &[BindArg],
      window: &mut RowWindow,
      start_pos: usize,
      required_pos: usize,
      count_all_rows: bool,
      token: Option<&CancellationToken>,
   ) -> Result<usize> {
      let window_name = window.name().to_string();
      let fill = self.run_statement(
         "executeForRowWindow",
         sql,
         args,
         token,
         |handle| fill_window(handle, window, start_pos, required_pos, count_all_rows),
         |fill| {
            Some(format!(
               "window='{window_name}', startPos={start_pos}, actualPos={}, filledRows={}, countedRows={}",
               fill.actual_pos, fill.filled_rows, fill.counted_rows
            ))
         },
      )?;
      Ok(fill.counted_rows)
   }

   // ---------------------------------------------------------------------
   // Diagnostics
   // ---------------------------------------------------------------------

   /// Describes the operation currently running on this connection, if any.
   pub fn describe_current_operation(&self) -> Option<String> {
      self.operations.describe_current()
   }

   /// Handle to the operation log for threads that do not own the connection.
   /// It stays valid after the connection is closed.
   pub fn operation_log(&self) -> OperationLogHandle {
      OperationLogHandle::new(Arc::clone(&self.operations))
   }

   /// Human-readable state of the connection: identity, recent operations
   /// and, when `verbose`, the native handle and every cached statement.
   pub fn dump(&self, verbose: bool) -> String {
      let mut out = String::new();
      let _ = writeln!(out, "Connection #{}:", self.connection_id);
      if verbose {
         let ptr = self.db.as_ref().map_or(0, |db| db.as_ptr() as usize);
         let _ = writeln!(out, "  connectionPtr: 0x{ptr:x}");
      }
      let _ = writeln!(out, "  isPrimaryConnection: {}", self.primary);
      let _ = writeln!(
         out,
         "  onlyAllowReadOnlyOperations: {}",
         self.only_allow_read_only_operations.get()
      );

      self.operations.dump(&mut out, verbose);

      if verbose {
         out.push_str("  Prepared statement cache:\n");
         let cache = self.cache.borrow();
         if cache.len() == 0 {
            out.push_str("    <none>\n");
         }
         for (i, record) in cache.entries().enumerate() {
            let _ = writeln!(
               out,
               "    {i}: statementPtr=0x{:x}, numParameters={}, type={}, readOnly={}, sql=\"{}\"",
               record.statement_ptr,
               record.num_parameters,
               record.kind,
               record.read_only,
               trim_sql_for_display(&record.sql)
            );
         }
      }
      out
   }

   /// Size and cache statistics for the main database followed by every
   /// attached database. Values that cannot be read are reported as zero.
   pub fn collect_db_stats(&self) -> Vec<DbStats> {
      let mut stats = vec![self.main_db_stats()];

      let mut window = RowWindow::new("collectDbStats", 100);
      if let Err(err) =
         self.execute_for_row_window("PRAGMA database_list;", &[], &mut window, 0, 0, false, None)
      {
         debug!(error = %err, "Could not list attached databases");
         return stats;
      }

      for row in window.rows().skip(1) {
         let name = row.get(1).and_then(ColumnValue::as_text).unwrap_or_default();
         let path = row.get(2).and_then(ColumnValue::as_text).unwrap_or_default();

         let page_count = self.pragma_value(&format!("PRAGMA {name}.page_count;"));
         let page_size = self.pragma_value(&format!("PRAGMA {name}.page_size;"));

         let mut label = format!("  (attached) {name}");
         if !path.is_empty() {
            label.push_str(": ");
            label.push_str(path);
         }
         stats.push(DbStats {
            label,
            page_count,
            page_size,
            lookaside: 0,
            cache_hits: 0,
            cache_misses: 0,
            cache_size: 0,
         });
      }
      stats
   }

   fn main_db_stats(&self) -> DbStats {
      let page_count = self.pragma_value("PRAGMA page_count;");
      let page_size = self.pragma_value("PRAGMA page_size;");

      let mut label = self.config.path.display().to_string();
      if !self.primary {
         let _ = write!(label, " ({})", self.connection_id);
      }

      let cache = self.cache.borrow();
      DbStats {
         label,
         page_count,
         page_size,
         lookaside: self.db.as_ref().map_or(0, DatabaseHandle::lookaside_used),
         cache_hits: cache.hits(),
         cache_misses: cache.misses(),
         cache_size: cache.len(),
      }
   }

   fn pragma_value(&self, sql: &str) -> i64 {
      match self.execute_for_long(sql, &[], None) {
         Ok(value) => value.unwrap_or(0),
         Err(err) => {
            debug!(sql, error = %err, "Could not read database statistics");
            0
         }
      }
   }
}

/// Steps a statement that must not return rows.
fn step_to_completion(handle: &StatementHandle) -> Result<()> {
   match handle.step()? {
      Step::Done => Ok(()),
      Step::Row => Err(Error::InvalidArgument(
         "Queries can be performed using query methods only.".to_string(),
      )),
   }
}

fn read_row(handle: &StatementHandle, num_columns: usize) -> Vec<ColumnValue> {
   (0..num_columns).map(|i| handle.column_value(i)).collect()
}

fn fill_window(
   handle: &StatementHandle,
   window: &mut RowWindow,
   start_pos: usize,
   required_pos: usize,
   count_all_rows: bool,
) -> Result<WindowFill> {
   let num_columns = handle.column_count();
   window.reset(num_columns);

   let mut start_pos = start_pos;
   let mut retries = 0;
   let mut total_rows = 0;
   let mut added_rows = 0;
   let mut window_full = false;

   while !window_full || count_all_rows {
      match handle.step() {
         Ok(Step::Row) => {
            retries = 0;
            total_rows += 1;
            if start_pos >= total_rows || window_full {
               continue;
            }

            let copied = match window.try_push_row(read_row(handle, num_columns)) {
               Ok(()) => true,
               Err(row) if added_rows > 0 && start_pos + added_rows <= required_pos => {
                  // Full before reaching the required row: start over from here.
                  window.reset(num_columns);
                  start_pos += added_rows;
                  added_rows = 0;
                  window.try_push_row(row).is_ok()
               }
               Err(_) => false,
            };

            if copied {
               added_rows += 1;
            } else {
               window_full = true;
            }
         }
         Ok(Step::Done) => break,
         Err(err) if err.is_locked() => {
            if retries > MAX_LOCK_RETRIES {
               return Err(err);
            }
            retries += 1;
            std::thread::sleep(LOCK_RETRY_PAUSE);
         }
         Err(err) => return Err(err),
      }
   }

   handle.reset();

   if start_pos > total_rows {
      warn!(start_pos, total_rows, "Window start position is past the last row");
   }
   if total_rows > start_pos && added_rows == 0 {
      return Err(Error::Sqlite(SqliteFailure::new(
         ffi::SQLITE_TOOBIG,
         ffi::SQLITE_TOOBIG,
         "Row too big to fit into the window",
      )));
   }

   window.set_start_position(start_pos);
   Ok(WindowFill {
      actual_pos: start_pos,
      counted_rows: total_rows,
      filled_rows: window.num_rows(),
   })
}

impl Drop for Connection {
   fn drop(&mut self) {
      if self.db.is_some() {
         if let Some(on_leak) = &self.on_leak {
            on_leak();
         }
         self.dispose(true);
      }
   }
}

impl fmt::Debug for Connection {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Connection")
         .field("connection_id", &self.connection_id)
         .field("label", &self.config.label)
         .field("primary", &self.primary)
         .field("closed", &self.db.is_none())
         .finish_non_exhaustive()
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn open_memory() -> Connection {
      Connection::open(&Configuration::in_memory()).unwrap()
   }

   #[test]
   fn test_attach_arms_once_per_outermost_token() {
      let conn = open_memory();
      let token = CancellationToken::new();

      {
         let _a = conn.attach_cancellation(Some(&token)).unwrap();
         let _b = conn.attach_cancellation(Some(&token)).unwrap();
         let _c = conn.attach_cancellation(Some(&token)).unwrap();
         assert_eq!(conn.cancellation_depth.get(), 3);
      }

      let stats = conn.stats();
      assert_eq!(conn.cancellation_depth.get(), 0);
      assert_eq!(stats.cancellation_armed, 1);
      assert_eq!(stats.cancellation_disarmed, 1);
   }

   #[test]
   fn test_attach_cancelled_token_fails_without_arming() {
      let conn = open_memory();
      let token = CancellationToken::new();
      token.cancel();

      assert!(matches!(
         conn.attach_cancellation(Some(&token)),
         Err(Error::Cancelled)
      ));
      assert_eq!(conn.cancellation_depth.get(), 0);
      assert_eq!(conn.stats().cancellation_armed, 0);
   }

   #[test]
   fn test_active_slot_is_cleared_after_call() {
      let conn = open_memory();
      assert!(conn.active.current().is_none());
      {
         let _outer = conn.enter();
         assert!(conn.active.current().is_some());
         {
            let _inner = conn.enter();
         }
         assert!(conn.active.current().is_some());
      }
      assert!(conn.active.current().is_none());
   }

   #[test]
   fn test_fill_window_restarts_before_required_row() {
      let conn = open_memory();
      let mut window = RowWindow::new("w", 3);
      let sql = "WITH RECURSIVE c(x) AS (SELECT 0 UNION ALL SELECT x + 1 FROM c WHERE x < 9) SELECT x FROM c";

      let counted = conn
         .execute_for_row_window(sql, &[], &mut window, 0, 7, true, None)
         .unwrap();
      assert_eq!(counted, 10);
      assert_eq!(window.start_position(), 6);
      assert_eq!(window.num_rows(), 3);
      assert_eq!(window.get(0, 0), Some(&ColumnValue::Integer(6)));
      assert!(window.contains_position(7));
   }

   #[test]
   fn test_fill_window_without_counting_stops_when_full() {
      let conn = open_memory();
      let mut window = RowWindow::new("w", 2);
      let sql = "WITH RECURSIVE c(x) AS (SELECT 0 UNION ALL SELECT x + 1 FROM c WHERE x < 9) SELECT x FROM c";

      let counted = conn
         .execute_for_row_window(sql, &[], &mut window, 4, 4, false, None)
         .unwrap();
      assert_eq!(window.start_position(), 4);
      assert_eq!(window.num_rows(), 2);
      assert_eq!(window.get(1, 0), Some(&ColumnValue::Integer(5)));
      // The row that did not fit was stepped before the loop stopped.
      assert_eq!(counted, 7);
   }

   #[test]
   fn test_row_too_big_for_window() {
      let conn = open_memory();
      let mut window = RowWindow::new("w", 10).with_byte_budget(4);
      let err = conn
         .execute_for_row_window("SELECT 'too large'", &[], &mut window, 0, 0, false, None)
         .unwrap_err();
      assert_eq!(err.error_code(), "SQLITE_TOOBIG");
   }
}
