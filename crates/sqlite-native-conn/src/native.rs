//! Typed wrappers over the SQLite C API.
//!
//! Everything that touches a raw `sqlite3` or `sqlite3_stmt` pointer lives in
//! this module. The rest of the crate works with two owned handle types:
//!
//! - **[`DatabaseHandle`]**: one open database; closed when dropped
//! - **[`StatementHandle`]**: one prepared statement; finalized when dropped
//!
//! Ownership is what guarantees that each native object is released exactly
//! once: a statement handle can only be finalized by consuming (or dropping)
//! it, and the connection is its only owner.

use std::cmp::Ordering;
use std::ffi::{CStr, CString, c_char, c_int, c_uint, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use libsqlite3_sys as ffi;
use tracing::{debug, error, trace, warn};

use crate::cancellation::OnCancel;
use crate::config::OpenFlags;
use crate::statement::trim_sql_for_display;
use crate::value::ColumnValue;
use crate::{Error, Result, SqliteFailure};

/// Soft heap limit for the page cache. Also the amount asked back from
/// [`release_memory`].
const SOFT_HEAP_LIMIT: i64 = 8 * 1024 * 1024;

/// How long a statement waits on a locked database before failing with
/// `SQLITE_BUSY`.
const BUSY_TIMEOUT_MS: c_int = 2500;

/// Number of virtual machine instructions between cancellation checks.
const PROGRESS_CHECK_INTERVAL: c_int = 4;

/// Configures the engine for multi-thread mode, routes its log to `tracing`
/// and sets the soft heap limit. Runs once per process.
pub(crate) fn initialize() {
   static INIT: Once = Once::new();
   INIT.call_once(|| {
      // SAFETY: sqlite3_config must run before sqlite3_initialize; both calls are
      // guarded by the Once. If another component initialized SQLite first the
      // config calls return SQLITE_MISUSE and leave the engine unchanged.
      unsafe {
         let rc = ffi::sqlite3_config(ffi::SQLITE_CONFIG_MULTITHREAD as c_int);
         if rc != ffi::SQLITE_OK {
            debug!(rc, "SQLite already initialized; keeping its threading mode");
         }

         let rc = ffi::sqlite3_config(
            ffi::SQLITE_CONFIG_LOG as c_int,
            log_callback as unsafe extern "C" fn(*mut c_void, c_int, *const c_char),
            ptr::null_mut::<c_void>(),
         );
         if rc != ffi::SQLITE_OK {
            debug!(rc, "Could not route the SQLite log");
         }

         ffi::sqlite3_soft_heap_limit64(SOFT_HEAP_LIMIT);
         ffi::sqlite3_initialize();
      }
   });
}

unsafe extern "C" fn log_callback(_data: *mut c_void, code: c_int, message: *const c_char) {
   if message.is_null() {
      return;
   }
   // SAFETY: SQLite passes a NUL-terminated message valid for this call.
   let message = unsafe { CStr::from_ptr(message) }.to_string_lossy();
   let primary = code & 0xff;
   if code == ffi::SQLITE_OK || primary == ffi::SQLITE_CONSTRAINT || primary == ffi::SQLITE_SCHEMA
   {
      trace!(code, "sqlite: {}", message);
   } else {
      error!(code, "sqlite: {}", message);
   }
}

/// Attempts to release memory by pruning the SQLite page cache and other
/// internal data structures. Returns the number of bytes freed.
pub fn release_memory() -> i32 {
   initialize();
   // SAFETY: plain call into the engine; no pointers involved.
   unsafe { ffi::sqlite3_release_memory(SOFT_HEAP_LIMIT as c_int) }
}

/// True when the engine was built with an encryption codec. Such builds manage
/// journal mode and collations themselves, so those pragmas are not applied.
pub(crate) fn has_codec() -> bool {
   // SAFETY: the option name is a static NUL-terminated string.
   unsafe { ffi::sqlite3_compileoption_used(c"HAS_CODEC".as_ptr()) != 0 }
}

fn failure_from_code(code: c_int) -> SqliteFailure {
   // SAFETY: sqlite3_errstr returns a static string for every code.
   let message = unsafe { CStr::from_ptr(ffi::sqlite3_errstr(code)) }
      .to_string_lossy()
      .into_owned();
   SqliteFailure::new(code & 0xff, code, message)
}

/// Reads the most recent error of `db`, falling back to the generic text for
/// `code` when the connection has no message.
fn last_failure(db: *mut ffi::sqlite3, code: c_int) -> SqliteFailure {
   if db.is_null() {
      return failure_from_code(code);
   }
   // SAFETY: db is a live connection owned by the caller.
   unsafe {
      let extended = ffi::sqlite3_extended_errcode(db);
      let message = ffi::sqlite3_errmsg(db);
      let message = if message.is_null() {
         failure_from_code(code).message
      } else {
         CStr::from_ptr(message).to_string_lossy().into_owned()
      };
      SqliteFailure::new(code & 0xff, extended, message)
   }
}

fn step_error(db: *mut ffi::sqlite3, code: c_int) -> Error {
   if code & 0xff == ffi::SQLITE_INTERRUPT {
      Error::Cancelled
   } else {
      Error::Sqlite(last_failure(db, code))
   }
}

/// Converts a byte length for the C API, which takes lengths as `int`.
fn c_len(len: usize) -> Result<c_int> {
   c_int::try_from(len)
      .map_err(|_| Error::InvalidArgument(format!("value of {len} bytes is too large for SQLite")))
}

fn check(db: *mut ffi::sqlite3, code: c_int) -> Result<()> {
   if code == ffi::SQLITE_OK {
      Ok(())
   } else {
      Err(Error::Sqlite(last_failure(db, code)))
   }
}

/// Flag polled by the progress handler while a cancellable statement runs.
///
/// The flag is shared with cancellation tokens through an `Arc`, so a token
/// that fires late, after the connection detached from it, only flips a flag
/// that nobody polls anymore.
#[derive(Debug, Default)]
pub(crate) struct InterruptFlag {
   cancelled: AtomicBool,
}

impl InterruptFlag {
   fn reset(&self) {
      self.cancelled.store(false, AtomicOrdering::Release);
   }

   #[cfg(test)]
   pub(crate) fn is_set(&self) -> bool {
      self.cancelled.load(AtomicOrdering::Acquire)
   }
}

impl OnCancel for InterruptFlag {
   fn on_cancel(&self) {
      self.cancelled.store(true, AtomicOrdering::Release);
   }
}

unsafe extern "C" fn progress_handler(arg: *mut c_void) -> c_int {
   // SAFETY: arg is the InterruptFlag kept alive by the DatabaseHandle that
   // installed this handler; the handler is removed before the handle closes.
   let flag = unsafe { &*(arg as *const InterruptFlag) };
   c_int::from(flag.cancelled.load(AtomicOrdering::Acquire))
}

/// Invoker called by the scalar function trampoline with text arguments.
pub(crate) type FunctionInvoker =
   dyn Fn(&[Option<String>]) -> std::result::Result<Option<String>, String> + Send;

struct FunctionState {
   invoker: Box<FunctionInvoker>,
}

unsafe fn value_text(value: *mut ffi::sqlite3_value) -> Option<String> {
   // SAFETY: value comes from the argv array SQLite handed to the trampoline.
   unsafe {
      if ffi::sqlite3_value_type(value) == ffi::SQLITE_NULL {
         return None;
      }
      let text = ffi::sqlite3_value_text(value);
      if text.is_null() {
         return None;
      }
      let len = ffi::sqlite3_value_bytes(value).max(0) as usize;
      let bytes = std::slice::from_raw_parts(text, len);
      Some(String::from_utf8_lossy(bytes).into_owned())
   }
}

unsafe fn result_text(ctx: *mut ffi::sqlite3_context, text: &str) {
   let Ok(len) = c_len(text.len()) else {
      // SAFETY: ctx is the context of the running call.
      unsafe { ffi::sqlite3_result_error_toobig(ctx) };
      return;
   };
   // SAFETY: SQLITE_TRANSIENT makes SQLite copy the text before we return.
   unsafe {
      ffi::sqlite3_result_text(ctx, text.as_ptr() as *const c_char, len, ffi::SQLITE_TRANSIENT());
   }
}

unsafe fn result_error(ctx: *mut ffi::sqlite3_context, message: &str) {
   let Ok(len) = c_len(message.len()) else {
      // SAFETY: ctx is the context of the running call.
      unsafe { ffi::sqlite3_result_error_toobig(ctx) };
      return;
   };
   // SAFETY: sqlite3_result_error copies the message.
   unsafe {
      ffi::sqlite3_result_error(ctx, message.as_ptr() as *const c_char, len);
   }
}

unsafe extern "C" fn call_function(
   ctx: *mut ffi::sqlite3_context,
   argc: c_int,
   argv: *mut *mut ffi::sqlite3_value,
) {
   // SAFETY: the user data is the FunctionState boxed by register_function and
   // freed by drop_function once SQLite no longer needs it.
   let state = unsafe { &*(ffi::sqlite3_user_data(ctx) as *const FunctionState) };
   let args: Vec<Option<String>> = (0..argc.max(0) as usize)
      .map(|i| unsafe { value_text(*argv.add(i)) })
      .collect();

   let outcome = panic::catch_unwind(AssertUnwindSafe(|| (state.invoker)(&args)));
   // SAFETY: ctx is valid for the duration of this call.
   unsafe {
      match outcome {
         Ok(Ok(Some(text))) => result_text(ctx, &text),
         Ok(Ok(None)) => ffi::sqlite3_result_null(ctx),
         Ok(Err(message)) => result_error(ctx, &message),
         Err(_) => result_error(ctx, "custom function panicked"),
      }
   }
}

unsafe extern "C" fn drop_function(state: *mut c_void) {
   if !state.is_null() {
      // SAFETY: state was produced by Box::into_raw in register_function.
      drop(unsafe { Box::from_raw(state as *mut FunctionState) });
   }
}

/// Ordering used by the `LOCALIZED` collation: case-insensitive first, then
/// the exact text so that distinct strings never compare equal.
pub(crate) fn localized_compare(a: &str, b: &str) -> Ordering {
   let folded = a
      .chars()
      .flat_map(char::to_lowercase)
      .cmp(b.chars().flat_map(char::to_lowercase));
   folded.then_with(|| a.cmp(b))
}

unsafe fn collation_args<'a>(
   len1: c_int,
   p1: *const c_void,
   len2: c_int,
   p2: *const c_void,
) -> (std::borrow::Cow<'a, str>, std::borrow::Cow<'a, str>) {
   let bytes = |len: c_int, p: *const c_void| -> &'a [u8] {
      if p.is_null() || len <= 0 {
         &[]
      } else {
         // SAFETY: SQLite passes len valid bytes at p.
         unsafe { std::slice::from_raw_parts(p as *const u8, len as usize) }
      }
   };
   (
      String::from_utf8_lossy(bytes(len1, p1)),
      String::from_utf8_lossy(bytes(len2, p2)),
   )
}

fn ordering_to_c(ordering: Ordering) -> c_int {
   match ordering {
      Ordering::Less => -1,
      Ordering::Equal => 0,
      Ordering::Greater => 1,
   }
}

unsafe extern "C" fn compare_localized(
   _arg: *mut c_void,
   len1: c_int,
   p1: *const c_void,
   len2: c_int,
   p2: *const c_void,
) -> c_int {
   let (a, b) = unsafe { collation_args(len1, p1, len2, p2) };
   ordering_to_c(localized_compare(&a, &b))
}

unsafe extern "C" fn compare_unicode(
   _arg: *mut c_void,
   len1: c_int,
   p1: *const c_void,
   len2: c_int,
   p2: *const c_void,
) -> c_int {
   let (a, b) = unsafe { collation_args(len1, p1, len2, p2) };
   ordering_to_c(a.chars().cmp(b.chars()))
}

unsafe extern "C" fn trace_callback(
   event: c_uint,
   _ctx: *mut c_void,
   p: *mut c_void,
   x: *mut c_void,
) -> c_int {
   // SAFETY: for STMT events x is the statement text; for PROFILE events p is
   // the statement and x points at the elapsed nanoseconds.
   unsafe {
      if event == ffi::SQLITE_TRACE_STMT as c_uint && !x.is_null() {
         let sql = CStr::from_ptr(x as *const c_char).to_string_lossy();
         trace!(sql = %trim_sql_for_display(&sql), "sqlite statement");
      } else if event == ffi::SQLITE_TRACE_PROFILE as c_uint && !x.is_null() {
         let nanos = *(x as *const i64);
         let sql = ffi::sqlite3_sql(p as *mut ffi::sqlite3_stmt);
         let sql = if sql.is_null() {
            String::new()
         } else {
            CStr::from_ptr(sql).to_string_lossy().into_owned()
         };
         trace!(
            sql = %trim_sql_for_display(&sql),
            elapsed_ms = nanos as f64 / 1_000_000.0,
            "sqlite statement finished"
         );
      }
   }
   0
}

/// An open `sqlite3` connection.
pub(crate) struct DatabaseHandle {
   db: NonNull<ffi::sqlite3>,
   interrupt: Arc<InterruptFlag>,
}

// SAFETY: the engine runs in multi-thread mode, so a connection may move
// between threads as long as only one thread uses it at a time. The handle is
// owned by a single Connection, which is not Sync.
unsafe impl Send for DatabaseHandle {}

impl DatabaseHandle {
   /// Opens the database at `path`, sets the busy timeout and checks that a
   /// read-write open really produced a writable database.
   pub(crate) fn open(path: &Path, flags: OpenFlags) -> Result<Self> {
      initialize();

      let path_str = path.to_str().ok_or_else(|| {
         Error::InvalidArgument(format!("database path is not valid UTF-8: {}", path.display()))
      })?;
      let c_path = CString::new(path_str)
         .map_err(|_| Error::InvalidArgument("database path contains a NUL byte".to_string()))?;

      let mut sqlite_flags = if flags.read_only {
         ffi::SQLITE_OPEN_READONLY as c_int
      } else {
         ffi::SQLITE_OPEN_READWRITE as c_int
      };
      if flags.create_if_necessary && !flags.read_only {
         sqlite_flags |= ffi::SQLITE_OPEN_CREATE as c_int;
      }

      let mut db: *mut ffi::sqlite3 = ptr::null_mut();
      // SAFETY: c_path is NUL-terminated and db is a valid out pointer.
      let rc = unsafe { ffi::sqlite3_open_v2(c_path.as_ptr(), &mut db, sqlite_flags, ptr::null()) };
      if rc != ffi::SQLITE_OK {
         let failure = last_failure(db, rc);
         if !db.is_null() {
            // SAFETY: a failed open may still allocate a handle that must be closed.
            unsafe { ffi::sqlite3_close(db) };
         }
         return Err(Error::Sqlite(failure));
      }

      let db = NonNull::new(db).ok_or_else(|| Error::Sqlite(failure_from_code(ffi::SQLITE_NOMEM)))?;
      let handle = Self {
         db,
         interrupt: Arc::new(InterruptFlag::default()),
      };

      if !flags.read_only && handle.is_readonly_db() {
         return Err(Error::Sqlite(SqliteFailure::new(
            ffi::SQLITE_CANTOPEN,
            ffi::SQLITE_CANTOPEN,
            "Could not open the database in read/write mode.",
         )));
      }

      // SAFETY: db is open.
      let rc = unsafe { ffi::sqlite3_busy_timeout(handle.as_ptr(), BUSY_TIMEOUT_MS) };
      check(handle.as_ptr(), rc)?;

      Ok(handle)
   }

   pub(crate) fn as_ptr(&self) -> *mut ffi::sqlite3 {
      self.db.as_ptr()
   }

   fn is_readonly_db(&self) -> bool {
      // SAFETY: db is open; a null schema name means "main".
      unsafe { ffi::sqlite3_db_readonly(self.as_ptr(), c"main".as_ptr()) == 1 }
   }

   /// Compiles the first statement in `sql`.
   pub(crate) fn prepare(&self, sql: &str) -> Result<StatementHandle> {
      let sql_len = c_len(sql.len())?;
      let mut stmt: *mut ffi::sqlite3_stmt = ptr::null_mut();
      // SAFETY: the SQL is passed with its byte length, so no NUL terminator is
      // needed; stmt is a valid out pointer.
      let rc = unsafe {
         ffi::sqlite3_prepare_v2(
            self.as_ptr(),
            sql.as_ptr() as *const c_char,
            sql_len,
            &mut stmt,
            ptr::null_mut(),
         )
      };
      if rc != ffi::SQLITE_OK {
         if !stmt.is_null() {
            // SAFETY: never leak a half-built statement.
            unsafe { ffi::sqlite3_finalize(stmt) };
         }
         return Err(Error::Compile {
            failure: last_failure(self.as_ptr(), rc),
            sql: trim_sql_for_display(sql),
         });
      }

      match NonNull::new(stmt) {
         Some(stmt) => Ok(StatementHandle {
            stmt,
            db: self.db,
         }),
         None => Err(Error::Compile {
            failure: SqliteFailure::new(
               ffi::SQLITE_MISUSE,
               ffi::SQLITE_MISUSE,
               "statement contains no SQL",
            ),
            sql: trim_sql_for_display(sql),
         }),
      }
   }

   /// Rows modified by the most recent INSERT, UPDATE or DELETE.
   pub(crate) fn changes(&self) -> i64 {
      // SAFETY: db is open.
      i64::from(unsafe { ffi::sqlite3_changes(self.as_ptr()) })
   }

   pub(crate) fn last_insert_rowid(&self) -> i64 {
      // SAFETY: db is open.
      unsafe { ffi::sqlite3_last_insert_rowid(self.as_ptr()) }
   }

   /// Clears the interrupt flag and installs (`cancelable`) or removes the
   /// progress handler that polls it.
   pub(crate) fn reset_cancel(&self, cancelable: bool) {
      self.interrupt.reset();
      // SAFETY: the handler's argument is the InterruptFlag owned by this handle,
      // which outlives every statement executed on it.
      unsafe {
         if cancelable {
            ffi::sqlite3_progress_handler(
               self.as_ptr(),
               PROGRESS_CHECK_INTERVAL,
               Some(progress_handler),
               Arc::as_ptr(&self.interrupt) as *mut c_void,
            );
         } else {
            ffi::sqlite3_progress_handler(self.as_ptr(), 0, None, ptr::null_mut());
         }
      }
   }

   /// Listener that interrupts statements running on this handle.
   pub(crate) fn canceller(&self) -> Arc<InterruptFlag> {
      Arc::clone(&self.interrupt)
   }

   /// Registers a scalar function whose arguments are delivered as text.
   pub(crate) fn register_function(
      &self,
      name: &str,
      num_args: i32,
      invoker: Box<FunctionInvoker>,
   ) -> Result<()> {
      let c_name = CString::new(name)
         .map_err(|_| Error::InvalidArgument(format!("function name contains a NUL byte: {name}")))?;
      let state = Box::into_raw(Box::new(FunctionState { invoker })) as *mut c_void;

      // SAFETY: ownership of state moves to SQLite, which calls drop_function
      // when the function is replaced, the connection closes, or registration
      // fails.
      let rc = unsafe {
         ffi::sqlite3_create_function_v2(
            self.as_ptr(),
            c_name.as_ptr(),
            num_args,
            ffi::SQLITE_UTF8 as c_int,
            state,
            Some(call_function),
            None,
            None,
            Some(drop_function),
         )
      };
      check(self.as_ptr(), rc)
   }

   /// Registers the `LOCALIZED` and `UNICODE` collations.
   pub(crate) fn register_localized_collators(&self, locale: &str) -> Result<()> {
      debug!(locale, "Registering localized collators");
      for (name, compare) in [
         (c"LOCALIZED", compare_localized as CollationFn),
         (c"UNICODE", compare_unicode as CollationFn),
      ] {
         // SAFETY: the comparators carry no user data.
         let rc = unsafe {
            ffi::sqlite3_create_collation_v2(
               self.as_ptr(),
               name.as_ptr(),
               ffi::SQLITE_UTF8 as c_int,
               ptr::null_mut(),
               Some(compare),
               None,
            )
         };
         check(self.as_ptr(), rc)?;
      }
      Ok(())
   }

   /// Sends every statement and its run time to `tracing` at trace level.
   pub(crate) fn enable_trace(&self) -> Result<()> {
      let mask = (ffi::SQLITE_TRACE_STMT | ffi::SQLITE_TRACE_PROFILE) as c_uint;
      // SAFETY: the callback uses no context pointer.
      let rc = unsafe {
         ffi::sqlite3_trace_v2(self.as_ptr(), mask, Some(trace_callback), ptr::null_mut())
      };
      check(self.as_ptr(), rc)
   }

   /// Lookaside memory slots currently in use.
   pub(crate) fn lookaside_used(&self) -> i32 {
      let mut current: c_int = 0;
      let mut highwater: c_int = 0;
      // SAFETY: db is open and both out pointers are valid.
      unsafe {
         ffi::sqlite3_db_status(
            self.as_ptr(),
            ffi::SQLITE_DBSTATUS_LOOKASIDE_USED as c_int,
            &mut current,
            &mut highwater,
            0,
         );
      }
      current
   }
}

// libsqlite3-sys blocklists sqlite3_close_v2 from its generated bindings; the
// symbol is still provided by the linked SQLite library.
unsafe extern "C" {
   fn sqlite3_close_v2(db: *mut ffi::sqlite3) -> c_int;
}

type CollationFn = unsafe extern "C" fn(*mut c_void, c_int, *const c_void, c_int, *const c_void) -> c_int;

impl Drop for DatabaseHandle {
   fn drop(&mut self) {
      // SAFETY: the handle is open and owned exclusively by self. close_v2 defers
      // the release if a statement somehow outlives the connection.
      let rc = unsafe { sqlite3_close_v2(self.as_ptr()) };
      if rc != ffi::SQLITE_OK {
         warn!(rc, "sqlite3_close_v2 failed");
      }
   }
}

/// Result of stepping a statement once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
   Row,
   Done,
}

/// A compiled `sqlite3_stmt`.
pub(crate) struct StatementHandle {
   stmt: NonNull<ffi::sqlite3_stmt>,
   db: NonNull<ffi::sqlite3>,
}

// SAFETY: see DatabaseHandle; statements never outlive or leave their owning
// connection.
unsafe impl Send for StatementHandle {}

impl StatementHandle {
   pub(crate) fn as_ptr(&self) -> *mut ffi::sqlite3_stmt {
      self.stmt.as_ptr()
   }

   fn db(&self) -> *mut ffi::sqlite3 {
      self.db.as_ptr()
   }

   pub(crate) fn parameter_count(&self) -> usize {
      // SAFETY: stmt is live.
      unsafe { ffi::sqlite3_bind_parameter_count(self.as_ptr()) }.max(0) as usize
   }

   pub(crate) fn is_readonly(&self) -> bool {
      // SAFETY: stmt is live.
      unsafe { ffi::sqlite3_stmt_readonly(self.as_ptr()) != 0 }
   }

   pub(crate) fn column_count(&self) -> usize {
      // SAFETY: stmt is live.
      unsafe { ffi::sqlite3_column_count(self.as_ptr()) }.max(0) as usize
   }

   pub(crate) fn column_name(&self, index: usize) -> String {
      // SAFETY: stmt is live; the returned name is valid until the next call.
      unsafe {
         let name = ffi::sqlite3_column_name(self.as_ptr(), index as c_int);
         if name.is_null() {
            String::new()
         } else {
            CStr::from_ptr(name).to_string_lossy().into_owned()
         }
      }
   }

   pub(crate) fn bind_null(&self, index: usize) -> Result<()> {
      // SAFETY: stmt is live; SQLite range-checks the index.
      let rc = unsafe { ffi::sqlite3_bind_null(self.as_ptr(), index as c_int) };
      check(self.db(), rc)
   }

   pub(crate) fn bind_int64(&self, index: usize, value: i64) -> Result<()> {
      // SAFETY: as above.
      let rc = unsafe { ffi::sqlite3_bind_int64(self.as_ptr(), index as c_int, value) };
      check(self.db(), rc)
   }

   pub(crate) fn bind_double(&self, index: usize, value: f64) -> Result<()> {
      // SAFETY: as above.
      let rc = unsafe { ffi::sqlite3_bind_double(self.as_ptr(), index as c_int, value) };
      check(self.db(), rc)
   }

   pub(crate) fn bind_text(&self, index: usize, value: &str) -> Result<()> {
      let len = c_len(value.len())?;
      // SAFETY: SQLITE_TRANSIENT makes SQLite copy the text.
      let rc = unsafe {
         ffi::sqlite3_bind_text(
            self.as_ptr(),
            index as c_int,
            value.as_ptr() as *const c_char,
            len,
            ffi::SQLITE_TRANSIENT(),
         )
      };
      check(self.db(), rc)
   }

   pub(crate) fn bind_blob(&self, index: usize, value: &[u8]) -> Result<()> {
      let len = c_len(value.len())?;
      // SAFETY: SQLITE_TRANSIENT makes SQLite copy the bytes; an empty slice is
      // bound as a zero-length blob rather than NULL.
      let rc = unsafe {
         if value.is_empty() {
            ffi::sqlite3_bind_zeroblob(self.as_ptr(), index as c_int, 0)
         } else {
            ffi::sqlite3_bind_blob(
               self.as_ptr(),
               index as c_int,
               value.as_ptr() as *const c_void,
               len,
               ffi::SQLITE_TRANSIENT(),
            )
         }
      };
      check(self.db(), rc)
   }

   /// Advances the statement. An interrupted step fails with
   /// [`Error::Cancelled`].
   pub(crate) fn step(&self) -> Result<Step> {
      // SAFETY: stmt is live.
      let rc = unsafe { ffi::sqlite3_step(self.as_ptr()) };
      match rc {
         ffi::SQLITE_ROW => Ok(Step::Row),
         ffi::SQLITE_DONE => Ok(Step::Done),
         _ => Err(step_error(self.db(), rc)),
      }
   }

   /// Resets the statement and clears its bindings for reuse.
   pub(crate) fn reset_and_clear_bindings(&self) -> Result<()> {
      // SAFETY: stmt is live.
      let mut rc = unsafe { ffi::sqlite3_reset(self.as_ptr()) };
      if rc == ffi::SQLITE_OK {
         // SAFETY: as above.
         rc = unsafe { ffi::sqlite3_clear_bindings(self.as_ptr()) };
      }
      check(self.db(), rc)
   }

   /// Resets the statement, ignoring the error of the last step.
   pub(crate) fn reset(&self) {
      // SAFETY: stmt is live.
      unsafe { ffi::sqlite3_reset(self.as_ptr()) };
   }

   pub(crate) fn column_int64(&self, index: usize) -> i64 {
      // SAFETY: stmt is positioned on a row.
      unsafe { ffi::sqlite3_column_int64(self.as_ptr(), index as c_int) }
   }

   pub(crate) fn column_text(&self, index: usize) -> Option<String> {
      // SAFETY: stmt is positioned on a row; the text is copied before the next
      // call into SQLite.
      unsafe {
         let text = ffi::sqlite3_column_text(self.as_ptr(), index as c_int);
         if text.is_null() {
            return None;
         }
         let len = ffi::sqlite3_column_bytes(self.as_ptr(), index as c_int).max(0) as usize;
         let bytes = std::slice::from_raw_parts(text, len);
         Some(String::from_utf8_lossy(bytes).into_owned())
      }
   }

   pub(crate) fn column_blob(&self, index: usize) -> Option<Vec<u8>> {
      // SAFETY: stmt is positioned on a row; the bytes are copied immediately.
      unsafe {
         if ffi::sqlite3_column_type(self.as_ptr(), index as c_int) == ffi::SQLITE_NULL {
            return None;
         }
         let blob = ffi::sqlite3_column_blob(self.as_ptr(), index as c_int);
         let len = ffi::sqlite3_column_bytes(self.as_ptr(), index as c_int).max(0) as usize;
         if blob.is_null() || len == 0 {
            return Some(Vec::new());
         }
         Some(std::slice::from_raw_parts(blob as *const u8, len).to_vec())
      }
   }

   /// Reads column `index` of the current row with its storage class.
   pub(crate) fn column_value(&self, index: usize) -> ColumnValue {
      // SAFETY: stmt is positioned on a row.
      let kind = unsafe { ffi::sqlite3_column_type(self.as_ptr(), index as c_int) };
      match kind {
         ffi::SQLITE_INTEGER => ColumnValue::Integer(self.column_int64(index)),
         ffi::SQLITE_FLOAT => {
            // SAFETY: as above.
            ColumnValue::Real(unsafe { ffi::sqlite3_column_double(self.as_ptr(), index as c_int) })
         }
         ffi::SQLITE_TEXT => self
            .column_text(index)
            .map_or(ColumnValue::Null, ColumnValue::Text),
         ffi::SQLITE_BLOB => self
            .column_blob(index)
            .map_or(ColumnValue::Null, ColumnValue::Blob),
         _ => ColumnValue::Null,
      }
   }
}

impl Drop for StatementHandle {
   fn drop(&mut self) {
      // SAFETY: the statement is finalized exactly once, here, by its owner.
      unsafe { ffi::sqlite3_finalize(self.as_ptr()) };
   }
}
