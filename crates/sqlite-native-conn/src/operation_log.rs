//! Ring buffer of recently executed operations.
//!
//! Every execute-family call opens an entry here. Entries are identified by a
//! cookie that combines the slot index with a generation counter, so a cookie
//! kept past the point where its slot was reused simply stops resolving.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use time::OffsetDateTime;
use time::macros::format_description;
use tracing::debug;

use crate::statement::trim_sql_for_display;
use crate::value::BindArg;

/// Number of operations kept for diagnostics.
pub const MAX_RECENT_OPERATIONS: usize = 20;

const COOKIE_GENERATION_SHIFT: u32 = 8;
const COOKIE_INDEX_MASK: u32 = 0xff;

/// Identifies one entry in the [`OperationLog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Cookie(u32);

impl Cookie {
   fn index(self) -> usize {
      (self.0 & COOKIE_INDEX_MASK) as usize
   }
}

#[derive(Debug)]
struct Operation {
   kind: &'static str,
   sql: Option<String>,
   bind_args: Vec<BindArg>,
   started_at: OffsetDateTime,
   start: Instant,
   end: Option<Instant>,
   failure: Option<String>,
   cookie: Cookie,
}

impl Operation {
   fn status(&self) -> &'static str {
      match (self.end, &self.failure) {
         (None, _) => "running",
         (Some(_), Some(_)) => "failed",
         (Some(_), None) => "succeeded",
      }
   }

   fn describe(&self, out: &mut String, verbose: bool) {
      out.push_str(self.kind);
      match self.end {
         Some(end) => {
            let _ = write!(out, " took {}ms", end.duration_since(self.start).as_millis());
         }
         None => {
            let _ = write!(out, " started {}ms ago", self.start.elapsed().as_millis());
         }
      }
      let _ = write!(out, " - {}", self.status());

      if let Some(sql) = &self.sql {
         let _ = write!(out, ", sql=\"{}\"", trim_sql_for_display(sql));
      }
      if verbose && !self.bind_args.is_empty() {
         let args: Vec<String> = self.bind_args.iter().map(ToString::to_string).collect();
         let _ = write!(out, ", bindArgs=[{}]", args.join(", "));
      }
      if let Some(failure) = &self.failure {
         let _ = write!(out, ", exception=\"{failure}\"");
      }
   }

   fn formatted_start_time(&self) -> String {
      let format =
         format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]");
      self
         .started_at
         .format(&format)
         .unwrap_or_else(|_| self.started_at.to_string())
   }
}

#[derive(Debug)]
struct Ring {
   slots: Vec<Option<Operation>>,
   index: usize,
   generation: u32,
   slow_threshold: Option<Duration>,
}

impl Ring {
   fn get(&self, cookie: Cookie) -> Option<&Operation> {
      self
         .slots
         .get(cookie.index())
         .and_then(Option::as_ref)
         .filter(|op| op.cookie == cookie)
   }

   fn get_mut(&mut self, cookie: Cookie) -> Option<&mut Operation> {
      self
         .slots
         .get_mut(cookie.index())
         .and_then(Option::as_mut)
         .filter(|op| op.cookie == cookie)
   }
}

/// Fixed-size log of the most recent operations on one connection.
#[derive(Debug)]
pub(crate) struct OperationLog {
   ring: Mutex<Ring>,
}

impl OperationLog {
   pub(crate) fn new(slow_threshold: Option<Duration>) -> Self {
      Self {
         ring: Mutex::new(Ring {
            slots: (0..MAX_RECENT_OPERATIONS).map(|_| None).collect(),
            index: 0,
            generation: 0,
            slow_threshold,
         }),
      }
   }

   pub(crate) fn set_slow_threshold(&self, slow_threshold: Option<Duration>) {
      self.ring.lock().slow_threshold = slow_threshold;
   }

   /// Opens an entry. Blob arguments are recorded as empty blobs.
   pub(crate) fn begin(&self, kind: &'static str, sql: Option<&str>, args: &[BindArg]) -> Cookie {
      let mut ring = self.ring.lock();
      ring.index = (ring.index + 1) % MAX_RECENT_OPERATIONS;
      ring.generation = ring.generation.wrapping_add(1);
      let cookie = Cookie((ring.generation << COOKIE_GENERATION_SHIFT) | ring.index as u32);

      let index = ring.index;
      ring.slots[index] = Some(Operation {
         kind,
         sql: sql.map(str::to_string),
         bind_args: args.iter().map(BindArg::redacted).collect(),
         started_at: OffsetDateTime::now_utc(),
         start: Instant::now(),
         end: None,
         failure: None,
         cookie,
      });
      cookie
   }

   /// Records the failure of an entry that is still open.
   pub(crate) fn fail(&self, cookie: Cookie, failure: &dyn std::fmt::Display) {
      if let Some(op) = self.ring.lock().get_mut(cookie) {
         op.failure = Some(failure.to_string());
      }
   }

   /// Closes an entry and logs it when it was slow.
   pub(crate) fn end(&self, cookie: Cookie) {
      if self.end_defer_log(cookie) {
         self.log(cookie, None);
      }
   }

   /// Closes an entry without logging it. Returns true when the operation was
   /// slow enough that the caller should [`log`](Self::log) it.
   pub(crate) fn end_defer_log(&self, cookie: Cookie) -> bool {
      let mut ring = self.ring.lock();
      let threshold = ring.slow_threshold;
      let Some(op) = ring.get_mut(cookie) else {
         return false;
      };
      let end = Instant::now();
      op.end = Some(end);
      match threshold {
         Some(threshold) => end.duration_since(op.start) >= threshold,
         None => false,
      }
   }

   /// Logs an entry, followed by `detail` when given.
   pub(crate) fn log(&self, cookie: Cookie, detail: Option<&str>) {
      let message = {
         let ring = self.ring.lock();
         let Some(op) = ring.get(cookie) else {
            return;
         };
         let mut message = String::new();
         op.describe(&mut message, false);
         if let Some(detail) = detail {
            message.push_str(", ");
            message.push_str(detail);
         }
         message
      };
      debug!("{}", message);
   }

   /// Describes the most recent entry if it is still running.
   pub(crate) fn describe_current(&self) -> Option<String> {
      let ring = self.ring.lock();
      let op = ring.slots[ring.index].as_ref()?;
      if op.end.is_some() {
         return None;
      }
      let mut out = String::new();
      op.describe(&mut out, false);
      Some(out)
   }

   /// True when `cookie` still identifies an entry.
   #[cfg(test)]
   pub(crate) fn contains(&self, cookie: Cookie) -> bool {
      self.ring.lock().get(cookie).is_some()
   }

   /// Appends the recent operations, newest first.
   pub(crate) fn dump(&self, out: &mut String, verbose: bool) {
      let ring = self.ring.lock();
      out.push_str("  Most recently executed operations:\n");

      let mut index = ring.index;
      let mut n = 0;
      while n < MAX_RECENT_OPERATIONS {
         let Some(op) = ring.slots[index].as_ref() else {
            break;
         };
         let _ = write!(out, "    {n}: [{}] ", op.formatted_start_time());
         op.describe(out, verbose);
         out.push('\n');
         index = if index > 0 {
            index - 1
         } else {
            MAX_RECENT_OPERATIONS - 1
         };
         n += 1;
      }
      if n == 0 {
         out.push_str("    <none>\n");
      }
   }
}

/// Read-only view of a connection's operation log that may be used from any
/// thread, including while the owning thread is executing a statement.
///
/// # Examples
///
/// ```
/// use sqlite_native_conn::{Configuration, Connection};
///
/// let mut conn = Connection::open(&Configuration::in_memory())?;
/// let log = conn.operation_log();
/// let dump = std::thread::spawn(move || log.dump(false)).join().unwrap();
/// assert!(dump.contains("Most recently executed operations"));
/// conn.close();
/// # Ok::<(), sqlite_native_conn::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct OperationLogHandle {
   log: Arc<OperationLog>,
}

impl OperationLogHandle {
   pub(crate) fn new(log: Arc<OperationLog>) -> Self {
      Self { log }
   }

   /// Describes the operation currently running on the connection, if any.
   pub fn describe_current_operation(&self) -> Option<String> {
      self.log.describe_current()
   }

   /// The recent operations, newest first. `verbose` includes bind arguments.
   pub fn dump(&self, verbose: bool) -> String {
      let mut out = String::new();
      self.log.dump(&mut out, verbose);
      out
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_stale_cookie_is_not_found() {
      let log = OperationLog::new(None);
      let first = log.begin("execute", Some("SELECT 1"), &[]);
      log.end(first);
      assert!(log.contains(first));

      for _ in 0..MAX_RECENT_OPERATIONS {
         let cookie = log.begin("execute", Some("SELECT 2"), &[]);
         log.end(cookie);
      }
      assert!(!log.contains(first));

      // Operations on a stale cookie are no-ops.
      log.fail(first, &"late failure");
      log.end(first);
      let mut dump = String::new();
      log.dump(&mut dump, true);
      assert!(!dump.contains("late failure"));
   }

   #[test]
   fn test_forged_cookie_is_ignored() {
      let log = OperationLog::new(Some(Duration::ZERO));
      log.begin("execute", None, &[]);
      let forged = Cookie(0xffff_ff42);
      assert!(!log.contains(forged));
      assert!(!log.end_defer_log(forged));
   }

   #[test]
   fn test_describe_current_only_while_running() {
      let log = OperationLog::new(None);
      let cookie = log.begin("executeForLong", Some("SELECT\n  count(*)\n FROM t"), &[]);
      let current = log.describe_current().unwrap();
      assert!(current.starts_with("executeForLong started "));
      assert!(current.contains("running, sql=\"SELECT count(*) FROM t\""));

      log.end(cookie);
      assert!(log.describe_current().is_none());
   }

   #[test]
   fn test_failure_is_described() {
      let log = OperationLog::new(None);
      let cookie = log.begin(
         "execute",
         Some("INSERT INTO t VALUES (?, ?)"),
         &[BindArg::Integer(1), BindArg::Blob(vec![1, 2, 3])],
      );
      log.fail(cookie, &"constraint failed");
      log.end(cookie);

      let mut dump = String::new();
      log.dump(&mut dump, true);
      assert!(dump.contains("    0: ["));
      assert!(dump.contains("execute took "));
      assert!(dump.contains("ms - failed"));
      assert!(dump.contains("bindArgs=[1, <blob>]"));
      assert!(dump.contains("exception=\"constraint failed\""));
   }

   #[test]
   fn test_dump_is_newest_first() {
      let log = OperationLog::new(None);
      for sql in ["SELECT 'a'", "SELECT 'b'"] {
         let cookie = log.begin("execute", Some(sql), &[]);
         log.end(cookie);
      }
      let mut dump = String::new();
      log.dump(&mut dump, false);
      let a = dump.find("SELECT 'a'").unwrap();
      let b = dump.find("SELECT 'b'").unwrap();
      assert!(b < a);
   }

   #[test]
   fn test_empty_dump() {
      let log = OperationLog::new(None);
      let mut dump = String::new();
      log.dump(&mut dump, false);
      assert!(dump.contains("<none>"));
   }

   #[test]
   fn test_slow_threshold() {
      let log = OperationLog::new(None);
      let cookie = log.begin("execute", None, &[]);
      assert!(!log.end_defer_log(cookie));

      log.set_slow_threshold(Some(Duration::ZERO));
      let cookie = log.begin("execute", None, &[]);
      assert!(log.end_defer_log(cookie));

      log.set_slow_threshold(Some(Duration::from_secs(3600)));
      let cookie = log.begin("execute", None, &[]);
      assert!(!log.end_defer_log(cookie));
   }

   #[test]
   fn test_handle_reads_from_another_thread() {
      let log = Arc::new(OperationLog::new(None));
      let handle = OperationLogHandle::new(Arc::clone(&log));
      let cookie = log.begin("executeForLong", Some("SELECT 1"), &[]);

      let current = std::thread::spawn(move || handle.describe_current_operation())
         .join()
         .unwrap();
      assert!(current.unwrap().contains("running, sql=\"SELECT 1\""));
      log.end(cookie);
   }
}
