//! Prepared statement records and SQL classification.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Kind of SQL statement, derived from its leading keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementKind {
   Select,
   Update,
   Attach,
   Begin,
   Commit,
   Abort,
   Pragma,
   Ddl,
   Unprepared,
   Other,
}

impl StatementKind {
   /// Classifies `sql` by its first three non-whitespace characters,
   /// ignoring case.
   ///
   /// ```
   /// use sqlite_native_conn::StatementKind;
   ///
   /// assert_eq!(StatementKind::of("  select 1"), StatementKind::Select);
   /// assert_eq!(StatementKind::of("REPLACE INTO t VALUES (1)"), StatementKind::Update);
   /// assert_eq!(StatementKind::of("END"), StatementKind::Commit);
   /// assert_eq!(StatementKind::of("--"), StatementKind::Other);
   /// ```
   pub fn of(sql: &str) -> Self {
      let prefix: String = sql.trim_start().chars().take(3).collect();
      if prefix.chars().count() < 3 {
         return StatementKind::Other;
      }

      match prefix.to_ascii_uppercase().as_str() {
         "SEL" => StatementKind::Select,
         "INS" | "UPD" | "REP" | "DEL" => StatementKind::Update,
         "ATT" => StatementKind::Attach,
         "COM" | "END" => StatementKind::Commit,
         "ROL" => StatementKind::Abort,
         "BEG" => StatementKind::Begin,
         "PRA" => StatementKind::Pragma,
         "CRE" | "DRO" | "ALT" => StatementKind::Ddl,
         "ANA" | "DET" => StatementKind::Unprepared,
         _ => StatementKind::Other,
      }
   }

   /// Only queries and data changes are kept in the statement cache. Other
   /// statements tend to run once, and transaction control must always see a
   /// freshly compiled statement.
   pub fn is_cacheable(self) -> bool {
      matches!(self, StatementKind::Select | StatementKind::Update)
   }

   fn as_str(self) -> &'static str {
      match self {
         StatementKind::Select => "SELECT",
         StatementKind::Update => "UPDATE",
         StatementKind::Attach => "ATTACH",
         StatementKind::Begin => "BEGIN",
         StatementKind::Commit => "COMMIT",
         StatementKind::Abort => "ABORT",
         StatementKind::Pragma => "PRAGMA",
         StatementKind::Ddl => "DDL",
         StatementKind::Unprepared => "UNPREPARED",
         StatementKind::Other => "OTHER",
      }
   }
}

impl fmt::Display for StatementKind {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.as_str())
   }
}

/// Collapses line breaks (and the whitespace around them) into single spaces
/// so SQL fits on one log line.
pub(crate) fn trim_sql_for_display(sql: &str) -> String {
   static RE: OnceLock<Regex> = OnceLock::new();

   let re = RE.get_or_init(|| Regex::new(r"[\s]*\n+[\s]*").expect("invalid regex"));
   re.replace_all(sql, " ").into_owned()
}

/// Lifecycle state of a [`CompiledStatement`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatementState {
   /// Retired to the free list; holds no native handle.
   Idle,
   /// In the cache and available for the next acquisition.
   Cached,
   /// In the cache and currently executing.
   InUse,
   /// Executing but not cached; finalized when released.
   InUseUncached,
}

/// Metadata about a compiled statement, returned by
/// [`Connection::prepare`](crate::Connection::prepare).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatementInfo {
   /// Number of `?` parameters the statement expects
   pub num_parameters: usize,
   /// True when the statement cannot modify the database
   pub read_only: bool,
   /// Names of the result columns, empty for statements that return no rows
   pub column_names: Vec<String>,
}

/// Record describing one native prepared statement.
///
/// The native handle itself travels with the lease while the statement is in
/// use, so the record only keeps its address for diagnostics.
#[derive(Debug)]
pub(crate) struct CompiledStatement {
   pub(crate) sql: String,
   pub(crate) statement_ptr: usize,
   pub(crate) num_parameters: usize,
   pub(crate) read_only: bool,
   pub(crate) kind: StatementKind,
   pub(crate) state: StatementState,
   /// Next record on the free list while `Idle`.
   pub(crate) pool_next: Option<usize>,
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_statement_kind_classification() {
      let cases = [
         ("SELECT 1", StatementKind::Select),
         ("insert into t values (1)", StatementKind::Update),
         ("UPDATE t SET a = 1", StatementKind::Update),
         ("DELETE FROM t", StatementKind::Update),
         ("ATTACH 'x' AS y", StatementKind::Attach),
         ("COMMIT", StatementKind::Commit),
         ("ROLLBACK", StatementKind::Abort),
         ("BEGIN IMMEDIATE", StatementKind::Begin),
         ("PRAGMA user_version", StatementKind::Pragma),
         ("CREATE TABLE t (a)", StatementKind::Ddl),
         ("DROP TABLE t", StatementKind::Ddl),
         ("ALTER TABLE t ADD b", StatementKind::Ddl),
         ("ANALYZE", StatementKind::Unprepared),
         ("DETACH y", StatementKind::Unprepared),
         ("WITH x AS (SELECT 1) SELECT * FROM x", StatementKind::Other),
         ("se", StatementKind::Other),
         ("", StatementKind::Other),
      ];
      for (sql, kind) in cases {
         assert_eq!(StatementKind::of(sql), kind, "{sql}");
      }
   }

   #[test]
   fn test_only_select_and_update_are_cacheable() {
      assert!(StatementKind::Select.is_cacheable());
      assert!(StatementKind::Update.is_cacheable());
      assert!(!StatementKind::Begin.is_cacheable());
      assert!(!StatementKind::Pragma.is_cacheable());
      assert!(!StatementKind::Ddl.is_cacheable());
   }

   #[test]
   fn test_trim_sql_for_display() {
      assert_eq!(
         trim_sql_for_display("SELECT *\n   FROM t\n\n  WHERE a = 1"),
         "SELECT * FROM t WHERE a = 1"
      );
      assert_eq!(trim_sql_for_display("SELECT 1"), "SELECT 1");
   }
}
