//! Integration tests for connection lifecycle, configuration and diagnostics.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use sqlite_native_conn::{
   BindArg, Configuration, Connection, ConnectionOptions, CustomFunction, Error, OpenFlags,
   PragmaDefaults,
};

/// Writer that keeps everything logged through `tracing` in memory.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
   fn contents(&self) -> String {
      String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
   }
}

impl Write for CapturedLogs {
   fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
      self.0.lock().unwrap().extend_from_slice(buf);
      Ok(buf.len())
   }

   fn flush(&mut self) -> std::io::Result<()> {
      Ok(())
   }
}

fn capture_logs<R>(f: impl FnOnce() -> R) -> (R, String) {
   let logs = CapturedLogs::default();
   let writer = logs.clone();
   let subscriber = tracing_subscriber::fmt()
      .with_max_level(tracing::Level::DEBUG)
      .with_ansi(false)
      .with_writer(move || writer.clone())
      .finish();
   let result = tracing::subscriber::with_default(subscriber, f);
   (result, logs.contents())
}

// ============================================================================
// Open / Close
// ============================================================================

#[test]
fn test_open_and_close_in_memory() {
   let mut conn = Connection::open(&Configuration::in_memory()).unwrap();
   assert!(conn.is_primary_connection());
   assert_eq!(conn.connection_id(), 0);
   assert_eq!(conn.label(), ":memory:");
   assert!(!conn.is_closed());

   conn.close();
   assert!(conn.is_closed());

   // Closing again is a no-op.
   conn.close();
   assert!(conn.is_closed());
}

#[test]
fn test_operations_after_close_fail() {
   let mut conn = Connection::open(&Configuration::in_memory()).unwrap();
   conn.close();

   let err = conn.execute_for_long("SELECT 1", &[], None).unwrap_err();
   assert!(matches!(err, Error::ConnectionClosed));
   assert_eq!(err.error_code(), "CONNECTION_CLOSED");
}

#[test]
fn test_invalid_cache_size_is_rejected() {
   let config = Configuration::in_memory().with_max_sql_cache_size(0);
   let err = Connection::open(&config).unwrap_err();
   assert!(matches!(err, Error::InvalidConfiguration(_)));
}

#[test]
fn test_read_only_open_of_missing_file_fails() {
   let dir = tempfile::tempdir().unwrap();
   let config = Configuration::new(dir.path().join("missing.db")).with_open_flags(OpenFlags {
      read_only: true,
      ..Default::default()
   });

   let err = Connection::open(&config).unwrap_err();
   assert_eq!(err.error_code(), "SQLITE_CANTOPEN");
}

#[test]
fn test_open_creates_file_and_applies_page_size() {
   let dir = tempfile::tempdir().unwrap();
   let path = dir.path().join("app.db");

   let mut conn = Connection::open(&Configuration::new(&path)).unwrap();
   assert!(path.exists());
   assert_eq!(
      conn.execute_for_long("PRAGMA page_size", &[], None).unwrap(),
      Some(1024)
   );
   conn.close();
}

#[test]
fn test_wal_mode_enabled() {
   let dir = tempfile::tempdir().unwrap();
   let config = Configuration::new(dir.path().join("wal.db")).with_wal(true);

   let mut conn = Connection::open(&config).unwrap();
   let mode = conn
      .execute_for_string("PRAGMA journal_mode", &[], None)
      .unwrap();
   assert_eq!(mode.as_deref(), Some("wal"));
   conn.close();
}

/// Builds a configuration whose per-connection pragma targets match what the
/// engine reports for a fresh connection, so only persistent settings
/// (page size, locale) ever need writing.
///
/// Foreign keys, synchronous, the journal size limit and the auto-checkpoint
/// interval reset on every open, so any target that differs from the engine
/// default is written again by each new connection.
fn engine_matching_config(path: &std::path::Path) -> Configuration {
   let reference_config = Configuration::new(path).with_open_flags(OpenFlags {
      read_only: true,
      ..Default::default()
   });
   let mut reference = Connection::open(&reference_config).unwrap();
   let read = |sql: &str| reference.execute_for_long(sql, &[], None).unwrap().unwrap();
   let foreign_keys = read("PRAGMA foreign_keys");
   let synchronous = read("PRAGMA synchronous");
   let journal_size_limit = read("PRAGMA journal_size_limit");
   let wal_auto_checkpoint = read("PRAGMA wal_autocheckpoint");
   reference.close();

   let mut config = Configuration::new(path).with_foreign_keys(foreign_keys == 1);
   config.pragma_defaults = PragmaDefaults {
      sync_mode: synchronous.to_string(),
      journal_size_limit,
      wal_auto_checkpoint,
      ..Default::default()
   };
   config
}

#[test]
fn test_reopen_with_same_configuration_issues_no_set_statements() {
   let file = tempfile::NamedTempFile::new().unwrap();
   let config = engine_matching_config(file.path());

   let mut first = Connection::open(&config).unwrap();
   first.close();

   let mut second = Connection::open(&config).unwrap();
   assert_eq!(second.stats().pragma_updates, 0);
   second.close();
}

#[test]
fn test_reopen_with_default_configuration_rewrites_per_connection_pragmas() {
   let file = tempfile::NamedTempFile::new().unwrap();
   let config = Configuration::new(file.path());

   let mut first = Connection::open(&config).unwrap();
   first.close();

   // The bundled engine defaults to foreign_keys=1, journal_size_limit=-1 and
   // synchronous=FULL. Page size, journal mode and locale persist in the file.
   let mut second = Connection::open(&config).unwrap();
   assert_eq!(second.stats().pragma_updates, 3);
   second.close();
}

#[test]
fn test_reconfigure_foreign_keys_only() {
   let config = Configuration::in_memory();
   let mut conn = Connection::open(&config).unwrap();
   let before = conn.stats().pragma_updates;

   conn.reconfigure(&config.clone().with_foreign_keys(true)).unwrap();

   assert_eq!(conn.stats().pragma_updates, before + 1);
   assert_eq!(
      conn.execute_for_long("PRAGMA foreign_keys", &[], None).unwrap(),
      Some(1)
   );
   assert!(conn.configuration().foreign_key_constraints_enabled);
   conn.close();
}

#[test]
fn test_reconfigure_clears_read_only_policy() {
   let config = Configuration::in_memory();
   let mut conn = Connection::open(&config).unwrap();
   conn.execute("CREATE TABLE t (a)", &[], None).unwrap();

   conn.set_only_allow_read_only_operations(true);
   assert!(conn.execute("INSERT INTO t VALUES (1)", &[], None).is_err());

   conn.reconfigure(&config).unwrap();
   conn.execute("INSERT INTO t VALUES (1)", &[], None).unwrap();
   conn.close();
}

#[test]
fn test_reconfigure_shrinks_statement_cache() {
   let config = Configuration::in_memory();
   let mut conn = Connection::open(&config).unwrap();
   for n in 0..5 {
      conn.execute_for_long(&format!("SELECT {n}"), &[], None).unwrap();
   }

   conn.reconfigure(&config.clone().with_max_sql_cache_size(2)).unwrap();
   assert_eq!(conn.stats().cache_size, 2);
   assert!(conn.is_prepared_statement_cached("SELECT 4"));
   assert!(!conn.is_prepared_statement_cached("SELECT 0"));
   conn.close();
}

#[test]
fn test_reconfigure_registers_only_new_functions() {
   let first = CustomFunction::new("first", 0, |_| Ok(Some("one".to_string())));
   let second = CustomFunction::new("second", 0, |_| Ok(Some("two".to_string())));
   let config = Configuration::in_memory().with_function(first);

   let mut conn = Connection::open(&config).unwrap();
   assert_eq!(conn.stats().functions_registered, 1);
   assert!(conn.execute_for_string("SELECT second()", &[], None).is_err());

   conn.reconfigure(&config.clone().with_function(second)).unwrap();
   assert_eq!(conn.stats().functions_registered, 2);
   assert_eq!(
      conn.execute_for_string("SELECT second()", &[], None).unwrap().as_deref(),
      Some("two")
   );
   assert_eq!(
      conn.execute_for_string("SELECT first()", &[], None).unwrap().as_deref(),
      Some("one")
   );

   // Reapplying the same configuration registers nothing.
   let same = conn.configuration().clone();
   conn.reconfigure(&same).unwrap();
   assert_eq!(conn.stats().functions_registered, 2);
   conn.close();
}

// ============================================================================
// Leaks
// ============================================================================

#[test]
fn test_failed_configure_does_not_report_a_leak() {
   let leaks = Arc::new(AtomicUsize::new(0));
   let counter = Arc::clone(&leaks);
   let options = ConnectionOptions::default().with_on_leak(move || {
      counter.fetch_add(1, Ordering::SeqCst);
   });
   let broken = CustomFunction::new("bad\0name", 0, |_| Ok(None));
   let config = Configuration::in_memory().with_function(broken);

   let err = Connection::open_with(&config, options).unwrap_err();
   assert!(matches!(err, Error::InvalidArgument(_)));
   assert_eq!(leaks.load(Ordering::SeqCst), 0);
}

#[test]
fn test_leak_callback_fires_when_dropped_open() {
   let leaks = Arc::new(AtomicUsize::new(0));
   let counter = Arc::clone(&leaks);
   let options = ConnectionOptions::default().with_on_leak(move || {
      counter.fetch_add(1, Ordering::SeqCst);
   });

   let conn = Connection::open_with(&Configuration::in_memory(), options.clone()).unwrap();
   drop(conn);
   assert_eq!(leaks.load(Ordering::SeqCst), 1);

   let mut conn = Connection::open_with(&Configuration::in_memory(), options).unwrap();
   conn.close();
   drop(conn);
   assert_eq!(leaks.load(Ordering::SeqCst), 1);
}

#[cfg(debug_assertions)]
#[test]
fn test_leaked_connection_is_reported() {
   let ((), logs) = capture_logs(|| {
      let conn = Connection::open(&Configuration::in_memory().with_label("leaky")).unwrap();
      drop(conn);
   });
   assert!(logs.contains("A connection was leaked"));
   assert!(logs.contains("leaky"));

   let ((), logs) = capture_logs(|| {
      let mut conn = Connection::open(&Configuration::in_memory()).unwrap();
      conn.close();
   });
   assert!(!logs.contains("A connection was leaked"));
}

// ============================================================================
// Diagnostics
// ============================================================================

#[cfg(debug_assertions)]
#[test]
fn test_slow_operation_log_includes_changed_rows() {
   let config = Configuration::in_memory().with_slow_query_threshold(std::time::Duration::ZERO);
   let mut conn = Connection::open(&config).unwrap();
   conn.execute("CREATE TABLE t (a INTEGER)", &[], None).unwrap();
   for n in 0..3i64 {
      conn.execute("INSERT INTO t VALUES (?)", &[BindArg::from(n)], None)
         .unwrap();
   }

   let (changed, logs) = capture_logs(|| {
      conn.execute_for_changed_row_count("UPDATE t SET a = a + 1", &[], None)
         .unwrap()
   });
   assert_eq!(changed, 3);
   assert!(logs.contains("executeForChangedRowCount took"));
   assert!(logs.contains("changedRows=3"));
   conn.close();
}

#[test]
fn test_dump_lists_operations_and_statements() {
   let options = ConnectionOptions::default()
      .with_connection_id(7)
      .with_primary(false);
   let mut conn = Connection::open_with(&Configuration::in_memory(), options).unwrap();
   conn.execute_for_long("SELECT\n   ?  +  1", &[BindArg::from(41)], None)
      .unwrap();

   let brief = conn.dump(false);
   assert!(brief.starts_with("Connection #7:"));
   assert!(brief.contains("isPrimaryConnection: false"));
   assert!(brief.contains("onlyAllowReadOnlyOperations: false"));
   assert!(brief.contains("executeForLong took"));
   assert!(brief.contains("sql=\"SELECT ?  +  1\""));
   assert!(!brief.contains("connectionPtr"));
   assert!(!brief.contains("bindArgs"));

   let verbose = conn.dump(true);
   assert!(verbose.contains("connectionPtr: 0x"));
   assert!(verbose.contains("bindArgs=[41]"));
   assert!(verbose.contains("Prepared statement cache:"));
   assert!(verbose.contains("numParameters=1, type=SELECT, readOnly=true, sql=\"SELECT ?  +  1\""));
   conn.close();
}

#[test]
fn test_db_stats_include_attached_databases() {
   let options = ConnectionOptions::default()
      .with_connection_id(2)
      .with_primary(false);
   let mut conn = Connection::open_with(&Configuration::in_memory(), options).unwrap();
   conn.execute("ATTACH DATABASE ':memory:' AS aux", &[], None)
      .unwrap();

   let stats = conn.collect_db_stats();
   assert_eq!(stats[0].label, ":memory: (2)");
   assert!(stats[0].page_size > 0);
   assert!(stats.iter().any(|s| s.label == "  (attached) aux"));
   conn.close();
}

#[test]
fn test_release_memory_is_callable() {
   assert!(sqlite_native_conn::release_memory() >= 0);
}
