//! Counters and database statistics reported by a connection.

use serde::Serialize;

/// Native work performed by one connection since it was opened.
///
/// Pools use these counters to size their statement caches, and they make the
/// cost of an operation observable in tests (for example, that a failed
/// arity check bound nothing).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
   /// Statements compiled by the engine
   pub statements_prepared: u64,
   /// Statements finalized by the engine
   pub statements_finalized: u64,
   /// Individual argument bind calls
   pub bind_calls: u64,
   /// Statements stepped by an execute method
   pub native_executions: u64,
   /// Times the cancellation handler was installed
   pub cancellation_armed: u64,
   /// Times the cancellation handler was removed
   pub cancellation_disarmed: u64,
   /// Pragma SET statements issued while configuring the connection
   pub pragma_updates: u64,
   /// Custom functions registered with the engine
   pub functions_registered: u64,
   /// Statement cache hits
   pub cache_hits: u64,
   /// Statement cache misses
   pub cache_misses: u64,
   /// Statements currently cached
   pub cache_size: usize,
}

/// Size and cache statistics for one database attached to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DbStats {
   /// Database path, or the schema name for attached databases
   pub label: String,
   pub page_count: i64,
   pub page_size: i64,
   /// Lookaside memory slots in use
   pub lookaside: i32,
   pub cache_hits: u64,
   pub cache_misses: u64,
   pub cache_size: usize,
}
