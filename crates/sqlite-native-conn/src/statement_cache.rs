//! LRU cache of prepared statements keyed by SQL text.
//!
//! Statement records live in an arena indexed by `usize`. Records that are no
//! longer needed are retired to a free list and reused by later preparations,
//! so a busy connection stops allocating records once it reaches a steady
//! state.
//!
//! While a statement executes, its native handle is moved out of the cache
//! into the caller's lease. The cache therefore never has to keep a borrow
//! alive across a native call, and a reentrant query can safely grow the arena
//! while an outer statement is still stepping.

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::native::StatementHandle;
use crate::statement::{CompiledStatement, StatementKind, StatementState};

/// Result of looking up SQL text in the cache.
pub(crate) enum Lookup {
   /// Cached and idle; the record is now `InUse` and the caller owns the handle.
   Available(usize, StatementHandle),
   /// Cached but already executing on this connection.
   Busy,
   /// Not cached.
   Missing,
}

pub(crate) struct StatementCache {
   records: Vec<CompiledStatement>,
   handles: Vec<Option<StatementHandle>>,
   free_head: Option<usize>,
   /// SQL → record index; front is least recently used.
   lru: IndexMap<String, usize>,
   capacity: usize,
   hits: u64,
   misses: u64,
   finalized: u64,
}

impl StatementCache {
   pub(crate) fn new(capacity: usize) -> Self {
      Self {
         records: Vec::new(),
         handles: Vec::new(),
         free_head: None,
         lru: IndexMap::new(),
         capacity: capacity.max(1),
         hits: 0,
         misses: 0,
         finalized: 0,
      }
   }

   pub(crate) fn record(&self, id: usize) -> &CompiledStatement {
      &self.records[id]
   }

   pub(crate) fn len(&self) -> usize {
      self.lru.len()
   }

   pub(crate) fn hits(&self) -> u64 {
      self.hits
   }

   pub(crate) fn misses(&self) -> u64 {
      self.misses
   }

   pub(crate) fn finalized(&self) -> u64 {
      self.finalized
   }

   /// True when `sql` is cached. Does not count as a use.
   pub(crate) fn contains(&self, sql: &str) -> bool {
      self.lru.contains_key(sql)
   }

   /// Looks up `sql`, marking a hit as most recently used.
   pub(crate) fn lookup(&mut self, sql: &str) -> Lookup {
      let Some(index) = self.lru.get_index_of(sql) else {
         self.misses += 1;
         return Lookup::Missing;
      };
      self.hits += 1;

      let last = self.lru.len() - 1;
      self.lru.move_index(index, last);
      let id = self.lru[last];

      if self.records[id].state != StatementState::Cached {
         return Lookup::Busy;
      }
      match self.handles[id].take() {
         Some(handle) => {
            self.records[id].state = StatementState::InUse;
            Lookup::Available(id, handle)
         }
         None => Lookup::Busy,
      }
   }

   /// Records a freshly prepared statement as in use and returns its id.
   ///
   /// The statement joins the cache unless `skip_cache` is set or its kind is
   /// not cacheable. Joining may evict the least recently used entries.
   pub(crate) fn install(
      &mut self,
      sql: &str,
      handle: &StatementHandle,
      kind: StatementKind,
      skip_cache: bool,
   ) -> usize {
      let cache = !skip_cache && kind.is_cacheable();
      let record = CompiledStatement {
         sql: sql.to_string(),
         statement_ptr: handle.as_ptr() as usize,
         num_parameters: handle.parameter_count(),
         read_only: handle.is_readonly(),
         kind,
         state: if cache {
            StatementState::InUse
         } else {
            StatementState::InUseUncached
         },
         pool_next: None,
      };
      let id = self.allocate(record);

      if cache {
         self.lru.insert(sql.to_string(), id);
         self.trim_to_capacity();
      }
      id
   }

   /// Changes the capacity, evicting the least recently used entries when it
   /// shrinks.
   pub(crate) fn resize(&mut self, capacity: usize) {
      self.capacity = capacity.max(1);
      self.trim_to_capacity();
   }

   fn allocate(&mut self, record: CompiledStatement) -> usize {
      match self.free_head {
         Some(id) => {
            self.free_head = self.records[id].pool_next;
            self.records[id] = record;
            id
         }
         None => {
            self.records.push(record);
            self.handles.push(None);
            self.records.len() - 1
         }
      }
   }

   fn retire(&mut self, id: usize) {
      let record = &mut self.records[id];
      record.sql.clear();
      record.statement_ptr = 0;
      record.state = StatementState::Idle;
      record.pool_next = self.free_head;
      self.free_head = Some(id);
   }

   fn finalize(&mut self, handle: StatementHandle) {
      drop(handle);
      self.finalized += 1;
   }

   fn trim_to_capacity(&mut self) {
      while self.lru.len() > self.capacity {
         if let Some((sql, id)) = self.lru.shift_remove_index(0) {
            debug!(sql = %sql, "Evicting prepared statement");
            self.on_evicted(id);
         }
      }
   }

   /// An evicted statement that is idle is finalized now; one that is still
   /// executing is finalized when its lease is released.
   fn on_evicted(&mut self, id: usize) {
      match self.records[id].state {
         StatementState::Cached => {
            if let Some(handle) = self.handles[id].take() {
               self.finalize(handle);
            }
            self.retire(id);
         }
         StatementState::InUse => {
            self.records[id].state = StatementState::InUseUncached;
         }
         StatementState::Idle | StatementState::InUseUncached => {}
      }
   }

   /// Takes back the handle of a statement acquired through [`lookup`] or
   /// [`install`].
   ///
   /// Cached statements are reset for the next use. If the reset fails the
   /// statement is dropped from the cache instead; the failure has already been
   /// reported by the step that caused it.
   ///
   /// [`lookup`]: StatementCache::lookup
   /// [`install`]: StatementCache::install
   pub(crate) fn release(&mut self, id: usize, handle: StatementHandle) {
      match self.records[id].state {
         StatementState::InUse => match handle.reset_and_clear_bindings() {
            Ok(()) => {
               self.handles[id] = Some(handle);
               self.records[id].state = StatementState::Cached;
            }
            Err(err) => {
               debug!(error = %err, "Could not reset cached statement; removing it from the cache");
               let sql = std::mem::take(&mut self.records[id].sql);
               self.lru.shift_remove(&sql);
               self.finalize(handle);
               self.retire(id);
            }
         },
         StatementState::InUseUncached => {
            self.finalize(handle);
            self.retire(id);
         }
         StatementState::Cached | StatementState::Idle => {
            warn!(id, "Released a statement that was not in use");
            self.finalize(handle);
         }
      }
   }

   /// Empties the cache. Statements still executing are finalized when
   /// released.
   pub(crate) fn evict_all(&mut self) {
      let ids: Vec<usize> = self.lru.drain(..).map(|(_, id)| id).collect();
      for id in ids {
         self.on_evicted(id);
      }
   }

   /// Cached records from least to most recently used.
   pub(crate) fn entries(&self) -> impl Iterator<Item = &CompiledStatement> {
      self.lru.values().map(|&id| &self.records[id])
   }
}
