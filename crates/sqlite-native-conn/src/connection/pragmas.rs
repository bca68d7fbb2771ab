//! Connection settings applied through pragmas.
//!
//! Each setting reads the current value first and only issues the SET
//! statement when it differs, so opening the same database twice with the
//! same configuration changes nothing the second time.

use tracing::{debug, warn};

use super::Connection;
use crate::value::BindArg;
use crate::{Error, Result};

/// Metadata table recording the locale the `LOCALIZED` indexes were built for.
const LOCALE_TABLE: &str = "connection_locale";

/// Maps the numeric values reported by `PRAGMA synchronous` to their names.
fn canonicalize_sync_mode(value: &str) -> &str {
   match value {
      "0" => "OFF",
      "1" => "NORMAL",
      "2" => "FULL",
      other => other,
   }
}

impl Connection {
   fn is_read_only_connection(&self) -> bool {
      self.config.open_flags.read_only
   }

   fn count_pragma_update(&self) {
      self.bump(|stats| stats.pragma_updates += 1);
   }

   fn read_long(&self, sql: &str) -> Result<i64> {
      Ok(self.execute_for_long(sql, &[], None)?.unwrap_or(0))
   }

   pub(super) fn set_page_size(&self) -> Result<()> {
      if self.config.is_in_memory_db() || self.is_read_only_connection() {
         return Ok(());
      }
      let new_value = self.config.pragma_defaults.page_size;
      if self.read_long("PRAGMA page_size")? != new_value {
         self.count_pragma_update();
         self.execute(&format!("PRAGMA page_size={new_value}"), &[], None)?;
      }
      Ok(())
   }

   pub(super) fn set_foreign_key_mode(&self) -> Result<()> {
      if self.is_read_only_connection() {
         return Ok(());
      }
      let new_value = i64::from(self.config.foreign_key_constraints_enabled);
      if self.read_long("PRAGMA foreign_keys")? != new_value {
         self.count_pragma_update();
         self.execute(&format!("PRAGMA foreign_keys={new_value}"), &[], None)?;
      }
      Ok(())
   }

   pub(super) fn set_journal_size_limit(&self) -> Result<()> {
      if self.config.is_in_memory_db() || self.is_read_only_connection() {
         return Ok(());
      }
      let new_value = self.config.pragma_defaults.journal_size_limit;
      if self.read_long("PRAGMA journal_size_limit")? != new_value {
         self.count_pragma_update();
         self.execute_for_long(&format!("PRAGMA journal_size_limit={new_value}"), &[], None)?;
      }
      Ok(())
   }

   pub(super) fn set_auto_checkpoint_interval(&self) -> Result<()> {
      if self.config.is_in_memory_db() || self.is_read_only_connection() {
         return Ok(());
      }
      let new_value = self.config.pragma_defaults.effective_wal_auto_checkpoint();
      if self.read_long("PRAGMA wal_autocheckpoint")? != new_value {
         self.count_pragma_update();
         self.execute_for_long(&format!("PRAGMA wal_autocheckpoint={new_value}"), &[], None)?;
      }
      Ok(())
   }

   pub(super) fn set_wal_mode(&self) -> Result<()> {
      if self.config.is_in_memory_db() || self.is_read_only_connection() {
         return Ok(());
      }
      let defaults = &self.config.pragma_defaults;
      if self.config.wal_enabled {
         self.set_journal_mode("WAL")?;
         self.set_sync_mode(&defaults.wal_sync_mode)
      } else {
         self.set_journal_mode(&defaults.journal_mode)?;
         self.set_sync_mode(&defaults.sync_mode)
      }
   }

   fn set_sync_mode(&self, new_value: &str) -> Result<()> {
      let value = self
         .execute_for_string("PRAGMA synchronous", &[], None)?
         .unwrap_or_default();
      if !canonicalize_sync_mode(&value).eq_ignore_ascii_case(canonicalize_sync_mode(new_value)) {
         self.count_pragma_update();
         self.execute(&format!("PRAGMA synchronous={new_value}"), &[], None)?;
      }
      Ok(())
   }

   /// Switches the journal mode. Another connection holding the database
   /// open prevents switching to or from WAL; that is tolerated with a
   /// warning.
   fn set_journal_mode(&self, new_value: &str) -> Result<()> {
      let value = self
         .execute_for_string("PRAGMA journal_mode", &[], None)?
         .unwrap_or_default();
      if value.eq_ignore_ascii_case(new_value) {
         return Ok(());
      }

      self.count_pragma_update();
      match self.execute_for_string(&format!("PRAGMA journal_mode={new_value}"), &[], None) {
         Ok(Some(result)) if result.eq_ignore_ascii_case(new_value) => return Ok(()),
         Ok(_) => {}
         Err(err) if err.is_locked() => {}
         Err(err) => return Err(err),
      }

      warn!(
         label = %self.config.label,
         from = %value,
         to = new_value,
         "Could not change the database journal mode because the database is locked. \
          Other open connections usually prevent enabling or disabling write-ahead logging. \
          Proceeding without changing the journal mode."
      );
      Ok(())
   }

   /// Registers the localized collators and, for writable connections,
   /// rebuilds `LOCALIZED` indexes when the locale changed since the
   /// database was last opened.
   pub(super) fn set_locale(&self) -> Result<()> {
      if self.config.open_flags.no_localized_collators {
         return Ok(());
      }

      let new_locale = self.config.locale.as_str();
      self.db()?.register_localized_collators(new_locale)?;
      if self.is_read_only_connection() {
         return Ok(());
      }

      self.update_stored_locale(new_locale).map_err(|source| Error::Locale {
         label: self.config.label.clone(),
         locale: new_locale.to_string(),
         source: Box::new(source),
      })
   }

   fn update_stored_locale(&self, new_locale: &str) -> Result<()> {
      self.execute(
         &format!("CREATE TABLE IF NOT EXISTS {LOCALE_TABLE} (locale TEXT)"),
         &[],
         None,
      )?;
      let old_locale = self.execute_for_string(
         &format!("SELECT locale FROM {LOCALE_TABLE} UNION SELECT NULL ORDER BY locale DESC LIMIT 1"),
         &[],
         None,
      )?;
      if old_locale.as_deref() == Some(new_locale) {
         return Ok(());
      }

      debug!(label = %self.config.label, ?old_locale, new_locale, "Reindexing for new locale");
      self.execute("BEGIN", &[], None)?;
      let outcome = self
         .execute(&format!("DELETE FROM {LOCALE_TABLE}"), &[], None)
         .and_then(|()| {
            self.execute(
               &format!("INSERT INTO {LOCALE_TABLE} (locale) VALUES(?)"),
               &[BindArg::from(new_locale)],
               None,
            )
         })
         .and_then(|()| self.execute("REINDEX LOCALIZED", &[], None));

      let finish = if outcome.is_ok() { "COMMIT" } else { "ROLLBACK" };
      let finished = self.execute(finish, &[], None);
      outcome.and(finished)
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::config::Configuration;

   #[test]
   fn test_canonicalize_sync_mode() {
      assert_eq!(canonicalize_sync_mode("0"), "OFF");
      assert_eq!(canonicalize_sync_mode("1"), "NORMAL");
      assert_eq!(canonicalize_sync_mode("2"), "FULL");
      assert_eq!(canonicalize_sync_mode("normal"), "normal");
   }

   #[test]
   fn test_locale_is_recorded() {
      let mut conn = Connection::open(&Configuration::in_memory().with_locale("de_DE")).unwrap();
      let stored = conn
         .execute_for_string("SELECT locale FROM connection_locale", &[], None)
         .unwrap();
      assert_eq!(stored.as_deref(), Some("de_DE"));

      conn.reconfigure(&Configuration::in_memory().with_locale("fr_FR"))
         .unwrap();
      let count = conn
         .execute_for_long("SELECT count(*) FROM connection_locale", &[], None)
         .unwrap();
      assert_eq!(count, Some(1));
      let stored = conn
         .execute_for_string("SELECT locale FROM connection_locale", &[], None)
         .unwrap();
      assert_eq!(stored.as_deref(), Some("fr_FR"));
      conn.close();
   }

   #[test]
   fn test_no_localized_collators_skips_locale_table() {
      let mut flags = crate::config::OpenFlags::read_write_create();
      flags.no_localized_collators = true;
      let mut conn = Connection::open(&Configuration::in_memory().with_open_flags(flags)).unwrap();
      let tables = conn
         .execute_for_long(
            "SELECT count(*) FROM sqlite_master WHERE name = 'connection_locale'",
            &[],
            None,
         )
         .unwrap();
      assert_eq!(tables, Some(0));
      conn.close();
   }

   #[test]
   fn test_foreign_keys_applied() {
      let mut conn = Connection::open(&Configuration::in_memory().with_foreign_keys(true)).unwrap();
      assert_eq!(
         conn.execute_for_long("PRAGMA foreign_keys", &[], None).unwrap(),
         Some(1)
      );

      let before = conn.stats().pragma_updates;
      conn.reconfigure(&Configuration::in_memory()).unwrap();
      assert_eq!(
         conn.execute_for_long("PRAGMA foreign_keys", &[], None).unwrap(),
         Some(0)
      );
      assert_eq!(conn.stats().pragma_updates, before + 1);
      conn.close();
   }
}
