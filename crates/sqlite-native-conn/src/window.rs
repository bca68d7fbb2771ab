//! Bounded window of result rows.

use std::fmt;

use crate::value::ColumnValue;

/// A window onto part of a query's result set.
///
/// [`Connection::execute_for_row_window`](crate::Connection::execute_for_row_window)
/// fills the window with consecutive rows starting at
/// [`start_position`](Self::start_position), stopping when the row capacity or
/// the optional byte budget is exhausted. Cursors page through large results
/// by refilling the same window at different positions.
///
/// # Examples
///
/// ```
/// use sqlite_native_conn::RowWindow;
///
/// let window = RowWindow::new("contacts", 50).with_byte_budget(64 * 1024);
/// assert_eq!(window.name(), "contacts");
/// assert_eq!(window.num_rows(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct RowWindow {
   name: String,
   start_position: usize,
   num_columns: usize,
   rows: Vec<Vec<ColumnValue>>,
   max_rows: usize,
   max_bytes: Option<usize>,
   used_bytes: usize,
}

impl RowWindow {
   /// Creates an empty window that holds at most `max_rows` rows.
   pub fn new(name: impl Into<String>, max_rows: usize) -> Self {
      Self {
         name: name.into(),
         start_position: 0,
         num_columns: 0,
         rows: Vec::new(),
         max_rows,
         max_bytes: None,
         used_bytes: 0,
      }
   }

   /// Also stop filling once the rows occupy about `max_bytes`.
   pub fn with_byte_budget(mut self, max_bytes: usize) -> Self {
      self.max_bytes = Some(max_bytes);
      self
   }

   pub fn name(&self) -> &str {
      &self.name
   }

   /// Position in the result set of the first row in the window.
   pub fn start_position(&self) -> usize {
      self.start_position
   }

   pub fn num_rows(&self) -> usize {
      self.rows.len()
   }

   pub fn num_columns(&self) -> usize {
      self.num_columns
   }

   pub fn is_empty(&self) -> bool {
      self.rows.is_empty()
   }

   /// Row at `index` within the window (not the result set).
   pub fn row(&self, index: usize) -> Option<&[ColumnValue]> {
      self.rows.get(index).map(Vec::as_slice)
   }

   pub fn get(&self, row: usize, column: usize) -> Option<&ColumnValue> {
      self.rows.get(row).and_then(|r| r.get(column))
   }

   pub fn rows(&self) -> impl Iterator<Item = &[ColumnValue]> {
      self.rows.iter().map(Vec::as_slice)
   }

   /// True when the result-set position `position` is inside the window.
   pub fn contains_position(&self, position: usize) -> bool {
      position >= self.start_position && position < self.start_position + self.rows.len()
   }

   /// Removes every row; the start position is kept.
   pub fn clear(&mut self) {
      self.rows.clear();
      self.used_bytes = 0;
   }

   pub(crate) fn reset(&mut self, num_columns: usize) {
      self.clear();
      self.num_columns = num_columns;
   }

   pub(crate) fn set_start_position(&mut self, position: usize) {
      self.start_position = position;
   }

   /// Appends a row, handing it back when the window has no room for it.
   pub(crate) fn try_push_row(
      &mut self,
      row: Vec<ColumnValue>,
   ) -> std::result::Result<(), Vec<ColumnValue>> {
      if self.rows.len() >= self.max_rows {
         return Err(row);
      }
      let size: usize = row.iter().map(ColumnValue::footprint).sum();
      if let Some(max_bytes) = self.max_bytes
         && self.used_bytes + size > max_bytes
      {
         return Err(row);
      }
      self.used_bytes += size;
      self.rows.push(row);
      Ok(())
   }
}

impl fmt::Display for RowWindow {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.name)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn row(n: i64) -> Vec<ColumnValue> {
      vec![ColumnValue::Integer(n), ColumnValue::Text(format!("row {n}"))]
   }

   #[test]
   fn test_row_capacity() {
      let mut window = RowWindow::new("w", 2);
      window.reset(2);
      assert!(window.try_push_row(row(1)).is_ok());
      assert!(window.try_push_row(row(2)).is_ok());
      assert_eq!(window.try_push_row(row(3)), Err(row(3)));
      assert_eq!(window.num_rows(), 2);
      assert_eq!(window.get(1, 0), Some(&ColumnValue::Integer(2)));
   }

   #[test]
   fn test_byte_budget() {
      let mut window = RowWindow::new("w", 100).with_byte_budget(20);
      window.reset(1);
      assert!(window.try_push_row(vec![ColumnValue::Integer(1)]).is_ok());
      assert!(window.try_push_row(vec![ColumnValue::Integer(2)]).is_ok());
      assert!(window.try_push_row(vec![ColumnValue::Integer(3)]).is_err());

      window.clear();
      assert!(window.is_empty());
      assert!(window.try_push_row(vec![ColumnValue::Blob(vec![0; 20])]).is_ok());
   }

   #[test]
   fn test_contains_position() {
      let mut window = RowWindow::new("w", 10);
      window.reset(2);
      window.set_start_position(5);
      window.try_push_row(row(5)).unwrap();
      window.try_push_row(row(6)).unwrap();
      assert!(!window.contains_position(4));
      assert!(window.contains_position(5));
      assert!(window.contains_position(6));
      assert!(!window.contains_position(7));
   }
}
