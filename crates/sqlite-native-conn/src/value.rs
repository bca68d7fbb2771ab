//! Bound argument and column value types.

use std::fmt;

/// A positional argument bound to a prepared statement.
///
/// Booleans are bound as the integers `0` and `1`. Anything else that only has
/// a textual form can be bound through [`BindArg::display`].
#[derive(Debug, Clone, PartialEq)]
pub enum BindArg {
   Null,
   Integer(i64),
   Float(f64),
   Blob(Vec<u8>),
   Bool(bool),
   Text(String),
}

impl BindArg {
   /// Binds the textual representation of `value`.
   pub fn display(value: impl fmt::Display) -> Self {
      BindArg::Text(value.to_string())
   }

   /// Returns true if this argument is null.
   pub fn is_null(&self) -> bool {
      matches!(self, BindArg::Null)
   }

   /// Copy suitable for keeping in diagnostics: blobs are replaced by an empty
   /// blob so large payloads are not retained after the operation.
   pub(crate) fn redacted(&self) -> Self {
      match self {
         BindArg::Blob(_) => BindArg::Blob(Vec::new()),
         other => other.clone(),
      }
   }
}

impl fmt::Display for BindArg {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         BindArg::Null => f.write_str("null"),
         BindArg::Integer(i) => write!(f, "{i}"),
         BindArg::Float(r) => write!(f, "{r}"),
         BindArg::Blob(_) => f.write_str("<blob>"),
         BindArg::Bool(b) => write!(f, "{b}"),
         BindArg::Text(s) => write!(f, "\"{s}\""),
      }
   }
}

macro_rules! bind_arg_from_integer {
   ($($ty:ty),*) => {
      $(
         impl From<$ty> for BindArg {
            fn from(value: $ty) -> Self {
               BindArg::Integer(i64::from(value))
            }
         }
      )*
   };
}

bind_arg_from_integer!(i8, i16, i32, i64, u8, u16, u32);

impl From<f32> for BindArg {
   fn from(value: f32) -> Self {
      BindArg::Float(f64::from(value))
   }
}

impl From<f64> for BindArg {
   fn from(value: f64) -> Self {
      BindArg::Float(value)
   }
}

impl From<bool> for BindArg {
   fn from(value: bool) -> Self {
      BindArg::Bool(value)
   }
}

impl From<&str> for BindArg {
   fn from(value: &str) -> Self {
      BindArg::Text(value.to_string())
   }
}

impl From<String> for BindArg {
   fn from(value: String) -> Self {
      BindArg::Text(value)
   }
}

impl From<Vec<u8>> for BindArg {
   fn from(value: Vec<u8>) -> Self {
      BindArg::Blob(value)
   }
}

impl From<&[u8]> for BindArg {
   fn from(value: &[u8]) -> Self {
      BindArg::Blob(value.to_vec())
   }
}

impl<T> From<Option<T>> for BindArg
where
   T: Into<BindArg>,
{
   fn from(value: Option<T>) -> Self {
      value.map_or(BindArg::Null, Into::into)
   }
}

/// Typed column value from SQLite.
///
/// Represents a single cell of a [`RowWindow`](crate::RowWindow) with its
/// native SQLite storage class.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
   Null,
   Integer(i64),
   Real(f64),
   Text(String),
   Blob(Vec<u8>),
}

impl ColumnValue {
   /// Returns true if this value is null.
   pub fn is_null(&self) -> bool {
      matches!(self, ColumnValue::Null)
   }

   /// Attempts to get this value as an integer.
   pub fn as_integer(&self) -> Option<i64> {
      match self {
         ColumnValue::Integer(i) => Some(*i),
         _ => None,
      }
   }

   /// Attempts to get this value as a float.
   pub fn as_real(&self) -> Option<f64> {
      match self {
         ColumnValue::Real(r) => Some(*r),
         _ => None,
      }
   }

   /// Attempts to get this value as a string reference.
   pub fn as_text(&self) -> Option<&str> {
      match self {
         ColumnValue::Text(s) => Some(s),
         _ => None,
      }
   }

   /// Attempts to get this value as a blob reference.
   pub fn as_blob(&self) -> Option<&[u8]> {
      match self {
         ColumnValue::Blob(b) => Some(b),
         _ => None,
      }
   }

   /// Approximate number of bytes this value occupies in a row window.
   pub(crate) fn footprint(&self) -> usize {
      match self {
         ColumnValue::Null => 0,
         ColumnValue::Integer(_) | ColumnValue::Real(_) => 8,
         ColumnValue::Text(s) => s.len() + 1,
         ColumnValue::Blob(b) => b.len(),
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_conversions() {
      assert_eq!(BindArg::from(7_i32), BindArg::Integer(7));
      assert_eq!(BindArg::from(7_u8), BindArg::Integer(7));
      assert_eq!(BindArg::from(1.5_f32), BindArg::Float(1.5));
      assert_eq!(BindArg::from(true), BindArg::Bool(true));
      assert_eq!(BindArg::from("x"), BindArg::Text("x".into()));
      assert_eq!(BindArg::from(None::<i64>), BindArg::Null);
      assert_eq!(BindArg::from(Some("y")), BindArg::Text("y".into()));
      assert_eq!(BindArg::display(42_u64), BindArg::Text("42".into()));
   }

   #[test]
   fn test_redacted_drops_blob_contents() {
      let arg = BindArg::Blob(vec![1; 4096]);
      assert_eq!(arg.redacted(), BindArg::Blob(Vec::new()));
      assert_eq!(BindArg::Integer(3).redacted(), BindArg::Integer(3));
   }

   #[test]
   fn test_display_for_diagnostics() {
      assert_eq!(BindArg::Null.to_string(), "null");
      assert_eq!(BindArg::Text("a".into()).to_string(), "\"a\"");
      assert_eq!(BindArg::Blob(vec![1, 2]).to_string(), "<blob>");
      assert_eq!(BindArg::Integer(-4).to_string(), "-4");
   }

   #[test]
   fn test_column_value_accessors() {
      assert!(ColumnValue::Null.is_null());
      assert_eq!(ColumnValue::Integer(3).as_integer(), Some(3));
      assert_eq!(ColumnValue::Real(0.5).as_real(), Some(0.5));
      assert_eq!(ColumnValue::Text("t".into()).as_text(), Some("t"));
      assert_eq!(ColumnValue::Blob(vec![9]).as_blob(), Some(&[9_u8][..]));
      assert_eq!(ColumnValue::Integer(3).as_text(), None);
   }
}
