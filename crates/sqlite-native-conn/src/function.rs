//! Custom scalar SQL functions registered on every connection.

use std::fmt;
use std::sync::Arc;

use crate::Result;
use crate::connection::Connection;

type Callback = dyn Fn(&FunctionCall<'_>) -> Result<Option<String>> + Send + Sync;

/// A scalar SQL function backed by a Rust closure.
///
/// Arguments arrive as text (`None` for SQL `NULL`) and the returned text, if
/// any, becomes the function's result. An `Err` is reported to SQLite as an
/// error raised by the function, which fails the statement that invoked it.
///
/// Two descriptors are the same function only when they share the same
/// callback allocation, so cloning a descriptor keeps its identity. This is
/// what [`Connection::reconfigure`](crate::Connection::reconfigure) uses to
/// skip functions that are already registered.
#[derive(Clone)]
pub struct CustomFunction {
   name: String,
   num_args: i32,
   callback: Arc<Callback>,
}

impl CustomFunction {
   /// Creates a function descriptor. `num_args` of `-1` accepts any number of
   /// arguments.
   pub fn new<F>(name: impl Into<String>, num_args: i32, callback: F) -> Self
   where
      F: Fn(&FunctionCall<'_>) -> Result<Option<String>> + Send + Sync + 'static,
   {
      Self {
         name: name.into(),
         num_args,
         callback: Arc::new(callback),
      }
   }

   pub fn name(&self) -> &str {
      &self.name
   }

   pub fn num_args(&self) -> i32 {
      self.num_args
   }

   pub(crate) fn invoke(&self, call: &FunctionCall<'_>) -> Result<Option<String>> {
      (self.callback)(call)
   }
}

impl PartialEq for CustomFunction {
   fn eq(&self, other: &Self) -> bool {
      self.name == other.name
         && self.num_args == other.num_args
         && Arc::ptr_eq(&self.callback, &other.callback)
   }
}

impl fmt::Debug for CustomFunction {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("CustomFunction")
         .field("name", &self.name)
         .field("num_args", &self.num_args)
         .finish_non_exhaustive()
   }
}

/// One invocation of a [`CustomFunction`].
pub struct FunctionCall<'a> {
   args: &'a [Option<String>],
   connection: Option<&'a Connection>,
}

impl<'a> FunctionCall<'a> {
   pub(crate) fn new(args: &'a [Option<String>], connection: Option<&'a Connection>) -> Self {
      Self { args, connection }
   }

   /// Arguments as text, `None` for SQL `NULL`.
   pub fn args(&self) -> &[Option<String>] {
      self.args
   }

   /// Argument at `index` as text, `None` when `NULL` or out of range.
   pub fn arg(&self, index: usize) -> Option<&str> {
      self.args.get(index).and_then(|arg| arg.as_deref())
   }

   /// The connection executing the statement that invoked this function.
   ///
   /// Queries issued through it run reentrantly, nested inside the statement
   /// that is still executing. `None` when the engine invoked the function
   /// outside of one of the connection's own operations.
   pub fn connection(&self) -> Option<&'a Connection> {
      self.connection
   }
}
