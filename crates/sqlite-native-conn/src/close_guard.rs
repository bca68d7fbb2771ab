//! Detection of connections that are dropped without being closed.

use tracing::warn;

/// Remembers that a resource must be closed explicitly.
///
/// Armed when the resource is acquired and disarmed by [`close`](Self::close).
/// A guard that is still armed when the owner is disposed by `Drop` reports a
/// leak. The check only runs in debug builds.
#[derive(Debug)]
pub(crate) struct CloseGuard {
   resource: Option<String>,
}

impl CloseGuard {
   pub(crate) fn armed(resource: impl Into<String>) -> Self {
      Self {
         resource: cfg!(debug_assertions).then(|| resource.into()),
      }
   }

   #[cfg(test)]
   pub(crate) fn is_armed(&self) -> bool {
      self.resource.is_some()
   }

   pub(crate) fn close(&mut self) {
      self.resource = None;
   }

   pub(crate) fn warn_if_open(&self) {
      if let Some(resource) = &self.resource {
         warn!(
            resource = %resource,
            "A connection was leaked. Call close() on every connection when it is no longer needed."
         );
      }
   }
}
