//! Cooperative cancellation of running statements.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::{Error, Result};

/// Receives the cancellation of a [`CancellationToken`].
///
/// Called at most once per token, on whichever thread cancels it, so
/// implementations must be cheap and must not block.
pub trait OnCancel: Send + Sync {
   fn on_cancel(&self);
}

struct Inner {
   cancelled: AtomicBool,
   notified: AtomicBool,
   listener: Mutex<Option<Arc<dyn OnCancel>>>,
}

/// Handle used to abort an operation from another thread.
///
/// Clones share state: cancelling any clone cancels them all. Passing a token
/// to an execute method makes the statement check it before it starts and
/// periodically while it runs; a cancelled statement fails with
/// [`Error::Cancelled`].
///
/// # Examples
///
/// ```
/// use sqlite_native_conn::CancellationToken;
///
/// let token = CancellationToken::new();
/// let remote = token.clone();
/// remote.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Clone)]
pub struct CancellationToken {
   inner: Arc<Inner>,
}

impl CancellationToken {
   pub fn new() -> Self {
      Self {
         inner: Arc::new(Inner {
            cancelled: AtomicBool::new(false),
            notified: AtomicBool::new(false),
            listener: Mutex::new(None),
         }),
      }
   }

   /// Cancels the token. Only the first call notifies the listener.
   pub fn cancel(&self) {
      if self
         .inner
         .cancelled
         .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
         .is_err()
      {
         return;
      }
      self.notify();
   }

   pub fn is_cancelled(&self) -> bool {
      self.inner.cancelled.load(Ordering::Acquire)
   }

   /// Fails with [`Error::Cancelled`] once the token has been cancelled.
   pub fn check_cancelled(&self) -> Result<()> {
      if self.is_cancelled() {
         Err(Error::Cancelled)
      } else {
         Ok(())
      }
   }

   /// Replaces the listener. A listener installed after cancellation is
   /// notified immediately, unless an earlier listener already was.
   ///
   /// Listeners may call back into the token; no lock is held while they run.
   pub fn set_listener(&self, listener: Option<Arc<dyn OnCancel>>) {
      *self.inner.listener.lock() = listener;
      if self.is_cancelled() {
         self.notify();
      }
   }

   // Both `cancel` and `set_listener` may get here for the same cancellation;
   // the `notified` flag lets only one of them through.
   fn notify(&self) {
      let Some(listener) = self.inner.listener.lock().clone() else {
         return;
      };
      if self
         .inner
         .notified
         .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
         .is_ok()
      {
         listener.on_cancel();
      }
   }
}

impl Default for CancellationToken {
   fn default() -> Self {
      Self::new()
   }
}

impl fmt::Debug for CancellationToken {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("CancellationToken")
         .field("cancelled", &self.is_cancelled())
         .finish_non_exhaustive()
   }
}

#[cfg(test)]
mod tests {
   use std::sync::atomic::AtomicUsize;

   use super::*;

   #[derive(Default)]
   struct Counter(AtomicUsize);

   impl OnCancel for Counter {
      fn on_cancel(&self) {
         self.0.fetch_add(1, Ordering::SeqCst);
      }
   }

   #[test]
   fn test_listener_fires_once() {
      let token = CancellationToken::new();
      let counter = Arc::new(Counter::default());
      token.set_listener(Some(counter.clone()));

      token.cancel();
      token.cancel();
      assert_eq!(counter.0.load(Ordering::SeqCst), 1);
      assert!(matches!(token.check_cancelled(), Err(Error::Cancelled)));
   }

   #[test]
   fn test_late_listener_is_notified() {
      let token = CancellationToken::new();
      token.cancel();

      let counter = Arc::new(Counter::default());
      token.set_listener(Some(counter.clone()));
      assert_eq!(counter.0.load(Ordering::SeqCst), 1);
   }

   #[test]
   fn test_removed_listener_is_not_notified() {
      let token = CancellationToken::new();
      let counter = Arc::new(Counter::default());
      token.set_listener(Some(counter.clone()));
      token.set_listener(None);
      token.cancel();
      assert_eq!(counter.0.load(Ordering::SeqCst), 0);
      assert!(token.check_cancelled().is_err());
   }

   #[test]
   fn test_cancel_from_another_thread() {
      let token = CancellationToken::new();
      let remote = token.clone();
      std::thread::spawn(move || remote.cancel()).join().unwrap();
      assert!(token.is_cancelled());
   }

   struct Detaching {
      token: CancellationToken,
      calls: AtomicUsize,
   }

   impl OnCancel for Detaching {
      fn on_cancel(&self) {
         self.calls.fetch_add(1, Ordering::SeqCst);
         self.token.set_listener(None);
      }
   }

   #[test]
   fn test_listener_may_detach_itself() {
      let token = CancellationToken::new();
      let listener = Arc::new(Detaching {
         token: token.clone(),
         calls: AtomicUsize::new(0),
      });
      token.set_listener(Some(listener.clone()));

      token.cancel();
      assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
      assert!(token.inner.listener.lock().is_none());
   }

   #[test]
   fn test_concurrent_cancel_and_set_listener_notify_once() {
      for _ in 0..200 {
         let token = CancellationToken::new();
         let counter = Arc::new(Counter::default());
         let remote = token.clone();

         let canceller = std::thread::spawn(move || remote.cancel());
         token.set_listener(Some(counter.clone()));
         canceller.join().unwrap();

         assert_eq!(counter.0.load(Ordering::SeqCst), 1);
      }
   }
}
