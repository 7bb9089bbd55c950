//! Cooperative cancellation.
//!
//! Every public operation accepts a [`CancelToken`]. The token is checked
//! before each database round-trip and at every batch boundary inside
//! in-memory scoring loops; there are no implicit timeouts — callers encode
//! deadlines in the token itself via [`CancelToken::with_deadline`].
//!
//! Cancellation is cooperative: a fired token makes the *next* check return
//! [`Error::Cancelled`]. Transactions that already committed stay committed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::error::{Error, Result};

/// A cheaply clonable cancellation handle.
///
/// Cloning shares the underlying flag, so cancelling any clone cancels all
/// of them. The default token never fires.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// A token that never fires unless [`cancel`](Self::cancel) is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that additionally fires once `deadline` has passed.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(deadline),
        }
    }

    /// Trip the token. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether the token has fired (explicitly or by deadline).
    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::Acquire) {
            return true;
        }
        match self.deadline {
            Some(d) => Instant::now() >= d,
            None => false,
        }
    }

    /// Return `Err(Cancelled)` tagged with `op` if the token has fired.
    pub fn check(&self, op: &'static str) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled { op })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fresh_token_passes() {
        let t = CancelToken::new();
        assert!(t.check("search").is_ok());
    }

    #[test]
    fn test_cancel_propagates_to_clones() {
        let t = CancelToken::new();
        let c = t.clone();
        t.cancel();
        let err = c.check("upsert").unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.op(), "upsert");
    }

    #[test]
    fn test_deadline_in_past_fires() {
        let t = CancelToken::with_deadline(Instant::now() - Duration::from_millis(1));
        assert!(t.is_cancelled());
    }
}
