//! Completion queue boundary and work completions.

mod wc;

use std::io;
use std::time::Duration;

pub use self::wc::*;

/// Which completions should raise the next notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyMode {
    /// Any completion.
    NextCompletion,
    /// Only solicited completions.
    Solicited,
}

/// Outcome of blocking on a completion channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqWait {
    /// A notification arrived, or the waiter was woken.
    Notified,
    /// The timeout elapsed first.
    TimedOut,
}

/// A transport completion queue with its notification channel.
///
/// Implementations must let [`wait`](Self::wait) return early when
/// [`wake`](Self::wake) is called from another thread. Both a notification
/// that arrives after [`arm`](Self::arm) and a `wake` must be latched until
/// the next `wait` consumes them.
pub trait CompletionQueue: Send + Sync {
    /// Non-blockingly poll one completion.
    fn poll_one(&self) -> io::Result<Option<Wc>>;

    /// Request a notification for the next completion.
    fn arm(&self, mode: NotifyMode) -> io::Result<()>;

    /// Block until notified, woken or timed out. `None` waits forever.
    fn wait(&self, timeout: Option<Duration>) -> io::Result<CqWait>;

    /// Wake a thread blocked in [`wait`](Self::wait).
    fn wake(&self);

    /// Number of entries the queue holds.
    fn depth(&self) -> usize;

    /// Grow the queue to at least `depth` entries. Return the actual depth.
    fn resize(&self, depth: usize) -> io::Result<usize>;

    /// Poll up to `n` completions.
    fn poll_some(&self, n: usize) -> io::Result<Vec<Wc>> {
        let mut wcs = Vec::with_capacity(n);
        while wcs.len() < n {
            match self.poll_one()? {
                Some(wc) => wcs.push(wc),
                None => break,
            }
        }
        Ok(wcs)
    }
}
