//! Error handling utils.
//!
//! Operation errors (everything the asynchronous substrate can report) are
//! represented by [`Error`] and travel by value: a suspending operation
//! returns them in the *inner* result of its completion, so the caller
//! decides locally whether to handle or propagate them.
//!
//! Interruption is deliberately **not** a variant of [`Error`]. It has its
//! own type, [`Interrupted`], which does not implement
//! [`std::error::Error`], so it cannot leak through `#[from]` conversions or
//! catch-all error handlers. The only way to swallow an interruption is to
//! match on it explicitly.

use std::fmt;
use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////
// Error
////////////////////////////////////////////////////////////////////////////////

/// Represents all operation error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The asynchronous operation was cancelled before it completed, e.g. by
    /// [`Timer::cancel`].
    ///
    /// When the cancellation was provoked by an interruption request the
    /// runtime reports [`Interrupted`] at the resume site instead, so user
    /// code only ever observes `Cancelled` for genuine external
    /// cancellations.
    ///
    /// [`Timer::cancel`]: crate::time::Timer::cancel
    #[error("operation cancelled")]
    Cancelled,

    /// The operating system refused to allocate a fiber stack.
    #[error("failed to allocate fiber stack: {0}")]
    StackAllocation(io::Error),

    #[error("io error: {0}")]
    IO(#[from] io::Error),
}

impl Error {
    /// `true` iff the error is [`Error::Cancelled`].
    #[inline(always)]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Interrupted
////////////////////////////////////////////////////////////////////////////////

/// Raised at a suspension point when the fiber has a pending interruption
/// request and interruption delivery is enabled.
///
/// Propagating this out of the fiber's start function (the `?` operator does
/// it) is the normal way for an interrupted fiber to terminate; the joiner
/// observes it through [`JoinHandle::interruption_caught`]. Catching it is
/// also fine: the fiber then keeps running and simply reports a normal
/// termination, unless a later suspension point raises again.
///
/// `Interrupted` intentionally does not implement [`std::error::Error`]; see
/// the module docs.
///
/// [`JoinHandle::interruption_caught`]: crate::fiber::JoinHandle::interruption_caught
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("fiber interrupted")
    }
}
