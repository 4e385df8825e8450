//! Stackful fibers on top of a serializing executor.
//!
//! This library contains:
//!
//! - [Fibers: spawn, join, detach, deferred interruption](fiber)
//! - [The executor substrate: io context and strands](executor)
//! - [Fiber-aware synchronization: mutex, no-suspend borrows](fiber)
//! - [Deadline timers and sleep](time)
//! - [Error handling](error)
//!
//! A fiber is a cooperatively scheduled thread of control with its own
//! stack. Fibers are bound to a [`Strand`], a serializing executor on top
//! of an [`IoContext`], and suspend by returning control to it: a yield,
//! a timer wait or a contended mutex all go through the same suspension
//! protocol, and all of them deliver deferred [interruption](fiber::interrupt)
//! requests.
//!
//! ```
//! use fibrio::{fiber, IoContext};
//!
//! let ctx = IoContext::new();
//! let mut handle = fiber::spawn(&ctx, |cx| {
//!     cx.yield_now()?;
//!     Ok(42)
//! });
//! ctx.run();
//! assert_eq!(handle.try_join(), Some(Some(42)));
//! ```
//!
//! The runtime is single-threaded: an `IoContext` and everything created
//! from it stay on the thread that runs the event loop. Fibers on one
//! strand never overlap; fibers on different strands interleave through
//! the context's queue.
//!
//! Logging goes through the [`log`](https://docs.rs/log/) facade; install
//! any logger implementation to see fiber lifecycle diagnostics.

pub mod error;
pub mod executor;
pub mod fiber;
pub mod time;

pub use error::{Error, Interrupted};
pub use executor::{context_aborted, IoContext, Strand};

pub use error::Result;
pub type StdResult<T, E> = std::result::Result<T, E>;
