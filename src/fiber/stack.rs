//! Suspendable execution contexts.
//!
//! This is the only module that touches the stack-switching backend
//! (`wasmtime-fiber`). The rest of the runtime drives a [`StackContext`]
//! through exactly two operations: resume into the fiber, and yield back
//! out of it. Scheduling policy lives entirely in [`crate::fiber`].

use wasmtime_fiber::{Fiber, FiberStack, Suspend};

use crate::error::Error;
use crate::Result;

/// Smallest stack we are willing to allocate. Below this, even logging from
/// the fiber body risks an overrun.
pub(crate) const MIN_STACK_SIZE: usize = 16 * 1024;

/// Stack size used when the builder does not specify one.
pub(crate) const DEFAULT_STACK_SIZE: usize = 256 * 1024;

////////////////////////////////////////////////////////////////////////////////
// StackContext
////////////////////////////////////////////////////////////////////////////////

/// An execution context holding its own stack.
///
/// The context starts suspended at the entry of `f`. Each [`resume`] call
/// transfers control into it until the body either calls
/// [`StackSuspend::yield_out`] or returns.
///
/// Dropping a context whose body was entered but has not returned does not
/// unwind the parked stack: values owned by its frames are leaked. The
/// runtime only does that when an io context is torn down with fibers still
/// suspended.
///
/// [`resume`]: StackContext::resume
pub(crate) struct StackContext {
    inner: Fiber<'static, (), (), ()>,
}

impl StackContext {
    /// Allocates a stack of (at least) `stack_size` bytes and binds `f` to
    /// it. `f` does not run yet.
    pub(crate) fn new<F>(stack_size: usize, f: F) -> Result<Self>
    where
        F: FnOnce(StackSuspend) + 'static,
    {
        let size = stack_size.max(MIN_STACK_SIZE).next_multiple_of(4096);
        let stack = FiberStack::new(size).map_err(Error::StackAllocation)?;
        let inner = Fiber::new(stack, move |(), suspend: &mut Suspend<(), (), ()>| {
            f(StackSuspend { inner: suspend })
        })
        .map_err(Error::StackAllocation)?;
        Ok(Self { inner })
    }

    /// Switches control into the context until it yields or its body
    /// returns. Returns `true` iff the body returned.
    ///
    /// Must not be called again after it returned `true`.
    pub(crate) fn resume(&self) -> bool {
        self.inner.resume(()).is_ok()
    }
}

impl std::fmt::Debug for StackContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackContext")
            .field("done", &self.inner.done())
            .finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// StackSuspend
////////////////////////////////////////////////////////////////////////////////

/// The in-context side of a [`StackContext`]: yields control back to
/// whoever resumed it.
#[derive(Clone, Copy)]
pub(crate) struct StackSuspend {
    // Borrowed from the backend for the duration of the body. A raw pointer
    // keeps `Context` free of lifetime parameters.
    inner: *mut Suspend<(), (), ()>,
}

impl StackSuspend {
    /// Transfers control back to the resumer. Returns when the context is
    /// resumed again.
    ///
    /// # Safety contract
    ///
    /// The pointee lives on the fiber's own stack for the whole body run,
    /// and `StackSuspend` never escapes the body (it is only reachable
    /// through `Context`, which user code receives by reference), so the
    /// dereference is always valid.
    pub(crate) fn yield_out(&self) {
        unsafe { (*self.inner).suspend(()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn resume_and_yield_round_trip() {
        let trace = Rc::new(RefCell::new(Vec::new()));
        let inner = trace.clone();
        let cx = StackContext::new(MIN_STACK_SIZE, move |suspend| {
            inner.borrow_mut().push("first");
            suspend.yield_out();
            inner.borrow_mut().push("second");
        })
        .unwrap();

        assert!(!cx.resume());
        trace.borrow_mut().push("between");
        assert!(cx.resume());
        assert_eq!(*trace.borrow(), vec!["first", "between", "second"]);
    }

    #[test]
    fn never_started_context_can_be_dropped() {
        let cx = StackContext::new(MIN_STACK_SIZE, |_suspend| {
            unreachable!("body must not run");
        })
        .unwrap();
        drop(cx);
    }

    #[test]
    fn stack_size_is_clamped() {
        // A degenerate request still yields a usable stack.
        let cx = StackContext::new(1, |_suspend| {}).unwrap();
        assert!(cx.resume());
    }
}
