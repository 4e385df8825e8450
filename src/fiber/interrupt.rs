//! Deferred interruption: scoped delivery toggles.
//!
//! [`JoinHandle::interrupt`] never stops a fiber in its tracks. It records
//! a request, which the runtime converts into an [`Interrupted`] result at
//! the fiber's next suspension point, and only while delivery is enabled.
//! This mirrors the POSIX deferred-cancellation model: between suspension
//! points the fiber is in full control of its own consistency.
//!
//! The guards here nest freely and restore the exact prior state when they
//! go out of scope, including during a panic unwind:
//!
//! ```no_run
//! # fibrio::fiber::spawn(&fibrio::IoContext::new(), |cx| {
//! let disabled = cx.disable_interruption();
//! cx.yield_now()?; // a pending request stays queued
//! {
//!     let _restored = cx.restore_interruption(&disabled);
//!     cx.yield_now()?; // delivery is possible again in here
//! }
//! cx.yield_now()?; // queued again
//! drop(disabled);
//! # Ok::<_, fibrio::Interrupted>(())
//! # }).detach();
//! ```
//!
//! [`JoinHandle::interrupt`]: super::JoinHandle::interrupt
//! [`Interrupted`]: crate::Interrupted

use std::marker::PhantomData;
use std::rc::Rc;

use super::{Context, Fcb};

impl Context {
    /// Defers interruption delivery until the returned guard is dropped.
    ///
    /// While any disable scope is active, suspension points complete
    /// normally and a pending request stays queued; it fires at the first
    /// eligible suspension point after the last scope closes. Suspension
    /// itself is still allowed (contrast with
    /// [`forbid_suspend`](Context::forbid_suspend)).
    pub fn disable_interruption(&self) -> InterruptionDisabler {
        let fcb = self.fcb.clone();
        let prior_depth = fcb.disable_depth.get();
        fcb.disable_depth.set(prior_depth + 1);
        InterruptionDisabler { fcb, prior_depth }
    }

    /// Within a disable scope, re-establishes the delivery state that was
    /// current *before* `scope` was created, until the returned guard is
    /// dropped.
    pub fn restore_interruption<'d>(
        &self,
        scope: &'d InterruptionDisabler,
    ) -> InterruptionRestorer<'d> {
        debug_assert!(
            Rc::ptr_eq(&self.fcb, &scope.fcb),
            "restore_interruption with a foreign fiber's disabler",
        );
        let fcb = self.fcb.clone();
        let saved_depth = fcb.disable_depth.get();
        fcb.disable_depth.set(scope.prior_depth);
        InterruptionRestorer {
            fcb,
            saved_depth,
            _scope: PhantomData,
        }
    }

    /// `true` iff an interruption would currently be delivered at a
    /// suspension point.
    pub fn interruption_enabled(&self) -> bool {
        self.fcb.disable_depth.get() == 0
    }

    /// `true` iff an interruption request is pending for this fiber.
    ///
    /// The request is consumed when it is delivered; checking it here does
    /// not consume it.
    pub fn interruption_requested(&self) -> bool {
        self.fcb.interrupt_requested.get()
    }
}

////////////////////////////////////////////////////////////////////////////////
// InterruptionDisabler
////////////////////////////////////////////////////////////////////////////////

/// Scope guard deferring interruption delivery; see
/// [`Context::disable_interruption`].
pub struct InterruptionDisabler {
    fcb: Rc<Fcb>,
    prior_depth: u32,
}

impl Drop for InterruptionDisabler {
    fn drop(&mut self) {
        // Restore rather than decrement, so the state is exact even if an
        // unwind tore scopes down in an unusual order.
        self.fcb.disable_depth.set(self.prior_depth);
    }
}

impl_debug_stub! {InterruptionDisabler}

////////////////////////////////////////////////////////////////////////////////
// InterruptionRestorer
////////////////////////////////////////////////////////////////////////////////

/// Scope guard re-enabling delivery inside a disable scope; see
/// [`Context::restore_interruption`].
pub struct InterruptionRestorer<'d> {
    fcb: Rc<Fcb>,
    saved_depth: u32,
    _scope: PhantomData<&'d InterruptionDisabler>,
}

impl Drop for InterruptionRestorer<'_> {
    fn drop(&mut self) {
        self.fcb.disable_depth.set(self.saved_depth);
    }
}

impl std::fmt::Debug for InterruptionRestorer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("InterruptionRestorer").finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// tests
////////////////////////////////////////////////////////////////////////////////
