//! Guards enforcing that no suspension happens in a lexical region.
//!
//! Data private to one strand needs no locking as long as no suspension
//! point executes in the middle of an access sequence. [`NoSuspendRef`]
//! encodes that contract at the borrow site: while the guard holds a
//! reference, any attempted suspension by the owning fiber is a programming
//! error. [`NoSuspendGuard`] is the bare form of the same contract, with no
//! reference attached.
//!
//! The check is a runtime counter inspected at every suspension entry: the
//! violation is logged and, in debug builds, aborts the offending call with
//! a panic.

use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use super::{Context, Fcb};

impl Context {
    /// Forbids suspension until the returned guard is dropped.
    ///
    /// Nests: suspension stays forbidden while any guard is alive.
    /// Operations that merely *may* suspend are still allowed on their
    /// non-suspending path, e.g. locking an uncontended [`Mutex`].
    ///
    /// [`Mutex`]: super::Mutex
    pub fn forbid_suspend(&self) -> NoSuspendGuard {
        NoSuspendGuard::new(self)
    }
}

fn enter_no_suspend(fcb: &Rc<Fcb>) {
    fcb.no_suspend_depth.set(fcb.no_suspend_depth.get() + 1);
}

fn leave_no_suspend(fcb: &Rc<Fcb>) {
    let depth = fcb.no_suspend_depth.get();
    debug_assert!(depth > 0, "no-suspend depth underflow");
    fcb.no_suspend_depth.set(depth.saturating_sub(1));
}

////////////////////////////////////////////////////////////////////////////////
// NoSuspendGuard
////////////////////////////////////////////////////////////////////////////////

/// Scope guard marking a region in which the fiber must not suspend.
///
/// See [`Context::forbid_suspend`].
pub struct NoSuspendGuard {
    fcb: Rc<Fcb>,
}

impl NoSuspendGuard {
    fn new(cx: &Context) -> Self {
        let fcb = cx.fcb.clone();
        enter_no_suspend(&fcb);
        Self { fcb }
    }
}

impl Drop for NoSuspendGuard {
    fn drop(&mut self) {
        leave_no_suspend(&self.fcb);
    }
}

impl_debug_stub! {NoSuspendGuard}

////////////////////////////////////////////////////////////////////////////////
// NoSuspendRef
////////////////////////////////////////////////////////////////////////////////

/// A borrow pinned to the fiber's strand: while it is held, the owning
/// fiber must not suspend, so no other fiber on the strand can observe the
/// borrowed value mid-update.
///
/// The guard is deliberately neither `Clone` nor `Copy`; dropping it (or
/// calling [`release`](Self::release)) ends the no-suspend region.
///
/// # Example
///
/// ```no_run
/// # use fibrio::fiber::NoSuspendRef;
/// # fibrio::fiber::spawn(&fibrio::IoContext::new(), |cx| {
/// let mut counters = vec![0u64; 4];
/// let mut excl = NoSuspendRef::new(&mut counters, cx);
/// (*excl)[0] += 1; // no suspension can interleave with these updates
/// (*excl)[1] += 1;
/// excl.release();
/// cx.yield_now()?; // fine again
/// # Ok::<_, fibrio::Interrupted>(())
/// # }).detach();
/// ```
pub struct NoSuspendRef<'a, T: ?Sized> {
    value: Option<&'a mut T>,
    fcb: Rc<Fcb>,
}

impl<'a, T: ?Sized> NoSuspendRef<'a, T> {
    /// Binds `value` to the calling fiber and forbids suspension while the
    /// borrow is held.
    pub fn new(value: &'a mut T, cx: &Context) -> Self {
        let fcb = cx.fcb.clone();
        enter_no_suspend(&fcb);
        Self {
            value: Some(value),
            fcb,
        }
    }

    /// Drops the borrow and allows suspension again (one nesting level).
    /// Dereferencing after `release` is a contract violation and panics.
    pub fn release(&mut self) {
        if self.value.take().is_some() {
            leave_no_suspend(&self.fcb);
        }
    }

    /// (Re)acquires a borrow. If none was held, suspension is forbidden
    /// again from this point.
    pub fn reset(&mut self, value: &'a mut T) {
        if self.value.is_none() {
            enter_no_suspend(&self.fcb);
        }
        self.value = Some(value);
    }

    /// `true` while a borrow is held.
    pub fn holds(&self) -> bool {
        self.value.is_some()
    }
}

impl<T: ?Sized> Deref for NoSuspendRef<'_, T> {
    type Target = T;

    #[track_caller]
    fn deref(&self) -> &T {
        self.value
            .as_deref()
            .expect("strand-exclusive borrow used after release")
    }
}

impl<T: ?Sized> DerefMut for NoSuspendRef<'_, T> {
    #[track_caller]
    fn deref_mut(&mut self) -> &mut T {
        self.value
            .as_deref_mut()
            .expect("strand-exclusive borrow used after release")
    }
}

impl<T: ?Sized> Drop for NoSuspendRef<'_, T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T: ?Sized + std::fmt::Debug> std::fmt::Debug for NoSuspendRef<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.value {
            Some(value) => value.fmt(f),
            None => f.write_str("<released>"),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// tests
////////////////////////////////////////////////////////////////////////////////
