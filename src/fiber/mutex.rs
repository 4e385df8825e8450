//! Fiber-aware mutual exclusion within a single strand.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};

use crate::executor::Strand;
use crate::fiber::{Context, FiberId, Resumer};

////////////////////////////////////////////////////////////////////////////////
// Mutex
////////////////////////////////////////////////////////////////////////////////

/// A mutual exclusion primitive for fibers sharing one [`Strand`], owning
/// the data it protects.
///
/// Strands already serialize handlers, so a mutex is only needed when a
/// critical section spans a suspension point: without it, another fiber on
/// the strand could run in the gap and observe (or corrupt) intermediate
/// state. For suspension-free access sequences, prefer
/// [`NoSuspendRef`](super::NoSuspendRef), which asserts instead of locking.
///
/// Waiters are queued and woken in strict FIFO order. Both the mutex and
/// every fiber locking it must live on the strand given at construction;
/// cross-strand use is not supported.
///
/// # Example
///
/// ```no_run
/// use std::rc::Rc;
/// use fibrio::fiber::{self, Mutex};
/// use fibrio::IoContext;
///
/// let ctx = IoContext::new();
/// let strand = ctx.make_strand();
/// let shared = Rc::new(Mutex::new(&strand, Vec::new()));
/// for i in 0..3 {
///     let shared = shared.clone();
///     fiber::spawn(&strand, move |cx| {
///         shared.lock(cx).push(i);
///         Ok::<_, fibrio::Interrupted>(())
///     })
///     .detach();
/// }
/// ctx.run();
/// ```
pub struct Mutex<T: ?Sized> {
    strand: Strand,
    locked: Cell<bool>,
    owner: Cell<Option<FiberId>>,
    waiters: RefCell<VecDeque<Resumer<()>>>,
    data: UnsafeCell<T>,
}

impl<T> Mutex<T> {
    /// Creates a new mutex in an unlocked state, bound to `strand`.
    pub fn new(strand: &Strand, t: T) -> Mutex<T> {
        Mutex {
            strand: strand.clone(),
            locked: Cell::new(false),
            owner: Cell::new(None),
            waiters: RefCell::new(VecDeque::new()),
            data: UnsafeCell::new(t),
        }
    }

    /// Consumes this mutex, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquires the mutex, suspending the calling fiber until it is able to
    /// do so. Returns a RAII guard; the mutex unlocks when the guard goes
    /// out of scope.
    ///
    /// An uncontended acquisition completes synchronously, without going
    /// through the strand queue. A contended one suspends in a FIFO wait
    /// queue; when the holder unlocks, ownership passes to the oldest
    /// waiter before it resumes.
    ///
    /// Locking is *not* an interruption point: delivery is deferred for the
    /// duration of the call, so `lock` never raises and a half-acquired
    /// state cannot arise. A pending request fires at the next eligible
    /// suspension point after the lock is held.
    ///
    /// Locking a mutex the calling fiber already holds deadlocks; debug
    /// builds abort instead.
    #[track_caller]
    pub fn lock(&self, cx: &Context) -> MutexGuard<'_, T> {
        debug_assert!(
            *cx.strand() == self.strand,
            "mutex locked from a foreign strand",
        );
        if !self.locked.get() {
            self.locked.set(true);
            self.owner.set(Some(cx.id()));
            return MutexGuard {
                lock: self,
                fiber: cx.id(),
            };
        }

        debug_assert!(
            self.owner.get() != Some(cx.id()),
            "deadlock: fiber relocked a mutex it already holds",
        );

        // Defer interruption so the wait cannot raise out of `lock` and
        // strand a half-acquired state.
        let _deferred = cx.disable_interruption();
        let wait = cx.suspend(|resumer| self.waiters.borrow_mut().push_back(resumer));
        debug_assert!(wait.is_ok(), "mutex wait raised an interruption");
        let _ = wait;
        // Ownership was transferred by the unlocking fiber.
        debug_assert!(self.locked.get());
        debug_assert_eq!(self.owner.get(), Some(cx.id()), "woken without ownership");
        MutexGuard {
            lock: self,
            fiber: cx.id(),
        }
    }

    /// Attempts to acquire this lock without suspending. Returns `None` if
    /// the mutex is held by another fiber.
    #[track_caller]
    pub fn try_lock(&self, cx: &Context) -> Option<MutexGuard<'_, T>> {
        debug_assert!(
            *cx.strand() == self.strand,
            "mutex locked from a foreign strand",
        );
        if self.locked.get() {
            return None;
        }
        self.locked.set(true);
        self.owner.set(Some(cx.id()));
        Some(MutexGuard {
            lock: self,
            fiber: cx.id(),
        })
    }

    /// Immediately drops the guard, and consequently unlocks the mutex.
    ///
    /// This function is equivalent to calling [`drop`] on the guard but is
    /// more self-documenting.
    pub fn unlock(guard: MutexGuard<'_, T>) {
        drop(guard);
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// Since this call borrows the `Mutex` mutably, no actual locking needs
    /// to take place -- the mutable borrow statically guarantees no guards
    /// exist.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// The strand this mutex (and every fiber locking it) is bound to.
    pub fn strand(&self) -> &Strand {
        &self.strand
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Mutex");
        if self.locked.get() {
            d.field("owner", &self.owner.get());
        } else {
            // No guard can exist, the data is safe to show.
            d.field("data", unsafe { &&*self.data.get() });
        }
        d.finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// MutexGuard
////////////////////////////////////////////////////////////////////////////////

/// An RAII scoped lock of a [`Mutex`]. The protected data is accessible
/// through the guard's [`Deref`] and [`DerefMut`] implementations.
pub struct MutexGuard<'a, T: ?Sized + 'a> {
    lock: &'a Mutex<T>,
    fiber: FiberId,
}

impl<'a, T: ?Sized + 'a> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        let lock = self.lock;
        debug_assert!(lock.strand.is_running(), "mutex unlocked off its strand");
        debug_assert_eq!(
            lock.owner.get(),
            Some(self.fiber),
            "mutex unlocked by a fiber that does not own it",
        );
        let next = lock.waiters.borrow_mut().pop_front();
        match next {
            Some(resumer) => {
                // Hand over ownership before the waiter resumes, so it sees
                // itself as owner without a re-check.
                lock.owner.set(Some(resumer.fiber_id()));
                resumer.complete(Ok(()));
            }
            None => {
                lock.owner.set(None);
                lock.locked.set(false);
            }
        }
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: ?Sized + fmt::Display> fmt::Display for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}

////////////////////////////////////////////////////////////////////////////////
// tests
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::{spawn, YieldResult};
    use crate::IoContext;
    use pretty_assertions::assert_eq;
    use std::rc::Rc;

    #[test]
    fn uncontended_lock_does_not_yield() {
        let ctx = IoContext::new();
        let strand = ctx.make_strand();
        let mutex = Rc::new(Mutex::new(&strand, 0));
        let m = mutex.clone();
        spawn(&strand, move |cx| {
            match cx.check_yield(|| m.lock(cx)) {
                YieldResult::DidntYield(guard) => drop(guard),
                YieldResult::Yielded(_) => panic!("uncontended lock went through the queue"),
            }
            Ok(())
        })
        .detach();
        ctx.run();
    }

    #[test]
    fn guard_protects_data_across_suspension() {
        let ctx = IoContext::new();
        let strand = ctx.make_strand();
        let mutex = Rc::new(Mutex::new(&strand, Vec::new()));
        for tag in ["a", "b"] {
            let m = mutex.clone();
            spawn(&strand, move |cx| {
                let mut guard = m.lock(cx);
                guard.push(format!("{tag}:begin"));
                cx.yield_now()?;
                guard.push(format!("{tag}:end"));
                Ok(())
            })
            .detach();
        }
        ctx.run();
        let recorded = Rc::try_unwrap(mutex).ok().unwrap().into_inner();
        assert_eq!(recorded, vec!["a:begin", "a:end", "b:begin", "b:end"]);
    }

    #[test]
    fn waiters_wake_in_fifo_order() {
        let ctx = IoContext::new();
        let strand = ctx.make_strand();
        let mutex = Rc::new(Mutex::new(&strand, ()));
        let order = Rc::new(RefCell::new(Vec::new()));

        {
            let m = mutex.clone();
            spawn(&strand, move |cx| {
                let guard = m.lock(cx);
                // Let b, c and d enqueue behind us.
                for _ in 0..4 {
                    cx.yield_now()?;
                }
                drop(guard);
                Ok(())
            })
            .detach();
        }
        for tag in ["b", "c", "d"] {
            let m = mutex.clone();
            let order = order.clone();
            spawn(&strand, move |cx| {
                let guard = m.lock(cx);
                order.borrow_mut().push(tag);
                cx.yield_now()?;
                drop(guard);
                Ok(())
            })
            .detach();
        }
        ctx.run();
        assert_eq!(*order.borrow(), vec!["b", "c", "d"]);
    }

    #[test]
    fn try_lock_fails_on_a_held_mutex() {
        let ctx = IoContext::new();
        let strand = ctx.make_strand();
        let mutex = Rc::new(Mutex::new(&strand, 5));
        let m = mutex.clone();
        spawn(&strand, move |cx| {
            let first = m.try_lock(cx).expect("unlocked mutex");
            assert!(m.try_lock(cx).is_none());
            drop(first);
            assert_eq!(*m.try_lock(cx).expect("released again"), 5);
            Ok(())
        })
        .detach();
        ctx.run();
    }

    #[test]
    fn interruption_is_deferred_across_a_contended_lock() {
        let ctx = IoContext::new();
        let strand = ctx.make_strand();
        let mutex = Rc::new(Mutex::new(&strand, ()));

        let holder = {
            let m = mutex.clone();
            spawn(&strand, move |cx| {
                let guard = m.lock(cx);
                for _ in 0..2 {
                    cx.yield_now()?;
                }
                drop(guard);
                Ok(())
            })
        };
        let waiter = {
            let m = mutex.clone();
            spawn::<(), _>(&strand, move |cx| {
                // `lock` must not raise even though we get interrupted while
                // queued; the pending request fires at the next yield.
                let guard = m.lock(cx);
                drop(guard);
                cx.yield_now()?;
                panic!("the yield after lock must raise");
            })
        };
        waiter.interrupt();
        ctx.run();
        let mut holder = holder;
        let mut waiter = waiter;
        assert_eq!(holder.try_join(), Some(Some(())));
        assert_eq!(waiter.try_join(), Some(None));
        assert!(waiter.interruption_caught());
    }

    #[test]
    fn get_mut_bypasses_locking() {
        let ctx = IoContext::new();
        let strand = ctx.make_strand();
        let mut mutex = Mutex::new(&strand, 1);
        *mutex.get_mut() = 7;
        assert_eq!(mutex.into_inner(), 7);
    }
}
