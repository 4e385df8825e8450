//! Deadline timers coupled to fiber suspension.
//!
//! [`Timer`] is the crate's reference asynchronous operation: it is armed
//! on creation and completes a single waiting fiber when the deadline
//! passes, or earlier when it is cancelled. [`sleep`] wraps a private timer
//! and cancels it from the interrupter, so a sleeping fiber reacts to
//! [`interrupt`] promptly instead of at the deadline.
//!
//! [`interrupt`]: crate::fiber::JoinHandle::interrupt

use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::error::{Error, Interrupted};
use crate::executor::{Strand, TimerKey};
use crate::fiber::{Context, Resumer};
use crate::{Result, StdResult};

////////////////////////////////////////////////////////////////////////////////
// Timer
////////////////////////////////////////////////////////////////////////////////

enum WaitState {
    /// Armed, nobody waiting yet.
    Pending,
    /// Armed with a fiber suspended on it.
    Waiting(Resumer<()>),
    Elapsed,
    Cancelled,
}

struct TimerShared {
    strand: Strand,
    key: RefCell<Option<TimerKey>>,
    state: RefCell<WaitState>,
}

/// A one-shot deadline timer bound to a [`Strand`].
///
/// The timer starts counting when it is created. At most one fiber can
/// [`wait`](Timer::wait) on it; the wait completes with `Ok(())` at the
/// deadline or with [`Error::Cancelled`] when some other party calls
/// [`cancel`](Timer::cancel) first. Clones are handles to the same timer,
/// which is what lets an interrupter closure cancel a wait in flight:
///
/// ```no_run
/// # use std::time::Duration;
/// # use fibrio::time::Timer;
/// # fibrio::fiber::spawn(&fibrio::IoContext::new(), |cx| {
/// let timer = Timer::new(cx.strand(), Duration::from_secs(60));
/// let canceller = timer.clone();
/// cx.set_interrupter(move || {
///     canceller.cancel();
/// });
/// match timer.wait(cx) {
///     // interrupted while waiting: raised at the resume site instead
///     Err(interrupted) => return Err(interrupted),
///     Ok(completion) => completion.expect("cancelled externally"),
/// }
/// # Ok::<_, fibrio::Interrupted>(())
/// # }).detach();
/// ```
#[derive(Clone)]
pub struct Timer {
    shared: Rc<TimerShared>,
}

impl Timer {
    /// Arms a timer expiring `timeout` from now, firing on `strand`.
    pub fn new(strand: &Strand, timeout: Duration) -> Self {
        let shared = Rc::new(TimerShared {
            strand: strand.clone(),
            key: RefCell::new(None),
            state: RefCell::new(WaitState::Pending),
        });
        let fire = shared.clone();
        let key = strand.schedule_timer(
            Instant::now() + timeout,
            Box::new(move || TimerShared::fire(&fire)),
        );
        *shared.key.borrow_mut() = Some(key);
        Self { shared }
    }

    /// Suspends the calling fiber until the deadline or a cancellation.
    ///
    /// The inner result carries the operation outcome: `Ok(())` when the
    /// deadline passed, `Err(Error::Cancelled)` when the timer was
    /// cancelled without a pending interruption. An interruption request
    /// lands as `Err(Interrupted)` in the outer result, like at every
    /// suspension point. A wait on an already-elapsed timer completes
    /// without blocking past the strand queue.
    ///
    /// # Panics
    ///
    /// If another fiber is already waiting on this timer.
    pub fn wait(&self, cx: &Context) -> StdResult<Result<()>, Interrupted> {
        cx.suspend(|resumer| self.shared.register(resumer))
    }

    /// Completes a pending [`wait`](Timer::wait) with [`Error::Cancelled`]
    /// ahead of the deadline. Does not suspend; has no effect once the
    /// timer fired.
    pub fn cancel(&self) {
        let disarmed = {
            let key = self.shared.key.borrow();
            match key.as_ref() {
                Some(key) => key.cancel(),
                None => false,
            }
        };
        if !disarmed {
            // Fired already, or a completion is in flight through the
            // strand queue; too late to cancel.
            return;
        }
        let prev = mem::replace(&mut *self.shared.state.borrow_mut(), WaitState::Cancelled);
        match prev {
            WaitState::Waiting(resumer) => resumer.complete(Err(Error::Cancelled)),
            WaitState::Pending => {}
            WaitState::Elapsed | WaitState::Cancelled => {
                unreachable!("timer was disarmed twice")
            }
        }
    }

    /// The strand this timer fires on.
    pub fn strand(&self) -> &Strand {
        &self.shared.strand
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.shared.state.borrow() {
            WaitState::Pending => "pending",
            WaitState::Waiting(_) => "waiting",
            WaitState::Elapsed => "elapsed",
            WaitState::Cancelled => "cancelled",
        };
        f.debug_struct("Timer").field("state", &state).finish()
    }
}

impl TimerShared {
    /// Deadline handler, runs on the strand.
    fn fire(shared: &Rc<TimerShared>) {
        let prev = mem::replace(&mut *shared.state.borrow_mut(), WaitState::Elapsed);
        match prev {
            WaitState::Waiting(resumer) => resumer.complete(Ok(())),
            WaitState::Pending => {}
            WaitState::Elapsed | WaitState::Cancelled => {
                unreachable!("timer fired after completion")
            }
        }
    }

    fn register(&self, resumer: Resumer<()>) {
        let mut state = self.state.borrow_mut();
        match &*state {
            WaitState::Pending => *state = WaitState::Waiting(resumer),
            WaitState::Elapsed => resumer.complete(Ok(())),
            WaitState::Cancelled => resumer.complete(Err(Error::Cancelled)),
            WaitState::Waiting(_) => panic!("timer already has a waiting fiber"),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// sleep
////////////////////////////////////////////////////////////////////////////////

/// Puts the calling fiber to sleep for at least `timeout`.
///
/// An interruption point: an interruption request cancels the underlying
/// timer, so the sleeper wakes (and raises) promptly rather than at the
/// deadline.
pub fn sleep(cx: &Context, timeout: Duration) -> StdResult<(), Interrupted> {
    let timer = Timer::new(cx.strand(), timeout);
    let waiter = timer.clone();
    let canceller = timer.clone();
    let completion = cx.suspend_with_interrupter(
        move |resumer| waiter.shared.register(resumer),
        move || canceller.cancel(),
    )?;
    // The only cancel path is our own interrupter, and that one surfaces as
    // `Interrupted` above.
    debug_assert!(completion.is_ok(), "private sleep timer cancelled externally");
    let _ = completion;
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// tests
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::spawn;
    use crate::IoContext;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;

    #[test]
    fn sleepers_wake_in_deadline_order() {
        let ctx = IoContext::new();
        let strand = ctx.make_strand();
        let order = Rc::new(RefCell::new(Vec::new()));
        for (tag, ms) in [("slow", 30u64), ("fast", 5), ("mid", 15)] {
            let order = order.clone();
            spawn(&strand, move |cx| {
                sleep(cx, Duration::from_millis(ms))?;
                order.borrow_mut().push(tag);
                Ok(())
            })
            .detach();
        }
        ctx.run();
        assert_eq!(*order.borrow(), vec!["fast", "mid", "slow"]);
    }

    #[test]
    fn external_cancellation_surfaces_as_an_operation_error() {
        let ctx = IoContext::new();
        let strand = ctx.make_strand();
        let timer = Timer::new(&strand, Duration::from_secs(3600));

        {
            let timer = timer.clone();
            spawn(&strand, move |cx| {
                sleep(cx, Duration::from_millis(5))?;
                timer.cancel();
                Ok(())
            })
            .detach();
        }
        let mut waiter = {
            let timer = timer.clone();
            spawn(&strand, move |cx| {
                // Cancelled without any interruption request: the error
                // stays an operation error, nothing is raised.
                let completion = timer.wait(cx)?;
                Ok(matches!(completion, Err(Error::Cancelled)))
            })
        };
        let started = Instant::now();
        ctx.run();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(waiter.try_join(), Some(Some(true)));
    }

    #[test]
    fn waiting_on_an_elapsed_timer_completes() {
        let ctx = IoContext::new();
        let strand = ctx.make_strand();
        let timer = Timer::new(&strand, Duration::from_millis(1));
        let mut handle = {
            let timer = timer.clone();
            spawn(&strand, move |cx| {
                sleep(cx, Duration::from_millis(20))?;
                let completion = timer.wait(cx)?;
                Ok(completion.is_ok())
            })
        };
        ctx.run();
        assert_eq!(handle.try_join(), Some(Some(true)));
    }

    #[test]
    fn cancel_after_firing_is_a_no_op() {
        let ctx = IoContext::new();
        let strand = ctx.make_strand();
        let timer = Timer::new(&strand, Duration::from_millis(1));
        let mut handle = {
            let timer = timer.clone();
            spawn(&strand, move |cx| {
                let completion = timer.wait(cx)?;
                timer.cancel();
                Ok(completion.is_ok())
            })
        };
        ctx.run();
        assert_eq!(handle.try_join(), Some(Some(true)));
    }

    #[test]
    fn interrupted_sleep_wakes_before_the_deadline() {
        let ctx = IoContext::new();
        let strand = ctx.make_strand();
        let mut sleeper = spawn::<(), _>(&strand, |cx| {
            sleep(cx, Duration::from_secs(3600))?;
            panic!("the sleep must raise");
        });
        sleeper.interrupt();
        let started = Instant::now();
        ctx.run();
        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(sleeper.try_join(), Some(None));
        assert!(sleeper.interruption_caught());
    }
}
