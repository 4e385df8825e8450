//! Cooperative multitasking module.
//!
//! With the fiber module, you can:
//! - spawn, join, detach and interrupt [fibers](self::spawn) scheduled on a
//!   [`Strand`],
//! - suspend a fiber until an asynchronous completion arrives
//!   ([`Context::suspend`]),
//! - use fiber-aware synchronization: a FIFO [`Mutex`] and the
//!   no-suspension borrow guards in [`safety`].
//!
//! A fiber is a stackful thread of control scheduled cooperatively: it runs
//! until it suspends or returns, and every state transition happens inside a
//! handler dispatched by the fiber's strand. Fibers sharing a strand never
//! overlap; fibers on different strands of one [`IoContext`] interleave in
//! the context's event loop.
//!
//! Cancellation is deferred: [`JoinHandle::interrupt`] only records a
//! request, which is delivered as [`Interrupted`] at the fiber's next
//! suspension point while delivery is enabled (see [`interrupt`] for the
//! scoped toggles).

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::mem;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Interrupted};
use crate::executor::{IoContext, Strand};
use crate::{Result, StdResult};

macro_rules! impl_debug_stub {
    ($t:ident $($p:tt)*) => {
        impl $($p)* ::std::fmt::Debug for $t $($p)* {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                f.debug_struct(::std::stringify!($t))
                    .finish_non_exhaustive()
            }
        }
    }
}

pub mod interrupt;
pub mod mutex;
pub mod safety;
mod stack;

pub use interrupt::{InterruptionDisabler, InterruptionRestorer};
pub use mutex::{Mutex, MutexGuard};
pub use safety::{NoSuspendGuard, NoSuspendRef};

use stack::{StackContext, StackSuspend, DEFAULT_STACK_SIZE};

////////////////////////////////////////////////////////////////////////////////
// FiberId
////////////////////////////////////////////////////////////////////////////////

/// Identifier of a fiber, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(u64);

impl FiberId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for FiberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Fcb
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Spawned, initial resume handler not executed yet.
    Ready,
    Running,
    Suspended,
    /// Body returned normally (or panicked; see `panic_payload`).
    Done,
    /// Body terminated by an interruption escape.
    DoneInterrupted,
}

enum Joiner {
    None,
    Detached,
    Waiting(Resumer<()>),
}

/// Fiber control block. Shared between the fiber body, the handle, pending
/// resume handlers and joiner registrations; released when the last of them
/// lets go.
pub(crate) struct Fcb {
    id: FiberId,
    name: String,
    /// The strand every handler related to this fiber runs on. Immutable.
    strand: Strand,
    state: Cell<State>,
    /// Taken (dropped) on termination.
    stack: RefCell<Option<StackContext>>,
    interrupt_requested: Cell<bool>,
    disable_depth: Cell<u32>,
    no_suspend_depth: Cell<u32>,
    interrupter: RefCell<Option<Box<dyn FnOnce()>>>,
    joiner: RefCell<Joiner>,
    /// Number of switches into this fiber.
    csw: Cell<u64>,
    panic_payload: RefCell<Option<Box<dyn Any + Send>>>,
}

impl Fcb {
    fn terminated(&self) -> bool {
        matches!(self.state.get(), State::Done | State::DoneInterrupted)
    }

    /// Switches into the fiber until it suspends or terminates. Must run as
    /// a handler on the fiber's strand.
    fn run_resume(fcb: &Rc<Fcb>) {
        if fcb.terminated() {
            return;
        }
        debug_assert!(fcb.strand.is_running(), "fiber resumed off its strand");
        let prev = fcb.state.replace(State::Running);
        debug_assert!(
            matches!(prev, State::Ready | State::Suspended),
            "resume of a fiber in state {prev:?}",
        );
        fcb.csw.set(fcb.csw.get() + 1);
        // The interrupter slot only covers one suspension.
        fcb.interrupter.borrow_mut().take();

        let finished = {
            let stack = fcb.stack.borrow();
            let stack = stack.as_ref().expect("fiber has no stack");
            stack.resume()
        };

        if finished {
            Self::finalize(fcb);
        } else {
            debug_assert_eq!(fcb.state.get(), State::Suspended);
        }
    }

    /// Post-termination bookkeeping: wake the joiner, release the stack,
    /// unpin the context.
    fn finalize(fcb: &Rc<Fcb>) {
        debug_assert!(fcb.terminated());
        fcb.stack.borrow_mut().take();
        fcb.interrupter.borrow_mut().take();
        log::debug!(
            "fiber {} '{}' terminated{}",
            fcb.id,
            fcb.name,
            if fcb.state.get() == State::DoneInterrupted {
                " by interruption"
            } else {
                ""
            },
        );
        let joiner = mem::replace(&mut *fcb.joiner.borrow_mut(), Joiner::None);
        fcb.strand.on_work_finished();
        match joiner {
            Joiner::Waiting(resumer) => resumer.complete(Ok(())),
            Joiner::Detached => {
                // A detached fiber has nobody to re-raise in: propagate out
                // of the event loop.
                if let Some(payload) = fcb.panic_payload.borrow_mut().take() {
                    resume_unwind(payload);
                }
            }
            Joiner::None => {}
        }
    }

    /// Records an interruption request and, if the fiber is suspended with
    /// delivery enabled, invokes its interrupter. Runs on the fiber's
    /// strand; never suspends.
    fn interrupt(fcb: &Rc<Fcb>) {
        if fcb.terminated() {
            return;
        }
        let target = fcb.clone();
        fcb.strand.dispatch(move || {
            if target.terminated() {
                return;
            }
            target.interrupt_requested.set(true);
            log::debug!("interruption requested for fiber {} '{}'", target.id, target.name);
            if target.state.get() == State::Suspended && target.disable_depth.get() == 0 {
                if let Some(hook) = target.interrupter.borrow_mut().take() {
                    hook();
                }
            }
        });
    }
}

////////////////////////////////////////////////////////////////////////////////
// ToStrand
////////////////////////////////////////////////////////////////////////////////

/// Where a new fiber should run. Implemented by [`Strand`] (run exactly
/// there), [`IoContext`] (run on a fresh strand) and [`Context`] (inherit
/// the spawning fiber's strand).
pub trait ToStrand {
    fn to_strand(&self) -> Strand;
}

impl ToStrand for Strand {
    fn to_strand(&self) -> Strand {
        self.clone()
    }
}

impl ToStrand for IoContext {
    fn to_strand(&self) -> Strand {
        self.make_strand()
    }
}

impl ToStrand for Context {
    fn to_strand(&self) -> Strand {
        self.fcb.strand.clone()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Builder
////////////////////////////////////////////////////////////////////////////////

/// Fiber factory which can be used to configure the properties of the new
/// fiber.
///
/// Methods can be chained on it in order to configure it. The currently
/// supported configurations are:
///
/// * `name`:       specifies an associated name for the fiber
/// * `stack_size`: specifies the desired stack size for the fiber
///
/// The [`spawn`](Builder::spawn) method takes ownership of the builder and
/// returns a [`Result`] to the fiber's [`JoinHandle`]. The [`fiber::spawn`]
/// free function uses a `Builder` with default configuration and unwraps
/// its return value.
///
/// [`fiber::spawn`]: spawn
#[derive(Debug)]
pub struct Builder {
    name: Option<String>,
    stack_size: usize,
}

impl Builder {
    /// Generates the base configuration for spawning a fiber, from which
    /// configuration methods can be chained.
    pub fn new() -> Self {
        Self {
            name: None,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }

    /// Names the fiber-to-be. Used in diagnostics only.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the size of the stack (in bytes) for the new fiber. The size is
    /// rounded up to a platform-acceptable minimum.
    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// Spawns a new fiber by taking ownership of the `Builder`, and returns
    /// a [`Result`] to its [`JoinHandle`].
    ///
    /// The fiber is scheduled: its strand has been pinned with
    /// `on_work_started` and an initial resume handler is in the queue. The
    /// body starts running once the event loop gets to that handler.
    pub fn spawn<T, F>(self, target: &impl ToStrand, f: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce(&Context) -> StdResult<T, Interrupted> + 'static,
        T: 'static,
    {
        let strand = target.to_strand();
        let fcb = Rc::new(Fcb {
            id: FiberId::next(),
            name: self.name.unwrap_or_else(|| "<fiber>".into()),
            strand: strand.clone(),
            state: Cell::new(State::Ready),
            stack: RefCell::new(None),
            interrupt_requested: Cell::new(false),
            disable_depth: Cell::new(0),
            no_suspend_depth: Cell::new(0),
            interrupter: RefCell::new(None),
            joiner: RefCell::new(Joiner::None),
            csw: Cell::new(0),
            panic_payload: RefCell::new(None),
        });
        let result = Rc::new(RefCell::new(None));

        // The trampoline holds a weak reference: the strong ones live in the
        // handle, the queued handlers and the joiner registration.
        let weak = Rc::downgrade(&fcb);
        let slot = result.clone();
        let stack = StackContext::new(self.stack_size, move |suspend| {
            trampoline(&weak, suspend, f, &slot)
        })?;
        fcb.stack.borrow_mut().replace(stack);

        strand.on_work_started();
        log::debug!("spawned fiber {} '{}' on {:?}", fcb.id, fcb.name, strand);
        let initial = fcb.clone();
        strand.post(move || Fcb::run_resume(&initial));

        Ok(JoinHandle {
            fcb: Some(fcb),
            result,
            caught: false,
        })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the fiber body on the fiber's own stack and records its outcome.
fn trampoline<T, F>(
    fcb: &Weak<Fcb>,
    suspend: StackSuspend,
    f: F,
    result: &Rc<RefCell<Option<StdResult<T, Interrupted>>>>,
) where
    F: FnOnce(&Context) -> StdResult<T, Interrupted>,
{
    let fcb = fcb.upgrade().expect("fiber control block dropped before the body ran");
    let cx = Context {
        fcb: fcb.clone(),
        suspend,
    };
    let outcome = catch_unwind(AssertUnwindSafe(|| f(&cx)));
    debug_assert_eq!(
        fcb.disable_depth.get(),
        0,
        "unbalanced interruption-disable scopes at fiber exit",
    );
    debug_assert_eq!(
        fcb.no_suspend_depth.get(),
        0,
        "unbalanced no-suspend scopes at fiber exit",
    );
    match outcome {
        Ok(Ok(value)) => {
            *result.borrow_mut() = Some(Ok(value));
            fcb.state.set(State::Done);
        }
        Ok(Err(Interrupted)) => {
            *result.borrow_mut() = Some(Err(Interrupted));
            fcb.state.set(State::DoneInterrupted);
        }
        Err(payload) => {
            *fcb.panic_payload.borrow_mut() = Some(payload);
            fcb.state.set(State::Done);
        }
    }
}

/// Creates a new fiber with default parameters of [`Builder`] and schedules
/// it for execution, returning a [`JoinHandle`] for it.
///
/// The handle must be consumed with [`JoinHandle::join`],
/// [`JoinHandle::try_join`] or [`JoinHandle::detach`]; dropping it without
/// doing so aborts the owning io context (see [`crate::context_aborted`]).
///
/// # Panics
///
/// If the fiber stack cannot be allocated. Use [`Builder::spawn`] to handle
/// that case.
pub fn spawn<T, F>(target: &impl ToStrand, f: F) -> JoinHandle<T>
where
    F: FnOnce(&Context) -> StdResult<T, Interrupted> + 'static,
    T: 'static,
{
    Builder::new()
        .spawn(target, f)
        .expect("failed to spawn fiber")
}

////////////////////////////////////////////////////////////////////////////////
// JoinHandle
////////////////////////////////////////////////////////////////////////////////

/// An owned permission to join on a fiber (suspend on its termination).
///
/// Exactly one of [`join`], [`try_join`] (returning `Some`) or [`detach`]
/// must consume the handle. Dropping an unconsumed handle is a logic error:
/// the owning [`IoContext`] is stopped abortively and the process-global
/// [`context_aborted`] flag is raised.
///
/// [`join`]: Self::join
/// [`try_join`]: Self::try_join
/// [`detach`]: Self::detach
/// [`context_aborted`]: crate::context_aborted
pub struct JoinHandle<T> {
    /// `Some` until the handle is consumed by join or detach.
    fcb: Option<Rc<Fcb>>,
    result: Rc<RefCell<Option<StdResult<T, Interrupted>>>>,
    caught: bool,
}

impl_debug_stub! {JoinHandle<T>}

impl<T> JoinHandle<T> {
    /// Suspends the calling fiber until the target terminates, then returns
    /// the target's value: `Ok(Some(v))` on normal termination, `Ok(None)`
    /// if the target terminated by an interruption escape (see
    /// [`interruption_caught`](Self::interruption_caught)).
    ///
    /// The caller and the target may live on different strands; the wakeup
    /// is posted onto the caller's strand. An already-terminated target is
    /// collected immediately, without suspending.
    ///
    /// Joining is an interruption point: if the *caller* is interrupted
    /// while waiting, `Err(Interrupted)` is returned and the handle stays
    /// consumable: it can be joined again or detached.
    ///
    /// If the target's body panicked, the panic is resumed here.
    ///
    /// # Panics
    ///
    /// If the handle was already consumed, or when joining a fiber from
    /// itself.
    pub fn join(&mut self, cx: &Context) -> StdResult<Option<T>, Interrupted> {
        let fcb = self
            .fcb
            .as_ref()
            .expect("fiber handle already joined or detached")
            .clone();
        assert!(fcb.id != cx.fcb.id, "a fiber cannot join itself");
        while !fcb.terminated() {
            let target = fcb.clone();
            let withdraw = fcb.clone();
            let wait = cx.suspend_with_interrupter(
                move |resumer| {
                    let prev =
                        mem::replace(&mut *target.joiner.borrow_mut(), Joiner::Waiting(resumer));
                    debug_assert!(
                        matches!(prev, Joiner::None),
                        "fiber has a second joiner",
                    );
                },
                move || {
                    // Withdraw the registration so the interrupted joiner is
                    // not resumed a second time on target termination.
                    let prev = mem::replace(&mut *withdraw.joiner.borrow_mut(), Joiner::None);
                    if let Joiner::Waiting(resumer) = prev {
                        resumer.complete(Err(Error::Cancelled));
                    }
                },
            )?;
            let _ = wait;
        }
        Ok(self.take_outcome())
    }

    /// Non-suspending collection of an already-terminated fiber, usable
    /// outside fiber context, typically after [`IoContext::run`] returned.
    ///
    /// Returns `None` (keeping the handle consumable) while the fiber has
    /// not terminated; otherwise consumes the handle like a successful
    /// [`join`](Self::join) and returns the same `Some(v)` / `None` value
    /// wrapped in `Some`.
    pub fn try_join(&mut self) -> Option<Option<T>> {
        let fcb = self
            .fcb
            .as_ref()
            .expect("fiber handle already joined or detached");
        if !fcb.terminated() {
            return None;
        }
        Some(self.take_outcome())
    }

    fn take_outcome(&mut self) -> Option<T> {
        let fcb = self.fcb.take().expect("fiber handle already consumed");
        debug_assert!(fcb.terminated());
        if let Some(payload) = fcb.panic_payload.borrow_mut().take() {
            resume_unwind(payload);
        }
        self.caught = fcb.state.get() == State::DoneInterrupted;
        match self.result.borrow_mut().take() {
            Some(Ok(value)) => Some(value),
            Some(Err(Interrupted)) => None,
            None => unreachable!("terminated fiber left no result"),
        }
    }

    /// Relinquishes the right to join: the fiber runs to completion
    /// independently. Consumes the handle.
    ///
    /// If the fiber already terminated with a panic, the panic is resumed
    /// here; a panic in a fiber detached before termination propagates out
    /// of [`IoContext::run`].
    pub fn detach(mut self) {
        let fcb = self
            .fcb
            .take()
            .expect("fiber handle already joined or detached");
        if fcb.terminated() {
            if let Some(payload) = fcb.panic_payload.borrow_mut().take() {
                resume_unwind(payload);
            }
            return;
        }
        log::debug!("fiber {} '{}' detached", fcb.id, fcb.name);
        let prev = mem::replace(&mut *fcb.joiner.borrow_mut(), Joiner::Detached);
        debug_assert!(matches!(prev, Joiner::None));
    }

    /// Requests interruption of the fiber.
    ///
    /// The request is recorded on the fiber's strand; if the fiber is
    /// currently suspended with delivery enabled, its registered interrupter
    /// (if any) is invoked to hurry the in-flight operation along. Delivery
    /// itself happens at the fiber's next eligible suspension point.
    ///
    /// Never suspends and is not an interruption point for the caller. Has
    /// no effect on a terminated fiber.
    pub fn interrupt(&self) {
        if let Some(fcb) = self.fcb.as_ref() {
            Fcb::interrupt(fcb);
        }
    }

    /// After a successful [`join`](Self::join) or [`try_join`](Self::try_join):
    /// `true` iff the fiber terminated by an interruption escape.
    pub fn interruption_caught(&self) -> bool {
        self.caught
    }

    /// The strand the fiber is bound to.
    ///
    /// # Panics
    ///
    /// If the handle was already consumed.
    pub fn strand(&self) -> &Strand {
        &self
            .fcb
            .as_ref()
            .expect("fiber handle already joined or detached")
            .strand
    }

    /// The fiber's id.
    pub fn id(&self) -> FiberId {
        self.fcb
            .as_ref()
            .expect("fiber handle already joined or detached")
            .id
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        if let Some(fcb) = self.fcb.take() {
            log::error!(
                "fiber handle for {} '{}' dropped without join or detach; \
                 aborting the io context",
                fcb.id,
                fcb.name,
            );
            fcb.strand.context().abort_from_leaked_handle();
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Context
////////////////////////////////////////////////////////////////////////////////

/// The in-fiber capability handle, passed by reference into the fiber's
/// start function.
///
/// Everything a fiber can do to itself goes through this object: voluntary
/// yields, suspension on asynchronous completions, interrupter registration
/// and the scoped interruption/suspension toggles (see [`interrupt`] and
/// [`safety`]).
pub struct Context {
    fcb: Rc<Fcb>,
    suspend: StackSuspend,
}

impl_debug_stub! {Context}

impl Context {
    /// Suspends the fiber and re-posts its resume at the tail of the strand
    /// queue, letting every other pending handler run once.
    ///
    /// An interruption point.
    #[track_caller]
    pub fn yield_now(&self) -> StdResult<(), Interrupted> {
        self.check_suspend_allowed("yield_now");
        let fcb = self.fcb.clone();
        self.fcb.strand.post(move || Fcb::run_resume(&fcb));
        self.switch_out();
        self.take_interruption()
    }

    /// Suspends the fiber until the [`Resumer`] handed to `register` is
    /// completed.
    ///
    /// This is how the fiber couples to asynchronous operations: `register`
    /// passes the resumer to the operation as its completion callback; the
    /// operation later calls [`Resumer::complete`] with its outcome, which
    /// re-enters through the fiber's strand and resumes the fiber here.
    ///
    /// The returned outer result reports interruption (an interruption
    /// point, like every suspension); the inner result is the completion
    /// value with any operation error in it, left for the caller to handle
    /// locally. If the operation was cancelled *because* of an interruption
    /// request, only `Err(Interrupted)` is observed.
    #[track_caller]
    pub fn suspend<T, F>(&self, register: F) -> StdResult<Result<T>, Interrupted>
    where
        F: FnOnce(Resumer<T>),
        T: 'static,
    {
        self.do_suspend(register, None)
    }

    /// Like [`suspend`](Self::suspend), with an interrupter installed for
    /// the duration of this wait. Used by the built-in suspending
    /// operations, which override any user-set hook.
    pub(crate) fn suspend_with_interrupter<T, F>(
        &self,
        register: F,
        interrupter: impl FnOnce() + 'static,
    ) -> StdResult<Result<T>, Interrupted>
    where
        F: FnOnce(Resumer<T>),
        T: 'static,
    {
        self.do_suspend(register, Some(Box::new(interrupter)))
    }

    #[track_caller]
    fn do_suspend<T, F>(
        &self,
        register: F,
        interrupter: Option<Box<dyn FnOnce()>>,
    ) -> StdResult<Result<T>, Interrupted>
    where
        F: FnOnce(Resumer<T>),
        T: 'static,
    {
        self.check_suspend_allowed("suspend");
        let slot = Rc::new(Cell::new(None));
        register(Resumer {
            inner: Some(ResumerInner {
                fcb: self.fcb.clone(),
                slot: slot.clone(),
            }),
        });
        if let Some(hook) = interrupter {
            *self.fcb.interrupter.borrow_mut() = Some(hook);
        }
        self.switch_out();
        let completion = slot.take().expect("fiber resumed without a completion value");
        self.take_interruption()?;
        Ok(completion)
    }

    /// Registers the hook invoked (on this strand) if an interruption
    /// request lands while the fiber is suspended, giving the fiber a way
    /// to cancel its in-flight operation early. The slot is cleared on
    /// every resume, so it covers at most the next suspension.
    pub fn set_interrupter(&self, hook: impl FnOnce() + 'static) {
        *self.fcb.interrupter.borrow_mut() = Some(Box::new(hook));
    }

    /// The strand this fiber is bound to.
    pub fn strand(&self) -> &Strand {
        &self.fcb.strand
    }

    pub fn id(&self) -> FiberId {
        self.fcb.id
    }

    pub fn name(&self) -> &str {
        &self.fcb.name
    }

    /// Number of context switches into this fiber so far.
    ///
    /// Mostly useful for testing, see [`check_yield`](Self::check_yield).
    pub fn csw(&self) -> u64 {
        self.fcb.csw.get()
    }

    /// Calls a function and checks whether it suspended the fiber.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use fibrio::fiber::YieldResult::*;
    /// # fibrio::fiber::spawn(&fibrio::IoContext::new(), |cx| {
    /// assert_eq!(cx.check_yield(|| cx.yield_now()), Yielded(Ok(())));
    /// # Ok::<_, fibrio::Interrupted>(())
    /// # }).detach();
    /// ```
    pub fn check_yield<F, T>(&self, f: F) -> YieldResult<T>
    where
        F: FnOnce() -> T,
    {
        let csw_before = self.csw();
        let res = f();
        if self.csw() == csw_before {
            YieldResult::DidntYield(res)
        } else {
            YieldResult::Yielded(res)
        }
    }

    fn switch_out(&self) {
        debug_assert!(self.fcb.strand.is_running());
        self.fcb.state.set(State::Suspended);
        self.suspend.yield_out();
        debug_assert_eq!(self.fcb.state.get(), State::Running);
    }

    /// Interruption delivery at a resume site: consumes a pending request
    /// if delivery is enabled.
    fn take_interruption(&self) -> StdResult<(), Interrupted> {
        let fcb = &self.fcb;
        if fcb.interrupt_requested.get() && fcb.disable_depth.get() == 0 {
            fcb.interrupt_requested.set(false);
            log::debug!("delivering interruption to fiber {} '{}'", fcb.id, fcb.name);
            return Err(Interrupted);
        }
        Ok(())
    }

    #[track_caller]
    fn check_suspend_allowed(&self, op: &str) {
        if self.fcb.no_suspend_depth.get() > 0 {
            log::error!(
                "fiber {} '{}' attempted `{}` while suspension is forbidden",
                self.fcb.id,
                self.fcb.name,
                op,
            );
            #[cfg(debug_assertions)]
            panic!("`{op}` called while suspension is forbidden");
        }
    }
}

/// Possible [`Context::check_yield`] results.
#[derive(Debug, PartialEq, Eq)]
pub enum YieldResult<T> {
    /// The function didn't yield.
    DidntYield(T),
    /// The function did yield.
    Yielded(T),
}

////////////////////////////////////////////////////////////////////////////////
// Resumer
////////////////////////////////////////////////////////////////////////////////

/// One-shot completion token binding an asynchronous operation's completion
/// to a fiber's resume. Obtained through [`Context::suspend`].
pub struct Resumer<T> {
    inner: Option<ResumerInner<T>>,
}

struct ResumerInner<T> {
    fcb: Rc<Fcb>,
    slot: Rc<Cell<Option<Result<T>>>>,
}

impl<T: 'static> Resumer<T> {
    /// Delivers the operation's outcome and schedules the fiber's resume on
    /// its strand. The resume handler observes every side effect of the
    /// caller (both run on the same strand).
    pub fn complete(mut self, result: Result<T>) {
        let ResumerInner { fcb, slot } = self
            .inner
            .take()
            .expect("completion token already consumed");
        let strand = fcb.strand.clone();
        strand.post(move || {
            if fcb.terminated() {
                return;
            }
            slot.set(Some(result));
            Fcb::run_resume(&fcb);
        });
    }
}

impl<T> Resumer<T> {
    /// Id of the fiber this token resumes.
    pub fn fiber_id(&self) -> FiberId {
        self.inner
            .as_ref()
            .expect("completion token already consumed")
            .fcb
            .id
    }
}

impl<T> Drop for Resumer<T> {
    fn drop(&mut self) {
        if let Some(inner) = &self.inner {
            log::warn!(
                "completion token for fiber {} '{}' dropped without completing; \
                 the fiber will never resume",
                inner.fcb.id,
                inner.fcb.name,
            );
        }
    }
}

impl_debug_stub! {Resumer<T>}

////////////////////////////////////////////////////////////////////////////////
// tests
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn run_fiber<T: 'static>(
        f: impl FnOnce(&Context) -> StdResult<T, Interrupted> + 'static,
    ) -> Option<T> {
        let ctx = IoContext::new();
        let mut handle = spawn(&ctx, f);
        ctx.run();
        handle.try_join().expect("fiber did not terminate")
    }

    #[test]
    fn fiber_runs_and_returns_a_value() {
        assert_eq!(run_fiber(|_cx| Ok(17)), Some(17));
    }

    #[test]
    fn spawn_is_deferred_until_run() {
        let ctx = IoContext::new();
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        let handle = spawn(&ctx, move |_cx| {
            flag.set(true);
            Ok(())
        });
        assert!(!ran.get());
        ctx.run();
        assert!(ran.get());
        handle.detach();
    }

    #[test]
    fn yield_now_interleaves_fibers_on_one_strand() {
        let ctx = IoContext::new();
        let strand = ctx.make_strand();
        let order = Rc::new(RefCell::new(Vec::new()));
        for tag in ["a", "b"] {
            let order = order.clone();
            spawn(&strand, move |cx| {
                for i in 0..3 {
                    order.borrow_mut().push(format!("{tag}{i}"));
                    cx.yield_now()?;
                }
                Ok(())
            })
            .detach();
        }
        ctx.run();
        assert_eq!(
            *order.borrow(),
            vec!["a0", "b0", "a1", "b1", "a2", "b2"],
        );
    }

    #[test]
    fn spawn_from_context_inherits_the_strand() {
        let ctx = IoContext::new();
        let strand = ctx.make_strand();
        let expected = strand.clone();
        let mut handle = spawn(&strand, move |cx| {
            let mut child = spawn(cx, |cx| Ok(cx.strand().clone()));
            let child_strand = child.join(cx).expect("not interrupted").expect("no escape");
            Ok(child_strand == expected)
        });
        ctx.run();
        assert_eq!(handle.try_join(), Some(Some(true)));
    }

    #[test]
    fn join_returns_the_fiber_value() {
        let ctx = IoContext::new();
        let mut outer = spawn(&ctx, |cx| {
            let mut inner = spawn(cx, |cx| {
                cx.yield_now()?;
                Ok(7)
            });
            Ok(inner.join(cx)?.expect("inner not interrupted"))
        });
        ctx.run();
        assert_eq!(outer.try_join(), Some(Some(7)));
    }

    #[test]
    fn join_across_strands() {
        let ctx = IoContext::new();
        let worker_strand = ctx.make_strand();
        let mut outer = spawn(&ctx, move |cx| {
            let mut inner = spawn(&worker_strand, |cx| {
                for _ in 0..3 {
                    cx.yield_now()?;
                }
                Ok("done")
            });
            Ok(inner.join(cx)?.expect("inner not interrupted"))
        });
        ctx.run();
        assert_eq!(outer.try_join(), Some(Some("done")));
    }

    #[test]
    fn join_of_terminated_fiber_does_not_suspend() {
        let ctx = IoContext::new();
        let mut outer = spawn(&ctx, |cx| {
            let mut inner = spawn(cx, |_cx| Ok(3));
            // Let the child run to completion first.
            for _ in 0..4 {
                cx.yield_now()?;
            }
            let joined = cx.check_yield(|| inner.join(cx));
            match joined {
                YieldResult::DidntYield(Ok(Some(v))) => Ok(v),
                other => panic!("unexpected join outcome: {other:?}"),
            }
        });
        ctx.run();
        assert_eq!(outer.try_join(), Some(Some(3)));
    }

    #[test]
    fn try_join_on_running_fiber_keeps_the_handle() {
        let ctx = IoContext::new();
        let mut handle = spawn(&ctx, |cx| {
            cx.yield_now()?;
            Ok(1)
        });
        assert_eq!(handle.try_join(), None);
        ctx.run();
        assert_eq!(handle.try_join(), Some(Some(1)));
    }

    #[test]
    fn detached_fiber_runs_to_completion() {
        let ctx = IoContext::new();
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        spawn(&ctx, move |cx| {
            cx.yield_now()?;
            flag.set(true);
            Ok(())
        })
        .detach();
        ctx.run();
        assert!(ran.get());
    }

    #[test]
    fn dropped_handle_aborts_the_context() {
        let ctx = IoContext::new();
        let handle = spawn(&ctx, |_cx| Ok(()));
        drop(handle);
        assert!(ctx.aborted());
        assert!(ctx.stopped());
        assert!(crate::context_aborted());
    }

    #[test]
    #[should_panic(expected = "fiber body blew up")]
    fn panic_propagates_to_join() {
        let ctx = IoContext::new();
        let mut handle = spawn(&ctx, |_cx| -> StdResult<(), Interrupted> {
            panic!("fiber body blew up");
        });
        ctx.run();
        handle.try_join();
    }

    #[test]
    fn suspend_delivers_the_completion_value() {
        let got = run_fiber(|cx| {
            let strand = cx.strand().clone();
            let completion = cx.suspend(move |resumer| {
                strand.post(move || resumer.complete(Ok(23)));
            })?;
            Ok(completion.expect("no operation error"))
        });
        assert_eq!(got, Some(23));
    }

    #[test]
    fn suspend_reports_operation_errors_in_the_inner_result() {
        let got = run_fiber(|cx| {
            let strand = cx.strand().clone();
            let completion: Result<i32> = cx.suspend(move |resumer| {
                strand.post(move || resumer.complete(Err(Error::Cancelled)));
            })?;
            Ok(matches!(completion, Err(Error::Cancelled)))
        });
        assert_eq!(got, Some(true));
    }

    #[test]
    fn csw_counts_switches_into_the_fiber() {
        let counts = run_fiber(|cx| {
            let initial = cx.csw();
            cx.yield_now()?;
            cx.yield_now()?;
            Ok((initial, cx.csw()))
        });
        let (initial, after) = counts.unwrap();
        assert_eq!(initial, 1);
        assert_eq!(after, 3);
    }

    #[test]
    fn check_yield_reports_both_outcomes() {
        let got = run_fiber(|cx| {
            let didnt = cx.check_yield(|| 5);
            let did = cx.check_yield(|| cx.yield_now());
            Ok((didnt, matches!(did, YieldResult::Yielded(Ok(())))))
        })
        .unwrap();
        assert_eq!(got.0, YieldResult::DidntYield(5));
        assert!(got.1);
    }

    #[test]
    fn builder_sets_name_and_stack_size() {
        let ctx = IoContext::new();
        let mut handle = Builder::new()
            .name("worker")
            .stack_size(64 * 1024)
            .spawn(&ctx, |cx| Ok(cx.name().to_string()))
            .unwrap();
        ctx.run();
        assert_eq!(handle.try_join(), Some(Some("worker".into())));
    }

    #[test]
    fn interrupt_after_termination_is_a_no_op() {
        let ctx = IoContext::new();
        let mut handle = spawn(&ctx, |_cx| Ok(2));
        ctx.run();
        handle.interrupt();
        assert_eq!(handle.try_join(), Some(Some(2)));
        assert!(!handle.interruption_caught());
    }
}
