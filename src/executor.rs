//! Serializing executor substrate.
//!
//! An [`IoContext`] owns a FIFO queue of posted handlers and a deadline
//! heap for timers, and is driven by a single thread calling
//! [`IoContext::run`]. A [`Strand`] is a serializing handle onto the
//! context: handlers posted through one strand run in post order and never
//! overlap, which for a single-threaded context is structural.
//!
//! The fiber runtime (see [`crate::fiber`]) posts every handler that touches
//! a fiber onto that fiber's strand, so all fiber state transitions are
//! observed in strand order.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering as MemOrdering};
use std::time::Instant;

pub(crate) type Task = Box<dyn FnOnce()>;

/// Set when any [`IoContext`] is shut down because a fiber handle was
/// dropped without being joined or detached. Never cleared.
static CONTEXT_ABORTED: AtomicBool = AtomicBool::new(false);

/// Reports whether any io context in this process was aborted because a
/// fiber handle was dropped without `join` or `detach`.
///
/// See also [`IoContext::aborted`] for the per-context flag.
#[inline]
pub fn context_aborted() -> bool {
    CONTEXT_ABORTED.load(MemOrdering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct StrandId(u64);

////////////////////////////////////////////////////////////////////////////////
// ContextInner
////////////////////////////////////////////////////////////////////////////////

struct ContextInner {
    /// Posted handlers, FIFO across all strands. A single queue preserves
    /// per-strand posting order.
    queue: RefCell<VecDeque<(StrandId, Task)>>,
    /// Armed timer entries; cancelled ones stay in the heap and are
    /// discarded lazily.
    timers: RefCell<BinaryHeap<TimerEntry>>,
    /// Outstanding work units (`on_work_started` / `on_work_finished`).
    work: Cell<usize>,
    /// Strand whose handler is currently executing, if any.
    current: Cell<Option<StrandId>>,
    running: Cell<bool>,
    stopped: Cell<bool>,
    aborted: Cell<bool>,
    next_strand_id: Cell<u64>,
    next_timer_seq: Cell<u64>,
}

struct TimerEntry {
    deadline: Instant,
    /// Tie-breaker keeping equal deadlines in arming order.
    seq: u64,
    armed: Rc<Cell<bool>>,
    strand: StrandId,
    task: Task,
}

// Min-heap by deadline on top of `BinaryHeap`'s max-heap.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

/// Handle to an armed timer entry, used by [`crate::time`] to cancel it.
pub(crate) struct TimerKey {
    armed: Rc<Cell<bool>>,
}

impl TimerKey {
    /// Disarms the entry: its task will not run. Returns `false` if it
    /// already fired or was already cancelled.
    pub(crate) fn cancel(&self) -> bool {
        self.armed.replace(false)
    }
}

////////////////////////////////////////////////////////////////////////////////
// IoContext
////////////////////////////////////////////////////////////////////////////////

/// A single-threaded handler dispatch context.
///
/// Cloning the handle is cheap and refers to the same context. The context
/// is not `Send`: it is driven by the thread that created it.
#[derive(Clone)]
pub struct IoContext {
    inner: Rc<ContextInner>,
}

impl IoContext {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(ContextInner {
                queue: RefCell::new(VecDeque::new()),
                timers: RefCell::new(BinaryHeap::new()),
                work: Cell::new(0),
                current: Cell::new(None),
                running: Cell::new(false),
                stopped: Cell::new(false),
                aborted: Cell::new(false),
                next_strand_id: Cell::new(0),
                next_timer_seq: Cell::new(0),
            }),
        }
    }

    /// Creates a fresh strand on this context.
    pub fn make_strand(&self) -> Strand {
        let id = self.inner.next_strand_id.get();
        self.inner.next_strand_id.set(id + 1);
        Strand {
            inner: self.inner.clone(),
            id: StrandId(id),
        }
    }

    /// Runs the context's event loop on the calling thread.
    ///
    /// Handlers are executed one at a time in FIFO order. When the queue is
    /// empty and timers are armed, the thread sleeps until the nearest
    /// deadline. Returns once the context is stopped or there is nothing
    /// left to execute.
    pub fn run(&self) {
        let inner = &*self.inner;
        debug_assert!(!inner.running.get(), "io context run() is not reentrant");
        inner.running.set(true);

        loop {
            if inner.stopped.get() {
                break;
            }
            self.fire_due_timers();

            let next = inner.queue.borrow_mut().pop_front();
            if let Some((strand, task)) = next {
                let prev = inner.current.replace(Some(strand));
                task();
                inner.current.set(prev);
                continue;
            }

            // Nothing runnable: sleep until the nearest armed deadline.
            let Some(deadline) = self.next_deadline() else {
                break;
            };
            let now = Instant::now();
            if deadline > now {
                std::thread::sleep(deadline - now);
            }
        }

        inner.running.set(false);
        if !inner.stopped.get() && inner.work.get() != 0 {
            log::warn!(
                "io context ran out of work with {} unit(s) still outstanding; \
                 some fiber is suspended with no pending completion",
                inner.work.get(),
            );
        }
    }

    /// Moves every due (and discards every cancelled) timer entry at the
    /// head of the heap into the handler queue.
    fn fire_due_timers(&self) {
        let inner = &*self.inner;
        if inner.timers.borrow().is_empty() {
            return;
        }
        let now = Instant::now();
        loop {
            let entry = {
                let mut timers = inner.timers.borrow_mut();
                let take = match timers.peek() {
                    Some(head) => head.deadline <= now || !head.armed.get(),
                    None => false,
                };
                if take {
                    timers.pop()
                } else {
                    None
                }
            };
            let Some(entry) = entry else {
                break;
            };
            if entry.armed.replace(false) {
                inner
                    .queue
                    .borrow_mut()
                    .push_back((entry.strand, entry.task));
            }
        }
    }

    /// Deadline of the earliest armed timer, discarding cancelled heads.
    fn next_deadline(&self) -> Option<Instant> {
        let mut timers = self.inner.timers.borrow_mut();
        loop {
            let head = match timers.peek() {
                None => return None,
                Some(head) => (head.deadline, head.armed.get()),
            };
            let (deadline, armed) = head;
            if armed {
                return Some(deadline);
            }
            timers.pop();
        }
    }

    /// Signals the event loop to return as soon as possible. Pending
    /// handlers and timers are not executed.
    pub fn stop(&self) {
        self.inner.stopped.set(true);
    }

    #[inline]
    pub fn stopped(&self) -> bool {
        self.inner.stopped.get()
    }

    /// `true` iff this context was shut down because a fiber handle was
    /// dropped without `join` or `detach`.
    #[inline]
    pub fn aborted(&self) -> bool {
        self.inner.aborted.get()
    }

    /// Abortive shutdown taken when a fiber handle is abandoned.
    pub(crate) fn abort_from_leaked_handle(&self) {
        self.inner.aborted.set(true);
        CONTEXT_ABORTED.store(true, MemOrdering::Relaxed);
        self.stop();
    }
}

impl Default for IoContext {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for IoContext {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for IoContext {}

impl fmt::Debug for IoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoContext")
            .field("stopped", &self.inner.stopped.get())
            .field("outstanding_work", &self.inner.work.get())
            .finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Strand
////////////////////////////////////////////////////////////////////////////////

/// A serializing executor handle.
///
/// All handlers going through one strand execute in post order and never
/// overlap. Strands created from the same [`IoContext`] share its event
/// loop; the fiber runtime binds every fiber to exactly one strand.
#[derive(Clone)]
pub struct Strand {
    inner: Rc<ContextInner>,
    id: StrandId,
}

impl Strand {
    /// Enqueues `f` to run on this strand, after every handler posted
    /// before it.
    pub fn post(&self, f: impl FnOnce() + 'static) {
        self.inner
            .queue
            .borrow_mut()
            .push_back((self.id, Box::new(f)));
    }

    /// Runs `f` inline if the calling code is already executing on this
    /// strand, otherwise posts it.
    pub fn dispatch(&self, f: impl FnOnce() + 'static) {
        if self.is_running() {
            f();
        } else {
            self.post(f);
        }
    }

    /// `true` iff the calling code is inside a handler dispatched by this
    /// strand.
    #[inline]
    pub fn is_running(&self) -> bool {
        self.inner.current.get() == Some(self.id)
    }

    /// Pins the owning context: [`IoContext::run`] keeps track of
    /// outstanding work for diagnostics until the matching
    /// [`on_work_finished`](Self::on_work_finished).
    pub fn on_work_started(&self) {
        self.inner.work.set(self.inner.work.get() + 1);
    }

    pub fn on_work_finished(&self) {
        let work = self.inner.work.get();
        debug_assert!(work > 0, "work count underflow");
        self.inner.work.set(work.saturating_sub(1));
    }

    /// The owning context.
    pub fn context(&self) -> IoContext {
        IoContext {
            inner: self.inner.clone(),
        }
    }

    /// Arms a timer firing `task` on this strand at `deadline`.
    pub(crate) fn schedule_timer(&self, deadline: Instant, task: Task) -> TimerKey {
        let seq = self.inner.next_timer_seq.get();
        self.inner.next_timer_seq.set(seq + 1);
        let armed = Rc::new(Cell::new(true));
        self.inner.timers.borrow_mut().push(TimerEntry {
            deadline,
            seq,
            armed: armed.clone(),
            strand: self.id,
            task,
        });
        TimerKey { armed }
    }
}

impl PartialEq for Strand {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner) && self.id == other.id
    }
}

impl Eq for Strand {}

impl std::hash::Hash for Strand {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl fmt::Debug for Strand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Strand").field("id", &self.id.0).finish()
    }
}

////////////////////////////////////////////////////////////////////////////////
// tests
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn post_runs_in_fifo_order() {
        let ctx = IoContext::new();
        let strand = ctx.make_strand();
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..4 {
            let order = order.clone();
            strand.post(move || order.borrow_mut().push(i));
        }
        ctx.run();
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn posting_order_is_kept_across_strands() {
        let ctx = IoContext::new();
        let a = ctx.make_strand();
        let b = ctx.make_strand();
        let order = Rc::new(RefCell::new(Vec::new()));
        for (i, strand) in [&a, &b, &a, &b].iter().enumerate() {
            let order = order.clone();
            strand.post(move || order.borrow_mut().push(i));
        }
        ctx.run();
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn dispatch_runs_inline_on_own_strand() {
        let ctx = IoContext::new();
        let strand = ctx.make_strand();
        let order = Rc::new(RefCell::new(Vec::new()));
        {
            let order = order.clone();
            let inner = strand.clone();
            strand.post(move || {
                assert!(inner.is_running());
                let o = order.clone();
                inner.dispatch(move || o.borrow_mut().push("inline"));
                order.borrow_mut().push("after");
            });
        }
        ctx.run();
        assert_eq!(*order.borrow(), vec!["inline", "after"]);
    }

    #[test]
    fn dispatch_posts_from_foreign_strand() {
        let ctx = IoContext::new();
        let a = ctx.make_strand();
        let b = ctx.make_strand();
        let order = Rc::new(RefCell::new(Vec::new()));
        {
            let order = order.clone();
            let b = b.clone();
            a.post(move || {
                assert!(!b.is_running());
                let o = order.clone();
                b.dispatch(move || o.borrow_mut().push("posted"));
                order.borrow_mut().push("first");
            });
        }
        ctx.run();
        assert_eq!(*order.borrow(), vec!["first", "posted"]);
    }

    #[test]
    fn dispatch_outside_run_posts() {
        let ctx = IoContext::new();
        let strand = ctx.make_strand();
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        strand.dispatch(move || flag.set(true));
        assert!(!ran.get());
        ctx.run();
        assert!(ran.get());
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let ctx = IoContext::new();
        let strand = ctx.make_strand();
        let order = Rc::new(RefCell::new(Vec::new()));
        let now = Instant::now();
        for (label, offset_ms) in [("slow", 30u64), ("fast", 5), ("mid", 15)] {
            let order = order.clone();
            strand.schedule_timer(
                now + Duration::from_millis(offset_ms),
                Box::new(move || order.borrow_mut().push(label)),
            );
        }
        ctx.run();
        assert_eq!(*order.borrow(), vec!["fast", "mid", "slow"]);
    }

    #[test]
    fn cancelled_timer_does_not_fire_or_delay_shutdown() {
        let ctx = IoContext::new();
        let strand = ctx.make_strand();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        let key = strand.schedule_timer(
            Instant::now() + Duration::from_secs(3600),
            Box::new(move || flag.set(true)),
        );
        assert!(key.cancel());
        assert!(!key.cancel());
        let started = Instant::now();
        ctx.run();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!fired.get());
    }

    #[test]
    fn stop_prevents_pending_handlers() {
        let ctx = IoContext::new();
        let strand = ctx.make_strand();
        let ran = Rc::new(Cell::new(0));
        {
            let ctx = ctx.clone();
            let ran = ran.clone();
            strand.post(move || {
                ran.set(ran.get() + 1);
                ctx.stop();
            });
        }
        {
            let ran = ran.clone();
            strand.post(move || ran.set(ran.get() + 1));
        }
        ctx.run();
        assert!(ctx.stopped());
        assert_eq!(ran.get(), 1);
    }

    #[test]
    fn strand_identity() {
        let ctx = IoContext::new();
        let a = ctx.make_strand();
        let b = ctx.make_strand();
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_eq!(a.context(), ctx);
    }
}
