//! The event loop: a multiplexed, timer-aware, cross-thread-wakeable
//! reactor built on a single [`Selector`].
//!
//! An `EventLoop` is owned by exactly one thread — the one that calls
//! [`start`](EventLoop::start). Everything except [`add_callback`] (and the
//! [`LoopHandle`] it can hand out) is unsafe to call from any other thread;
//! see the module's invariants in the crate-level docs.
//!
//! Every mutating method takes `&self`: the loop's fields live behind
//! `Cell`/`RefCell`, not behind one outer lock. A dispatched handler runs
//! with no borrow of the loop held at all, so it's free to call back into
//! `add_handler`/`update_handler`/`remove_handler`/`add_timeout` — as
//! [`stream::BufferedStream`](crate::stream::BufferedStream) does on every
//! I/O event — without re-entering anything already borrowed.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use crate::context::{self, BoxedCallback};
use crate::event::{Events, ReadyEvent};
use crate::selector::Selector;
use crate::waker::Waker;
use crate::{CallbackError, CallbackResult, Fd, Interest};

#[cfg(feature = "log")]
use log::{debug, error};

/// Upper bound on how long a single `poll` call is allowed to block, even
/// with no due timers at all.
const POLL_CEILING: f64 = 3600.0;

/// A callback crossing into the shared queue from a foreign thread may
/// still carry `Rc`-based context-propagator state if it was wrapped while
/// some context was active — but per this crate's design, context stacks
/// only live on a loop's own thread, so a queued callback wrapped from a
/// foreign thread always captured an *empty* stack and holds no `Rc` at
/// all. Either way, a callback is only ever run once, by the single loop
/// thread that drains this queue, never concurrently with the thread that
/// pushed it.
struct QueuedCallback(BoxedCallback);
unsafe impl Send for QueuedCallback {}

struct HandlerSlot {
    pending: Rc<Cell<Option<ReadyEvent>>>,
    // Shared out to `dispatch`, which clones the `Rc` and drops its borrow
    // of `handlers` before invoking it — the handler is free to re-enter
    // `add_handler`/`update_handler`/`remove_handler` on any fd, including
    // its own, without ever finding this (or `handlers`) already borrowed.
    wrapped: Rc<RefCell<BoxedCallback>>,
    interest: Cell<Interest>,
}

type TimerSlot = Rc<RefCell<Option<BoxedCallback>>>;

struct TimerEntry {
    deadline: f64,
    seq: u64,
    slot: TimerSlot,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed so `BinaryHeap`, a max-heap, surfaces the earliest deadline
    // (and among ties, the lowest sequence number) at the top.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .partial_cmp(&self.deadline)
            .expect("timer deadlines are always finite")
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Opaque handle returned by [`EventLoop::add_timeout`]; pass to
/// [`EventLoop::remove_timeout`] to cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutHandle(u64);

/// State shared between an `EventLoop` and any [`LoopHandle`]s it has
/// handed out — the only part of the loop that's safe to touch from a
/// foreign thread.
struct Shared {
    callbacks: Mutex<VecDeque<QueuedCallback>>,
    waker: Waker,
    thread_id: Mutex<Option<ThreadId>>,
    closing: AtomicBool,
}

fn schedule(shared: &Shared, cb: BoxedCallback) {
    if shared.closing.load(AtomicOrdering::SeqCst) {
        return;
    }
    let wrapped = context::wrap(cb);
    let was_empty;
    {
        let mut queue = shared.callbacks.lock().unwrap();
        was_empty = queue.is_empty();
        queue.push_back(QueuedCallback(wrapped));
    }
    let caller = std::thread::current().id();
    let owner = *shared.thread_id.lock().unwrap();
    if was_empty && owner != Some(caller) {
        let _ = shared.waker.wake();
    }
}

/// A cheaply cloneable handle that can schedule callbacks onto an
/// [`EventLoop`] from any thread.
///
/// This is the one piece of the loop that's genuinely thread-safe; obtain
/// it via [`EventLoop::handle`] before handing it to another thread.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

impl LoopHandle {
    /// Schedule `cb` to run on the loop thread. A no-op if the loop is
    /// closing.
    pub fn add_callback<F>(&self, cb: F)
    where
        F: FnMut() -> CallbackResult + 'static,
    {
        schedule(&self.shared, Box::new(cb));
    }
}

fn is_broken_pipe(err: &CallbackError) -> bool {
    err.downcast_ref::<io::Error>()
        .map(|e| e.kind() == io::ErrorKind::BrokenPipe)
        .unwrap_or(false)
}

/// A single-threaded, level-triggered reactor.
///
/// Owns the selector, the handler table, the callback queue, and the timer
/// heap described in the crate's data model; see the module docs for the
/// thread-ownership contract.
pub struct EventLoop {
    selector: Selector,
    handlers: RefCell<HashMap<Fd, HandlerSlot>>,
    events_buf: RefCell<Events>,
    timers: RefCell<BinaryHeap<TimerEntry>>,
    timer_slots: RefCell<HashMap<u64, TimerSlot>>,
    next_timer_seq: Cell<u64>,
    running: Cell<bool>,
    epoch: Instant,
    shared: Arc<Shared>,
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<EventLoop>>> = RefCell::new(None);
}

impl EventLoop {
    /// Build a fresh loop: a new selector plus a registered waker.
    pub fn new() -> io::Result<EventLoop> {
        let selector = Selector::new()?;
        let waker = Waker::new(&selector)?;
        Ok(EventLoop {
            selector,
            handlers: RefCell::new(HashMap::new()),
            events_buf: RefCell::new(Events::with_capacity(1024)),
            timers: RefCell::new(BinaryHeap::new()),
            timer_slots: RefCell::new(HashMap::new()),
            next_timer_seq: Cell::new(0),
            running: Cell::new(false),
            epoch: Instant::now(),
            shared: Arc::new(Shared {
                callbacks: Mutex::new(VecDeque::new()),
                waker,
                thread_id: Mutex::new(None),
                closing: AtomicBool::new(false),
            }),
        })
    }

    /// This thread's current loop, creating a lazy per-thread default if
    /// `create` is true and none has been set yet.
    ///
    /// The original design shares one process-wide default across every
    /// thread that never called [`make_current`](EventLoop::make_current)
    /// of its own; that can't be reproduced soundly here without making
    /// `EventLoop` itself `Send`/`Sync`, which would undermine the
    /// single-thread-ownership invariant the rest of this type relies on.
    /// Each thread instead gets its own lazily-constructed default.
    pub fn current(create: bool) -> Option<Rc<EventLoop>> {
        let existing = CURRENT.with(|c| c.borrow().clone());
        if existing.is_some() {
            return existing;
        }
        if !create {
            return None;
        }
        let loop_ = Rc::new(EventLoop::new().expect("failed to create the default event loop"));
        CURRENT.with(|c| *c.borrow_mut() = Some(loop_.clone()));
        Some(loop_)
    }

    /// Equivalent to `current(true)`.
    pub fn instance() -> Rc<EventLoop> {
        EventLoop::current(true).expect("current(true) always returns Some")
    }

    /// Install `loop_` as this thread's current loop.
    pub fn make_current(loop_: Rc<EventLoop>) {
        CURRENT.with(|c| *c.borrow_mut() = Some(loop_));
    }

    /// A handle that can schedule callbacks onto this loop from any
    /// thread.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    /// Monotonic time, in seconds, used for timer scheduling.
    pub fn time(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// Watch `fd` for `interest` (`ERROR` is always implied), invoking
    /// `handler` with the observed readiness on every subsequent poll.
    /// Fails if `fd` is already registered.
    pub fn add_handler<F>(&self, fd: Fd, mut handler: F, interest: Interest) -> io::Result<()>
    where
        F: FnMut(ReadyEvent) -> CallbackResult + 'static,
    {
        if self.handlers.borrow().contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("fd {} is already registered", fd),
            ));
        }

        let pending: Rc<Cell<Option<ReadyEvent>>> = Rc::new(Cell::new(None));
        let pending_for_dispatch = pending.clone();
        let raw: BoxedCallback = Box::new(move || {
            let event = pending_for_dispatch
                .take()
                .expect("handler invoked with no pending readiness event");
            handler(event)
        });
        let wrapped = context::wrap(raw);

        let full_interest = interest | Interest::ERROR;
        self.selector.register(fd, full_interest)?;
        self.handlers.borrow_mut().insert(
            fd,
            HandlerSlot {
                pending,
                wrapped: Rc::new(RefCell::new(wrapped)),
                interest: Cell::new(full_interest),
            },
        );
        Ok(())
    }

    /// Change the interest mask for an already-registered descriptor.
    pub fn update_handler(&self, fd: Fd, interest: Interest) -> io::Result<()> {
        if !self.handlers.borrow().contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("fd {} is not registered", fd),
            ));
        }
        let full_interest = interest | Interest::ERROR;
        self.selector.reregister(fd, full_interest)?;
        if let Some(slot) = self.handlers.borrow().get(&fd) {
            slot.interest.set(full_interest);
        }
        Ok(())
    }

    /// The interest mask `fd` is currently registered with, if any.
    pub fn interest_of(&self, fd: Fd) -> Option<Interest> {
        self.handlers.borrow().get(&fd).map(|slot| slot.interest.get())
    }

    /// Stop watching `fd`. Tolerates an `fd` that was never registered.
    pub fn remove_handler(&self, fd: Fd) -> io::Result<()> {
        self.handlers.borrow_mut().remove(&fd);
        match self.selector.deregister(fd) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Schedule `cb` to run on the loop thread, waking a blocked `poll` if
    /// this is the first callback queued since it last drained. A no-op
    /// while the loop is closing.
    pub fn add_callback<F>(&self, cb: F)
    where
        F: FnMut() -> CallbackResult + 'static,
    {
        schedule(&self.shared, Box::new(cb));
    }

    /// Fire `cb` once `deadline` (absolute monotonic seconds, see
    /// [`time`](EventLoop::time)) has passed. Fails if `deadline` isn't
    /// finite.
    pub fn add_timeout<F>(&self, deadline: f64, cb: F) -> io::Result<TimeoutHandle>
    where
        F: FnMut() -> CallbackResult + 'static,
    {
        if !deadline.is_finite() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "timeout deadline must be a finite number",
            ));
        }

        let wrapped = context::wrap(Box::new(cb));
        let seq = self.next_timer_seq.get();
        self.next_timer_seq.set(seq + 1);
        let slot: TimerSlot = Rc::new(RefCell::new(Some(wrapped)));
        self.timer_slots.borrow_mut().insert(seq, slot.clone());
        self.timers.borrow_mut().push(TimerEntry { deadline, seq, slot });
        Ok(TimeoutHandle(seq))
    }

    /// Cancel a pending timeout. A no-op if it already fired or was
    /// already cancelled.
    pub fn remove_timeout(&self, handle: TimeoutHandle) {
        if let Some(slot) = self.timer_slots.borrow_mut().remove(&handle.0) {
            *slot.borrow_mut() = None;
        }
    }

    /// Request that the loop exit after finishing its current iteration's
    /// in-progress work.
    pub fn stop(&self) {
        self.running.set(false);
        let _ = self.shared.waker.wake();
    }

    /// Run one iteration with polling forced on, for tests elsewhere in the
    /// crate that need to drive I/O dispatch without a full `start()` loop.
    #[cfg(test)]
    pub(crate) fn poll_once_for_test(&self) -> io::Result<bool> {
        self.running.set(true);
        self.run_iteration()
    }

    /// Close every registered descriptor, the selector, and the waker, and
    /// drop the callback and timer queues. Only valid while not running.
    pub fn close(&self) -> io::Result<()> {
        if self.running.get() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot close a running event loop",
            ));
        }
        self.shared.closing.store(true, AtomicOrdering::SeqCst);

        let fds: Vec<Fd> = self.handlers.borrow().keys().copied().collect();
        for fd in fds {
            let _ = self.selector.deregister(fd);
            let _ = syscall!(close(fd));
        }
        self.handlers.borrow_mut().clear();
        self.timers.borrow_mut().clear();
        self.timer_slots.borrow_mut().clear();
        self.shared.callbacks.lock().unwrap().clear();
        Ok(())
    }

    fn poll_timeout(&self, now: f64) -> Duration {
        if !self.shared.callbacks.lock().unwrap().is_empty() {
            return Duration::from_secs(0);
        }
        match self.timers.borrow().peek() {
            Some(next) => Duration::from_secs_f64((next.deadline - now).clamp(0.0, POLL_CEILING)),
            None => Duration::from_secs_f64(POLL_CEILING),
        }
    }

    /// Dispatch one readiness event. Clones the handler's pending-event
    /// cell and its (still-boxed) callback out of `handlers`, dropping the
    /// borrow before invoking it — so a handler that reenters `add_handler`
    /// / `update_handler` / `remove_handler` / `add_timeout`, on its own fd
    /// or any other, never finds `handlers` already borrowed.
    fn dispatch(&self, event: ReadyEvent) {
        if event.fd() == self.shared.waker.token() {
            self.shared.waker.drain();
            return;
        }
        let handle = {
            let handlers = self.handlers.borrow();
            handlers
                .get(&event.fd())
                .map(|slot| (slot.pending.clone(), slot.wrapped.clone()))
        };
        let Some((pending, wrapped)) = handle else {
            return;
        };
        pending.set(Some(event));
        #[allow(unused_variables)]
        if let Err(err) = wrapped.borrow_mut().invoke() {
            if is_broken_pipe(&err) {
                #[cfg(feature = "log")]
                debug!("fd {} handler: broken pipe: {}", event.fd(), err);
            } else {
                #[cfg(feature = "log")]
                error!("fd {} handler failed: {}", event.fd(), err);
            }
        }
    }

    /// Run one pass of the ready-callbacks → due-timers → poll → dispatch
    /// cycle. Returns `false` once `stop()` has been observed and the
    /// loop should exit; `true` to keep going.
    fn run_iteration(&self) -> io::Result<bool> {
        let ready: VecDeque<QueuedCallback> = {
            let mut queue = self.shared.callbacks.lock().unwrap();
            std::mem::take(&mut *queue)
        };

        let now = self.time();
        let mut due: Vec<TimerSlot> = Vec::new();
        loop {
            let is_due = matches!(self.timers.borrow().peek(), Some(top) if top.deadline <= now);
            if !is_due {
                break;
            }
            let entry = self.timers.borrow_mut().pop().unwrap();
            self.timer_slots.borrow_mut().remove(&entry.seq);
            due.push(entry.slot);
        }

        #[allow(unused_variables)]
        for mut cb in ready {
            if let Err(err) = cb.0.invoke() {
                #[cfg(feature = "log")]
                error!("callback failed: {}", err);
            }
        }

        #[allow(unused_variables)]
        for slot in due {
            let taken = slot.borrow_mut().take();
            if let Some(mut cb) = taken {
                if let Err(err) = cb.invoke() {
                    #[cfg(feature = "log")]
                    error!("timer callback failed: {}", err);
                }
            }
        }

        if !self.running.get() {
            return Ok(false);
        }

        let timeout = self.poll_timeout(self.time());
        {
            let mut events_buf = self.events_buf.borrow_mut();
            match self.selector.select(&mut events_buf, Some(timeout)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(true),
                Err(err) => return Err(err),
            }
        }

        let mut pending: Vec<ReadyEvent> = self.events_buf.borrow().iter().collect();
        while let Some(event) = pending.pop() {
            self.dispatch(event);
        }

        Ok(true)
    }

    /// Run the loop until [`stop`](EventLoop::stop) is called (directly,
    /// or via a callback scheduled through [`add_callback`] or a
    /// [`LoopHandle`]).
    pub fn start(&self) -> io::Result<()> {
        *self.shared.thread_id.lock().unwrap() = Some(std::thread::current().id());
        self.running.set(true);

        let result = loop {
            match self.run_iteration() {
                Ok(true) => continue,
                Ok(false) => break Ok(()),
                Err(err) => break Err(err),
            }
        };

        self.running.set(false);
        *self.shared.thread_id.lock().unwrap() = None;
        let _ = self.shared.waker.wake();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_thread_callback_runs_on_loop_thread() {
        let loop_ = EventLoop::new().unwrap();
        let handle = loop_.handle();
        let ran = Rc::new(Cell::new(false));

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            handle.add_callback(|| Ok(()));
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(1)).unwrap();

        let ran2 = ran.clone();
        let _ = loop_.run_iteration();
        // The spawned thread's callback ran as part of the queue drain
        // above; a second, loop-thread-originated callback confirms the
        // queue is still usable afterward.
        loop_.add_callback(move || {
            ran2.set(true);
            Ok(())
        });
        let _ = loop_.run_iteration();
        assert!(ran.get());
    }

    #[test]
    fn timer_ordering() {
        let loop_ = EventLoop::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        let now = loop_.time();
        let o1 = order.clone();
        loop_.add_timeout(now + 0.10, move || {
            o1.borrow_mut().push('A');
            Ok(())
        }).unwrap();
        let o2 = order.clone();
        loop_.add_timeout(now + 0.05, move || {
            o2.borrow_mut().push('B');
            Ok(())
        }).unwrap();
        let o3 = order.clone();
        loop_.add_timeout(now + 0.10, move || {
            o3.borrow_mut().push('C');
            Ok(())
        }).unwrap();

        std::thread::sleep(Duration::from_millis(120));
        let _ = loop_.run_iteration();

        assert_eq!(*order.borrow(), vec!['B', 'A', 'C']);
    }

    #[test]
    fn remove_timeout_tombstones() {
        let loop_ = EventLoop::new().unwrap();
        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        let handle = loop_
            .add_timeout(loop_.time() + 0.01, move || {
                f.set(true);
                Ok(())
            })
            .unwrap();
        loop_.remove_timeout(handle);

        std::thread::sleep(Duration::from_millis(20));
        let _ = loop_.run_iteration();

        assert!(!fired.get());
    }

    #[test]
    fn add_handler_rejects_duplicate_fd() {
        let loop_ = EventLoop::new().unwrap();
        // fd 0 (stdin) is always a valid descriptor to register against in
        // a test process, though we never actually poll on it here.
        assert!(loop_.add_handler(0, |_| Ok(()), Interest::READ).is_ok());
        assert!(loop_.add_handler(0, |_| Ok(()), Interest::READ).is_err());
        let _ = loop_.remove_handler(0);
    }
}
