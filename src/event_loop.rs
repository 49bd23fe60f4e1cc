//! The per-thread reactor: demultiplexer wrapper, wake-up mechanism, pending
//! task queue, and thread-affinity contract.

use std::cell::{Cell, RefCell};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::callbacks::TimerCallback;
use crate::channel::Channel;
use crate::poller::{new_default_poller, ActiveChannel, Poller};
use crate::timer::TimerId;
use crate::timer_queue::TimerQueue;

/// How long one `poll` call blocks when nothing is due; bounds how long a
/// `queue_in_loop` wake-up can be delayed in the pathological case where the
/// wake write itself is lost.
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

fn create_eventfd() -> OwnedFd {
    let fd = syscall!(eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC))
        .expect("eventfd creation failed");
    unsafe { OwnedFd::from_raw_fd(fd) }
}

fn read_eventfd(fd: RawFd) {
    let mut buf = [0u8; 8];
    match crate::net::sockets::read(fd, &mut buf) {
        Ok(8) => {}
        Ok(n) => log::warn!("EventLoop::wake read {n} bytes instead of 8"),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(e) => log::error!("EventLoop::wake read failed: {e}"),
    }
}

/// A per-thread reactor. Every mutating operation on the loop itself, its
/// channels or its timers must happen on the thread that created it;
/// crossing that boundary goes through [`EventLoop::run_in_loop`] or
/// [`EventLoop::queue_in_loop`].
///
/// Held behind `Arc` so channels, the timer queue and cross-thread callers
/// can all keep a reference, yet internally the loop is built from
/// `RefCell`/`Cell` rather than `Mutex`: all of that state is touched only
/// from the owning thread, exactly as in a plain single-threaded reactor,
/// and paying for a mutex on every channel dispatch would defeat the
/// point. The `unsafe impl Sync` below is the deliberate, documented trade
/// that makes sharing the `Arc` across threads compile; it is sound only
/// because every method that touches the `RefCell` fields asserts it is
/// running on the owning thread first. See DESIGN.md for the full
/// rationale.
pub struct EventLoop {
    thread_id: ThreadId,
    poller: RefCell<Box<dyn Poller>>,
    timer_queue: Rc<RefCell<TimerQueue>>,
    pending_functors: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    calling_pending_functors: Cell<bool>,
    quit: AtomicBool,
    wake_fd: OwnedFd,
    wake_channel: RefCell<Option<Channel>>,
    active_channels: RefCell<Vec<ActiveChannel>>,
    iteration: Cell<u64>,
}

// Safety: every access to the non-Sync/non-Send fields (`poller`,
// `timer_queue`, `wake_channel`, `active_channels`,
// `calling_pending_functors`, `iteration`) is preceded by
// `assert_in_loop_thread`, so only the single owning thread ever actually
// touches them, regardless of how many threads hold the surrounding `Arc`
// or which thread drops the last one. `pending_functors` is the one field
// genuinely shared across threads and is guarded by a real `Mutex`.
// `Send` is needed, not just `Sync`, because the constructing thread hands
// the `Arc<EventLoop>` it just built off to its caller (e.g. across an
// `mpsc` channel) before ever running the loop.
unsafe impl Send for EventLoop {}
unsafe impl Sync for EventLoop {}

impl EventLoop {
    /// Construct a loop bound to the calling thread. Must be called on the
    /// thread that will subsequently call [`EventLoop::run`].
    pub fn new() -> Arc<EventLoop> {
        let thread_id = thread::current().id();
        let wake_fd = create_eventfd();
        let raw_wake_fd = wake_fd.as_raw_fd();

        let event_loop = Arc::new_cyclic(|weak| {
            let timer_queue = Rc::new(RefCell::new(TimerQueue::new(weak.clone())));
            EventLoop {
                thread_id,
                poller: RefCell::new(new_default_poller()),
                timer_queue,
                pending_functors: Mutex::new(Vec::new()),
                calling_pending_functors: Cell::new(false),
                quit: AtomicBool::new(false),
                wake_fd,
                wake_channel: RefCell::new(None),
                active_channels: RefCell::new(Vec::new()),
                iteration: Cell::new(0),
            }
        });

        TimerQueue::attach(&event_loop.timer_queue);

        let wake_channel = Channel::from_weak(Arc::downgrade(&event_loop), raw_wake_fd);
        wake_channel.set_read_callback(move |_now| read_eventfd(raw_wake_fd));
        wake_channel.enable_reading();
        *event_loop.wake_channel.borrow_mut() = Some(wake_channel);

        log::debug!("EventLoop created in thread {:?}", thread_id);
        event_loop
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            log::error!(
                "EventLoop used from thread {:?}, but it is owned by thread {:?}",
                thread::current().id(),
                self.thread_id
            );
            panic!("EventLoop accessed from a thread that does not own it");
        }
    }

    /// Run until [`EventLoop::quit`] is called. Must run on the owning
    /// thread.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        log::debug!("EventLoop {:?} start looping", self.thread_id);

        while !self.quit.load(Ordering::Acquire) {
            let now = {
                let mut active = self.active_channels.borrow_mut();
                active.clear();
                let mut poller = self.poller.borrow_mut();
                poller.poll(POLL_TIMEOUT, &mut active)
            };
            self.iteration.set(self.iteration.get() + 1);

            let active: Vec<ActiveChannel> = self.active_channels.borrow_mut().drain(..).collect();
            for entry in active {
                entry.channel.handle_event(now);
            }

            self.do_pending_functors();
        }

        log::debug!("EventLoop {:?} stop looping", self.thread_id);
    }

    /// Run `f` immediately if called from the owning thread, otherwise
    /// hand it off via [`EventLoop::queue_in_loop`].
    pub fn run_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.queue_in_loop(f);
        }
    }

    /// Always enqueue `f` for the owning thread's next functor drain.
    /// Wakes the loop immediately unless we are on the owning thread and
    /// not currently inside a drain (in which case the loop will see it on
    /// the very next drain with no wake needed).
    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        {
            let mut pending = self.pending_functors.lock().unwrap();
            pending.push(Box::new(f));
        }
        if !self.is_in_loop_thread() || self.calling_pending_functors.get() {
            self.wake();
        }
    }

    fn do_pending_functors(&self) {
        let functors: Vec<Box<dyn FnOnce() + Send>> = {
            let mut pending = self.pending_functors.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        self.calling_pending_functors.set(true);
        for f in functors {
            f();
        }
        self.calling_pending_functors.set(false);
    }

    fn wake(&self) {
        let one: u64 = 1;
        if let Err(e) = crate::net::sockets::write(self.wake_fd.as_raw_fd(), &one.to_ne_bytes()) {
            log::error!("EventLoop::wake failed: {e}");
        }
    }

    /// Schedule `cb` to run once at `when`.
    pub fn run_at(&self, when: Instant, cb: TimerCallback) -> TimerId {
        TimerQueue::add_timer(&self.timer_queue, cb, when, Duration::ZERO)
    }

    /// Schedule `cb` to run once after `delay`.
    pub fn run_after(&self, delay: Duration, cb: TimerCallback) -> TimerId {
        self.run_at(Instant::now() + delay, cb)
    }

    /// Schedule `cb` to run every `interval`, starting one interval from
    /// now.
    pub fn run_every(&self, interval: Duration, cb: TimerCallback) -> TimerId {
        TimerQueue::add_timer(&self.timer_queue, cb, Instant::now() + interval, interval)
    }

    /// Cancel a previously scheduled timer. Safe from any thread and from
    /// inside a timer callback.
    pub fn cancel(&self, id: TimerId) {
        TimerQueue::cancel(&self.timer_queue, id);
    }

    /// Request loop exit. Safe from any thread.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wake();
        }
    }

    pub(crate) fn update_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().remove_channel(channel);
    }

    pub fn has_channel(&self, fd: RawFd) -> bool {
        self.assert_in_loop_thread();
        self.poller.borrow().has_channel(fd)
    }

    pub fn iteration(&self) -> u64 {
        self.iteration.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn run_in_loop_executes_immediately_on_owning_thread() {
        let event_loop = EventLoop::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        event_loop.run_in_loop(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn queue_in_loop_from_other_thread_wakes_and_runs() {
        // `EventLoop::new` must run on the thread that will drive it, so
        // construction happens inside the spawned thread and the `Arc` is
        // handed back over a channel.
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = std::thread::spawn(move || {
            let event_loop = EventLoop::new();
            tx.send(event_loop.clone()).unwrap();
            event_loop.run();
        });

        let event_loop = rx.recv().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let el_for_quit = event_loop.clone();

        event_loop.queue_in_loop(move || {
            ran2.store(true, Ordering::SeqCst);
        });
        event_loop.queue_in_loop(move || {
            el_for_quit.quit();
        });

        handle.join().unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    /// A timer callback scheduling a new timer and cancelling itself,
    /// entirely through the public `EventLoop` API — the exact reentrant
    /// pattern `Connector::retry` exercises (a firing timer's callback
    /// calling `run_after`) and that `TimerQueue::cancel`'s doc contract
    /// promises is safe. Before the `TimerQueue::add_timer`/`cancel`/
    /// `handle_read` borrow fix this panicked with `BorrowMutError` on the
    /// very first fire.
    #[test]
    fn timer_callback_can_schedule_and_cancel_via_public_api() {
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = std::thread::spawn(move || {
            let event_loop = EventLoop::new();
            tx.send(event_loop.clone()).unwrap();
            event_loop.run();
        });
        let event_loop = rx.recv().unwrap();

        let fires = Arc::new(AtomicUsize::new(0));
        let rescheduled = Arc::new(AtomicBool::new(false));
        let self_id: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));

        let loop_for_cb = event_loop.clone();
        let fires2 = fires.clone();
        let rescheduled2 = rescheduled.clone();
        let self_id2 = self_id.clone();
        let id = event_loop.run_every(
            Duration::from_millis(10),
            Box::new(move || {
                fires2.fetch_add(1, Ordering::SeqCst);

                let rescheduled3 = rescheduled2.clone();
                loop_for_cb.run_after(
                    Duration::from_millis(1),
                    Box::new(move || rescheduled3.store(true, Ordering::SeqCst)),
                );

                if let Some(id) = *self_id2.lock().unwrap() {
                    loop_for_cb.cancel(id);
                }
            }),
        );
        *self_id.lock().unwrap() = Some(id);

        std::thread::sleep(Duration::from_millis(150));
        event_loop.quit();
        handle.join().unwrap();

        assert_eq!(
            fires.load(Ordering::SeqCst),
            1,
            "a repeating timer that cancels itself on its first fire must not fire again"
        );
        assert!(
            rescheduled.load(Ordering::SeqCst),
            "the one-shot timer scheduled from inside the firing callback must still run"
        );
    }
}
