//! Binding of one file descriptor to an event loop: interest bits, a
//! readiness dispatcher, and a lifetime guard against callback re-entry.

use std::any::Any;
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak as RcWeak};
use std::sync::Weak as ArcWeak;
use std::time::Instant;

use crate::event_loop::EventLoop;
use crate::poller::{ChannelState, Interest, Readiness};

type ReadCb = Box<dyn FnMut(Instant)>;
type SimpleCb = Box<dyn FnMut()>;

struct ChannelInner {
    loop_: ArcWeak<EventLoop>,
    fd: RawFd,
    events: Interest,
    revents: Readiness,
    index: i32,
    state: ChannelState,
    event_handling: bool,
    added_to_loop: bool,
    tied: bool,
    tie: Option<ArcWeak<dyn Any + Send + Sync>>,
    log_hup: bool,
    read_callback: Option<ReadCb>,
    write_callback: Option<SimpleCb>,
    close_callback: Option<SimpleCb>,
    error_callback: Option<SimpleCb>,
}

/// A cheaply-clonable handle sharing one channel's state. All clones
/// refer to the same descriptor binding; cloning does not duplicate the
/// registration.
#[derive(Clone)]
pub struct Channel {
    inner: Rc<RefCell<ChannelInner>>,
}

/// A non-owning reference to a channel, held by the demultiplexer's
/// registry so it never keeps a channel alive past its owner dropping it.
#[derive(Clone)]
pub struct ChannelWeak {
    inner: RcWeak<RefCell<ChannelInner>>,
}

impl ChannelWeak {
    pub fn upgrade(&self) -> Option<Channel> {
        self.inner.upgrade().map(|inner| Channel { inner })
    }
}

impl Channel {
    pub fn new(event_loop: &std::sync::Arc<EventLoop>, fd: RawFd) -> Channel {
        Channel::from_weak(std::sync::Arc::downgrade(event_loop), fd)
    }

    /// Construct from a weak handle directly; used while the owning
    /// `EventLoop`'s `Arc` is still being built (see `Arc::new_cyclic` in
    /// `EventLoop::new`).
    pub fn from_weak(loop_weak: ArcWeak<EventLoop>, fd: RawFd) -> Channel {
        Channel {
            inner: Rc::new(RefCell::new(ChannelInner {
                loop_: loop_weak,
                fd,
                events: Interest::NONE,
                revents: Readiness::default(),
                index: -1,
                state: ChannelState::New,
                event_handling: false,
                added_to_loop: false,
                tied: false,
                tie: None,
                log_hup: true,
                read_callback: None,
                write_callback: None,
                close_callback: None,
                error_callback: None,
            })),
        }
    }

    pub fn downgrade(&self) -> ChannelWeak {
        ChannelWeak {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn ptr_eq(&self, other: &Channel) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn fd(&self) -> RawFd {
        self.inner.borrow().fd
    }

    pub fn events(&self) -> Interest {
        self.inner.borrow().events
    }

    pub fn set_revents(&self, revents: Readiness) {
        self.inner.borrow_mut().revents = revents;
    }

    pub fn index(&self) -> i32 {
        self.inner.borrow().index
    }

    pub fn set_index(&self, index: i32) {
        self.inner.borrow_mut().index = index;
    }

    pub fn state(&self) -> ChannelState {
        self.inner.borrow().state
    }

    pub fn set_state(&self, state: ChannelState) {
        self.inner.borrow_mut().state = state;
    }

    pub fn is_none_event(&self) -> bool {
        self.inner.borrow().events.is_none()
    }

    pub fn is_writing(&self) -> bool {
        self.inner.borrow().events.writable
    }

    pub fn is_reading(&self) -> bool {
        self.inner.borrow().events.readable
    }

    pub fn set_log_hup(&self, log_hup: bool) {
        self.inner.borrow_mut().log_hup = log_hup;
    }

    pub fn set_read_callback(&self, cb: impl FnMut(Instant) + 'static) {
        self.inner.borrow_mut().read_callback = Some(Box::new(cb));
    }

    pub fn set_write_callback(&self, cb: impl FnMut() + 'static) {
        self.inner.borrow_mut().write_callback = Some(Box::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl FnMut() + 'static) {
        self.inner.borrow_mut().close_callback = Some(Box::new(cb));
    }

    pub fn set_error_callback(&self, cb: impl FnMut() + 'static) {
        self.inner.borrow_mut().error_callback = Some(Box::new(cb));
    }

    /// Record a weak reference to the owner. While tied, `handle_event`
    /// upgrades the weak before dispatching and skips the callback if the
    /// owner no longer exists, so a callback never runs on a freed object.
    pub fn tie(&self, owner: ArcWeak<dyn Any + Send + Sync>) {
        let mut inner = self.inner.borrow_mut();
        inner.tie = Some(owner);
        inner.tied = true;
    }

    fn loop_(&self) -> std::sync::Arc<EventLoop> {
        self.inner
            .borrow()
            .loop_
            .upgrade()
            .expect("channel outlived its event loop")
    }

    fn update_events(&self, events: Interest) {
        self.inner.borrow_mut().events = events;
        self.update();
    }

    pub fn enable_reading(&self) {
        let events = {
            let mut e = self.events();
            e.readable = true;
            e
        };
        self.update_events(events);
    }

    pub fn disable_reading(&self) {
        let events = {
            let mut e = self.events();
            e.readable = false;
            e
        };
        self.update_events(events);
    }

    pub fn enable_writing(&self) {
        let events = {
            let mut e = self.events();
            e.writable = true;
            e
        };
        self.update_events(events);
    }

    pub fn disable_writing(&self) {
        let events = {
            let mut e = self.events();
            e.writable = false;
            e
        };
        self.update_events(events);
    }

    pub fn disable_all(&self) {
        self.update_events(Interest::NONE);
    }

    fn update(&self) {
        self.inner.borrow_mut().added_to_loop = true;
        self.loop_().update_channel(self);
    }

    /// Deregister. Precondition: interest set is empty (asserted).
    pub fn remove(&self) {
        assert!(self.is_none_event(), "channel must disable all interest before remove");
        self.inner.borrow_mut().added_to_loop = false;
        self.loop_().remove_channel(self);
    }

    /// Dispatch readiness recorded via `set_revents` to the appropriate
    /// callbacks, upgrading the tie (if any) first.
    pub fn handle_event(&self, receive_time: Instant) {
        let tied = self.inner.borrow().tied;
        if tied {
            let tie = self.inner.borrow().tie.clone();
            if let Some(tie) = tie {
                if let Some(guard) = tie.upgrade() {
                    let _keep_alive = guard;
                    self.handle_event_with_guard(receive_time);
                }
                // owner gone: silently skip, matches upgrade-fails semantics
            }
        } else {
            self.handle_event_with_guard(receive_time);
        }
    }

    fn handle_event_with_guard(&self, receive_time: Instant) {
        let revents = self.inner.borrow().revents;
        self.inner.borrow_mut().event_handling = true;

        if revents.hup && !revents.readable {
            if self.inner.borrow().log_hup {
                log::warn!("channel({}) POLLHUP", self.fd());
            }
            self.run_close();
        }
        if revents.invalid {
            log::warn!("channel({}) POLLNVAL", self.fd());
        }
        if revents.error || revents.invalid {
            self.run_error();
        }
        if revents.readable || revents.priority {
            self.run_read(receive_time);
        }
        if revents.writable {
            self.run_write();
        }

        self.inner.borrow_mut().event_handling = false;
    }

    fn run_read(&self, when: Instant) {
        let cb = self.inner.borrow_mut().read_callback.take();
        if let Some(mut cb) = cb {
            cb(when);
            self.inner.borrow_mut().read_callback = Some(cb);
        }
    }

    fn run_write(&self) {
        let cb = self.inner.borrow_mut().write_callback.take();
        if let Some(mut cb) = cb {
            cb();
            self.inner.borrow_mut().write_callback = Some(cb);
        }
    }

    fn run_close(&self) {
        let cb = self.inner.borrow_mut().close_callback.take();
        if let Some(mut cb) = cb {
            cb();
            self.inner.borrow_mut().close_callback = Some(cb);
        }
    }

    fn run_error(&self) {
        let cb = self.inner.borrow_mut().error_callback.take();
        if let Some(mut cb) = cb {
            cb();
            self.inner.borrow_mut().error_callback = Some(cb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::cell::RefCell;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;

    #[test]
    fn interest_mutators_toggle_and_register() {
        let event_loop = EventLoop::new();
        let (a, _b) = UnixStream::pair().unwrap();
        let channel = Channel::new(&event_loop, a.as_raw_fd());

        assert!(!channel.is_reading());
        channel.enable_reading();
        assert!(channel.is_reading());
        assert!(event_loop.has_channel(a.as_raw_fd()));

        channel.enable_writing();
        assert!(channel.is_writing());
        channel.disable_writing();
        assert!(!channel.is_writing());

        channel.disable_all();
        assert!(channel.is_none_event());
        channel.remove();
        assert!(!event_loop.has_channel(a.as_raw_fd()));
    }

    #[test]
    #[should_panic(expected = "must disable all interest")]
    fn remove_panics_with_active_interest() {
        let event_loop = EventLoop::new();
        let (a, _b) = UnixStream::pair().unwrap();
        let channel = Channel::new(&event_loop, a.as_raw_fd());
        channel.enable_reading();
        channel.remove();
    }

    #[test]
    fn dispatch_order_read_before_write() {
        let event_loop = EventLoop::new();
        let (a, _b) = UnixStream::pair().unwrap();
        let channel = Channel::new(&event_loop, a.as_raw_fd());

        let trace = Rc::new(RefCell::new(Vec::new()));
        let t1 = trace.clone();
        channel.set_read_callback(move |_now| t1.borrow_mut().push("read"));
        let t2 = trace.clone();
        channel.set_write_callback(move || t2.borrow_mut().push("write"));

        channel.set_revents(Readiness {
            readable: true,
            writable: true,
            ..Readiness::default()
        });
        channel.handle_event(std::time::Instant::now());

        assert_eq!(*trace.borrow(), vec!["read", "write"]);
    }

    #[test]
    fn hangup_without_readable_runs_close_not_read() {
        let event_loop = EventLoop::new();
        let (a, _b) = UnixStream::pair().unwrap();
        let channel = Channel::new(&event_loop, a.as_raw_fd());
        channel.set_log_hup(false);

        let trace = Rc::new(RefCell::new(Vec::new()));
        let t1 = trace.clone();
        channel.set_read_callback(move |_now| t1.borrow_mut().push("read"));
        let t2 = trace.clone();
        channel.set_close_callback(move || t2.borrow_mut().push("close"));

        channel.set_revents(Readiness {
            hup: true,
            ..Readiness::default()
        });
        channel.handle_event(std::time::Instant::now());

        assert_eq!(*trace.borrow(), vec!["close"]);
    }

    #[test]
    fn tie_skips_callback_once_owner_is_dropped() {
        use std::any::Any;
        use std::sync::Arc;

        let event_loop = EventLoop::new();
        let (a, _b) = UnixStream::pair().unwrap();
        let channel = Channel::new(&event_loop, a.as_raw_fd());

        let fired = Rc::new(RefCell::new(false));
        let fired2 = fired.clone();
        channel.set_read_callback(move |_now| *fired2.borrow_mut() = true);

        let owner: Arc<dyn Any + Send + Sync> = Arc::new(42u32);
        channel.tie(Arc::downgrade(&owner));
        drop(owner);

        channel.set_revents(Readiness {
            readable: true,
            ..Readiness::default()
        });
        channel.handle_event(std::time::Instant::now());

        assert!(!*fired.borrow());
    }
}
