//! Inbound listener: accepts connections and recovers from file-descriptor
//! exhaustion instead of busy-spinning on a level-triggered listening
//! socket.

use std::cell::{Cell, RefCell};
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::{Arc, Weak};

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::net::inet_addr::InetAddress;
use crate::net::socket::Socket;
use crate::net::sockets;

fn open_idle_fd() -> OwnedFd {
    let path = std::ffi::CString::new("/dev/null").unwrap();
    let fd = syscall!(open(path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC))
        .expect("Acceptor: opening /dev/null for the idle reserve descriptor failed");
    unsafe { OwnedFd::from_raw_fd(fd) }
}

/// Holds a listening socket, a read-armed channel, and a reserved
/// descriptor used to reclaim a slot during descriptor exhaustion.
pub struct Acceptor {
    loop_: Weak<EventLoop>,
    socket: Socket,
    channel: Channel,
    idle_fd: Cell<Option<OwnedFd>>,
    listening: Cell<bool>,
    new_connection_callback: RefCell<Option<Box<dyn FnMut(RawFd, &InetAddress)>>>,
}

impl Acceptor {
    pub fn new(
        event_loop: &Arc<EventLoop>,
        listen_addr: &InetAddress,
        reuse_port: bool,
    ) -> Rc<RefCell<Acceptor>> {
        let loop_weak = Arc::downgrade(event_loop);
        let listenfd = sockets::create_nonblocking_or_die(listen_addr.family());
        let socket = Socket::new(listenfd);
        socket.set_reuse_addr(true);
        if reuse_port {
            socket.set_reuse_port(true);
        }
        socket.bind_address(listen_addr);

        let channel = Channel::from_weak(loop_weak.clone(), listenfd);

        let acceptor = Rc::new(RefCell::new(Acceptor {
            loop_: loop_weak,
            socket,
            channel,
            idle_fd: Cell::new(Some(open_idle_fd())),
            listening: Cell::new(false),
            new_connection_callback: RefCell::new(None),
        }));

        let acceptor_for_cb = acceptor.clone();
        acceptor.borrow().channel.set_read_callback(move |_when| {
            acceptor_for_cb.borrow().handle_read();
        });

        acceptor
    }

    pub fn set_new_connection_callback(&self, cb: impl FnMut(RawFd, &InetAddress) + 'static) {
        *self.new_connection_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub fn listening(&self) -> bool {
        self.listening.get()
    }

    fn loop_upgrade(&self) -> Arc<EventLoop> {
        self.loop_.upgrade().expect("acceptor outlived its event loop")
    }

    /// Idempotent: calling this more than once re-enables reading but does
    /// not re-bind or re-listen.
    pub fn listen(&self) {
        let event_loop = self.loop_upgrade();
        event_loop.assert_in_loop_thread();
        self.listening.set(true);
        self.socket.listen();
        self.channel.enable_reading();
    }

    fn handle_read(&self) {
        let event_loop = self.loop_upgrade();
        event_loop.assert_in_loop_thread();
        match self.socket.accept() {
            Ok((connfd, peer_addr)) => {
                log::trace!("Acceptor accepted connection from {peer_addr}");
                let mut cb = self.new_connection_callback.borrow_mut();
                match cb.as_mut() {
                    Some(cb) => cb(connfd, &peer_addr),
                    None => sockets::close(connfd),
                }
            }
            Err(e) => {
                log::warn!("Acceptor::handle_read accept failed: {e}");
                if e.raw_os_error() == Some(libc::EMFILE) {
                    self.recover_from_emfile();
                }
            }
        }
    }

    /// Level-triggered `accept` readiness never clears on its own when the
    /// process is at its descriptor ceiling; free one descriptor, accept
    /// and immediately drop the pending connection, then reopen the
    /// reserve so future exhaustion can be handled the same way.
    fn recover_from_emfile(&self) {
        self.idle_fd.set(None);
        if let Ok((connfd, _)) = self.socket.accept() {
            sockets::close(connfd);
        }
        self.idle_fd.set(Some(open_idle_fd()));
    }
}
