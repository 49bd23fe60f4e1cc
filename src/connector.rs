//! Outbound non-blocking connect with exponential backoff and self-connect
//! detection.

use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::net::inet_addr::InetAddress;
use crate::net::sockets;

const INIT_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ConnectorState {
    Disconnected,
    Connecting,
    Connected,
}

/// Drives one outbound connection attempt at a time toward `server_addr`,
/// retrying with exponential backoff on rejection.
///
/// Shared via `Arc` so its own timer-backed retry can hold a weak
/// reference to reschedule itself; see the same `unsafe impl Send + Sync`
/// rationale as [`crate::TcpConnection`] in DESIGN.md — all mutation here
/// happens on the owning loop's thread, reached either directly or via
/// `run_in_loop`/`queue_in_loop`/a timer callback.
pub struct Connector {
    loop_: Weak<EventLoop>,
    server_addr: InetAddress,
    connect: Cell<bool>,
    state: Cell<ConnectorState>,
    channel: RefCell<Option<Channel>>,
    retry_delay: Cell<Duration>,
    new_connection_callback: RefCell<Option<Box<dyn FnMut(RawFd)>>>,
    self_weak: Weak<Connector>,
}

unsafe impl Send for Connector {}
unsafe impl Sync for Connector {}

impl Connector {
    pub fn new(event_loop: &Arc<EventLoop>, server_addr: InetAddress) -> Arc<Connector> {
        let loop_weak = Arc::downgrade(event_loop);
        Arc::new_cyclic(|weak| Connector {
            loop_: loop_weak,
            server_addr,
            connect: Cell::new(false),
            state: Cell::new(ConnectorState::Disconnected),
            channel: RefCell::new(None),
            retry_delay: Cell::new(INIT_RETRY_DELAY),
            new_connection_callback: RefCell::new(None),
            self_weak: weak.clone(),
        })
    }

    pub fn set_new_connection_callback(&self, cb: impl FnMut(RawFd) + 'static) {
        *self.new_connection_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub fn server_addr(&self) -> InetAddress {
        self.server_addr
    }

    fn loop_upgrade(&self) -> Arc<EventLoop> {
        self.loop_.upgrade().expect("connector outlived its event loop")
    }

    /// Begin connecting. Safe from any thread; resets backoff to the
    /// initial delay.
    pub fn start(&self) {
        self.connect.set(true);
        let weak = self.self_weak.clone();
        self.loop_upgrade().run_in_loop(move || {
            if let Some(connector) = weak.upgrade() {
                connector.start_in_loop();
            }
        });
    }

    fn start_in_loop(&self) {
        self.loop_upgrade().assert_in_loop_thread();
        self.retry_delay.set(INIT_RETRY_DELAY);
        if self.connect.get() {
            self.connect_();
        } else {
            log::debug!("Connector::start_in_loop - do not connect");
        }
    }

    /// Cancel the retry toggle and any in-flight attempt. Safe from any
    /// thread.
    pub fn stop(&self) {
        self.connect.set(false);
        let weak = self.self_weak.clone();
        self.loop_upgrade().queue_in_loop(move || {
            if let Some(connector) = weak.upgrade() {
                connector.stop_in_loop();
            }
        });
    }

    fn stop_in_loop(&self) {
        self.loop_upgrade().assert_in_loop_thread();
        if self.state.get() == ConnectorState::Connecting {
            self.state.set(ConnectorState::Disconnected);
            if let Some(channel) = self.channel.borrow_mut().take() {
                let fd = channel.fd();
                channel.disable_all();
                channel.remove();
                sockets::close(fd);
            }
        }
    }

    /// Reset backoff and reconnect. Safe from any thread.
    pub fn restart(&self) {
        self.connect.set(true);
        let weak = self.self_weak.clone();
        self.loop_upgrade().run_in_loop(move || {
            if let Some(connector) = weak.upgrade() {
                connector.state.set(ConnectorState::Disconnected);
                connector.start_in_loop();
            }
        });
    }

    fn connect_(&self) {
        let fd = sockets::create_nonblocking_or_die(self.server_addr.family());
        match sockets::connect(fd, &self.server_addr) {
            Ok(()) => self.connecting(fd),
            Err(e) => match e.raw_os_error() {
                Some(libc::EINPROGRESS) | Some(libc::EINTR) | Some(libc::EISCONN) => {
                    self.connecting(fd)
                }
                Some(libc::EAGAIN)
                | Some(libc::EADDRINUSE)
                | Some(libc::EADDRNOTAVAIL)
                | Some(libc::ECONNREFUSED)
                | Some(libc::ENETUNREACH) => {
                    log::warn!("Connector::connect_ to {} failed: {e}", self.server_addr);
                    self.retry(fd);
                }
                _ => {
                    log::error!("Connector::connect_ to {} failed: {e}", self.server_addr);
                    sockets::close(fd);
                }
            },
        }
    }

    fn connecting(&self, fd: RawFd) {
        self.state.set(ConnectorState::Connecting);
        let channel = Channel::from_weak(self.loop_.clone(), fd);

        let weak_for_write = self.self_weak.clone();
        channel.set_write_callback(move || {
            if let Some(connector) = weak_for_write.upgrade() {
                connector.handle_write();
            }
        });
        let weak_for_error = self.self_weak.clone();
        channel.set_error_callback(move || {
            if let Some(connector) = weak_for_error.upgrade() {
                connector.handle_error();
            }
        });
        channel.enable_writing();
        *self.channel.borrow_mut() = Some(channel);
    }

    fn take_connecting_channel(&self) -> Option<RawFd> {
        let channel = self.channel.borrow_mut().take()?;
        let fd = channel.fd();
        channel.disable_all();
        channel.remove();
        Some(fd)
    }

    fn handle_write(&self) {
        self.loop_upgrade().assert_in_loop_thread();
        if self.state.get() != ConnectorState::Connecting {
            return;
        }
        let fd = match self.take_connecting_channel() {
            Some(fd) => fd,
            None => return,
        };

        let err = sockets::get_socket_error(fd);
        if err != 0 {
            log::warn!("Connector::handle_write - SO_ERROR = {err}");
            self.retry(fd);
        } else if sockets::is_self_connect(fd) {
            log::warn!("Connector::handle_write - self connect to {}", self.server_addr);
            self.retry(fd);
        } else {
            self.state.set(ConnectorState::Connected);
            if self.connect.get() {
                let mut cb = self.new_connection_callback.borrow_mut();
                match cb.as_mut() {
                    Some(cb) => cb(fd),
                    None => sockets::close(fd),
                }
            } else {
                sockets::close(fd);
            }
        }
    }

    fn handle_error(&self) {
        self.loop_upgrade().assert_in_loop_thread();
        if self.state.get() != ConnectorState::Connecting {
            return;
        }
        let fd = match self.take_connecting_channel() {
            Some(fd) => fd,
            None => return,
        };
        let err = sockets::get_socket_error(fd);
        log::warn!("Connector::handle_error - SO_ERROR = {err}");
        self.retry(fd);
    }

    fn retry(&self, fd: RawFd) {
        sockets::close(fd);
        self.state.set(ConnectorState::Disconnected);
        if self.connect.get() {
            let delay = self.retry_delay.get();
            log::info!("Connector::retry - retrying {} in {:?}", self.server_addr, delay);
            let weak = self.self_weak.clone();
            self.loop_upgrade().run_after(
                delay,
                Box::new(move || {
                    if let Some(connector) = weak.upgrade() {
                        connector.connect_();
                    }
                }),
            );
            self.retry_delay.set((delay * 2).min(MAX_RETRY_DELAY));
        } else {
            log::debug!("Connector::retry - do not connect");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;

    #[test]
    fn connects_successfully_to_a_listening_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = InetAddress::from_ip_port("127.0.0.1", listener.local_addr().unwrap().port()).unwrap();

        let connected = Arc::new(AtomicBool::new(false));
        let connected2 = connected.clone();
        let (loop_tx, loop_rx) = mpsc::channel();

        let handle = std::thread::spawn(move || {
            let event_loop = EventLoop::new();
            loop_tx.send(event_loop.clone()).unwrap();
            let connector = Connector::new(&event_loop, addr);
            connector.set_new_connection_callback(move |fd| {
                connected2.store(true, Ordering::SeqCst);
                sockets::close(fd);
            });
            connector.start();
            event_loop.run();
        });

        let event_loop = loop_rx.recv().unwrap();
        let _ = listener.accept();
        std::thread::sleep(std::time::Duration::from_millis(100));

        assert!(connected.load(Ordering::SeqCst));
        event_loop.quit();
        handle.join().unwrap();
    }

    #[test]
    fn retry_delay_doubles_up_to_cap() {
        let delay = INIT_RETRY_DELAY;
        let doubled = (delay * 2).min(MAX_RETRY_DELAY);
        assert_eq!(doubled, Duration::from_secs(1));
        let mut d = INIT_RETRY_DELAY;
        for _ in 0..10 {
            d = (d * 2).min(MAX_RETRY_DELAY);
        }
        assert_eq!(d, MAX_RETRY_DELAY);
    }
}
