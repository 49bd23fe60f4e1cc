//! The TCP connection state machine: input/output buffers, write-spooling
//! with high-water notification, half-close, and the close protocol.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::buffer::Buffer;
use crate::callbacks::{
    default_connection_callback, default_message_callback, CloseCallback, ConnectionCallback,
    HighWaterMarkCallback, MessageCallback, WriteCompleteCallback,
};
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::net::inet_addr::InetAddress;
use crate::net::socket::Socket;

/// Default buffered-output threshold at which the high-water callback
/// fires.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StateE {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// One established or in-progress TCP connection.
///
/// Shared via `Arc` between the owning server/client registry and any
/// in-flight callback, yet internally built from `Cell`/`RefCell` rather
/// than locks, matching [`EventLoop`]'s own trade-off: a connection's state
/// is only ever touched on its owning loop's thread. `Channel` uses `Rc`
/// internally (it is never itself sent across threads), which is why this
/// type needs the same deliberate `unsafe impl Send + Sync` as
/// `EventLoop`; see DESIGN.md.
pub struct TcpConnection {
    loop_: Weak<EventLoop>,
    name: String,
    state: Cell<StateE>,
    socket: Socket,
    channel: Channel,
    local_addr: InetAddress,
    peer_addr: InetAddress,
    input_buffer: RefCell<Buffer>,
    output_buffer: RefCell<Buffer>,
    high_water_mark: Cell<usize>,
    reading: Cell<bool>,
    connection_callback: RefCell<ConnectionCallback>,
    message_callback: RefCell<MessageCallback>,
    write_complete_callback: RefCell<Option<WriteCompleteCallback>>,
    high_water_mark_callback: RefCell<Option<HighWaterMarkCallback>>,
    close_callback: RefCell<Option<CloseCallback>>,
    context: RefCell<Option<Box<dyn Any + Send + Sync>>>,
    self_weak: Weak<TcpConnection>,
}

// Safety: every field that is not itself Send/Sync (`channel`'s internal
// `Rc`) is mutated only on the thread that owns the connection's loop;
// every entry point asserts that via `loop_upgrade().assert_in_loop_thread()`
// or routes through `run_in_loop`/`queue_in_loop` first.
unsafe impl Send for TcpConnection {}
unsafe impl Sync for TcpConnection {}

impl TcpConnection {
    pub fn new(
        event_loop: &Arc<EventLoop>,
        name: String,
        sockfd: RawFd,
        local_addr: InetAddress,
        peer_addr: InetAddress,
    ) -> Arc<TcpConnection> {
        let loop_weak = Arc::downgrade(event_loop);
        let channel = Channel::from_weak(loop_weak.clone(), sockfd);

        let conn = Arc::new_cyclic(|weak| TcpConnection {
            loop_: loop_weak,
            name,
            state: Cell::new(StateE::Connecting),
            socket: Socket::new(sockfd),
            channel,
            local_addr,
            peer_addr,
            input_buffer: RefCell::new(Buffer::new()),
            output_buffer: RefCell::new(Buffer::new()),
            high_water_mark: Cell::new(DEFAULT_HIGH_WATER_MARK),
            reading: Cell::new(false),
            connection_callback: RefCell::new(Arc::new(default_connection_callback)),
            message_callback: RefCell::new(Arc::new(default_message_callback)),
            write_complete_callback: RefCell::new(None),
            high_water_mark_callback: RefCell::new(None),
            close_callback: RefCell::new(None),
            context: RefCell::new(None),
            self_weak: weak.clone(),
        });

        let weak_for_read = conn.self_weak.clone();
        conn.channel.set_read_callback(move |when| {
            if let Some(conn) = weak_for_read.upgrade() {
                conn.handle_read(when);
            }
        });
        let weak_for_write = conn.self_weak.clone();
        conn.channel.set_write_callback(move || {
            if let Some(conn) = weak_for_write.upgrade() {
                conn.handle_write();
            }
        });
        let weak_for_close = conn.self_weak.clone();
        conn.channel.set_close_callback(move || {
            if let Some(conn) = weak_for_close.upgrade() {
                conn.handle_close();
            }
        });
        let weak_for_error = conn.self_weak.clone();
        conn.channel.set_error_callback(move || {
            if let Some(conn) = weak_for_error.upgrade() {
                conn.handle_error();
            }
        });

        conn.socket.set_keep_alive(true);
        log::debug!("TcpConnection [{}] created, fd {}", conn.name, sockfd);
        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> InetAddress {
        self.local_addr
    }

    pub fn peer_addr(&self) -> InetAddress {
        self.peer_addr
    }

    pub fn connected(&self) -> bool {
        self.state.get() == StateE::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state.get() == StateE::Disconnected
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        self.socket.set_tcp_no_delay(on);
    }

    pub fn set_context(&self, context: Box<dyn Any + Send + Sync>) {
        *self.context.borrow_mut() = Some(context);
    }

    pub fn context(&self) -> std::cell::Ref<'_, Option<Box<dyn Any + Send + Sync>>> {
        self.context.borrow()
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_callback.borrow_mut() = cb;
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_callback.borrow_mut() = cb;
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_callback.borrow_mut() = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        *self.high_water_mark_callback.borrow_mut() = Some(cb);
        self.high_water_mark.set(mark);
    }

    /// Registered by the owning server/client registry, not the end user;
    /// runs once as part of the close protocol (§ close flow step 4).
    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_callback.borrow_mut() = Some(cb);
    }

    fn loop_upgrade(&self) -> Arc<EventLoop> {
        self.loop_.upgrade().expect("connection outlived its event loop")
    }

    /// The loop that owns this connection; teardown and buffer access must
    /// be scheduled on it via [`EventLoop::run_in_loop`]/`queue_in_loop`.
    pub fn event_loop(&self) -> Arc<EventLoop> {
        self.loop_upgrade()
    }

    fn set_state(&self, state: StateE) {
        self.state.set(state);
    }

    /// Called once, on the loop thread, right after the socket is handed
    /// off by an acceptor or connector.
    pub fn connect_established(self: &Arc<Self>) {
        let event_loop = self.loop_upgrade();
        event_loop.assert_in_loop_thread();
        assert_eq!(self.state.get(), StateE::Connecting);
        self.set_state(StateE::Connected);
        self.channel.tie(self.self_weak.clone());
        self.channel.enable_reading();
        self.reading.set(true);
        (self.connection_callback.borrow())(self);
    }

    /// Called once, on the loop thread, after the close protocol has run;
    /// deregisters the channel from the demultiplexer.
    pub fn connect_destroyed(self: &Arc<Self>) {
        let event_loop = self.loop_upgrade();
        event_loop.assert_in_loop_thread();
        if self.state.get() == StateE::Connected {
            self.set_state(StateE::Disconnected);
            self.channel.disable_all();
            (self.connection_callback.borrow())(self);
        }
        self.channel.remove();
    }

    /// Queue `data` for the peer. Safe from any thread.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state.get() != StateE::Connected {
            return;
        }
        let event_loop = self.loop_upgrade();
        if event_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let owned = data.to_vec();
            let self2 = self.clone();
            event_loop.run_in_loop(move || self2.send_in_loop(&owned));
        }
    }

    fn send_in_loop(&self, data: &[u8]) {
        let event_loop = self.loop_upgrade();
        event_loop.assert_in_loop_thread();

        if self.state.get() == StateE::Disconnected {
            log::warn!("TcpConnection::send_in_loop [{}] - disconnected, give up", self.name);
            return;
        }

        let mut wrote = 0usize;
        let mut fault = false;

        if !self.channel.is_writing() && self.output_buffer.borrow().readable_bytes() == 0 {
            match crate::net::sockets::write(self.channel.fd(), data) {
                Ok(n) => {
                    wrote = n;
                    if wrote == data.len() {
                        self.schedule_write_complete();
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    log::warn!("TcpConnection::send_in_loop [{}] write failed: {e}", self.name);
                    if matches!(e.raw_os_error(), Some(libc::EPIPE) | Some(libc::ECONNRESET)) {
                        fault = true;
                    }
                }
            }
        }

        if !fault && wrote < data.len() {
            let remaining = &data[wrote..];
            let old_len = self.output_buffer.borrow().readable_bytes();
            let new_len = old_len + remaining.len();
            if new_len >= self.high_water_mark.get() && old_len < self.high_water_mark.get() {
                if let Some(cb) = self.high_water_mark_callback.borrow().clone() {
                    let conn = self.self_weak.upgrade().expect("connection alive during send");
                    event_loop.queue_in_loop(move || cb(&conn, new_len));
                }
            }
            self.output_buffer.borrow_mut().append(remaining);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    fn schedule_write_complete(&self) {
        if let Some(cb) = self.write_complete_callback.borrow().clone() {
            let conn = self.self_weak.upgrade().expect("connection alive during send");
            self.loop_upgrade().queue_in_loop(move || cb(&conn));
        }
    }

    /// Half-close: stop writing once pending output drains.
    pub fn shutdown(self: &Arc<Self>) {
        if self.state.get() == StateE::Connected {
            self.set_state(StateE::Disconnecting);
            let self2 = self.clone();
            self.loop_upgrade().run_in_loop(move || self2.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        self.loop_upgrade().assert_in_loop_thread();
        if !self.channel.is_writing() {
            self.socket.shutdown_write();
        }
    }

    /// Tear down immediately, discarding any unsent output.
    pub fn force_close(self: &Arc<Self>) {
        if matches!(self.state.get(), StateE::Connected | StateE::Disconnecting) {
            self.set_state(StateE::Disconnecting);
            let self2 = self.clone();
            self.loop_upgrade().queue_in_loop(move || self2.force_close_in_loop());
        }
    }

    fn force_close_in_loop(&self) {
        let event_loop = self.loop_upgrade();
        event_loop.assert_in_loop_thread();
        if matches!(self.state.get(), StateE::Connected | StateE::Disconnecting) {
            self.handle_close();
        }
    }

    /// Schedule [`TcpConnection::force_close`] after `delay`, via a weak
    /// reference so a connection already torn down is never revived.
    pub fn force_close_with_delay(self: &Arc<Self>, delay: Duration) {
        if matches!(self.state.get(), StateE::Connected | StateE::Disconnecting) {
            let weak = self.self_weak.clone();
            self.loop_upgrade().run_after(
                delay,
                Box::new(move || {
                    if let Some(conn) = weak.upgrade() {
                        conn.force_close();
                    }
                }),
            );
        }
    }

    fn handle_read(self: &Arc<Self>, when: Instant) {
        let event_loop = self.loop_upgrade();
        event_loop.assert_in_loop_thread();
        let result = self.input_buffer.borrow_mut().read_from_fd(self.channel.fd());
        match result {
            Ok(0) => self.handle_close(),
            Ok(_n) => {
                let cb = self.message_callback.borrow().clone();
                cb(self, &mut self.input_buffer.borrow_mut(), when);
            }
            Err(e) => {
                log::warn!("TcpConnection::handle_read [{}] failed: {e}", self.name);
                self.handle_error();
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        let event_loop = self.loop_upgrade();
        event_loop.assert_in_loop_thread();
        if !self.channel.is_writing() {
            log::trace!("TcpConnection fd {} is down, no more writing", self.channel.fd());
            return;
        }
        let drained = {
            let mut out = self.output_buffer.borrow_mut();
            match crate::net::sockets::write(self.channel.fd(), out.peek()) {
                Ok(n) => {
                    out.retrieve(n);
                    out.readable_bytes() == 0
                }
                Err(e) => {
                    log::warn!("TcpConnection::handle_write [{}] failed: {e}", self.name);
                    false
                }
            }
        };
        if drained {
            self.channel.disable_writing();
            self.schedule_write_complete();
            if self.state.get() == StateE::Disconnecting {
                self.shutdown_in_loop();
            }
        }
    }

    fn handle_close(self: &Arc<Self>) {
        let event_loop = self.loop_upgrade();
        event_loop.assert_in_loop_thread();
        debug_assert!(matches!(self.state.get(), StateE::Connected | StateE::Disconnecting));
        self.set_state(StateE::Disconnected);
        self.channel.disable_all();

        (self.connection_callback.borrow())(self);
        if let Some(cb) = self.close_callback.borrow().clone() {
            cb(self);
        }
    }

    fn handle_error(&self) {
        let err = crate::net::sockets::get_socket_error(self.channel.fd());
        log::error!("TcpConnection::handle_error [{}] - SO_ERROR = {}", self.name, err);
    }
}
