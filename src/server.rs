//! The TCP server: binds an [`Acceptor`] and an [`EventLoopThreadPool`]
//! together, round-robin assigning each accepted connection to a worker
//! loop and keeping the registry of live connections on the base loop.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::acceptor::Acceptor;
use crate::callbacks::{
    default_connection_callback, default_message_callback, ConnectionCallback, MessageCallback,
    TcpConnectionPtr, WriteCompleteCallback,
};
use crate::event_loop::EventLoop;
use crate::loop_pool::EventLoopThreadPool;
use crate::net::inet_addr::InetAddress;
use crate::net::sockets;
use crate::tcp_connection::TcpConnection;

/// A listening TCP server: one acceptor on the base loop, connections
/// handed off round-robin to a pool of worker loops.
///
/// Not `Sync` by accident: `start`/`set_thread_num` and the connection
/// registry are only ever touched from the base loop's thread, matching
/// `Acceptor`'s and `EventLoopThreadPool`'s own thread-affine contracts.
pub struct TcpServer {
    loop_: Arc<EventLoop>,
    ip_port: String,
    name: String,
    acceptor: RefCell<Option<std::rc::Rc<RefCell<Acceptor>>>>,
    thread_pool: RefCell<Arc<EventLoopThreadPool>>,
    connection_callback: RefCell<ConnectionCallback>,
    message_callback: RefCell<MessageCallback>,
    write_complete_callback: RefCell<Option<WriteCompleteCallback>>,
    next_conn_id: Cell<i32>,
    connections: RefCell<HashMap<String, TcpConnectionPtr>>,
    started: Cell<bool>,
    reuse_port: bool,
}

impl TcpServer {
    pub fn new(event_loop: &Arc<EventLoop>, listen_addr: InetAddress, name: impl Into<String>) -> Arc<TcpServer> {
        Self::with_reuse_port(event_loop, listen_addr, name, false)
    }

    pub fn with_reuse_port(
        event_loop: &Arc<EventLoop>,
        listen_addr: InetAddress,
        name: impl Into<String>,
        reuse_port: bool,
    ) -> Arc<TcpServer> {
        let name = name.into();
        let server = Arc::new(TcpServer {
            loop_: event_loop.clone(),
            ip_port: listen_addr.to_ip_port(),
            name,
            acceptor: RefCell::new(None),
            thread_pool: RefCell::new(Arc::new(EventLoopThreadPool::new(event_loop.clone(), 0))),
            connection_callback: RefCell::new(Arc::new(default_connection_callback)),
            message_callback: RefCell::new(Arc::new(default_message_callback)),
            write_complete_callback: RefCell::new(None),
            next_conn_id: Cell::new(1),
            connections: RefCell::new(HashMap::new()),
            started: Cell::new(false),
            reuse_port,
        });

        let acceptor = Acceptor::new(event_loop, &listen_addr, server.reuse_port);
        let server_for_cb = server.clone();
        acceptor
            .borrow()
            .set_new_connection_callback(move |fd, peer_addr| {
                server_for_cb.new_connection(fd, peer_addr);
            });
        *server.acceptor.borrow_mut() = Some(acceptor);

        log::debug!("TcpServer [{}] created on {}", server.name, server.ip_port);
        server
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ip_port(&self) -> &str {
        &self.ip_port
    }

    /// Number of worker loops; must be called before [`TcpServer::start`].
    /// `0` (the default) runs every connection on the base loop.
    pub fn set_thread_num(&self, num_threads: usize) {
        assert!(!self.started.get(), "set_thread_num called after start");
        *self.thread_pool.borrow_mut() = Arc::new(EventLoopThreadPool::new(self.loop_.clone(), num_threads));
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

    /// Listen and launch the worker loop pool. Idempotent: a second call
    /// is a no-op. Must run on (or be queued onto) the base loop thread.
    pub fn start(self: &Arc<Self>) {
        if self.started.replace(true) {
            return;
        }
        self.thread_pool.borrow().start();
        let acceptor = self.acceptor.borrow().clone().expect("acceptor present");
        self.loop_.run_in_loop(move || {
            acceptor.borrow().listen();
        });
    }

    fn new_connection(self: &Arc<Self>, sockfd: RawFd, peer_addr: &InetAddress) {
        self.loop_.assert_in_loop_thread();
        let io_loop = self.thread_pool.borrow().next_loop();
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, self.next_conn_id.get());
        self.next_conn_id.set(self.next_conn_id.get() + 1);
        let local_addr = sockets::get_local_addr(sockfd);

        log::debug!("TcpServer [{}] - new connection [{conn_name}] from {peer_addr}", self.name);

        let conn = TcpConnection::new(&io_loop, conn_name.clone(), sockfd, local_addr, *peer_addr);
        conn.set_connection_callback(self.connection_callback.borrow().clone());
        conn.set_message_callback(self.message_callback.borrow().clone());
        if let Some(cb) = self.write_complete_callback.borrow().clone() {
            conn.set_write_complete_callback(cb);
        }

        let server_for_close = self.clone();
        conn.set_close_callback(Arc::new(move |conn: &TcpConnectionPtr| {
            server_for_close.remove_connection(conn);
        }));

        self.connections.borrow_mut().insert(conn_name, conn.clone());
        io_loop.run_in_loop(move || conn.connect_established());
    }

    fn remove_connection(self: &Arc<Self>, conn: &TcpConnectionPtr) {
        let self2 = self.clone();
        let conn2 = conn.clone();
        self.loop_.run_in_loop(move || self2.remove_connection_in_loop(&conn2));
    }

    fn remove_connection_in_loop(self: &Arc<Self>, conn: &TcpConnectionPtr) {
        self.loop_.assert_in_loop_thread();
        log::debug!("TcpServer [{}] - removing connection [{}]", self.name, conn.name());
        self.connections.borrow_mut().remove(conn.name());
        let conn2 = conn.clone();
        // `conn`'s own loop may be a worker loop distinct from the base
        // loop; the teardown call must still run on that owning loop.
        let conn_loop = conn.event_loop();
        conn_loop.queue_in_loop(move || conn2.connect_destroyed());
    }

    /// Number of currently registered connections.
    pub fn num_connections(&self) -> usize {
        self.connections.borrow().len()
    }
}
