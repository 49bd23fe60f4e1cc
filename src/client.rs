//! The TCP client: drives one [`Connector`] and, once connected, one
//! [`TcpConnection`], with an optional auto-retry toggle on disconnect.

use std::cell::Cell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use crate::callbacks::{
    default_connection_callback, default_message_callback, ConnectionCallback, MessageCallback,
    TcpConnectionPtr, WriteCompleteCallback,
};
use crate::connector::Connector;
use crate::event_loop::EventLoop;
use crate::net::inet_addr::InetAddress;
use crate::net::sockets;
use crate::tcp_connection::TcpConnection;

/// A single outbound connection, reconnected by the owning [`Connector`]
/// with exponential backoff unless [`TcpClient::disable_retry`] was called.
///
/// `connection_` is guarded by a real mutex (not thread-affine like the
/// rest of the crate) because [`TcpClient::connection`] is a documented
/// cross-thread accessor, mirroring the teacher design's own rationale for
/// protecting a client's current connection pointer.
pub struct TcpClient {
    loop_: Arc<EventLoop>,
    connector: Arc<Connector>,
    name: String,
    connection_callback: Mutex<ConnectionCallback>,
    message_callback: Mutex<MessageCallback>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    retry: Cell<bool>,
    connect: Cell<bool>,
    next_conn_id: AtomicI32,
    connection: Mutex<Option<TcpConnectionPtr>>,
}

unsafe impl Sync for TcpClient {}

impl TcpClient {
    pub fn new(event_loop: &Arc<EventLoop>, server_addr: InetAddress, name: impl Into<String>) -> Arc<TcpClient> {
        let connector = Connector::new(event_loop, server_addr);
        let client = Arc::new(TcpClient {
            loop_: event_loop.clone(),
            connector,
            name: name.into(),
            connection_callback: Mutex::new(Arc::new(default_connection_callback)),
            message_callback: Mutex::new(Arc::new(default_message_callback)),
            write_complete_callback: Mutex::new(None),
            retry: Cell::new(false),
            connect: Cell::new(true),
            next_conn_id: AtomicI32::new(1),
            connection: Mutex::new(None),
        });

        let client_for_cb = client.clone();
        client
            .connector
            .set_new_connection_callback(move |fd| client_for_cb.new_connection(fd));

        log::debug!("TcpClient [{}] created, targeting {}", client.name, client.connector.server_addr());
        client
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server_addr(&self) -> InetAddress {
        self.connector.server_addr()
    }

    /// The currently established connection, if any. Safe from any thread.
    pub fn connection(&self) -> Option<TcpConnectionPtr> {
        self.connection.lock().unwrap().clone()
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_callback.lock().unwrap() = cb;
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_callback.lock().unwrap() = cb;
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_callback.lock().unwrap() = Some(cb);
    }

    /// When enabled, a disconnect that is not the result of `disconnect`
    /// triggers the connector to retry with backoff; disabled by default.
    pub fn enable_retry(&self) {
        self.retry.set(true);
    }

    pub fn disable_retry(&self) {
        self.retry.set(false);
    }

    pub fn retry_enabled(&self) -> bool {
        self.retry.get()
    }

    /// Begin (re)connecting. Safe from any thread.
    pub fn connect(&self) {
        self.connect.set(true);
        log::debug!("TcpClient [{}] - connecting to {}", self.name, self.connector.server_addr());
        self.connector.start();
    }

    /// Half-close the current connection, if any; does not affect the
    /// retry toggle.
    pub fn disconnect(&self) {
        self.connect.set(false);
        let conn = self.connection.lock().unwrap().clone();
        if let Some(conn) = conn {
            conn.shutdown();
        }
    }

    /// Stop any in-flight connection attempt; does not touch an already
    /// established connection.
    pub fn stop(&self) {
        self.connect.set(false);
        self.connector.stop();
    }

    fn new_connection(self: &Arc<Self>, sockfd: RawFd) {
        self.loop_.assert_in_loop_thread();
        let peer_addr = sockets::get_peer_addr(sockfd);
        let local_addr = sockets::get_local_addr(sockfd);
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let conn_name = format!("{}-{}#{}", self.name, peer_addr.to_ip_port(), conn_id);

        log::debug!("TcpClient [{}] - new connection [{conn_name}]", self.name);

        let conn = TcpConnection::new(&self.loop_, conn_name, sockfd, local_addr, peer_addr);
        conn.set_connection_callback(self.connection_callback.lock().unwrap().clone());
        conn.set_message_callback(self.message_callback.lock().unwrap().clone());
        if let Some(cb) = self.write_complete_callback.lock().unwrap().clone() {
            conn.set_write_complete_callback(cb);
        }

        let client_for_close = self.clone();
        conn.set_close_callback(Arc::new(move |conn: &TcpConnectionPtr| {
            client_for_close.remove_connection(conn);
        }));

        *self.connection.lock().unwrap() = Some(conn.clone());
        conn.connect_established();
    }

    fn remove_connection(self: &Arc<Self>, conn: &TcpConnectionPtr) {
        self.loop_.assert_in_loop_thread();
        {
            let mut guard = self.connection.lock().unwrap();
            if guard.as_ref().map(|c| Arc::ptr_eq(c, conn)).unwrap_or(false) {
                *guard = None;
            }
        }
        let conn2 = conn.clone();
        self.loop_.queue_in_loop(move || conn2.connect_destroyed());

        if self.retry.get() && self.connect.get() {
            log::info!(
                "TcpClient [{}] - reconnecting to {}",
                self.name,
                self.connector.server_addr()
            );
            self.connector.restart();
        }
    }
}
