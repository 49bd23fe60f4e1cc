//! Fixed callback signatures shared across the runtime.

use std::sync::Arc;
use std::time::Instant;

use crate::buffer::Buffer;
use crate::tcp_connection::TcpConnection;

pub type TcpConnectionPtr = Arc<TcpConnection>;

pub type TimerCallback = Box<dyn Fn() + Send + 'static>;

pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync + 'static>;
pub type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync + 'static>;
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync + 'static>;
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync + 'static>;
pub type MessageCallback =
    Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Instant) + Send + Sync + 'static>;

pub fn default_connection_callback(conn: &TcpConnectionPtr) {
    log::trace!(
        "{} -> {}",
        conn.local_addr().to_ip_port(),
        conn.peer_addr().to_ip_port()
    );
}

pub fn default_message_callback(_conn: &TcpConnectionPtr, buf: &mut Buffer, _when: Instant) {
    buf.retrieve_all();
}
