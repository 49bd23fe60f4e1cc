//! A single-host, multi-threaded reactor runtime for TCP networking.
//!
//! The runtime multiplexes many connections onto a small pool of I/O
//! threads using a readiness-based, level-triggered event demultiplexer.
//! Every mutating operation on a loop, a channel, a timer or a connection
//! must happen on the thread that owns it; crossing that boundary goes
//! through [`EventLoop::run_in_loop`] or [`EventLoop::queue_in_loop`].
//!
//! ```text
//! EventLoop ─┬─ Poller (epoll/poll)
//!            ├─ TimerQueue (timerfd)
//!            ├─ wake Channel (eventfd)
//!            └─ N user Channels ── Acceptor / Connector / TcpConnection
//! ```
//!
//! [`TcpServer`] and [`TcpClient`] compose those primitives into the two
//! public entry points: a server accepts onto a round-robin
//! [`EventLoopThreadPool`], a client drives one [`Connector`] with
//! optional auto-retry on disconnect.
#![cfg(unix)]

#[macro_use]
mod macros;

pub mod buffer;
pub mod callbacks;
pub mod channel;
pub mod event_loop;
pub mod loop_pool;
pub mod net;
pub mod poller;
pub mod timer;
pub mod timer_queue;

pub mod acceptor;
pub mod client;
pub mod connector;
pub mod server;
pub mod tcp_connection;

pub use buffer::Buffer;
pub use channel::Channel;
pub use event_loop::EventLoop;
pub use loop_pool::EventLoopThreadPool;
pub use net::inet_addr::InetAddress;
pub use net::sockets;
pub use timer::TimerId;
pub use timer_queue::TimerQueue;

pub use acceptor::Acceptor;
pub use client::TcpClient;
pub use connector::Connector;
pub use server::TcpServer;
pub use tcp_connection::{StateE, TcpConnection};
