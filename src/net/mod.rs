pub mod inet_addr;
pub mod socket;
pub mod sockets;

pub use inet_addr::InetAddress;
pub use socket::Socket;
