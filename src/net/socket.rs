//! RAII wrapper around a socket file descriptor.

use std::os::unix::io::{AsRawFd, RawFd};

use crate::net::inet_addr::InetAddress;
use crate::net::sockets;

/// Owns exactly one file descriptor and closes it on drop.
#[derive(Debug)]
pub struct Socket {
    fd: RawFd,
}

impl Socket {
    pub fn new(fd: RawFd) -> Socket {
        Socket { fd }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn bind_address(&self, addr: &InetAddress) {
        sockets::bind_or_die(self.fd, addr);
    }

    pub fn listen(&self) {
        sockets::listen_or_die(self.fd);
    }

    pub fn accept(&self) -> std::io::Result<(RawFd, InetAddress)> {
        sockets::accept(self.fd)
    }

    pub fn shutdown_write(&self) {
        sockets::shutdown_write(self.fd);
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        sockets::set_tcp_no_delay(self.fd, on);
    }

    pub fn set_reuse_addr(&self, on: bool) {
        sockets::set_reuse_addr(self.fd, on);
    }

    pub fn set_reuse_port(&self, on: bool) {
        sockets::set_reuse_port(self.fd, on);
    }

    pub fn set_keep_alive(&self, on: bool) {
        sockets::set_keep_alive(self.fd, on);
    }

    /// Retrieve `TCP_INFO` for diagnostics. Best-effort: absent on
    /// platforms or kernels that don't expose it.
    #[cfg(target_os = "linux")]
    pub fn tcp_info(&self) -> Option<libc::tcp_info> {
        let mut info: libc::tcp_info = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::tcp_info>() as libc::socklen_t;
        let res = unsafe {
            libc::getsockopt(
                self.fd,
                libc::IPPROTO_TCP,
                libc::TCP_INFO,
                &mut info as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if res == 0 {
            Some(info)
        } else {
            None
        }
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        sockets::close(self.fd);
    }
}
