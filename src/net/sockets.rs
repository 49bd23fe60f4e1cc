//! Thin, total wrappers around the OS socket interface: non-blocking
//! creation, bind/listen/accept with transient-vs-fatal errno
//! classification, non-blocking connect, read/readv/write, and
//! introspection (local/peer address, self-connect detection).

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use crate::net::inet_addr::InetAddress;

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => unsafe {
            let sin = &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in);
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = a.port().to_be();
            sin.sin_addr.s_addr = u32::from_ne_bytes(a.ip().octets());
            mem::size_of::<libc::sockaddr_in>()
        },
        SocketAddr::V6(a) => unsafe {
            let sin6 = &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6);
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = a.port().to_be();
            sin6.sin6_addr.s6_addr = a.ip().octets();
            sin6.sin6_scope_id = a.scope_id();
            mem::size_of::<libc::sockaddr_in6>()
        },
    };
    (storage, len as libc::socklen_t)
}

unsafe fn sockaddr_to_inet(storage: &libc::sockaddr_storage) -> InetAddress {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = &*(storage as *const _ as *const libc::sockaddr_in);
            let ip = std::net::Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr).to_be_bytes());
            InetAddress::from_socket_addr(SocketAddr::new(ip.into(), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6 = &*(storage as *const _ as *const libc::sockaddr_in6);
            let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            InetAddress::from_socket_addr(SocketAddr::new(ip.into(), u16::from_be(sin6.sin6_port)))
        }
        _ => InetAddress::any_v4(0),
    }
}

/// `socket(2)` with `SOCK_NONBLOCK | SOCK_CLOEXEC` set atomically.
pub fn create_nonblocking_or_die(family: libc::sa_family_t) -> RawFd {
    match syscall!(socket(
        family as libc::c_int,
        libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        libc::IPPROTO_TCP,
    )) {
        Ok(fd) => fd,
        Err(e) => {
            log::error!("sockets::create_nonblocking_or_die failed: {e}");
            panic!("sockets::create_nonblocking_or_die failed: {e}");
        }
    }
}

pub fn bind_or_die(fd: RawFd, addr: &InetAddress) {
    let (storage, len) = sockaddr_from(&addr.socket_addr());
    let res = syscall!(bind(
        fd,
        &storage as *const _ as *const libc::sockaddr,
        len
    ));
    if let Err(e) = res {
        log::error!("sockets::bind_or_die failed: {e}");
        panic!("sockets::bind_or_die failed: {e}");
    }
}

pub fn listen_or_die(fd: RawFd) {
    if let Err(e) = syscall!(listen(fd, libc::SOMAXCONN)) {
        log::error!("sockets::listen_or_die failed: {e}");
        panic!("sockets::listen_or_die failed: {e}");
    }
}

/// `accept4(2)` with transient errors preserved in `errno`/the returned
/// `io::Error`, and a fatal `panic!` on programmer-error classes.
pub fn accept(fd: RawFd) -> io::Result<(RawFd, InetAddress)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let res = syscall!(accept4(
        fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
    ));
    match res {
        Ok(connfd) => Ok((connfd, unsafe { sockaddr_to_inet(&storage) })),
        Err(e) => {
            match e.raw_os_error() {
                Some(libc::EAGAIN)
                | Some(libc::ECONNABORTED)
                | Some(libc::EINTR)
                | Some(libc::EPROTO)
                | Some(libc::EPERM)
                | Some(libc::EMFILE) => {
                    log::warn!("sockets::accept transient error: {e}");
                }
                _ => {
                    log::error!("sockets::accept unexpected error: {e}");
                    panic!("sockets::accept unexpected error: {e}");
                }
            }
            Err(e)
        }
    }
}

pub fn connect(fd: RawFd, addr: &InetAddress) -> io::Result<()> {
    let (storage, len) = sockaddr_from(&addr.socket_addr());
    syscall!(connect(
        fd,
        &storage as *const _ as *const libc::sockaddr,
        len
    ))
    .map(|_| ())
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    syscall!(read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())).map(|n| n as usize)
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    syscall!(write(fd, buf.as_ptr() as *const libc::c_void, buf.len())).map(|n| n as usize)
}

pub fn close(fd: RawFd) {
    if let Err(e) = syscall!(close(fd)) {
        log::error!("sockets::close failed: {e}");
    }
}

pub fn shutdown_write(fd: RawFd) {
    if let Err(e) = syscall!(shutdown(fd, libc::SHUT_WR)) {
        log::error!("sockets::shutdown_write failed: {e}");
    }
}

pub fn get_socket_error(fd: RawFd) -> i32 {
    let mut optval: libc::c_int = 0;
    let mut optlen = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let res = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut optval as *mut _ as *mut libc::c_void,
            &mut optlen,
        )
    };
    if res < 0 {
        io::Error::last_os_error().raw_os_error().unwrap_or(0)
    } else {
        optval
    }
}

pub fn get_local_addr(fd: RawFd) -> InetAddress {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let res = unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if res < 0 {
        log::error!("sockets::get_local_addr failed: {}", io::Error::last_os_error());
    }
    unsafe { sockaddr_to_inet(&storage) }
}

pub fn get_peer_addr(fd: RawFd) -> InetAddress {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let res = unsafe { libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if res < 0 {
        log::error!("sockets::get_peer_addr failed: {}", io::Error::last_os_error());
    }
    unsafe { sockaddr_to_inet(&storage) }
}

pub fn is_self_connect(fd: RawFd) -> bool {
    let local = get_local_addr(fd);
    let peer = get_peer_addr(fd);
    local.port() == peer.port() && local.to_ip() == peer.to_ip()
}

pub fn set_tcp_no_delay(fd: RawFd, on: bool) {
    set_bool_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on, "set_tcp_no_delay");
}

pub fn set_reuse_addr(fd: RawFd, on: bool) {
    set_bool_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, on, "set_reuse_addr");
}

pub fn set_reuse_port(fd: RawFd, on: bool) {
    #[cfg(target_os = "linux")]
    set_bool_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, on, "set_reuse_port");
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (fd, on);
    }
}

pub fn set_keep_alive(fd: RawFd, on: bool) {
    set_bool_opt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on, "set_keep_alive");
}

fn set_bool_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, on: bool, what: &str) {
    let val: libc::c_int = if on { 1 } else { 0 };
    let res = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &val as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if res < 0 {
        log::warn!("sockets::{} failed: {}", what, io::Error::last_os_error());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::inet_addr::InetAddress;

    #[test]
    fn create_bind_listen_accept_connect_roundtrip() {
        let listen_addr = InetAddress::new(0, true, false);
        let listenfd = create_nonblocking_or_die(listen_addr.family());
        bind_or_die(listenfd, &listen_addr);
        listen_or_die(listenfd);
        let bound_addr = get_local_addr(listenfd);
        assert!(bound_addr.port() != 0);

        let clientfd = create_nonblocking_or_die(bound_addr.family());
        let target = InetAddress::from_ip_port("127.0.0.1", bound_addr.port()).unwrap();
        match connect(clientfd, &target) {
            Ok(()) => {}
            Err(e) => assert_eq!(e.raw_os_error(), Some(libc::EINPROGRESS)),
        }

        // Give the kernel a moment to complete the loopback handshake;
        // a listening socket's backlog accepts it immediately regardless
        // of whether our client-side connect() call has itself returned.
        std::thread::sleep(std::time::Duration::from_millis(20));
        let (connfd, _peer) = accept(listenfd).expect("accept should see the pending connection");

        assert!(!is_self_connect(connfd) || get_peer_addr(connfd).port() == bound_addr.port());

        close(connfd);
        close(clientfd);
        close(listenfd);
    }

    #[test]
    fn accept_on_empty_listener_is_transient() {
        let listen_addr = InetAddress::new(0, true, false);
        let listenfd = create_nonblocking_or_die(listen_addr.family());
        bind_or_die(listenfd, &listen_addr);
        listen_or_die(listenfd);

        let err = accept(listenfd).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        close(listenfd);
    }
}
