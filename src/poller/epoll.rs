//! The scalable `epoll(7)`-based demultiplexer backend (default).

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use crate::channel::{Channel, ChannelWeak};
use crate::poller::{ActiveChannel, ChannelState, Interest, Poller, Readiness};

const INIT_EVENT_LIST_SIZE: usize = 16;

struct Entry {
    weak: ChannelWeak,
}

pub struct EpollPoller {
    epoll_fd: OwnedFd,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Entry>,
}

fn interest_to_epoll(interest: Interest) -> u32 {
    let mut events = 0i32;
    if interest.readable {
        events |= libc::EPOLLIN | libc::EPOLLPRI;
    }
    if interest.writable {
        events |= libc::EPOLLOUT;
    }
    events as u32
}

fn epoll_events_to_readiness(events: u32) -> Readiness {
    let events = events as i32;
    Readiness {
        readable: events & libc::EPOLLIN != 0,
        writable: events & libc::EPOLLOUT != 0,
        hup: events & libc::EPOLLHUP != 0,
        error: events & libc::EPOLLERR != 0,
        invalid: false,
        priority: events & libc::EPOLLPRI != 0,
    }
}

impl EpollPoller {
    pub fn new() -> EpollPoller {
        let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC)).expect("epoll_create1 failed");
        EpollPoller {
            epoll_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![unsafe { std::mem::zeroed() }; INIT_EVENT_LIST_SIZE],
            channels: HashMap::new(),
        }
    }

    fn update(&self, op: libc::c_int, channel: &Channel) {
        let mut ev = libc::epoll_event {
            events: interest_to_epoll(channel.events()),
            u64: channel.fd() as u64,
        };
        if let Err(e) = syscall!(epoll_ctl(
            self.epoll_fd.as_raw_fd(),
            op,
            channel.fd(),
            &mut ev,
        )) {
            log::error!("EpollPoller epoll_ctl({op}) on fd {} failed: {e}", channel.fd());
        }
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout: Duration, active: &mut Vec<ActiveChannel>) -> Instant {
        active.clear();
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        let now = Instant::now();
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                log::error!("EpollPoller::poll failed: {err}");
            }
            return now;
        }
        let n = n as usize;
        for event in &self.events[..n] {
            let fd = event.u64 as RawFd;
            if let Some(entry) = self.channels.get(&fd) {
                if let Some(channel) = entry.weak.upgrade() {
                    let revents = epoll_events_to_readiness(event.events);
                    channel.set_revents(revents);
                    active.push(ActiveChannel { channel, revents });
                }
            }
        }
        if n == self.events.len() {
            self.events.resize(self.events.len() * 2, unsafe { std::mem::zeroed() });
        }
        now
    }

    fn update_channel(&mut self, channel: &Channel) {
        match channel.state() {
            ChannelState::New | ChannelState::Deleted => {
                if channel.state() == ChannelState::New {
                    debug_assert!(!self.channels.contains_key(&channel.fd()));
                    self.channels
                        .insert(channel.fd(), Entry { weak: channel.downgrade() });
                } else {
                    debug_assert!(self.channels.contains_key(&channel.fd()));
                }
                channel.set_state(ChannelState::Added);
                self.update(libc::EPOLL_CTL_ADD, channel);
            }
            ChannelState::Added => {
                if channel.is_none_event() {
                    self.update(libc::EPOLL_CTL_DEL, channel);
                    channel.set_state(ChannelState::Deleted);
                } else {
                    self.update(libc::EPOLL_CTL_MOD, channel);
                }
            }
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        debug_assert!(channel.is_none_event());
        if channel.state() == ChannelState::Added {
            self.update(libc::EPOLL_CTL_DEL, channel);
        }
        self.channels.remove(&channel.fd());
        channel.set_state(ChannelState::New);
    }

    fn has_channel(&self, fd: RawFd) -> bool {
        self.channels.contains_key(&fd)
    }
}
