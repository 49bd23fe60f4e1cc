//! The classic `poll(2)`-based demultiplexer backend.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::channel::{Channel, ChannelWeak};
use crate::poller::{ActiveChannel, Interest, Poller, Readiness};

struct Entry {
    weak: ChannelWeak,
}

pub struct PollPoller {
    pollfds: Vec<libc::pollfd>,
    // fd (or, for a momentarily-silenced slot, -fd-1) -> registry entry,
    // indexed in parallel with `pollfds`.
    channels: HashMap<RawFd, Entry>,
}

fn interest_to_poll_events(interest: Interest) -> libc::c_short {
    let mut events = 0;
    if interest.readable {
        events |= libc::POLLIN | libc::POLLPRI;
    }
    if interest.writable {
        events |= libc::POLLOUT;
    }
    events as libc::c_short
}

fn poll_revents_to_readiness(revents: libc::c_short) -> Readiness {
    let revents = revents as libc::c_int;
    Readiness {
        readable: revents & (libc::POLLIN | libc::POLLPRI) != 0,
        writable: revents & libc::POLLOUT != 0,
        hup: revents & libc::POLLHUP != 0,
        error: revents & libc::POLLERR != 0,
        invalid: revents & libc::POLLNVAL != 0,
        priority: revents & libc::POLLPRI != 0,
    }
}

impl PollPoller {
    pub fn new() -> PollPoller {
        PollPoller {
            pollfds: Vec::new(),
            channels: HashMap::new(),
        }
    }
}

impl Poller for PollPoller {
    fn poll(&mut self, timeout: Duration, active: &mut Vec<ActiveChannel>) -> Instant {
        active.clear();
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let nfds = self.pollfds.len();
        let ret = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                nfds as libc::nfds_t,
                timeout_ms,
            )
        };
        let now = Instant::now();
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                log::error!("PollPoller::poll failed: {err}");
            }
            return now;
        }
        if ret == 0 {
            return now;
        }
        for pfd in &self.pollfds {
            if pfd.revents == 0 {
                continue;
            }
            let real_fd = if pfd.fd < 0 { -pfd.fd - 1 } else { pfd.fd };
            if let Some(entry) = self.channels.get(&real_fd) {
                if let Some(channel) = entry.weak.upgrade() {
                    let revents = poll_revents_to_readiness(pfd.revents);
                    channel.set_revents(revents);
                    active.push(ActiveChannel { channel, revents });
                }
            }
        }
        now
    }

    fn update_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        if channel.index() < 0 {
            debug_assert!(!self.channels.contains_key(&fd));
            let pfd = libc::pollfd {
                fd,
                events: interest_to_poll_events(channel.events()),
                revents: 0,
            };
            channel.set_index(self.pollfds.len() as i32);
            self.pollfds.push(pfd);
            self.channels.insert(fd, Entry { weak: channel.downgrade() });
        } else {
            debug_assert!(self.channels.contains_key(&fd));
            let idx = channel.index() as usize;
            let pfd = &mut self.pollfds[idx];
            debug_assert!(pfd.fd == fd || pfd.fd == -fd - 1);
            pfd.fd = fd;
            pfd.events = interest_to_poll_events(channel.events());
            pfd.revents = 0;
            if channel.is_none_event() {
                // Silence without losing the slot: a later interest
                // change re-arms in place instead of re-inserting.
                pfd.fd = -fd - 1;
            }
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        debug_assert!(channel.is_none_event());
        let idx = channel.index() as usize;
        debug_assert!(idx < self.pollfds.len());
        let last = self.pollfds.len() - 1;
        if idx != last {
            let last_fd = self.pollfds[last].fd;
            let real_last_fd = if last_fd < 0 { -last_fd - 1 } else { last_fd };
            self.pollfds.swap(idx, last);
            if let Some(entry) = self.channels.get(&real_last_fd) {
                if let Some(moved) = entry.weak.upgrade() {
                    moved.set_index(idx as i32);
                }
            }
        }
        self.pollfds.pop();
        self.channels.remove(&fd);
    }

    fn has_channel(&self, fd: RawFd) -> bool {
        self.channels.contains_key(&fd)
    }
}
