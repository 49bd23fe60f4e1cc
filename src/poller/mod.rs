//! The demultiplexer abstraction: a level-triggered readiness poll plus a
//! channel registry, with two concrete backends (classic `poll`, scalable
//! `epoll`) selectable by the `USE_POLL` environment variable.

mod epoll;
mod poll;

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::channel::Channel;

/// Interest bits a channel registers with the demultiplexer.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const NONE: Interest = Interest {
        readable: false,
        writable: false,
    };

    pub fn is_none(&self) -> bool {
        !self.readable && !self.writable
    }
}

/// Kernel-reported readiness bits for one channel, backend-neutral.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub hup: bool,
    pub error: bool,
    pub invalid: bool,
    pub priority: bool,
}

/// Tag used by the scalable backend to avoid re-registering a channel
/// whose interest momentarily drops to none; mirrors the New/Added/Deleted
/// states of the original design so a later interest change re-arms
/// without allocation churn. The classic backend only distinguishes
/// "not yet indexed" from "has a slot".
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChannelState {
    New,
    Added,
    Deleted,
}

/// One readiness event surfaced by `poll`: which descriptor, and what
/// happened to it.
pub struct ActiveChannel {
    pub channel: Channel,
    pub revents: Readiness,
}

/// The demultiplexer interface. Both implementations assert they are
/// invoked on the loop thread that owns them (enforced by the caller,
/// `EventLoop`, not by this trait).
pub trait Poller {
    /// Block up to `timeout`; return the channels with non-empty
    /// readiness, each tagged with its readiness bits, plus the instant
    /// taken immediately after wake-up.
    fn poll(&mut self, timeout: Duration, active: &mut Vec<ActiveChannel>) -> Instant;

    /// Register a new channel or update its interest set.
    fn update_channel(&mut self, channel: &Channel);

    /// Fully deregister. Precondition: the channel's interest set is
    /// empty.
    fn remove_channel(&mut self, channel: &Channel);

    fn has_channel(&self, fd: RawFd) -> bool;
}

/// Pick the default backend, honoring `USE_POLL` the way the scalable
/// variant is opted out of in the original design.
pub fn new_default_poller() -> Box<dyn Poller> {
    if std::env::var_os("USE_POLL").is_some() {
        log::debug!("poller: USE_POLL set, using classic poll(2) backend");
        Box::new(poll::PollPoller::new())
    } else {
        log::debug!("poller: using epoll(7) backend");
        Box::new(epoll::EpollPoller::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_poller_honors_use_poll_env() {
        std::env::set_var("USE_POLL", "1");
        let _p = new_default_poller();
        std::env::remove_var("USE_POLL");
    }
}
