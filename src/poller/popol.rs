use std::collections::VecDeque;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use crate::poller::{IoFail, IoType, Poll};

impl From<IoType> for popol::Interest {
    fn from(ev: IoType) -> Self {
        let mut interest = popol::interest::NONE;
        if ev.read {
            interest |= popol::interest::READ;
        }
        if ev.write {
            interest |= popol::interest::WRITE;
        }
        interest
    }
}

/// Manager for a set of file descriptors polled for I/O readiness by using
/// the [`popol`] library (a poll(2) syscall wrapper).
pub struct Poller {
    poll: popol::Sources<RawFd>,
    events: VecDeque<(RawFd, Result<IoType, IoFail>)>,
}

impl Poller {
    pub fn new() -> Self {
        Self {
            poll: popol::Sources::new(),
            events: empty!(),
        }
    }
}

impl Default for Poller {
    fn default() -> Self { Poller::new() }
}

impl Poll for Poller {
    fn register(&mut self, fd: &impl AsRawFd, interest: IoType) {
        self.poll.register(fd.as_raw_fd(), fd, interest.into());
    }

    fn unregister(&mut self, fd: &impl AsRawFd) { self.poll.unregister(&fd.as_raw_fd()); }

    fn set_interest(&mut self, fd: &impl AsRawFd, interest: IoType) -> bool {
        let fd = fd.as_raw_fd();
        self.poll.unset(&fd, (!interest).into());
        self.poll.set(&fd, interest.into())
    }

    fn select(&mut self, timeout: Duration) -> io::Result<usize> {
        let mut events = Vec::new();

        // Blocking call (unless the timeout is zero)
        match self.poll.poll(&mut events, popol::Timeout::from(timeout)) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }

        let count = events.len();
        for ev in events {
            let res = if ev.is_hangup() {
                Err(IoFail::Connectivity)
            } else if ev.is_error() || ev.is_invalid() {
                Err(IoFail::Os)
            } else {
                Ok(IoType {
                    read: ev.is_readable(),
                    write: ev.is_writable(),
                })
            };
            self.events.push_back((ev.key, res));
        }

        Ok(count)
    }
}

impl Iterator for Poller {
    type Item = (RawFd, Result<IoType, IoFail>);

    fn next(&mut self) -> Option<Self::Item> { self.events.pop_front() }
}
