//! Readiness Poller
//!
//! A thin safe wrapper over Linux `epoll`. Every registration carries a
//! [`Token`] chosen by the caller; events hand the token back together with
//! the reported [`Readiness`].
//!
//! Clients are registered edge-triggered, so a consumer must keep reading
//! or writing until the socket would block before waiting again.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Calls a libc function and maps `-1` to the last OS error.
macro_rules! syscall {
    ($fn:ident ( $($arg:expr),* $(,)* ) ) => {{
        #[allow(unused_unsafe)]
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

/// Opaque tag attached to a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub u64);

/// What a registration is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Listening socket: readable, woken on one waiter per connection
    Listener,
    /// Client socket: readable, writable, hangup, error, edge-triggered
    Client,
}

impl Interest {
    fn bits(self) -> u32 {
        let bits = match self {
            Interest::Listener => libc::EPOLLIN | libc::EPOLLEXCLUSIVE,
            Interest::Client => {
                libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLHUP | libc::EPOLLERR | libc::EPOLLET
            }
        };
        bits as u32
    }
}

/// Readiness reported for one registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
    pub error: bool,
}

impl Readiness {
    /// Decodes an epoll event mask.
    pub fn from_epoll(events: u32) -> Self {
        let has = |flag: libc::c_int| events & flag as u32 != 0;
        Self {
            readable: has(libc::EPOLLIN),
            writable: has(libc::EPOLLOUT),
            hangup: has(libc::EPOLLHUP),
            error: has(libc::EPOLLERR),
        }
    }
}

/// Buffer that receives events from [`Poller::wait`].
pub struct Events {
    inner: Vec<libc::epoll_event>,
    len: usize,
}

impl Events {
    /// Creates a buffer able to hold `capacity` events per wait.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: vec![libc::epoll_event { events: 0, u64: 0 }; capacity.max(1)],
            len: 0,
        }
    }

    /// Returns true if the last wait reported nothing.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterates over the events of the last wait.
    pub fn iter(&self) -> impl Iterator<Item = (Token, Readiness)> + '_ {
        self.inner[..self.len].iter().map(|event| {
            // Copy out of the packed struct before use
            let data = event.u64;
            let events = event.events;
            (Token(data), Readiness::from_epoll(events))
        })
    }
}

/// An epoll instance, closed on drop.
#[derive(Debug)]
pub struct Poller {
    epoll: OwnedFd,
}

impl Poller {
    /// Creates a new epoll instance.
    pub fn new() -> io::Result<Self> {
        let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        // SAFETY: epoll_create1 returned a fresh descriptor we now own
        let epoll = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { epoll })
    }

    /// Registers a descriptor.
    pub fn add(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest.bits(),
            u64: token.0,
        };
        syscall!(epoll_ctl(
            self.epoll.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            fd,
            &mut event
        ))?;
        Ok(())
    }

    /// Removes a registration.
    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        syscall!(epoll_ctl(
            self.epoll.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            std::ptr::null_mut()
        ))?;
        Ok(())
    }

    /// Waits for events; `None` waits indefinitely.
    ///
    /// An interrupted wait returns with no events.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout_ms = match timeout {
            Some(timeout) => timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
            None => -1,
        };

        events.len = 0;
        match syscall!(epoll_wait(
            self.epoll.as_raw_fd(),
            events.inner.as_mut_ptr(),
            events.inner.len() as libc::c_int,
            timeout_ms
        )) {
            Ok(n) => {
                events.len = n as usize;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl AsRawFd for Poller {
    fn as_raw_fd(&self) -> RawFd {
        self.epoll.as_raw_fd()
    }
}
