// io/poll.rs - epoll-style readiness notifier

use std::io;
use std::os::fd::RawFd;

/// Read/write interest bits tracked per registered queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const NONE: Interest = Interest {
        read: false,
        write: false,
    };
    pub const READ: Interest = Interest {
        read: true,
        write: false,
    };
    pub const WRITE: Interest = Interest {
        read: false,
        write: true,
    };

    /// OR of both interest sets.
    pub fn or(self, other: Interest) -> Interest {
        Interest {
            read: self.read || other.read,
            write: self.write || other.write,
        }
    }

    pub fn is_empty(self) -> bool {
        !self.read && !self.write
    }
}

/// One readiness event.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    /// The registration token (a queue descriptor in this crate).
    pub token: u64,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

#[cfg(target_os = "linux")]
mod imp {
    use super::{Event, Interest};
    use nix::sys::epoll::{
        epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
    };
    use std::io;
    use std::os::fd::RawFd;

    const WAIT_BATCH: usize = 64;

    fn flags(interest: Interest) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if interest.read {
            flags |= EpollFlags::EPOLLIN;
        }
        if interest.write {
            flags |= EpollFlags::EPOLLOUT;
        }
        flags
    }

    fn map_err(err: nix::Error) -> io::Error {
        io::Error::from_raw_os_error(err as i32)
    }

    /// Level-triggered epoll wrapper owning one epoll instance per worker.
    #[derive(Debug)]
    pub struct Poller {
        epfd: RawFd,
    }

    impl Poller {
        pub fn new() -> io::Result<Self> {
            let epfd =
                epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC).map_err(map_err)?;
            Ok(Self { epfd })
        }

        pub fn register(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
            let mut event = EpollEvent::new(flags(interest), token);
            epoll_ctl(self.epfd, EpollOp::EpollCtlAdd, fd, &mut event).map_err(map_err)
        }

        pub fn modify(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
            let mut event = EpollEvent::new(flags(interest), token);
            epoll_ctl(self.epfd, EpollOp::EpollCtlMod, fd, &mut event).map_err(map_err)
        }

        pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
            epoll_ctl(self.epfd, EpollOp::EpollCtlDel, fd, None).map_err(map_err)
        }

        pub fn wait(&self, timeout_ms: isize) -> io::Result<Vec<Event>> {
            let mut buf = [EpollEvent::empty(); WAIT_BATCH];
            let count = epoll_wait(self.epfd, &mut buf, timeout_ms).map_err(map_err)?;
            Ok(buf[..count]
                .iter()
                .map(|ev| {
                    let bits = ev.events();
                    Event {
                        token: ev.data(),
                        readable: bits.contains(EpollFlags::EPOLLIN),
                        writable: bits.contains(EpollFlags::EPOLLOUT),
                        error: bits
                            .intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP),
                    }
                })
                .collect())
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            let _ = nix::unistd::close(self.epfd);
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::{Event, Interest};
    use std::io;
    use std::os::fd::RawFd;

    /// No-op notifier for platforms without epoll; transports without raw
    /// fds never register anyway.
    #[derive(Debug)]
    pub struct Poller;

    impl Poller {
        pub fn new() -> io::Result<Self> {
            Ok(Self)
        }

        pub fn register(&self, _fd: RawFd, _token: u64, _interest: Interest) -> io::Result<()> {
            Ok(())
        }

        pub fn modify(&self, _fd: RawFd, _token: u64, _interest: Interest) -> io::Result<()> {
            Ok(())
        }

        pub fn deregister(&self, _fd: RawFd) -> io::Result<()> {
            Ok(())
        }

        pub fn wait(&self, _timeout_ms: isize) -> io::Result<Vec<Event>> {
            Ok(Vec::new())
        }
    }
}

pub use imp::Poller;

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn reports_writability_level_triggered() {
        let (a, _b) = UnixStream::pair().unwrap();
        let poller = Poller::new().unwrap();
        poller
            .register(a.as_raw_fd(), 7, Interest::WRITE)
            .unwrap();

        // level-triggered: stays writable across repeated waits
        for _ in 0..2 {
            let events = poller.wait(100).unwrap();
            assert!(events.iter().any(|ev| ev.token == 7 && ev.writable));
        }

        poller.deregister(a.as_raw_fd()).unwrap();
        assert!(poller.wait(0).unwrap().is_empty());
    }

    #[test]
    fn interest_updates_take_effect() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let poller = Poller::new().unwrap();
        poller.register(a.as_raw_fd(), 1, Interest::READ).unwrap();

        assert!(poller.wait(0).unwrap().is_empty());
        b.write_all(b"x").unwrap();
        let events = poller.wait(100).unwrap();
        assert!(events.iter().any(|ev| ev.token == 1 && ev.readable));

        poller
            .modify(a.as_raw_fd(), 1, Interest::READ.or(Interest::WRITE))
            .unwrap();
        let events = poller.wait(100).unwrap();
        assert!(events
            .iter()
            .any(|ev| ev.token == 1 && ev.readable && ev.writable));
    }
}
