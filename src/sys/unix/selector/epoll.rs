use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::Interest;

/// Level-triggered epoll selector.
///
/// Unlike mio we deliberately do not set `EPOLLET`: the reactor this
/// backs is level-triggered by design (see the crate's module docs), so a
/// descriptor that is still readable after being drained keeps showing up
/// on the next `poll` rather than requiring the caller to re-arm it.
#[derive(Debug)]
pub struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Selector { ep })
    }

    pub fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout_ms = timeout
            .map(|to| {
                // `Duration::as_millis` truncates; round up so a
                // sub-millisecond timeout never becomes a zero (no-wait)
                // poll unless the caller asked for exactly that.
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        events.inner.clear();
        syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            events.inner.as_mut_ptr(),
            events.inner.capacity() as i32,
            timeout_ms,
        ))
        .map(|n_events| {
            // SAFETY: `epoll_wait` just initialized `n_events` entries.
            unsafe { events.inner.set_len(n_events as usize) };
        })
    }

    pub fn register(&self, fd: RawFd, interests: Interest) -> io::Result<()> {
        let mut event = raw_event(fd, interests);
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            fd,
            &mut event
        ))
        .map(|_| ())
    }

    pub fn reregister(&self, fd: RawFd, interests: Interest) -> io::Result<()> {
        let mut event = raw_event(fd, interests);
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_MOD,
            fd,
            &mut event
        ))
        .map(|_| ())
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            std::ptr::null_mut()
        ))
        .map(|_| ())
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.ep.as_raw_fd()
    }
}

fn raw_event(fd: RawFd, interests: Interest) -> libc::epoll_event {
    let mut kind = 0;
    if interests.is_readable() {
        kind |= libc::EPOLLIN | libc::EPOLLRDHUP;
    }
    if interests.is_writable() {
        kind |= libc::EPOLLOUT;
    }
    libc::epoll_event {
        events: kind as u32,
        u64: fd as u64,
    }
}

pub type Event = libc::epoll_event;

#[derive(Debug)]
pub struct Events {
    inner: Vec<Event>,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            inner: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.inner.iter()
    }
}

pub mod event {
    use super::Event;
    use std::os::unix::io::RawFd;

    pub fn fd(event: &Event) -> RawFd {
        event.u64 as RawFd
    }

    pub fn is_readable(event: &Event) -> bool {
        (event.events as libc::c_int & (libc::EPOLLIN | libc::EPOLLPRI)) != 0
    }

    pub fn is_writable(event: &Event) -> bool {
        (event.events as libc::c_int & libc::EPOLLOUT) != 0
    }

    pub fn is_error(event: &Event) -> bool {
        (event.events as libc::c_int & (libc::EPOLLERR | libc::EPOLLHUP)) != 0
    }
}
