use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::ptr;

use crate::sys::unix::selector::kqueue::WAKER_IDENT;
use crate::sys::Selector;

/// Waker backed by kqueue user space notifications (`EVFILT_USER`).
///
/// Setting this up registers an `EVFILT_USER` filter on a duplicate of the
/// loop's own kqueue descriptor; waking is just triggering that filter, no
/// extra descriptor required. The duplicate is kept open (and owned) for
/// as long as this `Waker` is alive so the filter stays valid even if the
/// loop's own selector is later closed.
#[derive(Debug)]
pub(crate) struct Waker {
    kq: RawFd,
}

impl Waker {
    pub(crate) fn new(selector: &Selector) -> io::Result<Waker> {
        let kq = syscall!(dup(selector.as_raw_fd()))?;
        setup(kq)?;
        Ok(Waker { kq })
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        let mut kevent = libc::kevent {
            ident: 0,
            filter: libc::EVFILT_USER,
            flags: libc::EV_ADD | libc::EV_RECEIPT,
            fflags: libc::NOTE_TRIGGER,
            data: 0,
            udata: WAKER_IDENT as *mut libc::c_void,
        };

        syscall!(kevent(self.kq, &kevent, 1, &mut kevent, 1, ptr::null())).and_then(|_| {
            if (kevent.flags & libc::EV_ERROR) != 0 && kevent.data != 0 {
                Err(io::Error::from_raw_os_error(kevent.data as i32))
            } else {
                Ok(())
            }
        })
    }
}

fn setup(kq: RawFd) -> io::Result<()> {
    let mut kevent = libc::kevent {
        ident: 0,
        filter: libc::EVFILT_USER,
        flags: libc::EV_ADD | libc::EV_CLEAR | libc::EV_RECEIPT,
        fflags: 0,
        data: 0,
        udata: WAKER_IDENT as *mut libc::c_void,
    };

    syscall!(kevent(kq, &kevent, 1, &mut kevent, 1, ptr::null())).and_then(|_| {
        if (kevent.flags & libc::EV_ERROR) != 0 && kevent.data != 0 {
            Err(io::Error::from_raw_os_error(kevent.data as i32))
        } else {
            Ok(())
        }
    })
}

impl Drop for Waker {
    fn drop(&mut self) {
        let _ = syscall!(close(self.kq));
    }
}
