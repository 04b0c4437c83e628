use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

/// Waker backed by a Unix self-pipe.
///
/// Waker controls both the sending and receiving ends and empties the pipe
/// if writing to it (waking) fails.
#[derive(Debug)]
pub(crate) struct WakerInternal {
    sender: File,
    receiver: File,
}

impl WakerInternal {
    pub(crate) fn new() -> io::Result<WakerInternal> {
        let [receiver, sender] = new_raw()?;
        let sender = unsafe { File::from_raw_fd(sender) };
        let receiver = unsafe { File::from_raw_fd(receiver) };
        Ok(WakerInternal { sender, receiver })
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        match (&self.sender).write(&[1]) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // The reading end is full; empty it and try again.
                self.empty();
                self.wake()
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => self.wake(),
            Err(err) => Err(err),
        }
    }

    /// Drain the pipe after the loop observes this waker as readable.
    pub(crate) fn drain(&self) {
        self.empty();
    }

    /// Empty the pipe's buffer. Only needed if `wake` fails. Ignores errors.
    fn empty(&self) {
        let mut buf = [0; 4096];
        loop {
            match (&self.receiver).read(&mut buf) {
                Ok(n) if n > 0 => continue,
                _ => return,
            }
        }
    }
}

impl AsRawFd for WakerInternal {
    fn as_raw_fd(&self) -> RawFd {
        self.receiver.as_raw_fd()
    }
}

/// Create a non-blocking, close-on-exec pipe, returned as `[read, write]`.
#[cfg(not(any(
    target_os = "ios",
    target_os = "macos",
    target_os = "tvos",
    target_os = "watchos",
    target_os = "visionos",
)))]
fn new_raw() -> io::Result<[RawFd; 2]> {
    let mut fds = [-1; 2];
    syscall!(pipe2(
        fds.as_mut_ptr(),
        libc::O_NONBLOCK | libc::O_CLOEXEC
    ))?;
    Ok(fds)
}

/// macOS and friends don't have `pipe2(2)`; fall back to `pipe(2)` plus
/// `fcntl` to set the flags `pipe2` would have set atomically.
#[cfg(any(
    target_os = "ios",
    target_os = "macos",
    target_os = "tvos",
    target_os = "watchos",
    target_os = "visionos",
))]
fn new_raw() -> io::Result<[RawFd; 2]> {
    let mut fds = [-1; 2];
    syscall!(pipe(fds.as_mut_ptr()))?;
    for &fd in fds.iter() {
        syscall!(fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK))?;
        syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
    }
    Ok(fds)
}
