//! Platform-specific readiness backends.
//!
//! Only the Unix selectors (`epoll`, `kqueue`) are implemented; there is no
//! Windows or Fuchsia backend.

mod unix;

pub(crate) use unix::event;
pub(crate) use unix::{Event, Events, Selector};
pub(crate) use unix::Waker;
