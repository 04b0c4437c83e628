//! A single-threaded, level-triggered reactor.
//!
//! `evloop` provides three co-designed pieces:
//!
//! - [`reactor`]: the event loop itself — a multiplexed, timer-aware,
//!   cross-thread-wakeable selector loop.
//! - [`stream`]: a non-blocking buffered byte stream layered over a file
//!   descriptor, registered with the loop.
//! - [`context`]: a per-thread stack of scoped handlers that survives
//!   callback scheduling, so exceptions raised inside a deferred callback
//!   route to the handler that was in scope when the callback was
//!   scheduled rather than unwinding through the reactor's dispatch loop.
//!
//! Higher level collaborators — a TCP acceptor, an HTTP server, a CLI
//! front-end, process management, DNS/TLS — are expected to be built on
//! top of these three pieces; none of that is part of this crate.
//!
//! # Portability
//!
//! Only POSIX-style readiness primitives are supported: `epoll` on Linux
//! and Android, `kqueue` on the BSDs and macOS. There is no Windows
//! backend and no attempt at edge-triggered readiness; see [`Interest`]
//! and [`reactor::EventLoop`] for what guarantees are actually made.

#[macro_use]
mod macros;

mod sys;

pub mod context;
pub mod error;
pub mod event;
pub mod interest;
pub mod reactor;
pub mod selector;
pub mod stream;
pub mod waker;

pub use context::{wrap, ExceptionContext, NullStackContext, StackContext};
pub use error::{CallbackError, CallbackResult, StackInconsistentError};
pub use event::{Readiness, ReadyEvent};
pub use interest::Interest;
pub use reactor::EventLoop;
pub use selector::Selector;
pub use stream::BufferedStream;
pub use waker::Waker;

use std::os::unix::io::RawFd;

/// A raw, OS-assigned file descriptor.
///
/// Re-exported for convenience since every public surface in this crate
/// (handlers, streams, the selector) is keyed by one.
pub type Fd = RawFd;
