//! Error types for callback dispatch and buffered-stream I/O.

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// The error type a scheduled callback returns when it fails.
///
/// Handlers, timeouts, and deferred callbacks all run through
/// [`wrap`](crate::wrap)-wrapped closures returning [`CallbackResult`]
/// rather than panicking; a panic would unwind through the loop's dispatch
/// code and abandon whatever callback was running next; a bubbled-up
/// `CallbackError` gets routed to the [`StackContext`](crate::StackContext)
/// that was active when the callback was scheduled, same as the rest.
pub type CallbackError = Box<dyn StdError + Send + Sync + 'static>;

/// The result type every loop-scheduled callback returns.
pub type CallbackResult = Result<(), CallbackError>;

/// The read buffer's high-water mark was exceeded before the requested
/// delimiter or byte count was found.
#[derive(Debug)]
pub struct StreamOverflowError {
    pub(crate) buffered: usize,
    pub(crate) max: usize,
}

impl fmt::Display for StreamOverflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "read buffer exceeded max_buffer_size ({} > {})",
            self.buffered, self.max
        )
    }
}

impl StdError for StreamOverflowError {}

/// An operation was attempted on a stream that has already been closed.
#[derive(Debug)]
pub struct StreamClosedError {
    /// The I/O error that caused the stream to close, if any. `None` when
    /// the stream was closed deliberately (e.g. via `close()`) or the peer
    /// performed an orderly EOF shutdown.
    pub real_error: Option<io::Error>,
}

impl fmt::Display for StreamClosedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.real_error {
            Some(err) => write!(f, "stream is closed: {}", err),
            None => write!(f, "stream is closed"),
        }
    }
}

impl StdError for StreamClosedError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.real_error.as_ref().map(|e| e as &(dyn StdError + 'static))
    }
}

/// A [`StackContext`](crate::StackContext) scope was exited out of order,
/// or a context active at callback-invocation time doesn't match the one
/// snapshotted when the callback was wrapped.
#[derive(Debug)]
pub struct StackInconsistentError(pub(crate) String);

impl fmt::Display for StackInconsistentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stack inconsistency: {}", self.0)
    }
}

impl StdError for StackInconsistentError {}
