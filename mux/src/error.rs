use std::io;

use thiserror::Error;

/// Failures that end the whole multiplexed message, not just one backend.
///
/// Per-backend problems (timeouts, transport errors, protocol violations)
/// never surface here; they expire the session in question and are reported
/// through [`Event::Error`](crate::Event::Error).
#[derive(Debug, Error)]
pub enum MuxError {
    /// The body spool could not be written or read back
    #[error("body spool: {0}")]
    Spool(#[source] io::Error),

    /// Handing an event to the MTA-side consumer failed
    #[error("emitting to the mta side: {0}")]
    Emit(#[source] io::Error),
}
