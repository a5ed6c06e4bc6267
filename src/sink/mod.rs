//! Audit sink: a line-per-message append-only log.
//!
//! The broker writes one line per published message to the active sink.
//! [`FileSink`] is the stock implementation; anything implementing
//! [`AuditSink`] can be installed with `Broker::activate_sink_with`.

mod file;
mod format;

pub use file::FileSink;
pub use format::{AuditFormat, AuditRecord, TIME_FORMAT};

use std::io;

/// Append-only text sink consumed by the broker.
pub trait AuditSink: Send {
    /// Append one complete line (including the trailing newline).
    fn append(&mut self, line: &[u8]) -> io::Result<()>;

    /// Release the underlying resource.
    fn close(self: Box<Self>) -> io::Result<()>;
}
