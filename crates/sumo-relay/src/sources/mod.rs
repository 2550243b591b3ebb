//! Producers that feed log lines into a [`LogBuffer`](crate::buffer::LogBuffer).

pub mod file;
pub mod journal;

use std::process::ExitStatus;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journalctl exited unexpectedly: {0}")]
    JournalExited(ExitStatus),
}
