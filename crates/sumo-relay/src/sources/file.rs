use std::io::{ErrorKind, SeekFrom};
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::SourceError;
use crate::buffer::LogBuffer;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Follow `path` from its first line, adding each complete line under `tag`.
///
/// Lines are added without their terminator. A trailing line with no newline
/// yet is held back until the rest of it is written. Truncation restarts
/// reading at the top of the file. Returns `Ok` once the file is removed or
/// `cancel` fires.
pub async fn tail(
    path: &Path,
    tag: &str,
    buffer: &LogBuffer,
    cancel: &CancellationToken,
) -> Result<(), SourceError> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut offset: u64 = 0;
    let mut line = Vec::new();

    info!(path = %path.display(), tag, "tailing file");

    loop {
        let read = tokio::select! {
            read = reader.read_until(b'\n', &mut line) => read?,
            _ = cancel.cancelled() => return Ok(()),
        };

        if read > 0 {
            offset += read as u64;
            if line.ends_with(b"\n") {
                emit(&mut line, tag, buffer);
            }
            continue;
        }

        match fs::metadata(path).await {
            Ok(meta) if meta.len() < offset => {
                debug!(path = %path.display(), "file truncated, reading from start");
                reader.seek(SeekFrom::Start(0)).await?;
                offset = 0;
                line.clear();
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if !line.is_empty() {
                    emit(&mut line, tag, buffer);
                }
                info!(path = %path.display(), "file removed, stopping");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = cancel.cancelled() => return Ok(()),
        }
    }
}

fn emit(line: &mut Vec<u8>, tag: &str, buffer: &LogBuffer) {
    if line.ends_with(b"\n") {
        line.pop();
        if line.ends_with(b"\r") {
            line.pop();
        }
    }
    buffer.add(Bytes::from(std::mem::take(line)), tag);
}

#[cfg(test)]
#[path = "file_tests.rs"]
mod tests;
