use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::SourceError;
use crate::buffer::LogBuffer;

/// Tag used for entries that lack the configured name field.
pub const UNDEFINED_NAME: &str = "UNDEFINED";

const MESSAGE_FIELD: &str = "MESSAGE";
const TIMESTAMP_FIELD: &str = "__REALTIME_TIMESTAMP";

/// Outcome of reading one `journalctl --output=json` line.
#[derive(Debug, PartialEq)]
pub enum Entry {
    Record { payload: String, tag: String },
    NoMessage,
    Expired { age: Duration },
    Invalid(String),
}

/// Turns journal entries into tagged records.
#[derive(Debug, Clone)]
pub struct JournalReader {
    name_field: String,
    window: Duration,
}

impl JournalReader {
    pub fn new(name_field: impl Into<String>, window: Duration) -> Self {
        Self {
            name_field: name_field.into(),
            window,
        }
    }

    /// Parse one JSON entry as seen at `now`.
    ///
    /// Entries older than the window are skipped. The payload is the entry's
    /// RFC 3339 timestamp, a space, and its message.
    pub fn parse_entry(&self, line: &str, now: SystemTime) -> Entry {
        let fields: Map<String, Value> = match serde_json::from_str(line) {
            Ok(fields) => fields,
            Err(e) => return Entry::Invalid(format!("malformed JSON: {e}")),
        };

        let Some(micros) = fields
            .get(TIMESTAMP_FIELD)
            .and_then(field_text)
            .and_then(|raw| raw.parse::<u64>().ok())
        else {
            return Entry::Invalid(format!("missing or invalid {TIMESTAMP_FIELD}"));
        };
        let Some(stamp) = i64::try_from(micros)
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_micros)
        else {
            return Entry::Invalid(format!("{TIMESTAMP_FIELD} out of range: {micros}"));
        };
        let at = UNIX_EPOCH + Duration::from_micros(micros);

        // Entries stamped in the future count as fresh.
        let age = now.duration_since(at).unwrap_or_default();
        if age >= self.window {
            return Entry::Expired { age };
        }

        let Some(message) = fields.get(MESSAGE_FIELD).and_then(field_text) else {
            return Entry::NoMessage;
        };

        let tag = fields
            .get(&self.name_field)
            .and_then(field_text)
            .unwrap_or_else(|| UNDEFINED_NAME.to_owned());

        let stamp = stamp.to_rfc3339_opts(SecondsFormat::Micros, true);
        Entry::Record {
            payload: format!("{stamp} {message}"),
            tag,
        }
    }

    /// Read entries from `reader` until it ends or `cancel` fires.
    pub async fn pump<R: AsyncBufRead + Unpin>(
        &self,
        reader: R,
        buffer: &LogBuffer,
        cancel: &CancellationToken,
    ) -> Result<(), SourceError> {
        let mut lines = reader.lines();
        loop {
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = cancel.cancelled() => return Ok(()),
            };
            let Some(line) = line else {
                return Ok(());
            };

            match self.parse_entry(&line, SystemTime::now()) {
                Entry::Record { payload, tag } => {
                    debug!(tag, "adding journal entry to buffer");
                    buffer.add(payload, tag);
                }
                Entry::NoMessage => {}
                Entry::Expired { age } => {
                    debug!(
                        age_secs = age.as_secs_f64(),
                        "journal entry outside time window, skipping"
                    );
                }
                Entry::Invalid(reason) => warn!(reason, "skipping unreadable journal entry"),
            }
        }
    }

    /// Follow the journal in `directory` through `journalctl` until `cancel`
    /// fires. `journalctl` exiting on its own is an error.
    pub async fn follow(
        &self,
        directory: &Path,
        buffer: &LogBuffer,
        cancel: &CancellationToken,
    ) -> Result<(), SourceError> {
        let since = SystemTime::now()
            .checked_sub(self.window)
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .unwrap_or_default();

        let mut child = Command::new("journalctl")
            .arg("--directory")
            .arg(directory)
            .args(["--follow", "--output=json", "--all"])
            .arg(format!("--since=@{}", since.as_secs()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("failed to capture journalctl stdout"))?;

        info!(
            directory = %directory.display(),
            name_field = %self.name_field,
            "following journal"
        );
        self.pump(BufReader::new(stdout), buffer, cancel).await?;

        if cancel.is_cancelled() {
            if let Err(e) = child.kill().await {
                debug!(error = %e, "journalctl already gone");
            }
            return Ok(());
        }
        Err(SourceError::JournalExited(child.wait().await?))
    }
}

/// Journal field values are strings, or byte arrays for binary data.
fn field_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let bytes: Option<Vec<u8>> = items
                .iter()
                .map(|v| v.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect();
            match bytes {
                Some(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
                // Repeated fields come as an array of strings; use the first.
                None => items.first().and_then(field_text),
            }
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
#[path = "journal_tests.rs"]
mod tests;
