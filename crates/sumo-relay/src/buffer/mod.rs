use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, warn};

use crate::uploader::{UploadError, Uploader};

/// Slots reserved each time the buffer runs out of room.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

const SEPARATOR: &[u8] = b"\n";

/// One payload waiting to be delivered under `tag`. An empty tag means untagged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    payload: Bytes,
    tag: String,
}

impl Record {
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

#[derive(Debug, Error)]
pub enum FlushError {
    /// At least one tag group failed; carries the last failure seen.
    #[error("flush failed: {0}")]
    Delivery(#[from] UploadError),

    #[error("a flush is already in flight")]
    InFlight,
}

/// Records and flush state behind the single mutex.
struct BufferState {
    records: Vec<Record>,
    chunk_size: usize,
    flushing: bool,
}

impl BufferState {
    fn push(&mut self, record: Record) {
        if self.records.len() == self.records.capacity() {
            self.records.reserve_exact(self.chunk_size);
        }
        self.records.push(record);
    }
}

/// Accumulates tagged records from any number of producers and flushes them,
/// grouped by tag, through an [`Uploader`].
///
/// Uses `std::sync::Mutex` because the lock is only held to append, to copy
/// the pending prefix, or to remove it again. Network I/O happens outside it.
#[derive(Clone)]
pub struct LogBuffer {
    state: Arc<Mutex<BufferState>>,
}

impl LogBuffer {
    pub fn new(chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            state: Arc::new(Mutex::new(BufferState {
                records: Vec::with_capacity(chunk_size),
                chunk_size,
                flushing: false,
            })),
        }
    }

    // A panicking producer must not stop the relay, and every critical
    // section leaves the state consistent, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a record. Never blocks on I/O and never fails.
    pub fn add(&self, payload: impl Into<Bytes>, tag: impl Into<String>) {
        let record = Record {
            payload: payload.into(),
            tag: tag.into(),
        };
        self.lock().push(record);
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().records.capacity()
    }

    pub fn chunk_size(&self) -> usize {
        self.lock().chunk_size
    }

    pub fn is_flushing(&self) -> bool {
        self.lock().flushing
    }

    /// Copy of the records waiting to be flushed, oldest first.
    pub fn pending(&self) -> Vec<Record> {
        self.lock().records.clone()
    }

    /// Run one flush cycle.
    ///
    /// Copies the pending records, sends one request per distinct tag, and
    /// removes the copied records only if every request succeeded. On any
    /// failure nothing is removed and the last error is returned, so the whole
    /// batch is retried on the next call (groups that did succeed are sent
    /// again). Records added while the flush is in progress are never removed
    /// by it.
    ///
    /// Returns the number of records removed. Fails with
    /// [`FlushError::InFlight`] if another flush on this buffer has not
    /// finished.
    pub async fn send<U: Uploader>(&self, uploader: &U) -> Result<usize, FlushError> {
        let (_flushing, batch) = {
            let mut state = self.lock();
            if state.flushing {
                return Err(FlushError::InFlight);
            }
            let batch = state.records.clone();
            state.flushing = true;
            (FlushingGuard { buffer: self }, batch)
        };

        if batch.is_empty() {
            return Ok(0);
        }

        let mut last_error = None;
        for (tag, payload) in group_by_tag(&batch) {
            if let Err(e) = uploader.send(&payload, tag).await {
                warn!(tag, bytes = payload.len(), error = %e, "failed to deliver tag group");
                last_error = Some(e);
            }
        }
        if let Some(e) = last_error {
            return Err(FlushError::Delivery(e));
        }

        {
            let mut state = self.lock();
            state.records.drain(..batch.len());
        }
        debug!(records = batch.len(), "flushed buffer");
        Ok(batch.len())
    }
}

/// Clears the flushing flag when a flush ends, including when its future is
/// dropped part way through.
struct FlushingGuard<'a> {
    buffer: &'a LogBuffer,
}

impl Drop for FlushingGuard<'_> {
    fn drop(&mut self) {
        self.buffer.lock().flushing = false;
    }
}

/// Join each tag's payloads with a newline, in arrival order.
/// Groups are returned in order of each tag's first appearance.
fn group_by_tag(batch: &[Record]) -> Vec<(&str, Bytes)> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut groups: Vec<(&str, BytesMut)> = Vec::new();

    for record in batch {
        match index.get(record.tag.as_str()) {
            Some(&i) => {
                let body = &mut groups[i].1;
                body.extend_from_slice(SEPARATOR);
                body.extend_from_slice(&record.payload);
            }
            None => {
                index.insert(&record.tag, groups.len());
                groups.push((&record.tag, BytesMut::from(&record.payload[..])));
            }
        }
    }

    groups
        .into_iter()
        .map(|(tag, body)| (tag, body.freeze()))
        .collect()
}
