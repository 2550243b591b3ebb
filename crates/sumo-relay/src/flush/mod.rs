use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::buffer::{FlushError, LogBuffer};
use crate::uploader::Uploader;

/// Flushes a [`LogBuffer`] on a fixed period until cancelled.
///
/// Failed flushes are logged and left to the next tick; the buffer keeps the
/// undelivered records.
pub struct FlushDriver<U: Uploader> {
    buffer: LogBuffer,
    uploader: Arc<U>,
    period: Duration,
}

impl<U: Uploader> FlushDriver<U> {
    pub fn new(buffer: LogBuffer, uploader: Arc<U>, period: Duration) -> Self {
        Self {
            buffer,
            uploader,
            period,
        }
    }

    /// Tick until `cancel` fires, then make one last flush attempt.
    ///
    /// The first flush happens one full period after start. A flush that
    /// overruns the period delays the following ticks instead of bunching them.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = time::interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => self.flush().await,
                _ = cancel.cancelled() => break,
            }
        }

        debug!(pending = self.buffer.len(), "final flush before shutdown");
        self.flush().await;
    }

    /// Run one flush cycle and log the outcome.
    pub async fn flush(&self) {
        match self.buffer.send(&*self.uploader).await {
            Ok(0) => {}
            Ok(records) => debug!(records, "flush delivered"),
            Err(FlushError::InFlight) => debug!("flush skipped, previous flush still running"),
            Err(e) => error!(error = %e, pending = self.buffer.len(), "flush failed"),
        }
    }
}
