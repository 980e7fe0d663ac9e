use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::updates::decode_batch;
use super::Telegram;
use crate::platform::NotifyError;

/// Who is currently feeding inbound events into the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestMode {
    Idle,
    /// The background poll loop owns the cursor.
    Polling,
    /// Number of push-mode batches in progress.
    Pushing(usize),
}

/// Holds an ingest mode and returns it to `Idle` when dropped.
pub(crate) struct ModeGuard<'a> {
    mode: &'a Mutex<IngestMode>,
}

impl<'a> ModeGuard<'a> {
    pub(crate) fn polling(mode: &'a Mutex<IngestMode>) -> Result<Self, NotifyError> {
        let mut current = mode.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != IngestMode::Idle {
            return Err(NotifyError::ModeConflict);
        }
        *current = IngestMode::Polling;
        Ok(Self { mode })
    }

    pub(crate) fn pushing(mode: &'a Mutex<IngestMode>) -> Result<Self, NotifyError> {
        let mut current = mode.lock().unwrap_or_else(PoisonError::into_inner);
        *current = match *current {
            IngestMode::Polling => return Err(NotifyError::ModeConflict),
            IngestMode::Idle => IngestMode::Pushing(1),
            IngestMode::Pushing(active) => IngestMode::Pushing(active + 1),
        };
        Ok(Self { mode })
    }
}

impl Drop for ModeGuard<'_> {
    fn drop(&mut self) {
        let mut current = self.mode.lock().unwrap_or_else(PoisonError::into_inner);
        *current = match *current {
            IngestMode::Pushing(active) if active > 1 => IngestMode::Pushing(active - 1),
            _ => IngestMode::Idle,
        };
    }
}

impl Telegram {
    /// Poll for updates and sweep expired link requests until `cancel` fires.
    ///
    /// Fails with [`NotifyError::ModeConflict`] when the loop is already
    /// running or push-mode batches are being processed.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), NotifyError> {
        let _guard = ModeGuard::polling(&self.mode)?;
        info!(
            "Telegram poll loop started (poll every {:?}, sweep every {:?})",
            self.poll_interval, self.sweep_interval
        );

        tokio::join!(self.poll_task(&cancel), self.sweep_task(&cancel));

        info!("Telegram poll loop stopped");
        Ok(())
    }

    async fn poll_task(&self, cancel: &CancellationToken) {
        let mut ticker = ticker(self.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            match self.poll_once(cancel).await {
                Ok(count) if count > 0 => debug!("Processed {} telegram updates", count),
                Ok(_) => {}
                Err(NotifyError::Cancelled) => return,
                Err(e) => warn!("Failed to fetch telegram updates: {}", e),
            }
        }
    }

    async fn sweep_task(&self, cancel: &CancellationToken) {
        let mut ticker = ticker(self.sweep_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let removed = self.requests.sweep_expired(Utc::now());
            if removed > 0 {
                debug!("Swept {} expired link requests", removed);
            }
        }
    }

    /// Fetch one batch from the cursor and process it. Returns the batch size.
    pub(crate) async fn poll_once(&self, cancel: &CancellationToken) -> Result<usize, NotifyError> {
        let mut cursor = self.cursor.lock().await;
        let updates = self.api.get_updates(cancel, *cursor).await?;
        self.process_updates(cancel, &updates, &mut cursor).await;
        Ok(updates.len())
    }

    /// Process a serialized batch delivered from outside (push mode).
    ///
    /// Expired link requests are swept on every call, even when `raw` does
    /// not decode. Refused with [`NotifyError::ModeConflict`] while the poll
    /// loop is running.
    pub async fn process_update(&self, cancel: &CancellationToken, raw: &str) -> Result<(), NotifyError> {
        let _guard = ModeGuard::pushing(&self.mode)?;

        let removed = self.requests.sweep_expired(Utc::now());
        if removed > 0 {
            debug!("Swept {} expired link requests", removed);
        }

        let updates = decode_batch(raw).map_err(|e| NotifyError::InvalidUpdate(e.to_string()))?;

        let mut cursor = self.cursor.lock().await;
        self.process_updates(cancel, &updates, &mut cursor).await;
        Ok(())
    }

    pub fn ingest_mode(&self) -> IngestMode {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
