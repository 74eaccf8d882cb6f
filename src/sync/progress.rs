use crate::models::ProgressUpdate;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info};

/// Receives periodic progress tuples; implementations must never block the caller
pub trait ProgressSink: Send + Sync {
    fn report(&self, update: ProgressUpdate);
}

/// Forwards updates over a bounded channel, dropping them when it is full or closed
pub struct ChannelProgressSink {
    tx: mpsc::Sender<ProgressUpdate>,
}

impl ChannelProgressSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelProgressSink {
    fn report(&self, update: ProgressUpdate) {
        match self.tx.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(update)) => {
                debug!(task_id = %update.task_id, "Progress channel full, dropping update");
            }
            Err(TrySendError::Closed(update)) => {
                debug!(task_id = %update.task_id, "Progress channel closed, dropping update");
            }
        }
    }
}

pub struct LoggingProgressSink;

impl ProgressSink for LoggingProgressSink {
    fn report(&self, update: ProgressUpdate) {
        info!(
            task_id = %update.task_id,
            phase = ?update.phase,
            processed = update.processed,
            success = update.success,
            failed = update.failed,
            "Transfer progress"
        );
    }
}
