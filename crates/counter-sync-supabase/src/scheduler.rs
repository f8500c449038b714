//! Drives the upload bridge until the local queue is empty.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use counter_sync_core::{BackendConnector, MutationQueue, Result, SyncError};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Backoff settings for transient upload failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after consecutive failures before giving up.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadStatus {
    pub uploading: bool,
    pub last_uploaded_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

pub struct UploadScheduler {
    connector: Arc<dyn BackendConnector>,
    queue: Arc<dyn MutationQueue>,
    policy: RetryPolicy,
    /// Held for the whole of a drain; the bridge is not reentrant.
    drain_lock: Mutex<()>,
    status: watch::Sender<UploadStatus>,
}

impl UploadScheduler {
    pub fn new(
        connector: Arc<dyn BackendConnector>,
        queue: Arc<dyn MutationQueue>,
        policy: RetryPolicy,
    ) -> Self {
        let (status, _) = watch::channel(UploadStatus::default());
        Self {
            connector,
            queue,
            policy,
            drain_lock: Mutex::new(()),
            status,
        }
    }

    pub fn status(&self) -> UploadStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<UploadStatus> {
        self.status.subscribe()
    }

    /// Upload pending transactions until none are left.
    ///
    /// Returns how many transactions left the queue, discarded ones
    /// included. Gives up with the last error once `max_retries`
    /// consecutive attempts have failed.
    pub async fn drain(&self) -> Result<usize> {
        let _guard = self.drain_lock.lock().await;
        self.status.send_modify(|s| s.uploading = true);

        let result = self.drain_locked().await;

        self.status.send_modify(|s| {
            s.uploading = false;
            if let Err(e) = &result {
                s.last_error = Some(e.to_string());
            }
        });
        result
    }

    async fn drain_locked(&self) -> Result<usize> {
        let mut processed = 0;
        let mut failures = 0;
        let mut delay = self.policy.base_delay;
        let mut last_head = None;

        while let Some(head) = self.queue.next_pending_transaction().await? {
            if last_head == Some(head.tx_id) && failures == 0 {
                return Err(SyncError::Queue(format!(
                    "transaction {} was still pending after a successful upload",
                    head.tx_id
                )));
            }
            last_head = Some(head.tx_id);

            match self.connector.upload_data(self.queue.as_ref()).await {
                Ok(()) => {
                    processed += 1;
                    failures = 0;
                    delay = self.policy.base_delay;
                    self.status.send_modify(|s| {
                        s.last_uploaded_at = Some(Utc::now());
                        s.last_error = None;
                    });
                }
                Err(e) if e.is_retryable() && failures < self.policy.max_retries => {
                    failures += 1;
                    warn!(
                        attempt = failures,
                        tx_id = head.tx_id,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Upload failed, retrying"
                    );
                    self.status.send_modify(|s| s.last_error = Some(e.to_string()));
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.policy.max_delay);
                }
                Err(e) => {
                    warn!(tx_id = head.tx_id, error = %e, "Giving up on upload");
                    return Err(e);
                }
            }
        }

        if processed > 0 {
            info!("Uploaded {} transaction(s)", processed);
        }
        Ok(processed)
    }

    /// Drain once, then again after every change notification.
    ///
    /// Returns when the sender side of `changes` is dropped.
    pub async fn run(&self, mut changes: watch::Receiver<u64>) {
        loop {
            let _ = changes.borrow_and_update();
            if let Err(e) = self.drain().await {
                warn!("Upload stopped, waiting for the next local change: {}", e);
            }
            if changes.changed().await.is_err() {
                debug!("Change notifier closed, stopping upload loop");
                return;
            }
        }
    }
}
