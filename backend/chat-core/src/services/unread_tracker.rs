use crate::error::AppResult;
use crate::services::retry::{with_retry, RetryConfig};
use crate::store::{ReadCursor, UnreadReset, UnreadStore};
use futures::future::join_all;
use std::sync::Arc;
use uuid::Uuid;

/// Per-participant unread counters.
///
/// Increments are conditional on the message's commit sequence, so they
/// commute with read-time recomputes: whichever lands second, the count
/// matches the log.
#[derive(Clone)]
pub struct UnreadTracker {
    store: Arc<dyn UnreadStore>,
    retry: RetryConfig,
}

impl UnreadTracker {
    pub fn new(store: Arc<dyn UnreadStore>, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    /// Count the message committed at `seq` as unread for each recipient.
    ///
    /// Returns `(recipient, new_count)` for the increments that applied. A
    /// recipient whose increment keeps failing is skipped; their next read
    /// recomputes the count from the log.
    pub async fn record_message(&self, chat_id: Uuid, recipients: &[Uuid], seq: u64) -> Vec<(Uuid, u64)> {
        let increments = recipients.iter().map(|&user_id| async move {
            let result = with_retry(&self.retry, "increment_unread", || {
                self.store.increment_unread(chat_id, user_id, seq)
            })
            .await;
            (user_id, result)
        });

        let mut applied = Vec::with_capacity(recipients.len());
        for (user_id, result) in join_all(increments).await {
            match result {
                Ok(Some(count)) => applied.push((user_id, count)),
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    chat_id = %chat_id,
                    user_id = %user_id,
                    seq,
                    error = %e,
                    "Unread increment failed; count will be recomputed on next read"
                ),
            }
        }
        applied
    }

    /// Move the participant's read cursor (if given) and recompute their count.
    pub async fn acknowledge(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        cursor: Option<ReadCursor>,
    ) -> AppResult<UnreadReset> {
        with_retry(&self.retry, "reset_unread", || {
            self.store.reset_unread(chat_id, user_id, cursor)
        })
        .await
    }
}
