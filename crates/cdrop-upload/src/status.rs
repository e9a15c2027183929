//! Upload processing status.
//!
//! Phases only move forward: an update is applied if its phase is at least the
//! stored one, so a late `Uploading` never hides `Finished`, and `Error` (the
//! highest phase) always wins. Entries are dropped a fixed time after creation.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use cdrop_core::types::{now_unix, UploadPhase, UploadStatus};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::events::{Event, Publisher, Subscription};

pub struct StatusTable {
    entries: RwLock<HashMap<String, UploadStatus>>,
    publisher: Publisher,
    ttl: Duration,
}

impl StatusTable {
    pub fn new(publisher: Publisher, ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            publisher,
            ttl,
        }
    }

    /// Record a phase change. Returns whether it was applied; applied changes
    /// are published to subscribers.
    pub fn set_status(
        &self,
        chunk_id: &str,
        phase: UploadPhase,
        file_id: Option<String>,
        error_message: Option<String>,
    ) -> bool {
        let status = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            let created_at = match entries.get(chunk_id) {
                Some(existing) if existing.phase > phase => {
                    debug!(
                        chunk_id,
                        stored = existing.phase.as_u8(),
                        rejected = phase.as_u8(),
                        "stale status update ignored"
                    );
                    return false;
                }
                Some(existing) => existing.created_at,
                None => now_unix(),
            };
            let status = UploadStatus {
                chunk_id: chunk_id.to_string(),
                phase,
                file_id,
                error_message,
                created_at,
            };
            entries.insert(chunk_id.to_string(), status.clone());
            status
        };

        self.publisher.publish(Event::from_status(&status));
        true
    }

    pub fn get(&self, chunk_id: &str) -> Option<UploadStatus> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(chunk_id)
            .cloned()
    }

    pub fn all(&self) -> Vec<UploadStatus> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rebuild the table without entries created more than the TTL before
    /// `now` (Unix seconds). Returns the number dropped.
    pub fn sweep_expired(&self, now: u64) -> usize {
        let cutoff = now.saturating_sub(self.ttl.as_secs());
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        let fresh: HashMap<String, UploadStatus> = entries
            .drain()
            .filter(|(_, status)| status.created_at > cutoff)
            .collect();
        *entries = fresh;
        let removed = before - entries.len();
        if removed > 0 {
            info!(removed, "expired upload statuses swept");
        }
        removed
    }

    /// Subscribe to status events, starting with every current status.
    pub fn subscribe(&self, cancel: CancellationToken) -> Subscription {
        let snapshot = self.all().iter().map(Event::from_status).collect();
        self.publisher.subscribe_with(cancel, snapshot)
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    #[cfg(test)]
    fn backdate(&self, chunk_id: &str, created_at: u64) {
        if let Some(s) = self.entries.write().unwrap().get_mut(chunk_id) {
            s.created_at = created_at;
        }
    }
}

impl std::fmt::Debug for StatusTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusTable")
            .field("entries", &self.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}
