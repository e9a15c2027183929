//! Live event fan-out to connected subscribers (server-sent events).
//!
//! Each subscriber owns a bounded channel registered with the [`Publisher`].
//! Publishing never waits: a subscriber whose buffer is full is dropped, and
//! its [`Subscription`] ends after draining what was already queued. A
//! subscription otherwise yields frames until the caller cancels, the
//! publisher shuts down, or the connection reaches its maximum age; idle
//! periods produce heartbeat pings.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use cdrop_core::types::UploadStatus;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Events queued per subscriber before it counts as stalled
const SUBSCRIBER_BUFFER: usize = 64;

pub const PING_FRAME: &str = "event: ping\n\n";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event")]
pub enum Event {
    #[serde(rename = "uploadStatus")]
    UploadStatus {
        chunk_id: String,
        file_id: String,
        error_message: String,
        upload_status: u8,
    },
    #[serde(rename = "download")]
    Download {
        file_id: String,
        download_count: u64,
        /// -1 for unlimited downloads
        downloads_remaining: i64,
    },
}

impl Event {
    pub fn from_status(status: &UploadStatus) -> Self {
        Event::UploadStatus {
            chunk_id: status.chunk_id.clone(),
            file_id: status.file_id.clone().unwrap_or_default(),
            error_message: status.error_message.clone().unwrap_or_default(),
            upload_status: status.phase.as_u8(),
        }
    }

    pub fn download(file_id: &str, download_count: u64, downloads_remaining: Option<u32>) -> Self {
        Event::Download {
            file_id: file_id.to_string(),
            download_count,
            downloads_remaining: downloads_remaining.map_or(-1, i64::from),
        }
    }

    /// Render as an SSE `message` frame.
    pub fn to_sse_frame(&self) -> String {
        // Serializing a plain enum of strings and integers cannot fail
        let data = serde_json::to_string(self).unwrap_or_default();
        format!("event: message\ndata: {data}\n\n")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Event(Event),
    Ping,
}

impl Frame {
    pub fn to_sse(&self) -> String {
        match self {
            Frame::Event(event) => event.to_sse_frame(),
            Frame::Ping => PING_FRAME.to_string(),
        }
    }
}

struct Shared {
    subscribers: RwLock<HashMap<String, mpsc::Sender<Event>>>,
    shutdown: CancellationToken,
    heartbeat: Duration,
    max_age: Duration,
}

impl Shared {
    fn remove(&self, id: &str) {
        if self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
        {
            debug!(subscriber = id, "subscriber removed");
        }
    }
}

#[derive(Clone)]
pub struct Publisher {
    shared: Arc<Shared>,
}

impl Publisher {
    pub fn new(heartbeat: Duration, max_age: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                subscribers: RwLock::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                heartbeat,
                max_age,
            }),
        }
    }

    /// Queue `event` for every current subscriber, in publish order.
    /// Subscribers that stopped reading are deregistered.
    pub fn publish(&self, event: Event) {
        let mut dropped = Vec::new();
        {
            let subscribers = self
                .shared
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            for (id, tx) in subscribers.iter() {
                match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            subscriber = %id,
                            buffered = SUBSCRIBER_BUFFER,
                            "subscriber lagging, dropped"
                        );
                        dropped.push(id.clone());
                    }
                    Err(TrySendError::Closed(_)) => dropped.push(id.clone()),
                }
            }
        }
        for id in dropped {
            self.shared.remove(&id);
        }
    }

    pub fn subscribe(&self, cancel: CancellationToken) -> Subscription {
        self.subscribe_with(cancel, Vec::new())
    }

    /// Register a subscriber that first receives `snapshot`.
    pub fn subscribe_with(&self, cancel: CancellationToken, snapshot: Vec<Event>) -> Subscription {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.shared
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), tx);
        debug!(subscriber = %id, "subscriber added");

        Subscription {
            id,
            backlog: snapshot.into(),
            rx,
            cancel,
            shutdown: self.shared.shutdown.clone(),
            deadline: Instant::now() + self.shared.max_age,
            heartbeat: self.shared.heartbeat,
            shared: Arc::downgrade(&self.shared),
            closed: false,
        }
    }

    /// End every subscription and refuse further deliveries.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let count = {
            let mut subs = self
                .shared
                .subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let count = subs.len();
            subs.clear();
            count
        };
        info!(subscribers = count, "event publisher shut down");
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("subscribers", &self.subscriber_count())
            .field("heartbeat", &self.shared.heartbeat)
            .field("max_age", &self.shared.max_age)
            .finish()
    }
}

/// One live connection. Deregisters itself when it ends or is dropped.
pub struct Subscription {
    id: String,
    backlog: VecDeque<Event>,
    rx: mpsc::Receiver<Event>,
    cancel: CancellationToken,
    shutdown: CancellationToken,
    deadline: Instant,
    heartbeat: Duration,
    shared: Weak<Shared>,
    closed: bool,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next frame to write to the client, `None` once the connection should
    /// be closed.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        if self.closed {
            return None;
        }
        if let Some(event) = self.backlog.pop_front() {
            return Some(Frame::Event(event));
        }

        let frame = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            _ = self.shutdown.cancelled() => None,
            _ = tokio::time::sleep_until(self.deadline) => None,
            event = self.rx.recv() => event.map(Frame::Event),
            _ = tokio::time::sleep(self.heartbeat) => Some(Frame::Ping),
        };

        if frame.is_none() {
            self.close();
        }
        frame
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Some(shared) = self.shared.upgrade() {
                shared.remove(&self.id);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdrop_core::types::UploadPhase;

    fn publisher() -> Publisher {
        Publisher::new(Duration::from_secs(15), Duration::from_secs(7200))
    }

    fn status_event(id: &str) -> Event {
        Event::from_status(&UploadStatus {
            chunk_id: id.into(),
            phase: UploadPhase::Finished,
            file_id: Some("file-1".into()),
            error_message: None,
            created_at: 0,
        })
    }

    #[test]
    fn test_sse_frames() {
        let frame = status_event("chunk-1").to_sse_frame();
        assert!(frame.starts_with("event: message\ndata: {"));
        assert!(frame.ends_with("}\n\n"));
        assert!(frame.contains(r#""event":"uploadStatus""#));
        assert!(frame.contains(r#""chunk_id":"chunk-1""#));
        assert!(frame.contains(r#""upload_status":2"#));

        let dl = Event::download("file-1", 3, None).to_sse_frame();
        assert!(dl.contains(r#""event":"download""#));
        assert!(dl.contains(r#""downloads_remaining":-1"#));

        assert_eq!(Frame::Ping.to_sse(), "event: ping\n\n");
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let publisher = publisher();
        let mut a = publisher.subscribe(CancellationToken::new());
        let mut b = publisher.subscribe(CancellationToken::new());
        assert_eq!(publisher.subscriber_count(), 2);

        publisher.publish(status_event("chunk-1"));

        assert_eq!(a.next_frame().await, Some(Frame::Event(status_event("chunk-1"))));
        assert_eq!(b.next_frame().await, Some(Frame::Event(status_event("chunk-1"))));
    }

    #[tokio::test]
    async fn test_snapshot_comes_first() {
        let publisher = publisher();
        let mut sub = publisher.subscribe_with(
            CancellationToken::new(),
            vec![status_event("old-1"), status_event("old-2")],
        );
        assert_eq!(sub.next_frame().await, Some(Frame::Event(status_event("old-1"))));
        assert_eq!(sub.next_frame().await, Some(Frame::Event(status_event("old-2"))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_when_idle() {
        let publisher = Publisher::new(Duration::from_secs(15), Duration::from_secs(7200));
        let mut sub = publisher.subscribe(CancellationToken::new());
        assert_eq!(sub.next_frame().await, Some(Frame::Ping));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_age_ends_subscription() {
        let publisher = Publisher::new(Duration::from_secs(15), Duration::from_secs(40));
        let mut sub = publisher.subscribe(CancellationToken::new());

        let mut pings = 0;
        while let Some(frame) = sub.next_frame().await {
            assert_eq!(frame, Frame::Ping);
            pings += 1;
        }
        assert_eq!(pings, 2);
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_ends_subscription() {
        let publisher = publisher();
        let cancel = CancellationToken::new();
        let mut sub = publisher.subscribe(cancel.clone());

        cancel.cancel();
        assert_eq!(sub.next_frame().await, None);
        assert_eq!(publisher.subscriber_count(), 0);
        assert_eq!(sub.next_frame().await, None);
    }

    #[tokio::test]
    async fn test_shutdown_ends_all() {
        let publisher = publisher();
        let mut a = publisher.subscribe(CancellationToken::new());
        let mut b = publisher.subscribe(CancellationToken::new());

        publisher.shutdown();
        assert_eq!(a.next_frame().await, None);
        assert_eq!(b.next_frame().await, None);
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_deregisters() {
        let publisher = publisher();
        let sub = publisher.subscribe(CancellationToken::new());
        assert_eq!(publisher.subscriber_count(), 1);
        drop(sub);
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_keeps_order() {
        let publisher = publisher();
        let mut sub = publisher.subscribe(CancellationToken::new());
        for i in 0..10 {
            publisher.publish(status_event(&format!("chunk-{i}")));
        }
        for i in 0..10 {
            assert_eq!(
                sub.next_frame().await,
                Some(Frame::Event(status_event(&format!("chunk-{i}"))))
            );
        }
    }

    #[tokio::test]
    async fn test_stalled_subscriber_is_dropped() {
        let publisher = publisher();
        let mut stalled = publisher.subscribe(CancellationToken::new());
        let mut live = publisher.subscribe(CancellationToken::new());

        for i in 0..SUBSCRIBER_BUFFER {
            publisher.publish(status_event(&format!("chunk-{i}")));
            assert_eq!(live.next_frame().await.map(|_| ()), Some(()));
        }
        assert_eq!(publisher.subscriber_count(), 2);

        for _ in 0..1000 {
            publisher.publish(status_event("overflow"));
            live.next_frame().await;
        }
        assert_eq!(publisher.subscriber_count(), 1);

        // Already queued events still arrive, then the stream ends.
        let mut received = 0;
        while let Some(frame) = stalled.next_frame().await {
            assert_ne!(frame, Frame::Event(status_event("overflow")));
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_BUFFER);

        publisher.publish(status_event("after"));
        assert_eq!(live.next_frame().await, Some(Frame::Event(status_event("after"))));
    }

    #[test]
    fn test_publish_without_runtime() {
        let publisher = publisher();
        publisher.publish(status_event("nobody"));
        assert_eq!(publisher.subscriber_count(), 0);
    }
}
