//! Sync event bus
//!
//! Broadcasts `sync_started` / `sync_completed` / `sync_failed` to any number
//! of observers. Subscriptions are explicit: a `Receiver` from `subscribe`, or
//! a callback handle from `on_sync_event` that stops on `unsubscribe`/drop.

use super::models::{SyncOptions, SyncResult};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Started(SyncOptions),
    Completed(SyncResult),
    /// A run aborted early (store failure); lock already released
    Failed { error: String, result: SyncResult },
}

impl SyncEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Started(_) => "sync_started",
            Self::Completed(_) => "sync_completed",
            Self::Failed { .. } => "sync_failed",
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to current subscribers; no subscribers is not an error
    pub fn emit(&self, event: SyncEvent) {
        log::debug!("Sync event: {}", event.name());
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Invoke `callback` for every event until the handle is dropped
    ///
    /// Must be called inside a Tokio runtime.
    pub fn on_sync_event<F>(&self, callback: F) -> Subscription
    where
        F: Fn(SyncEvent) + Send + 'static,
    {
        let mut receiver = self.sender.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => callback(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Sync event listener lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Subscription {
            handle: Some(handle),
        }
    }
}

/// Callback subscription handle
pub struct Subscription {
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_subscribe_receives_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(SyncEvent::Started(SyncOptions::default()));
        bus.emit(SyncEvent::Completed(SyncResult::default()));

        assert_eq!(rx.recv().await.unwrap().name(), "sync_started");
        assert_eq!(rx.recv().await.unwrap().name(), "sync_completed");
    }

    #[tokio::test]
    async fn test_callback_stops_after_unsubscribe() {
        let bus = EventBus::default();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let subscription = bus.on_sync_event(move |event| {
            let _ = tx.send(event.name());
        });

        bus.emit(SyncEvent::Started(SyncOptions::default()));
        let name = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(name, Some("sync_started"));

        subscription.unsubscribe();
        // Aborting drops the callback and with it the sender
        let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(closed, None);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::default();
        bus.emit(SyncEvent::Failed {
            error: "boom".to_string(),
            result: SyncResult::rejected("boom"),
        });
    }
}
