//! Relay of worker messages to the status cache and observers

use tokio::sync::broadcast;

use super::channel::RouterInbox;
use super::protocol::{Envelope, RelayedEvent, WorkerId, WorkerMessage};
use crate::cache::StatusCache;

/// Forwards every worker message, in arrival order, to observers
pub struct Relay {
    cache: StatusCache,
    events: broadcast::Sender<RelayedEvent>,
}

impl Relay {
    pub fn new(cache: StatusCache, events: broadcast::Sender<RelayedEvent>) -> Self {
        Self { cache, events }
    }

    /// Run until every worker endpoint is gone
    pub async fn run(self, mut inbox: RouterInbox) {
        while let Some(envelope) = inbox.recv().await {
            self.apply(envelope);
        }
        tracing::info!("All worker endpoints closed, relay stopped");
    }

    /// Update the cache from one envelope and publish it
    pub fn apply(&self, envelope: Envelope) {
        if envelope.from == WorkerId::processing() {
            match &envelope.message {
                WorkerMessage::ProcessorStatus(status) => {
                    self.cache.set_processor_status(status.clone())
                }
                WorkerMessage::ProgressUpdate(progress) => {
                    self.cache.set_active_job(Some(progress.clone()))
                }
                WorkerMessage::JobDone { .. } => self.cache.set_active_job(None),
                _ => {}
            }
        }

        match RelayedEvent::from_message(&envelope.message) {
            // No subscribers is fine
            Ok(event) => {
                let _ = self.events.send(event);
            }
            Err(e) => tracing::warn!("Dropping message from {}: {}", envelope.from, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::ProgressUpdate;

    fn envelope(from: WorkerId, message: WorkerMessage) -> Envelope {
        Envelope { from, message }
    }

    #[test]
    fn test_processing_progress_drives_active_job() {
        let cache = StatusCache::new();
        let (tx, mut rx) = broadcast::channel(16);
        let relay = Relay::new(cache.clone(), tx);

        relay.apply(envelope(
            WorkerId::processing(),
            WorkerMessage::ProcessorStatus("warmed up".to_string()),
        ));
        relay.apply(envelope(
            WorkerId::processing(),
            WorkerMessage::ProgressUpdate(ProgressUpdate::stage("id1", "Starting download")),
        ));
        assert_eq!(cache.processor_status(), "warmed up");
        assert_eq!(cache.active_job().unwrap().id, "id1");

        relay.apply(envelope(
            WorkerId::processing(),
            WorkerMessage::JobDone { id: "id1".to_string() },
        ));
        assert!(cache.active_job().is_none());

        let types: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.message_type)
            .collect();
        assert_eq!(types, vec!["processor_status", "progress_update", "job_done"]);
    }

    #[test]
    fn test_metadata_progress_does_not_touch_cache() {
        let cache = StatusCache::new();
        let (tx, mut rx) = broadcast::channel(16);
        let relay = Relay::new(cache.clone(), tx);

        relay.apply(envelope(
            WorkerId::metadata(),
            WorkerMessage::ProgressUpdate(ProgressUpdate::stage("id2", "Fetching thumbnail")),
        ));

        assert!(cache.active_job().is_none());
        assert_eq!(rx.try_recv().unwrap().message_type, "progress_update");
    }

    #[test]
    fn test_relay_without_subscribers() {
        let (tx, _) = broadcast::channel(4);
        let relay = Relay::new(StatusCache::new(), tx);
        relay.apply(envelope(WorkerId::metadata(), WorkerMessage::MetadataRefresh));
    }
}
