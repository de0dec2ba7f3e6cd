//! In-process publish/subscribe so a listener can learn a pipeline's
//! `wal_events` table just grew without polling it.

use tokio::sync::broadcast;
use uuid::Uuid;

/// Bounded so a slow or absent subscriber can't grow this unboundedly;
/// lagging subscribers just miss old notifications and catch the next one.
const CHANNEL_CAPACITY: usize = 256;

/// Broadcasts a pipeline id every time a committed transaction's batch
/// wrote at least one `wal_event` for it.
#[derive(Clone)]
pub struct PipelineNotifier {
    sender: broadcast::Sender<Uuid>,
}

impl PipelineNotifier {
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Uuid> {
        self.sender.subscribe()
    }

    /// Publish a `wal_event_inserted` notification for `pipeline_id`. A
    /// send with no subscribers is not an error.
    pub fn notify(&self, pipeline_id: Uuid) {
        let _ = self.sender.send(pipeline_id);
    }
}

impl Default for PipelineNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_notified_pipeline_id() {
        let notifier = PipelineNotifier::new();
        let mut rx = notifier.subscribe();
        let id = Uuid::new_v4();
        notifier.notify(id);
        assert_eq!(rx.recv().await.unwrap(), id);
    }

    #[test]
    fn notify_without_subscribers_is_not_an_error() {
        let notifier = PipelineNotifier::new();
        notifier.notify(Uuid::new_v4());
    }
}
