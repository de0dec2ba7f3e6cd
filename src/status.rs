//! Process-wide status registry for status readers: `last_committed_at`
//! and health, keyed both per replication slot and per individual
//! consumer/pipeline subscription.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotHealth {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Copy)]
pub struct SlotStatus {
    pub last_committed_at: SystemTime,
    pub health: SlotHealth,
}

#[derive(Default)]
pub struct StatusRegistry {
    slots: Mutex<HashMap<String, SlotStatus>>,
    subscriptions: Mutex<HashMap<Uuid, SlotHealth>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_committed(&self, slot_id: &str, at: SystemTime) {
        self.slots.lock().unwrap().insert(
            slot_id.to_string(),
            SlotStatus {
                last_committed_at: at,
                health: SlotHealth::Healthy,
            },
        );
    }

    pub fn mark_unhealthy(&self, slot_id: &str) {
        let mut slots = self.slots.lock().unwrap();
        slots
            .entry(slot_id.to_string())
            .and_modify(|s| s.health = SlotHealth::Unhealthy)
            .or_insert(SlotStatus {
                last_committed_at: SystemTime::UNIX_EPOCH,
                health: SlotHealth::Unhealthy,
            });
    }

    pub fn get(&self, slot_id: &str) -> Option<SlotStatus> {
        self.slots.lock().unwrap().get(slot_id).copied()
    }

    /// Marks one consumer or pipeline healthy, called once its batch of
    /// this commit has been durably persisted.
    pub fn mark_subscription_healthy(&self, id: Uuid) {
        self.subscriptions
            .lock()
            .unwrap()
            .insert(id, SlotHealth::Healthy);
    }

    pub fn mark_subscription_unhealthy(&self, id: Uuid) {
        self.subscriptions
            .lock()
            .unwrap()
            .insert(id, SlotHealth::Unhealthy);
    }

    pub fn subscription_health(&self, id: Uuid) -> Option<SlotHealth> {
        self.subscriptions.lock().unwrap().get(&id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marks_and_reads_status() {
        let registry = StatusRegistry::new();
        let now = SystemTime::now();
        registry.mark_committed("slot-a", now);
        let status = registry.get("slot-a").unwrap();
        assert_eq!(status.health, SlotHealth::Healthy);
        assert_eq!(status.last_committed_at, now);
    }

    #[test]
    fn unhealthy_overrides_health_without_losing_previous_commit() {
        let registry = StatusRegistry::new();
        let now = SystemTime::now();
        registry.mark_committed("slot-a", now);
        registry.mark_unhealthy("slot-a");
        let status = registry.get("slot-a").unwrap();
        assert_eq!(status.health, SlotHealth::Unhealthy);
        assert_eq!(status.last_committed_at, now);
    }

    #[test]
    fn tracks_subscription_health_independently_of_slot_health() {
        let registry = StatusRegistry::new();
        let consumer_id = Uuid::new_v4();
        assert_eq!(registry.subscription_health(consumer_id), None);
        registry.mark_subscription_healthy(consumer_id);
        assert_eq!(
            registry.subscription_health(consumer_id),
            Some(SlotHealth::Healthy)
        );
        registry.mark_subscription_unhealthy(consumer_id);
        assert_eq!(
            registry.subscription_health(consumer_id),
            Some(SlotHealth::Unhealthy)
        );
    }
}
