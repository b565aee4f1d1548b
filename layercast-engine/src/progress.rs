//! Progress Registry
//!
//! Latest [`ProgressSnapshot`] per session. Only the pipeline driving a
//! session writes its entry; every write replaces the whole record and is
//! published on the event bus as `ProgressUpdated`.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use layercast_common::events::{EventBus, GenerationEvent, ProgressSnapshot};

#[derive(Debug, Clone)]
pub struct ProgressRegistry {
    entries: Arc<RwLock<HashMap<Uuid, ProgressSnapshot>>>,
    event_bus: EventBus,
}

impl ProgressRegistry {
    pub fn new(event_bus: EventBus) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            event_bus,
        }
    }

    /// Insert or replace the session's snapshot
    pub async fn publish(&self, snapshot: ProgressSnapshot) {
        self.entries
            .write()
            .await
            .insert(snapshot.session_id, snapshot.clone());
        self.event_bus
            .emit_lossy(GenerationEvent::ProgressUpdated { snapshot });
    }

    /// Replace the snapshot only if the session still has an entry
    ///
    /// Returns false once the session was removed, so a run that outlives
    /// its session does not resurrect the entry.
    pub async fn replace(&self, snapshot: ProgressSnapshot) -> bool {
        {
            let mut entries = self.entries.write().await;
            match entries.get_mut(&snapshot.session_id) {
                Some(entry) => *entry = snapshot.clone(),
                None => return false,
            }
        }
        self.event_bus
            .emit_lossy(GenerationEvent::ProgressUpdated { snapshot });
        true
    }

    pub async fn get(&self, session_id: Uuid) -> Option<ProgressSnapshot> {
        self.entries.read().await.get(&session_id).cloned()
    }

    pub async fn remove(&self, session_id: Uuid) -> Option<ProgressSnapshot> {
        self.entries.write().await.remove(&session_id)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use layercast_common::events::GenerationStatus;

    #[tokio::test]
    async fn test_publish_replaces_whole_record() {
        let registry = ProgressRegistry::new(EventBus::new(16));
        let id = Uuid::new_v4();

        registry.publish(ProgressSnapshot::pending(id, 4)).await;
        let mut next = ProgressSnapshot::pending(id, 4);
        next.status = GenerationStatus::Generating;
        next.percentage = 25.0;
        next.message = "Generating images...".to_string();
        registry.publish(next.clone()).await;

        assert_eq!(registry.get(id).await, Some(next));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_replace_requires_existing_entry() {
        let registry = ProgressRegistry::new(EventBus::new(16));
        let id = Uuid::new_v4();

        assert!(!registry.replace(ProgressSnapshot::pending(id, 1)).await);
        assert!(registry.get(id).await.is_none());

        registry.publish(ProgressSnapshot::pending(id, 1)).await;
        assert!(registry.replace(ProgressSnapshot::pending(id, 2)).await);
        assert_eq!(registry.get(id).await.map(|s| s.total), Some(2));

        registry.remove(id).await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_updates_are_broadcast() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let registry = ProgressRegistry::new(bus);
        let id = Uuid::new_v4();

        registry.publish(ProgressSnapshot::pending(id, 3)).await;
        match rx.recv().await.unwrap() {
            GenerationEvent::ProgressUpdated { snapshot } => assert_eq!(snapshot.total, 3),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
