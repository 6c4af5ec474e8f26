//! Live update fan-out - push channel with bounded subscriber queues
//!
//! Updates for a given entity reach a given subscriber in non-decreasing
//! timestamp order because every ingest publishes through one channel in
//! batch order. Each subscriber has a bounded queue (the broadcast channel
//! capacity); on overflow the oldest buffered messages are dropped and the
//! subscriber sees `ResyncRequired` instead of a silent gap.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use tempo_core::{EntityType, LiveUpdateMessage};

/// Subscriber-side filter; empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<String>,
}

impl SubscriptionFilter {
    pub fn for_type(entity_type: EntityType) -> Self {
        Self {
            entity_type: Some(entity_type),
            entity_id: None,
        }
    }

    pub fn for_entity(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: Some(entity_type),
            entity_id: Some(entity_id.into()),
        }
    }

    pub fn matches(&self, msg: &LiveUpdateMessage) -> bool {
        if let Some(entity_type) = &self.entity_type {
            if msg.entity_type != *entity_type {
                return false;
            }
        }
        if let Some(entity_id) = &self.entity_id {
            if msg.entity_id != *entity_id {
                return false;
            }
        }
        true
    }
}

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveEvent {
    Update(LiveUpdateMessage),
    /// The subscriber's queue overflowed and messages were dropped; the
    /// affected range must be re-queried rather than trusted.
    ResyncRequired { dropped: u64 },
}

pub struct LiveUpdateFanOut {
    tx: broadcast::Sender<LiveUpdateMessage>,
}

impl LiveUpdateFanOut {
    pub fn new(queue_depth: usize) -> Self {
        let (tx, _) = broadcast::channel(queue_depth.max(1));
        Self { tx }
    }

    /// Broadcast one update; returns the number of subscribers reached.
    pub fn publish(&self, msg: LiveUpdateMessage) -> usize {
        match self.tx.send(msg) {
            Ok(receivers) => receivers,
            Err(_) => {
                // No subscribers; nothing to deliver.
                0
            }
        }
    }

    pub fn subscribe(&self, filter: SubscriptionFilter) -> LiveUpdateStream {
        debug!(?filter.entity_type, ?filter.entity_id, "Live subscriber attached");
        LiveUpdateStream {
            rx: self.tx.subscribe(),
            filter,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// One subscriber's view of the fan-out.
pub struct LiveUpdateStream {
    rx: broadcast::Receiver<LiveUpdateMessage>,
    filter: SubscriptionFilter,
}

impl LiveUpdateStream {
    /// Receive the next matching event. Returns `None` once the fan-out is
    /// closed. A lagged queue yields `ResyncRequired` with the drop count.
    pub async fn recv(&mut self) -> Option<LiveEvent> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => {
                    if self.filter.matches(&msg) {
                        return Some(LiveEvent::Update(msg));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(dropped)) => {
                    return Some(LiveEvent::ResyncRequired { dropped });
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update(entity_type: EntityType, id: &str, ts: i64) -> LiveUpdateMessage {
        LiveUpdateMessage {
            entity_type,
            entity_id: id.to_string(),
            timestamp: ts,
            data: json!({"seq": ts}),
        }
    }

    #[tokio::test]
    async fn delivers_in_publish_order_per_entity() {
        let fanout = LiveUpdateFanOut::new(16);
        let mut stream = fanout.subscribe(SubscriptionFilter::for_type(EntityType::Aircraft));

        for ts in [100, 110, 120] {
            fanout.publish(update(EntityType::Aircraft, "N1", ts));
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            match stream.recv().await.unwrap() {
                LiveEvent::Update(msg) => seen.push(msg.timestamp),
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(seen, vec![100, 110, 120]);
    }

    #[tokio::test]
    async fn filter_skips_other_entities() {
        let fanout = LiveUpdateFanOut::new(16);
        let mut stream =
            fanout.subscribe(SubscriptionFilter::for_entity(EntityType::Aircraft, "N2"));

        fanout.publish(update(EntityType::Aircraft, "N1", 100));
        fanout.publish(update(EntityType::Vessel, "N2", 150));
        fanout.publish(update(EntityType::Aircraft, "N2", 200));

        match stream.recv().await.unwrap() {
            LiveEvent::Update(msg) => {
                assert_eq!(msg.entity_id, "N2");
                assert_eq!(msg.timestamp, 200);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn overflow_emits_resync_required() {
        let fanout = LiveUpdateFanOut::new(4);
        let mut stream = fanout.subscribe(SubscriptionFilter::default());

        // Push well past the queue depth before the subscriber drains.
        for ts in 0..20 {
            fanout.publish(update(EntityType::Aircraft, "N1", ts));
        }

        match stream.recv().await.unwrap() {
            LiveEvent::ResyncRequired { dropped } => assert!(dropped >= 16),
            other => panic!("expected resync, got {:?}", other),
        }

        // Stream continues after the resync signal.
        match stream.recv().await.unwrap() {
            LiveEvent::Update(msg) => assert!(msg.timestamp >= 16),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_harmless() {
        let fanout = LiveUpdateFanOut::new(4);
        assert_eq!(fanout.publish(update(EntityType::Aircraft, "N1", 1)), 0);
        assert_eq!(fanout.subscriber_count(), 0);
    }
}
