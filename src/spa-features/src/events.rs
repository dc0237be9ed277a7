//! Structured engine events.
//!
//! Every registration, navigation and lifecycle transition is published on
//! the [`EventBus`]. Hosts either subscribe an [`EventHandler`] or take a
//! broadcast [`receiver`](EventBus::receiver) and forward records to their
//! own log collector.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

/// Events emitted by the activation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    // ========== Registry Events ==========
    /// Feature registered
    FeatureRegistered { feature: String, pattern: String },

    /// Feature descriptor replaced
    FeatureReplaced { feature: String, pattern: String },

    /// Feature removed from the registry
    FeatureUnregistered { feature: String },

    // ========== Navigation Events ==========
    /// The evaluated URL changed
    NavigationDetected { from: Option<String>, to: String },

    /// An evaluation pass finished
    EvaluationCompleted {
        url: String,
        activated: Vec<String>,
        failed: Vec<String>,
    },

    // ========== Lifecycle Events ==========
    /// `init` is about to run
    FeatureActivating { feature: String, url: String },

    /// Feature is active
    FeatureActivated { feature: String, url: String },

    /// `init` failed
    FeatureActivationFailed {
        feature: String,
        url: String,
        error: String,
    },

    /// Feature is inactive again
    FeatureDeactivated { feature: String },

    /// `cleanup` failed
    FeatureCleanupFailed { feature: String, error: String },

    /// A matching feature was silenced by a more specific one
    FeatureExcluded {
        feature: String,
        excluded_by: String,
    },
}

impl EngineEvent {
    /// Feature the event concerns, if any.
    pub fn feature(&self) -> Option<&str> {
        match self {
            Self::FeatureRegistered { feature, .. }
            | Self::FeatureReplaced { feature, .. }
            | Self::FeatureUnregistered { feature }
            | Self::FeatureActivating { feature, .. }
            | Self::FeatureActivated { feature, .. }
            | Self::FeatureActivationFailed { feature, .. }
            | Self::FeatureDeactivated { feature }
            | Self::FeatureCleanupFailed { feature, .. }
            | Self::FeatureExcluded { feature, .. } => Some(feature),
            Self::NavigationDetected { .. } | Self::EvaluationCompleted { .. } => None,
        }
    }
}

/// Event type filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    // Registry events
    FeatureRegistered,
    FeatureReplaced,
    FeatureUnregistered,
    // Navigation events
    NavigationDetected,
    EvaluationCompleted,
    // Lifecycle events
    FeatureActivating,
    FeatureActivated,
    FeatureActivationFailed,
    FeatureDeactivated,
    FeatureCleanupFailed,
    FeatureExcluded,
    // Wildcard
    All,
}

impl From<&EngineEvent> for EventType {
    fn from(event: &EngineEvent) -> Self {
        match event {
            EngineEvent::FeatureRegistered { .. } => EventType::FeatureRegistered,
            EngineEvent::FeatureReplaced { .. } => EventType::FeatureReplaced,
            EngineEvent::FeatureUnregistered { .. } => EventType::FeatureUnregistered,
            EngineEvent::NavigationDetected { .. } => EventType::NavigationDetected,
            EngineEvent::EvaluationCompleted { .. } => EventType::EvaluationCompleted,
            EngineEvent::FeatureActivating { .. } => EventType::FeatureActivating,
            EngineEvent::FeatureActivated { .. } => EventType::FeatureActivated,
            EngineEvent::FeatureActivationFailed { .. } => EventType::FeatureActivationFailed,
            EngineEvent::FeatureDeactivated { .. } => EventType::FeatureDeactivated,
            EngineEvent::FeatureCleanupFailed { .. } => EventType::FeatureCleanupFailed,
            EngineEvent::FeatureExcluded { .. } => EventType::FeatureExcluded,
        }
    }
}

/// A published event with its timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// When the event was published
    pub timestamp: DateTime<Utc>,

    /// The event
    #[serde(flatten)]
    pub event: EngineEvent,
}

impl EventRecord {
    /// Stamp an event with the current time.
    pub fn new(event: EngineEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }

    /// Serialize for an external log collector.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Event handler trait for hosts.
///
/// Handlers are awaited by the publisher, one after another, with no engine
/// or bus lock held. They may call back into the engine and may subscribe or
/// unsubscribe on the bus that is dispatching to them; a subscription change
/// takes effect from the next event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, record: &EventRecord) -> crate::Result<()>;

    /// Get the event types this handler is interested in.
    fn event_types(&self) -> Vec<EventType>;
}

/// Event subscription handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventSubscription {
    id: Uuid,
    subscriber: String,
}

impl EventSubscription {
    /// Create a new subscription.
    pub fn new(subscriber: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscriber: subscriber.to_string(),
        }
    }

    /// Get the subscription ID.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Get the subscriber name.
    pub fn subscriber(&self) -> &str {
        &self.subscriber
    }
}

struct HandlerEntry {
    subscription: EventSubscription,
    handler: Arc<dyn EventHandler>,
    types: Vec<EventType>,
}

/// Event bus for publishing engine events.
pub struct EventBus {
    /// Handlers in subscription order
    handlers: RwLock<Vec<HandlerEntry>>,
    sender: broadcast::Sender<EventRecord>,
}

impl EventBus {
    /// Create a new event bus with the default channel capacity.
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// Create a new event bus with a broadcast channel of `capacity`.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            handlers: RwLock::new(Vec::new()),
            sender,
        }
    }

    /// Subscribe a handler.
    pub async fn subscribe(
        &self,
        subscriber: &str,
        handler: Arc<dyn EventHandler>,
    ) -> EventSubscription {
        let subscription = EventSubscription::new(subscriber);
        let types = handler.event_types();

        self.handlers.write().await.push(HandlerEntry {
            subscription: subscription.clone(),
            handler,
            types,
        });

        subscription
    }

    /// Unsubscribe a handler.
    pub async fn unsubscribe(&self, subscription: &EventSubscription) {
        self.handlers
            .write()
            .await
            .retain(|entry| entry.subscription.id != subscription.id);
    }

    /// Unsubscribe all handlers of a subscriber.
    pub async fn unsubscribe_all(&self, subscriber: &str) {
        self.handlers
            .write()
            .await
            .retain(|entry| entry.subscription.subscriber != subscriber);
    }

    /// A receiver for every event published from now on.
    pub fn receiver(&self) -> broadcast::Receiver<EventRecord> {
        self.sender.subscribe()
    }

    /// Publish an event to the broadcast channel and all matching handlers.
    pub async fn publish(&self, event: EngineEvent) {
        let event_type = EventType::from(&event);
        let record = EventRecord::new(event);

        // No receivers is fine.
        let _ = self.sender.send(record.clone());

        let matching: Vec<(String, Arc<dyn EventHandler>)> = self
            .handlers
            .read()
            .await
            .iter()
            .filter(|entry| entry.types.contains(&EventType::All) || entry.types.contains(&event_type))
            .map(|entry| (entry.subscription.subscriber.clone(), Arc::clone(&entry.handler)))
            .collect();

        for (subscriber, handler) in matching {
            if let Err(e) = handler.handle(&record).await {
                tracing::warn!(subscriber = %subscriber, "Event handler error: {}", e);
            }
        }
    }

    /// Get the number of active subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct TestHandler {
        count: Arc<AtomicU32>,
        event_types: Vec<EventType>,
    }

    #[async_trait]
    impl EventHandler for TestHandler {
        async fn handle(&self, _record: &EventRecord) -> crate::Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn event_types(&self) -> Vec<EventType> {
            self.event_types.clone()
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl EventHandler for FailingHandler {
        async fn handle(&self, _record: &EventRecord) -> crate::Result<()> {
            Err(crate::FeatureError::ConfigError("collector offline".to_string()))
        }

        fn event_types(&self) -> Vec<EventType> {
            vec![EventType::All]
        }
    }

    fn activated(feature: &str) -> EngineEvent {
        EngineEvent::FeatureActivated {
            feature: feature.to_string(),
            url: "https://example.com/cards/1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_event_bus_subscribe_publish() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU32::new(0));

        let handler = Arc::new(TestHandler {
            count: count.clone(),
            event_types: vec![EventType::FeatureActivated],
        });

        let _sub = bus.subscribe("host", handler).await;
        bus.publish(activated("cards")).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_event_bus_filter_types() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU32::new(0));

        let handler = Arc::new(TestHandler {
            count: count.clone(),
            event_types: vec![EventType::FeatureDeactivated],
        });

        let _sub = bus.subscribe("host", handler).await;
        bus.publish(activated("cards")).await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_event_bus_unsubscribe() {
        let bus = EventBus::new();
        let handler = Arc::new(TestHandler {
            count: Arc::new(AtomicU32::new(0)),
            event_types: vec![EventType::All],
        });

        let sub = bus.subscribe("host", handler.clone()).await;
        let _other = bus.subscribe("collector", handler).await;
        assert_eq!(bus.subscription_count().await, 2);

        bus.unsubscribe(&sub).await;
        assert_eq!(bus.subscription_count().await, 1);

        bus.unsubscribe_all("collector").await;
        assert_eq!(bus.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_others() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU32::new(0));

        bus.subscribe("broken", Arc::new(FailingHandler)).await;
        bus.subscribe(
            "host",
            Arc::new(TestHandler {
                count: count.clone(),
                event_types: vec![EventType::All],
            }),
        )
        .await;

        bus.publish(activated("cards")).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    /// Hands its slot to a fresh counting handler on the first event.
    struct HandOffHandler {
        bus: Arc<EventBus>,
        count: Arc<AtomicU32>,
    }

    #[async_trait]
    impl EventHandler for HandOffHandler {
        async fn handle(&self, _record: &EventRecord) -> crate::Result<()> {
            self.bus.unsubscribe_all("hand-off").await;
            self.bus
                .subscribe(
                    "host",
                    Arc::new(TestHandler {
                        count: self.count.clone(),
                        event_types: vec![EventType::All],
                    }),
                )
                .await;
            Ok(())
        }

        fn event_types(&self) -> Vec<EventType> {
            vec![EventType::All]
        }
    }

    #[tokio::test]
    async fn test_handler_can_change_subscriptions() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicU32::new(0));

        bus.subscribe(
            "hand-off",
            Arc::new(HandOffHandler {
                bus: bus.clone(),
                count: count.clone(),
            }),
        )
        .await;

        tokio::time::timeout(std::time::Duration::from_secs(5), bus.publish(activated("cards")))
            .await
            .expect("publish finished");

        // The new handler sees events from the next one on.
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(bus.subscription_count().await, 1);

        bus.publish(activated("boards")).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscription_count().await, 1);
    }

    #[tokio::test]
    async fn test_broadcast_receiver() {
        let bus = EventBus::new();
        let mut rx = bus.receiver();

        bus.publish(activated("cards")).await;

        let record = rx.recv().await.unwrap();
        assert_eq!(record.event, activated("cards"));
        assert_eq!(record.event.feature(), Some("cards"));
    }

    #[test]
    fn test_record_json() {
        let record = EventRecord::new(EngineEvent::FeatureActivationFailed {
            feature: "cards".to_string(),
            url: "https://example.com/cards/1".to_string(),
            error: "boom".to_string(),
        });

        let json: serde_json::Value = serde_json::from_str(&record.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "feature_activation_failed");
        assert_eq!(json["feature"], "cards");
        assert_eq!(json["error"], "boom");
        assert!(json["timestamp"].is_string());
    }
}
