//! Topic pub/sub on gossipsub.
//!
//! Gossipsub handles propagation between nodes. Inside a node, each topic
//! fans out to a bounded number of local subscribers, each with a bounded
//! queue. [`TopicRegistry`] is that fan-out table; it lives inside the swarm
//! task and has no swarm dependencies of its own.

use std::collections::HashMap;

use libp2p::PeerId;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{info, warn};

use crate::config::NetConfig;
use crate::error::NetError;
use crate::service::NetworkHandle;

/// An event delivered to topic subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubsubEvent {
    /// A message published on the topic.
    Message {
        /// Topic the message arrived on.
        topic: String,
        /// Original publisher.
        source: PeerId,
        /// Payload.
        data: Vec<u8>,
    },
    /// A remote peer subscribed to the topic.
    PeerJoined {
        /// The peer that joined.
        peer: PeerId,
    },
}

/// Receiving end of a topic subscription.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    rx: mpsc::Receiver<PubsubEvent>,
}

impl Subscription {
    /// Build a subscription from a raw receiver.
    ///
    /// Used by alternative [`Broadcast`](crate::Broadcast) implementations.
    pub fn new(topic: impl Into<String>, rx: mpsc::Receiver<PubsubEvent>) -> Self {
        Self {
            topic: topic.into(),
            rx,
        }
    }

    /// The subscribed topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next event, in receive order. `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<PubsubEvent> {
        self.rx.recv().await
    }
}

/// Per-node pub/sub limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubsubLimits {
    /// Maximum local subscribers per topic.
    pub max_topic_subscribers: usize,
    /// Queue depth of each subscriber.
    pub subscriber_queue: usize,
}

impl PubsubLimits {
    /// Extract and check the limits from a network config.
    pub fn from_config(config: &NetConfig) -> Result<Self, NetError> {
        if config.max_topic_subscribers == 0 {
            return Err(NetError::Config("max_topic_subscribers must be > 0".into()));
        }
        if config.subscriber_queue == 0 {
            return Err(NetError::Config("subscriber_queue must be > 0".into()));
        }
        Ok(Self {
            max_topic_subscribers: config.max_topic_subscribers,
            subscriber_queue: config.subscriber_queue,
        })
    }
}

/// Local fan-out table: topic → bounded subscriber queues.
#[derive(Debug)]
pub struct TopicRegistry {
    limits: PubsubLimits,
    topics: HashMap<String, Vec<mpsc::Sender<PubsubEvent>>>,
}

impl TopicRegistry {
    /// Create an empty registry.
    pub fn new(limits: PubsubLimits) -> Self {
        Self {
            limits,
            topics: HashMap::new(),
        }
    }

    /// Add a subscriber. Returns the subscription and whether this is the
    /// topic's first subscriber (the caller then joins the gossipsub topic).
    pub fn add(&mut self, topic: &str) -> Result<(Subscription, bool), NetError> {
        let subs = self.topics.entry(topic.to_string()).or_default();
        subs.retain(|tx| !tx.is_closed());
        if subs.len() >= self.limits.max_topic_subscribers {
            return Err(NetError::SubscriberLimit {
                target: topic.to_string(),
                max: self.limits.max_topic_subscribers,
            });
        }
        let first = subs.is_empty();
        let (tx, rx) = mpsc::channel(self.limits.subscriber_queue);
        subs.push(tx);
        Ok((Subscription::new(topic, rx), first))
    }

    /// Drop all local subscribers of `topic`. Returns `true` if there were any.
    pub fn remove_topic(&mut self, topic: &str) -> bool {
        self.topics.remove(topic).is_some()
    }

    /// Fan an event out to every live subscriber of `topic`.
    ///
    /// A full queue drops the event for that subscriber. Closed subscribers
    /// are pruned; if none remain the topic is removed. Returns the number of
    /// subscribers that received the event.
    pub fn deliver(&mut self, topic: &str, event: &PubsubEvent) -> usize {
        let Some(subs) = self.topics.get_mut(topic) else {
            return 0;
        };
        let mut delivered = 0;
        subs.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(%topic, "subscriber queue full, dropping message");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        if subs.is_empty() {
            self.topics.remove(topic);
        }
        delivered
    }

    /// Number of live local subscribers of `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Whether `topic` has a registry entry.
    pub fn has_topic(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    /// Remove every topic, returning their names.
    pub fn drain(&mut self) -> Vec<String> {
        self.topics.drain().map(|(t, _)| t).collect()
    }
}

/// The pub/sub component.
///
/// Starting it enables topic subscriptions on the network service; stopping
/// it leaves every topic and closes all local subscriptions.
pub struct PubSub {
    handle: NetworkHandle,
    running: bool,
}

impl PubSub {
    /// Enable pub/sub with the limits from `config`.
    pub async fn start(handle: NetworkHandle, config: &NetConfig) -> Result<Self, NetError> {
        let limits = PubsubLimits::from_config(config)?;
        handle.enable_pubsub(limits).await?;
        info!(
            max_topic_subscribers = limits.max_topic_subscribers,
            subscriber_queue = limits.subscriber_queue,
            "pub/sub started"
        );
        Ok(Self {
            handle,
            running: true,
        })
    }

    /// The network handle pub/sub runs on.
    pub fn handle(&self) -> &NetworkHandle {
        &self.handle
    }

    /// Leave every topic. Idempotent.
    pub async fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        if let Err(e) = self.handle.disable_pubsub().await {
            warn!(error = %e, "failed to disable pub/sub cleanly");
        }
        info!("pub/sub stopped");
    }
}
