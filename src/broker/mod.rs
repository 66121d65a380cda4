//! In-process pub/sub broker with at-least-once delivery and a dedup window.
//!
//! A [`Broker`] is a cheap-clone handle to one isolated instance; there is no
//! global broker. Envelopes travel as JSON frames so the wire schema is
//! exercised end to end. Each [`Subscription`] suppresses redeliveries of a
//! `message_id` it has already handed out within the dedup TTL.
//!
//! Within one topic, fresh deliveries arrive in publish order. Nothing is
//! promised across topics.

mod dedup;

pub use dedup::TtlSet;

use futures::Stream;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use crate::protocol::{AgentId, Envelope, MessageId};
use crate::runtime::RetryPolicy;

/// Topic every runtime publishes heartbeats to.
pub const HEARTBEAT_TOPIC: &str = "a2a.heartbeats";

const MEM_SCHEME: &str = "mem://";

/// Inbox topic of an agent.
pub fn agent_topic(agent: &AgentId) -> String {
    format!("agent.{}", agent)
}

/// Acknowledgement for a successful publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Delivered { subscribers: usize },
    NoSubscribers,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub published: u64,
    pub delivered: u64,
    pub duplicates_suppressed: u64,
    pub dropped_frames: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    duplicates_suppressed: AtomicU64,
    dropped_frames: AtomicU64,
}

struct Inner {
    endpoint: String,
    dedup_ttl: Duration,
    dedup_capacity: usize,
    topics: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<String>>>>,
    available: AtomicBool,
    duplicate_budget: AtomicUsize,
    // Shared with subscriptions, which must not keep the senders alive.
    counters: Arc<Counters>,
}

#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("endpoint", &self.inner.endpoint)
            .finish()
    }
}

impl Broker {
    /// Open the broker named by `config.endpoint`.
    pub fn connect(config: &BrokerConfig) -> Result<Self> {
        if !config.endpoint.starts_with(MEM_SCHEME) {
            return Err(Error::Config(format!(
                "unsupported broker endpoint {:?}; only {}<name> is served in-process",
                config.endpoint, MEM_SCHEME
            )));
        }
        debug!(endpoint = %config.endpoint, "broker connected");
        Ok(Self::build(config))
    }

    /// A fresh isolated instance with default settings.
    pub fn in_memory() -> Self {
        Self::build(&BrokerConfig::default())
    }

    fn build(config: &BrokerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                endpoint: config.endpoint.clone(),
                dedup_ttl: config.dedup_ttl(),
                dedup_capacity: config.dedup_capacity.max(1),
                topics: RwLock::new(HashMap::new()),
                available: AtomicBool::new(true),
                duplicate_budget: AtomicUsize::new(0),
                counters: Arc::new(Counters::default()),
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Publish one envelope to every current subscriber of `topic`.
    ///
    /// Fails fast with a transient error while the transport is unavailable.
    pub async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<Ack> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(Error::TransportUnavailable(self.inner.endpoint.clone()));
        }
        let frame = envelope.to_json()?;
        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);

        let redeliver = self
            .inner
            .duplicate_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let copies = if redeliver { 2 } else { 1 };

        let mut topics = self
            .inner
            .topics
            .write()
            .unwrap_or_else(|p| p.into_inner());
        let Some(senders) = topics.get_mut(topic) else {
            trace!(topic, kind = envelope.kind(), "publish: no subscribers");
            return Ok(Ack::NoSubscribers);
        };
        senders.retain(|tx| !tx.is_closed());

        let mut subscribers = 0;
        for tx in senders.iter() {
            let mut sent = false;
            for _ in 0..copies {
                sent |= tx.send(frame.clone()).is_ok();
            }
            if sent {
                subscribers += 1;
                self.inner
                    .counters
                    .delivered
                    .fetch_add(copies as u64, Ordering::Relaxed);
            }
        }
        trace!(
            topic,
            kind = envelope.kind(),
            message_id = %envelope.message_id(),
            subscribers,
            redeliver,
            "published"
        );

        if subscribers == 0 {
            Ok(Ack::NoSubscribers)
        } else {
            Ok(Ack::Delivered { subscribers })
        }
    }

    /// Publish, backing off on retryable failures per `policy`.
    pub async fn publish_with_retry(
        &self,
        topic: &str,
        envelope: &Envelope,
        policy: &RetryPolicy,
    ) -> Result<Ack> {
        let mut retries = 0;
        loop {
            match self.publish(topic, envelope).await {
                Ok(ack) => return Ok(ack),
                Err(err) if policy.should_retry(err.kind(), retries) => {
                    let delay = policy.delay(retries);
                    warn!(topic, retries, ?delay, error = %err, "publish failed, backing off");
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn subscribe(&self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .topics
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        debug!(topic, "subscribed");
        Subscription {
            topic: topic.to_string(),
            rx,
            seen: TtlSet::new(self.inner.dedup_ttl, self.inner.dedup_capacity),
            counters: Arc::clone(&self.inner.counters),
        }
    }

    /// Simulate a transport outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
        debug!(available, "broker availability changed");
    }

    /// Deliver each of the next `n` published envelopes twice.
    pub fn duplicate_next(&self, n: usize) {
        self.inner.duplicate_budget.store(n, Ordering::SeqCst);
    }

    pub fn stats(&self) -> BrokerStats {
        let c = &self.inner.counters;
        BrokerStats {
            published: c.published.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            duplicates_suppressed: c.duplicates_suppressed.load(Ordering::Relaxed),
            dropped_frames: c.dropped_frames.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    fn inject_raw(&self, topic: &str, frame: &str) {
        if let Some(senders) = self.inner.topics.read().unwrap().get(topic) {
            for tx in senders {
                let _ = tx.send(frame.to_string());
            }
        }
    }
}

/// Receiving end of one topic subscription.
pub struct Subscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<String>,
    seen: TtlSet<MessageId>,
    counters: Arc<Counters>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next fresh envelope. `None` once every broker handle is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            let frame = self.rx.recv().await?;
            let envelope = match Envelope::from_json(&frame) {
                Ok(envelope) => envelope,
                Err(err) => {
                    self.counters.dropped_frames.fetch_add(1, Ordering::Relaxed);
                    warn!(topic = %self.topic, error = %err, "dropping undecodable frame");
                    continue;
                }
            };
            if !self.seen.insert(envelope.message_id()) {
                self.counters
                    .duplicates_suppressed
                    .fetch_add(1, Ordering::Relaxed);
                debug!(
                    topic = %self.topic,
                    message_id = %envelope.message_id(),
                    "duplicate suppressed"
                );
                continue;
            }
            return Some(envelope);
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Envelope> {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|envelope| (envelope, sub))
        })
    }
}
