//! Liveness tracking from heartbeats.
//!
//! The `LivenessMonitor` records the last heartbeat of every agent and
//! reports agents that have been silent for longer than `stale_after`.
//! Heartbeats only feed this view; they never touch task state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{Broker, HEARTBEAT_TOPIC};
use crate::protocol::{AgentId, Envelope, Heartbeat};

/// Last known health of one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentHealth {
    pub agent_id: AgentId,
    pub last_seen: Instant,
    /// In-flight tasks reported by the last heartbeat.
    pub load: usize,
    pub stale: bool,
}

/// Events emitted when an agent's liveness changes.
#[derive(Debug, Clone, PartialEq)]
pub enum LivenessEvent {
    /// No heartbeat for longer than the threshold.
    AgentStale {
        agent_id: AgentId,
        silent_for: Duration,
    },
    /// A stale agent sent a heartbeat again.
    AgentRecovered { agent_id: AgentId },
}

#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    stale_after: Duration,
    agents: Arc<RwLock<HashMap<AgentId, AgentHealth>>>,
}

impl LivenessMonitor {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            stale_after,
            agents: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Record a heartbeat. Returns a recovery event if the agent was stale.
    pub async fn record(&self, beat: &Heartbeat) -> Option<LivenessEvent> {
        let mut agents = self.agents.write().await;
        let entry = agents
            .entry(beat.agent_id.clone())
            .or_insert_with(|| AgentHealth {
                agent_id: beat.agent_id.clone(),
                last_seen: Instant::now(),
                load: beat.load,
                stale: false,
            });
        let was_stale = entry.stale;
        entry.last_seen = Instant::now();
        entry.load = beat.load;
        entry.stale = false;

        was_stale.then(|| LivenessEvent::AgentRecovered {
            agent_id: beat.agent_id.clone(),
        })
    }

    /// Mark agents silent past the threshold; events only for fresh transitions.
    pub async fn check(&self) -> Vec<LivenessEvent> {
        let now = Instant::now();
        let mut agents = self.agents.write().await;
        let mut events = Vec::new();
        for health in agents.values_mut() {
            let silent_for = now.duration_since(health.last_seen);
            if !health.stale && silent_for > self.stale_after {
                health.stale = true;
                events.push(LivenessEvent::AgentStale {
                    agent_id: health.agent_id.clone(),
                    silent_for,
                });
            }
        }
        events
    }

    pub async fn stale_agents(&self) -> Vec<AgentId> {
        let now = Instant::now();
        let agents = self.agents.read().await;
        let mut stale: Vec<_> = agents
            .values()
            .filter(|h| now.duration_since(h.last_seen) > self.stale_after)
            .map(|h| h.agent_id.clone())
            .collect();
        stale.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        stale
    }

    pub async fn health(&self, agent_id: &AgentId) -> Option<AgentHealth> {
        self.agents.read().await.get(agent_id).cloned()
    }

    /// Consume the heartbeat topic and emit liveness transitions until cancelled.
    pub fn spawn(
        &self,
        broker: &Broker,
        cancel: CancellationToken,
    ) -> (JoinHandle<()>, mpsc::UnboundedReceiver<LivenessEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut beats = broker.subscribe(HEARTBEAT_TOPIC);
        let monitor = self.clone();
        let period = (self.stale_after / 2).max(Duration::from_millis(1));

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    envelope = beats.recv() => match envelope {
                        Some(Envelope::Heartbeat(beat)) => {
                            if let Some(event) = monitor.record(&beat).await {
                                info!(agent = %beat.agent_id, "agent recovered");
                                let _ = tx.send(event);
                            }
                        }
                        Some(_) => {}
                        None => break,
                    },
                    _ = ticker.tick() => {
                        for event in monitor.check().await {
                            if let LivenessEvent::AgentStale { agent_id, silent_for } = &event {
                                warn!(agent = %agent_id, ?silent_for, "agent stale");
                            }
                            let _ = tx.send(event);
                        }
                    }
                }
            }
            debug!("liveness monitor stopped");
        });

        (join, rx)
    }
}
