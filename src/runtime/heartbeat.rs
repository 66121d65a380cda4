//! Heartbeat loop: publishes an agent's load on a fixed interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::InFlight;
use crate::broker::{Broker, HEARTBEAT_TOPIC};
use crate::protocol::{AgentId, Envelope, Heartbeat};

pub struct HeartbeatActor {
    broker: Broker,
    agent_id: AgentId,
    in_flight: Arc<InFlight>,
    interval: Duration,
}

impl HeartbeatActor {
    pub(crate) fn new(
        broker: Broker,
        agent_id: AgentId,
        in_flight: Arc<InFlight>,
        interval: Duration,
    ) -> Self {
        Self {
            broker,
            agent_id,
            in_flight,
            interval,
        }
    }

    /// Run until `cancel` fires. A failed publish is logged and skipped;
    /// the next tick tries again.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        debug!(agent = %self.agent_id, interval = ?self.interval, "HeartbeatActor::spawn");

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(agent = %self.agent_id, "HeartbeatActor cancelled");
                        break;
                    }
                    _ = interval.tick() => {
                        let load = self.in_flight.len();
                        let beat = Envelope::Heartbeat(Heartbeat::new(self.agent_id.clone(), load));
                        match self.broker.publish(HEARTBEAT_TOPIC, &beat).await {
                            Ok(_) => trace!(agent = %self.agent_id, load, "heartbeat"),
                            Err(err) => warn!(agent = %self.agent_id, error = %err, "heartbeat not published"),
                        }
                    }
                }
            }
        })
    }
}
