//! Periodic status reporting
//!
//! Samples the relay counters and queue depths on a fixed interval and
//! publishes the snapshot onto the bus through the normal outbound path,
//! so status reports get the same buffering guarantees as any other
//! message.

use busrelay_core::{RetryStore, StatusSnapshot};
use chrono::Utc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::forwarder::RelayHandle;

pub struct StatusReporter {
    node: String,
    resource: String,
    handle: RelayHandle,
    inbound_store: RetryStore,
    interval: Duration,
    cancel: CancellationToken,
}

impl StatusReporter {
    pub fn new(
        node: &str,
        resource: &str,
        handle: RelayHandle,
        inbound_store: RetryStore,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            node: node.to_string(),
            resource: resource.to_string(),
            handle,
            inbound_store,
            interval,
            cancel,
        }
    }

    fn snapshot(&self) -> StatusSnapshot {
        let stats = self.handle.stats();
        let out = self.handle.store().depths();
        let inbound = self.inbound_store.depths();
        StatusSnapshot {
            node: self.node.clone(),
            resource: self.resource.clone(),
            sent: stats.sent(),
            received: stats.received(),
            forwarded: stats.forwarded(),
            queue_depth: self.handle.channel().len() as u64,
            backup_memory: out.buffer_in + out.buffer_out + inbound.buffer_in + inbound.buffer_out,
            backup_disk: out.disk + inbound.disk,
            timestamp: Utc::now(),
        }
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        let payload = match serde_json::to_string(&snapshot) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode status snapshot");
                return;
            }
        };
        let msg = busrelay_core::Message::new(payload)
            .with_routing_key(format!("{}.status", self.node));
        // Bypass the ingress counter: a status report is not relay traffic.
        if let Err(diverted) = self.handle.channel().try_push(msg) {
            self.handle.store().append(diverted);
        }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.publish(),
            }
        }
        debug!("Status reporter stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use busrelay_core::{FlowControlledChannel, Message, RelayStats};
    use std::sync::Arc;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_reporter_publishes_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let out_store = RetryStore::open(dir.path().join("out.db"), "retry_out", 1000, 10)
            .await
            .unwrap();
        let in_store = RetryStore::open(dir.path().join("in.db"), "retry_in", 1000, 10)
            .await
            .unwrap();
        let channel = Arc::new(FlowControlledChannel::new(64));
        let stats = Arc::new(RelayStats::default());
        stats.incr_sent(7);
        stats.incr_received(9);
        let handle = RelayHandle::new(channel.clone(), out_store, stats);
        in_store.append(Message::new("parked"));

        let cancel = CancellationToken::new();
        let reporter = StatusReporter::new(
            "busrelay",
            "host1-abc",
            handle.clone(),
            in_store,
            Duration::from_millis(20),
            cancel.clone(),
        );
        let task = tokio::spawn(reporter.run());

        let msg = timeout(Duration::from_secs(5), async {
            loop {
                if let Some(msg) = channel.pop() {
                    return msg;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(msg.routing_key.as_deref(), Some("busrelay.status"));
        let snapshot: StatusSnapshot = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(snapshot.node, "busrelay");
        assert_eq!(snapshot.resource, "host1-abc");
        assert_eq!(snapshot.sent, 7);
        assert_eq!(snapshot.received, 9);
        assert_eq!(snapshot.backup_memory, 1);

        cancel.cancel();
        task.await.unwrap();
    }
}
