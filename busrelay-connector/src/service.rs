//! Service assembly
//!
//! Wires the stores, the flow-controlled channel, both forwarders, the
//! priority arbiter and the status reporter into one running relay, and
//! owns their shutdown order: cancel everything, join the tasks, then
//! flush both stores so nothing in the memory buffers is lost.

use anyhow::Context;
use busrelay_core::{Config, FlowControlledChannel, Message, RelayStats, RetryStore};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::arbiter::{ArbiterSettings, PresenceEvent, PriorityArbiter};
use crate::forwarder::{BusListener, BusPublisher, Consumer, RejectClassifier, RelayHandle};
use crate::reporter::StatusReporter;
use crate::transport::BusTransport;

/// Table names for the two relay directions, sharing one database file
const OUTBOUND_TABLE: &str = "retry_out";
const INBOUND_TABLE: &str = "retry_in";

/// A fully wired relay instance
pub struct RelayService {
    handle: RelayHandle,
    presence_tx: mpsc::Sender<PresenceEvent>,
    priority_rx: watch::Receiver<i32>,
    classifier: Arc<RwLock<RejectClassifier>>,
    out_store: RetryStore,
    in_store: RetryStore,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayService {
    /// Open the stores and spawn every relay task. The returned service
    /// owns them until [`shutdown`](Self::shutdown).
    pub async fn start<P, L, C>(
        config: &Config,
        resource: &str,
        publisher_transport: P,
        listener_transport: L,
        consumer: C,
    ) -> anyhow::Result<Self>
    where
        P: BusTransport + 'static,
        L: BusTransport + 'static,
        C: Consumer + 'static,
    {
        // Library callers may not have gone through the binary's startup
        // checks; bad settings must fail here, not panic downstream.
        config
            .validate()
            .map_err(|errors| anyhow::anyhow!("Invalid configuration: {}", errors.join("; ")))?;

        let out_store = RetryStore::open(
            &config.store.path,
            OUTBOUND_TABLE,
            config.store.flush_threshold,
            config.store.refill_factor,
        )
        .await
        .with_context(|| format!("Failed to open retry store at {}", config.store.path))?;
        let in_store = RetryStore::open(
            &config.store.path,
            INBOUND_TABLE,
            config.store.flush_threshold,
            config.store.refill_factor,
        )
        .await
        .with_context(|| format!("Failed to open retry store at {}", config.store.path))?;

        let channel = Arc::new(FlowControlledChannel::new(config.relay.max_queue_size));
        let stats = Arc::new(RelayStats::default());
        let handle = RelayHandle::new(channel.clone(), out_store.clone(), stats.clone());
        let classifier = Arc::new(RwLock::new(RejectClassifier::new(
            &config.relay.reject_patterns,
        )));
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let publisher = BusPublisher::new(
            publisher_transport,
            &config.bus,
            &config.relay,
            handle.clone(),
            classifier.clone(),
            cancel.child_token(),
        )?;
        tasks.push(tokio::spawn(publisher.run()));

        let listener = BusListener::new(
            listener_transport,
            &config.bus,
            &config.relay,
            consumer,
            stats.clone(),
            classifier.clone(),
            cancel.child_token(),
        )?;
        tasks.push(tokio::spawn(listener.run()));

        let mut arbiter = PriorityArbiter::new(
            resource,
            ArbiterSettings::from(&config.arbiter),
            channel.subscribe(),
            cancel.child_token(),
        );
        let presence_tx = arbiter.event_sender();
        let priority_rx = arbiter.priority_watch();
        if let Some(announcements) = arbiter.take_announcements() {
            tasks.push(tokio::spawn(announce_loop(
                announcements,
                handle.clone(),
                config.node.name.clone(),
            )));
        }
        tasks.push(tokio::spawn(arbiter.run()));

        let reporter = StatusReporter::new(
            &config.node.name,
            resource,
            handle.clone(),
            in_store.clone(),
            Duration::from_secs(config.relay.status_interval_secs),
            cancel.child_token(),
        );
        tasks.push(tokio::spawn(reporter.run()));

        info!(
            node = %config.node.name,
            resource,
            exchange = %config.bus.exchange,
            "Relay service started"
        );

        Ok(Self {
            handle,
            presence_tx,
            priority_rx,
            classifier,
            out_store,
            in_store,
            cancel,
            tasks,
        })
    }

    /// Producer-facing handle for local ingress
    pub fn ingress(&self) -> RelayHandle {
        self.handle.clone()
    }

    /// Feed for presence events decoded off the bus
    pub fn presence_sender(&self) -> mpsc::Sender<PresenceEvent> {
        self.presence_tx.clone()
    }

    /// Watch over this instance's arbitrated priority
    pub fn priority(&self) -> watch::Receiver<i32> {
        self.priority_rx.clone()
    }

    /// Apply the reloadable parts of a new configuration. Anything that
    /// would need a restart is left untouched.
    pub fn reload(&self, config: &Config) -> Result<(), Vec<String>> {
        config.validate()?;
        *self.classifier.write() = RejectClassifier::new(&config.relay.reject_patterns);
        info!(
            patterns = config.relay.reject_patterns.len(),
            "Reject patterns reloaded"
        );
        Ok(())
    }

    /// Stop every task and flush both stores to disk.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        info!("Relay service stopping");
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Relay task panicked during shutdown");
            }
        }
        self.out_store
            .flush()
            .await
            .context("Failed to flush outbound retry store")?;
        self.in_store
            .flush()
            .await
            .context("Failed to flush inbound retry store")?;
        info!("Relay service stopped");
        Ok(())
    }
}

/// Publish arbiter announcements as presence messages on the bus,
/// bypassing the ingress counter.
async fn announce_loop(
    mut announcements: mpsc::UnboundedReceiver<PresenceEvent>,
    handle: RelayHandle,
    node: String,
) {
    while let Some(event) = announcements.recv().await {
        match serde_json::to_string(&event) {
            Ok(payload) => {
                let msg = Message::new(payload).with_routing_key(format!("{node}.presence"));
                if let Err(diverted) = handle.channel().try_push(msg) {
                    handle.store().append(diverted);
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode presence event"),
        }
    }
}
