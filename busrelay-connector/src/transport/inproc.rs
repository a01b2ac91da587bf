//! In-process bus transport
//!
//! A loopback broker holding queues in memory, used by the integration
//! tests and the standalone binary. It models the parts of a real broker
//! the forwarders care about: topic bindings, publish confirms, delivery
//! tags with ack/nack, and an outage switch that makes every operation
//! fail until flipped back.

use async_trait::async_trait;
use busrelay_core::Message;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::transport::{BusTransport, Delivery, HostSpec, Publish};

#[derive(Default)]
struct BrokerState {
    down: bool,
    queues: HashMap<String, VecDeque<Message>>,
    bindings: Vec<(String, String)>,
    reject_pattern: Option<String>,
}

impl BrokerState {
    fn route(&mut self, routing_key: &str, msg: Message) {
        let targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|(pattern, _)| pattern_matches(pattern, routing_key))
            .map(|(_, queue)| queue.clone())
            .collect();
        for queue in targets {
            if let Some(slot) = self.queues.get_mut(&queue) {
                slot.push_back(msg.clone());
            }
        }
    }
}

/// Topic pattern match: `#` matches everything, `prefix.#` matches by
/// prefix, anything else matches exactly.
fn pattern_matches(pattern: &str, routing_key: &str) -> bool {
    if pattern == "#" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".#") {
        return routing_key == prefix || routing_key.starts_with(&format!("{prefix}."));
    }
    pattern == routing_key
}

/// Shared loopback broker; clone it to hand the same broker to several
/// transports.
#[derive(Clone, Default)]
pub struct InProcBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InProcBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a queue and bind it to a routing pattern.
    pub fn bind(&self, queue: &str, pattern: &str) {
        let mut state = self.state.lock();
        state.queues.entry(queue.to_string()).or_default();
        state
            .bindings
            .push((pattern.to_string(), queue.to_string()));
    }

    /// Simulate a broker outage. While down every transport operation
    /// fails; queued messages survive.
    pub fn set_down(&self, down: bool) {
        self.state.lock().down = down;
    }

    /// Publishes whose payload contains this substring are refused with
    /// the substring in the error text.
    pub fn set_reject_pattern(&self, pattern: Option<&str>) {
        self.state.lock().reject_pattern = pattern.map(str::to_string);
    }

    /// Inject a message straight into a queue, bypassing routing.
    pub fn push(&self, queue: &str, msg: Message) {
        self.state
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(msg);
    }

    /// Snapshot of a queue's contents, oldest first.
    pub fn queue_messages(&self, queue: &str) -> Vec<Message> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.state.lock().queues.get(queue).map_or(0, VecDeque::len)
    }
}

/// One transport session against an [`InProcBroker`].
pub struct InProcTransport {
    broker: InProcBroker,
    consume_queue: Option<String>,
    connected: bool,
    unconfirmed: u64,
    next_tag: u64,
    unacked: HashMap<u64, Message>,
    in_flight_hint: Option<u32>,
}

impl InProcTransport {
    /// A publish-only session.
    pub fn publisher(broker: InProcBroker) -> Self {
        Self {
            broker,
            consume_queue: None,
            connected: false,
            unconfirmed: 0,
            next_tag: 0,
            unacked: HashMap::new(),
            in_flight_hint: Some(64),
        }
    }

    /// A consuming session draining the named queue.
    pub fn consumer(broker: InProcBroker, queue: &str) -> Self {
        Self {
            consume_queue: Some(queue.to_string()),
            ..Self::publisher(broker)
        }
    }

    fn ensure_up(&self) -> Result<()> {
        if !self.connected {
            return Err(Error::Transport("Not connected".to_string()));
        }
        if self.broker.state.lock().down {
            return Err(Error::Transport("Broker unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BusTransport for InProcTransport {
    async fn connect(&mut self, host: &HostSpec) -> Result<()> {
        if self.broker.state.lock().down {
            return Err(Error::Transport(format!(
                "Connection refused by {host}"
            )));
        }
        self.connected = true;
        Ok(())
    }

    async fn setup(&mut self) -> Result<()> {
        self.ensure_up()?;
        if let Some(queue) = &self.consume_queue {
            self.broker
                .state
                .lock()
                .queues
                .entry(queue.clone())
                .or_default();
        }
        Ok(())
    }

    async fn publish(&mut self, publish: Publish) -> Result<()> {
        self.ensure_up()?;
        let mut state = self.broker.state.lock();
        if let Some(pattern) = &state.reject_pattern {
            if publish.payload.contains(pattern.as_str()) {
                return Err(Error::Transport(format!(
                    "Publish refused: {pattern}"
                )));
            }
        }
        let msg = Message {
            payload: publish.payload,
            routing_key: Some(publish.routing_key.clone()),
            persistent: publish.persistent,
            ttl_ms: publish.ttl_ms,
            kind: None,
        };
        state.route(&publish.routing_key, msg);
        drop(state);
        self.unconfirmed += 1;
        Ok(())
    }

    async fn await_confirms(&mut self) -> Result<u64> {
        self.ensure_up()?;
        let confirmed = self.unconfirmed;
        self.unconfirmed = 0;
        Ok(confirmed)
    }

    async fn next_delivery(&mut self) -> Result<Option<Delivery>> {
        self.ensure_up()?;
        let queue = match &self.consume_queue {
            Some(queue) => queue.clone(),
            None => return Ok(None),
        };
        let msg = self
            .broker
            .state
            .lock()
            .queues
            .get_mut(&queue)
            .and_then(VecDeque::pop_front);
        match msg {
            Some(message) => {
                self.next_tag += 1;
                let tag = self.next_tag;
                self.unacked.insert(tag, message.clone());
                Ok(Some(Delivery { tag, message }))
            }
            None => Ok(None),
        }
    }

    async fn ack(&mut self, tag: u64) -> Result<()> {
        self.ensure_up()?;
        self.unacked.remove(&tag);
        Ok(())
    }

    async fn nack(&mut self, tag: u64, requeue: bool) -> Result<()> {
        self.ensure_up()?;
        if let Some(msg) = self.unacked.remove(&tag) {
            if requeue {
                if let Some(queue) = &self.consume_queue {
                    if let Some(slot) = self.broker.state.lock().queues.get_mut(queue) {
                        slot.push_front(msg);
                    }
                }
            }
        }
        Ok(())
    }

    fn max_in_flight_hint(&self) -> Option<u32> {
        self.in_flight_hint
    }
}
