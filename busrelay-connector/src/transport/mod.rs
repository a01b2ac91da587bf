//! Bus transport seam
//!
//! Concrete broker drivers (session negotiation, TLS, stream compression)
//! live behind the `BusTransport` trait; the forwarders only see connect,
//! setup, publish-with-confirms and the ack/nack primitives. An
//! in-process implementation used by tests and the loopback binary is in
//! [`inproc`].

pub mod inproc;

use async_trait::async_trait;
use busrelay_core::Message;
use std::fmt;
use std::net::SocketAddr;

use crate::error::{Error, Result};

/// Initial backoff delay for reconnection
pub const INITIAL_BACKOFF_SECS: u64 = 1;
/// Maximum backoff delay for reconnection
pub const MAX_BACKOFF_SECS: u64 = 30;

/// One broker host, with the transport default port applied when the
/// entry did not carry one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    pub host: String,
    pub port: u16,
}

impl HostSpec {
    /// Parse "host", "host:port" or a bracket-delimited IPv6 literal such
    /// as "[::1]:5671". A bare IPv6 literal without brackets gets the
    /// default port.
    pub fn parse(spec: &str, default_port: u16) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(Error::Transport("Empty host spec".to_string()));
        }

        // Full socket address first: covers "[::1]:5671" and "1.2.3.4:5".
        if let Ok(addr) = spec.parse::<SocketAddr>() {
            return Ok(Self {
                host: addr.ip().to_string(),
                port: addr.port(),
            });
        }

        // Bracketed IPv6 without a port.
        if let Some(inner) = spec.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            return Ok(Self {
                host: inner.to_string(),
                port: default_port,
            });
        }

        // "host:port" — but a bare IPv6 literal contains colons in the host
        // part, so only split when the left side has none.
        if let Some((host, port_str)) = spec.rsplit_once(':') {
            if !host.contains(':') {
                let port = port_str.parse::<u16>().map_err(|_| {
                    Error::Transport(format!("Invalid port in host spec: {spec}"))
                })?;
                return Ok(Self {
                    host: host.to_string(),
                    port,
                });
            }
        }

        Ok(Self {
            host: spec.to_string(),
            port: default_port,
        })
    }

    /// Connectable "host:port" form, bracketing IPv6 hosts.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for HostSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address())
    }
}

/// Cycles through broker hosts, moving on after a bounded number of
/// failed attempts per host.
#[derive(Debug, Clone)]
pub struct HostFailover {
    hosts: Vec<HostSpec>,
    index: usize,
    attempts_per_host: u32,
    attempt: u32,
}

impl HostFailover {
    pub fn new(hosts: Vec<HostSpec>, attempts_per_host: u32) -> Self {
        debug_assert!(!hosts.is_empty());
        Self {
            hosts,
            index: 0,
            attempts_per_host: attempts_per_host.max(1),
            attempt: 0,
        }
    }

    /// Parse a config host list against a default port.
    pub fn from_config(hosts: &[String], default_port: u16, attempts_per_host: u32) -> Result<Self> {
        if hosts.is_empty() {
            return Err(Error::Transport("No broker hosts configured".to_string()));
        }
        let parsed = hosts
            .iter()
            .map(|h| HostSpec::parse(h, default_port))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(parsed, attempts_per_host))
    }

    /// Host to try for the next connect attempt. Each call counts as one
    /// attempt against the current host.
    pub fn next(&mut self) -> HostSpec {
        let host = self.hosts[self.index].clone();
        self.attempt += 1;
        if self.attempt >= self.attempts_per_host {
            self.attempt = 0;
            self.index = (self.index + 1) % self.hosts.len();
        }
        host
    }

    /// Reset the per-host attempt counter after a successful connect.
    pub fn mark_connected(&mut self) {
        self.attempt = 0;
    }
}

/// One outbound publish handed to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub exchange: String,
    pub routing_key: String,
    pub payload: String,
    pub persistent: bool,
    pub ttl_ms: Option<u64>,
}

impl Publish {
    pub fn from_message(exchange: &str, msg: &Message) -> Self {
        Self {
            exchange: exchange.to_string(),
            routing_key: msg.routing_key.clone().unwrap_or_default(),
            payload: msg.payload.clone(),
            persistent: msg.persistent,
            ttl_ms: msg.ttl_ms,
        }
    }
}

/// One inbound delivery; `tag` feeds the ack/nack primitives.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: u64,
    pub message: Message,
}

/// Transport-side primitives the forwarders drive.
///
/// Implementations are expected to surface disconnects as
/// `Error::Transport`; rejection classification happens above this seam.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BusTransport: Send {
    async fn connect(&mut self, host: &HostSpec) -> Result<()>;

    /// Declare the destination resource and bind subscriptions. Called
    /// once per connection, after `connect`.
    async fn setup(&mut self) -> Result<()>;

    async fn publish(&mut self, publish: Publish) -> Result<()>;

    /// Wait for all outstanding publish confirms; returns how many were
    /// confirmed.
    async fn await_confirms(&mut self) -> Result<u64>;

    /// Next pending delivery, or `None` when the queue is idle.
    async fn next_delivery(&mut self) -> Result<Option<Delivery>>;

    async fn ack(&mut self, tag: u64) -> Result<()>;

    async fn nack(&mut self, tag: u64, requeue: bool) -> Result<()>;

    /// Server-advertised in-flight limit, when the transport knows one.
    fn max_in_flight_hint(&self) -> Option<u32> {
        None
    }
}
