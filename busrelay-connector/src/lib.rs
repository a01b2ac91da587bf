//! Connector half of BusRelay: the bus transport seam, the outbound and
//! inbound forwarders, the presence-based priority arbiter, the local
//! delivery endpoints and the service glue tying them together.

pub mod arbiter;
pub mod endpoint;
pub mod error;
pub mod forwarder;
pub mod reporter;
pub mod service;
pub mod transport;

pub use arbiter::{ArbiterSettings, PresenceEvent, PriorityArbiter};
pub use endpoint::{LineSocketServer, QueueEndpoint, SocketConsumer};
pub use error::{Error, Result};
pub use reporter::StatusReporter;
pub use forwarder::{BusListener, BusPublisher, Consumer, ForwarderState, RejectClassifier, RelayHandle};
pub use service::RelayService;
pub use transport::{BusTransport, Delivery, HostFailover, HostSpec, Publish};
