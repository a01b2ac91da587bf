//! Core building blocks for the BusRelay connector: message model,
//! configuration, the persistent retry store and the flow-controlled
//! channel that feed the forwarders.

pub mod config;
pub mod error;
pub mod flow;
pub mod logging;
pub mod message;
pub mod stats;
pub mod store;

pub use config::{Config, load_config};
pub use error::{Error, Result};
pub use flow::{FlowControlledChannel, FlowSignal};
pub use message::Message;
pub use stats::{RelayStats, StatusSnapshot};
pub use store::{RetryStore, StoreDepths};
