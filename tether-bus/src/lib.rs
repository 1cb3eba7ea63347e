//! Inter-plugin message bus for the Tether plugin kernel.
//!
//! - per-plugin endpoints with one handler per channel
//! - broadcast, fire-and-forget and request/response delivery
//! - a pending-request table with per-request timers
//! - a service registry layered on request/response
//!
//! Handlers run synchronously inside `send`, in send order.

mod bus;
mod envelope;
mod error;
mod service;
mod teardown;

pub use bus::{ChannelHandler, MessageBus, Responder, SendOutcome};
pub use envelope::{Envelope, MessageType, OutgoingMessage};
pub use error::{BusError, HandlerError, Result};
pub use service::{
    service_channel, ServiceDefinition, ServiceProvider, Visibility, SERVICE_CHANNEL_PREFIX,
};
pub use teardown::BusTeardownHook;

use serde::{Deserialize, Serialize};

/// Default wait for a RESPONSE.
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 30_000;

/// Bus settings, read from the `[bus]` config section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub response_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
        }
    }
}
