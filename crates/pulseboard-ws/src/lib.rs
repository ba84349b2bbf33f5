//! Reconnecting, topic-addressed WebSocket transport for the pulseboard
//! dashboard.
//!
//! Provides resilient delivery of server-pushed events over a long-lived
//! full-duplex connection:
//! - Automatic reconnection with exponential backoff and an attempt ceiling
//! - FIFO buffering of messages sent while disconnected, flushed on reconnect
//! - Topic subscription tracking with full replay after every reconnection
//! - Typed in-process event fan-out with per-handler error isolation
//!
//! Delivery is best-effort: nothing is guaranteed across a reconnect
//! boundary. Credential refresh and multi-tab coordination live elsewhere.

pub mod backoff;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod events;
pub mod queue;
pub mod subscription;

pub use backoff::ReconnectPolicy;
pub use connection::{
    ClientConfig, ClientStatus, ConnectionState, CredentialProvider, StaticToken,
    SubscriptionHandle, TopicSubscription, WsClient,
};
pub use envelope::Envelope;
pub use error::{WsError, WsResult};
pub use events::{BoxError, EventBus, EventKind, HandlerId, TransportEvent};
pub use queue::OutboundQueue;
pub use subscription::SubscriptionRegistry;
