//! VibeMQ Nano - embedded-style MQTT v3.1.1/v5.0 broker core
//!
//! A fixed pool of work contexts drives the protocol engine over a pipe
//! transport; subscriptions and retained messages live in a topic trie and
//! per-client state in a small set of locked tables.

pub mod broker;
pub mod codec;
pub mod config;
pub mod engine;
pub mod policy;
pub mod protocol;
pub mod registry;
pub mod topic;
pub mod transport;

/// Identifier of one network connection
pub type PipeId = u32;

pub use broker::Broker;
pub use config::Config;
pub use engine::{EngineSettings, ProtocolErrorAction};
pub use policy::{AbortPolicy, CapacityPolicy, RejectPolicy};
pub use protocol::{ProtocolVersion, QoS};
pub use registry::Registry;
pub use topic::SubscriptionTrie;
pub use transport::{Socket, TransportSettings};
