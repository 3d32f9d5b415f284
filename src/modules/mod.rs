//! Supporting services
//!
//! Lifecycle events, NAT port mapping and the relay that lets remote captcha
//! workers reach the web through this host.

pub mod events;
pub mod nat;
pub mod proxy;

// Re-export commonly used types
pub use events::{
    ChallengeEvent, ChallengeStage, ErrorEvent, EventDispatcher, EventHandler, FetchEvent,
    LoggingHandler, PostResponseEvent, PreRequestEvent, RetryEvent,
};
pub use nat::{NatError, NatLease, NatTraversal, PortMapper, PortMapping, Protocol, is_private_ip};
pub use proxy::{PeerPolicy, ProxyRelay, RelayConfig, RelayError};
