mod config;
mod instance;
mod peer;
mod secrets;
mod session;
mod store;
mod transport;
mod wire;

pub use config::{ConfigError, DiscoveryConfig, TrackerAddr};
pub use instance::{Discovery, DiscoveryError, DiscoveryEvent, EventRx};
pub use peer::{Peer, Topic};
pub use transport::TransportError;
