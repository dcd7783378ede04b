use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_DOMAIN: &str = "dns-discovery.local";
pub const DEFAULT_PORT: u16 = 53;
pub const DEFAULT_SECONDARY_PORT: u16 = 5300;
pub const DEFAULT_LIMIT: usize = 10_000;
pub const DEFAULT_SUBSCRIBER_TTL: Duration = Duration::from_secs(60);

#[derive(thiserror::Error, Debug, Clone)]
pub enum ConfigError {

    #[error("invalid tracker address: {0}")]
    InvalidTracker(String),

}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {

    // Suffix appended to every topic name on the wire.
    pub domain: String,

    // Authoritative discovery servers reached over unicast.
    pub trackers: Vec<TrackerAddr>,

    // Whether to also discover on the local link via mDNS.
    pub multicast: bool,

    // Send announce/unannounce ports as "0", telling trackers to use
    // the observed UDP source port instead.
    pub implied_port: bool,

    // Peer expiry for the main store. None keeps peers forever.
    pub ttl: Option<Duration>,

    // Maximum total peers across all topics, 0 for unbounded.
    pub limit: usize,

    pub subscriber_ttl: Duration,

    pub subscriber_limit: usize,

    // Resends per query before a leg gives up.
    pub retries: u32,

}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            domain: DEFAULT_DOMAIN.to_string(),
            trackers: Vec::new(),
            multicast: true,
            implied_port: false,
            ttl: None,
            limit: DEFAULT_LIMIT,
            subscriber_ttl: DEFAULT_SUBSCRIBER_TTL,
            subscriber_limit: DEFAULT_LIMIT,
            retries: 2,
        }
    }
}

impl DiscoveryConfig {
    // Record ttl used on answers and pushes, in whole seconds.
    pub fn record_ttl(&self) -> u32 {
        self.ttl.map(|t| t.as_secs() as u32).unwrap_or(0)
    }
}

// A tracker endpoint, parsed from "host[:port[,secondaryPort]]".
// Most trackers listen on both ports so clients behind port-53 filters
// still get through; the probe keeps whichever answers first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerAddr {

    pub host: String,

    pub port: u16,

    // 0 when the tracker has a single port.
    pub secondary_port: u16,

}

impl FromStr for TrackerAddr {

    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let invalid = || ConfigError::InvalidTracker(s.to_string());

        let (host, ports) = match raw.split_once(':') {
            Some((host, ports)) => (host, Some(ports)),
            None => (raw, None),
        };
        if host.is_empty() {
            return Err(invalid());
        }

        let (port, secondary_port) = match ports {
            None => (DEFAULT_PORT, DEFAULT_SECONDARY_PORT),
            Some(ports) => {
                let (primary, secondary) = match ports.split_once(',') {
                    Some((primary, secondary)) => (primary, Some(secondary)),
                    None => (ports, None),
                };
                let port = primary.parse().map_err(|_| invalid())?;
                let secondary_port = match secondary {
                    None => DEFAULT_SECONDARY_PORT,
                    Some(secondary) => secondary.parse().map_err(|_| invalid())?,
                };
                (port, secondary_port)
            }
        };

        Ok(TrackerAddr { host: host.to_string(), port, secondary_port })
    }
}
