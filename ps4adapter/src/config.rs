/// Connection settings for a debug session

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::Deserialize;

/// Port the stub serves commands on.
pub const PS4DBG_PORT: u16 = 744;
/// Port the client listens on for debug interrupts.
pub const PS4DBG_DEBUG_PORT: u16 = 755;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DebuggerConfig {
    pub port: u16,
    /// Local address the interrupt channel binds to
    pub interrupt_bind: SocketAddr,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    #[serde(with = "millis")]
    pub recv_timeout: Duration,
    /// Pause between availability checks on the interrupt channel
    #[serde(with = "millis")]
    pub poll_interval: Duration,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            port: PS4DBG_PORT,
            interrupt_bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), PS4DBG_DEBUG_PORT),
            connect_timeout: Duration::from_secs(10),
            recv_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl DebuggerConfig {
    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
