use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

const DEFAULT_LISTEN_PORT: u16 = 8000;
const DEFAULT_PUBLIC_URL: &str = "http://127.0.0.1:8000";
const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct SignalingServerConfig {
    pub listen_addr: SocketAddr,
    pub public_base_url: String,
    /// Upper bound for a single inbound WebSocket message. Offers with many
    /// candidates stay well below this.
    pub max_message_bytes: usize,
}

impl SignalingServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from `lookup`, falling back per setting when a
    /// value is missing or unparsable.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let listen_port = lookup("SIGNALING_PORT")
            .and_then(|raw| raw.parse::<u16>().ok())
            .unwrap_or(DEFAULT_LISTEN_PORT);

        let listen_addr = lookup("SIGNALING_ADDR")
            .and_then(|raw| raw.parse::<IpAddr>().ok())
            .map(|ip| SocketAddr::new(ip, listen_port))
            .unwrap_or(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), listen_port));

        let public_base_url =
            lookup("SIGNALING_PUBLIC_URL").unwrap_or_else(|| DEFAULT_PUBLIC_URL.to_string());

        let max_message_bytes = lookup("SIGNALING_MAX_MESSAGE_BYTES")
            .and_then(|raw| raw.parse::<usize>().ok())
            .filter(|bytes| *bytes > 0)
            .unwrap_or(DEFAULT_MAX_MESSAGE_BYTES);

        Ok(Self {
            listen_addr,
            public_base_url,
            max_message_bytes,
        })
    }

    /// Configuration bound to loopback on an OS-assigned port.
    pub fn ephemeral() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            ..Self::fallback()
        }
    }

    fn fallback() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_LISTEN_PORT),
            public_base_url: DEFAULT_PUBLIC_URL.to_string(),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl Default for SignalingServerConfig {
    fn default() -> Self {
        Self::from_env().unwrap_or_else(|_| Self::fallback())
    }
}
