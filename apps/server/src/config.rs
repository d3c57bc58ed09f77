use std::env;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub backend_base_url: String,
    /// Bearer credential used when a connection does not bring its own.
    pub backend_service_token: Option<String>,
    pub backend_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub pong_timeout: Duration,
    /// `None` disables the ringing-call timer.
    pub ring_timeout: Option<Duration>,
    pub max_message_bytes: usize,
    pub public_ws_url: String,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let port = env::var("WEBRTC_SIGNALING_PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(defaults.bind_addr.port());
        let backend_base_url = env::var("API_BASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .unwrap_or(defaults.backend_base_url);
        let backend_service_token = env::var("API_AUTH_TOKEN")
            .ok()
            .filter(|token| !token.trim().is_empty());
        let ring_timeout = match read_secs("CALL_RING_TIMEOUT_SECS") {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.ring_timeout,
        };

        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            backend_base_url,
            backend_service_token,
            backend_timeout: read_secs("BACKEND_TIMEOUT_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.backend_timeout),
            heartbeat_interval: read_secs("HEARTBEAT_INTERVAL_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            pong_timeout: read_secs("PONG_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.pong_timeout),
            ring_timeout,
            max_message_bytes: env::var("MAX_MESSAGE_BYTES")
                .ok()
                .and_then(|val| val.parse().ok())
                .filter(|bytes| *bytes > 0)
                .unwrap_or(defaults.max_message_bytes),
            public_ws_url: env::var("PUBLIC_WS_URL")
                .ok()
                .map(|url| url.trim().trim_end_matches('/').to_string())
                .filter(|url| !url.is_empty())
                .unwrap_or(defaults.public_ws_url),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080)),
            backend_base_url: "http://localhost:8000".to_string(),
            backend_service_token: None,
            backend_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(5),
            ring_timeout: Some(Duration::from_secs(60)),
            max_message_bytes: 16 * 1024 * 1024,
            public_ws_url: "ws://localhost:8080".to_string(),
        }
    }
}

fn read_secs(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|val| val.trim().parse().ok())
}
