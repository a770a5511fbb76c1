//! Relay configuration loaded from environment variables

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Tunables for the relay. All limits are per connection unless noted.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address for the HTTP/WebSocket listener
    pub http_addr: SocketAddr,
    /// Address for the newline-delimited TCP listener (None = disabled)
    pub tcp_addr: Option<SocketAddr>,
    /// Capacity of each connection's outbound queue
    pub queue_capacity: usize,
    /// Upper bound on a single transport write
    pub write_timeout: Duration,
    /// Upper bound on flushing queued frames after close
    pub drain_timeout: Duration,
    /// How often the writer pings the peer
    pub ping_interval: Duration,
    /// Close peers that send nothing for this long
    pub idle_timeout: Duration,
    /// Largest accepted inbound frame in bytes
    pub max_frame_bytes: usize,
    /// Protocol errors tolerated before the connection is dropped
    pub max_protocol_errors: u32,
    /// Longest accepted room name in characters
    pub max_room_name: usize,
    /// Rooms clients may join (None = any room)
    pub allowed_rooms: Option<Vec<String>>,
    /// Cadence of the background stats reporter
    pub stats_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080),
            tcp_addr: None,
            queue_capacity: 64,
            write_timeout: Duration::from_millis(5000),
            drain_timeout: Duration::from_millis(2000),
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            max_frame_bytes: 64 * 1024,
            max_protocol_errors: 5,
            max_room_name: 64,
            allowed_rooms: None,
            stats_interval: Duration::from_secs(15),
        }
    }
}

const INBOUND_SLACK: usize = 4;

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl RelayConfig {
    /// Load config from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let bind: IpAddr = env_parse("RELAY_BIND").unwrap_or(defaults.http_addr.ip());
        let port: u16 = env_parse("PORT").unwrap_or(defaults.http_addr.port());
        let tcp_addr = env_parse::<u16>("RELAY_TCP_PORT").map(|p| SocketAddr::new(bind, p));

        let allowed_rooms = std::env::var("RELAY_ALLOWED_ROOMS")
            .ok()
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|rooms| !rooms.is_empty());

        let config = Self {
            http_addr: SocketAddr::new(bind, port),
            tcp_addr,
            queue_capacity: env_parse::<usize>("RELAY_QUEUE_CAPACITY")
                .filter(|&n| n > 0)
                .unwrap_or(defaults.queue_capacity),
            write_timeout: env_parse("RELAY_WRITE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.write_timeout),
            drain_timeout: env_parse("RELAY_DRAIN_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.drain_timeout),
            ping_interval: env_parse::<u64>("RELAY_PING_INTERVAL_SECS")
                .filter(|&n| n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.ping_interval),
            idle_timeout: env_parse::<u64>("RELAY_IDLE_TIMEOUT_SECS")
                .filter(|&n| n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
            max_frame_bytes: env_parse("RELAY_MAX_FRAME_BYTES").unwrap_or(defaults.max_frame_bytes),
            max_protocol_errors: env_parse("RELAY_MAX_PROTOCOL_ERRORS")
                .unwrap_or(defaults.max_protocol_errors),
            max_room_name: env_parse("RELAY_MAX_ROOM_NAME").unwrap_or(defaults.max_room_name),
            allowed_rooms,
            stats_interval: env_parse::<u64>("RELAY_STATS_INTERVAL_SECS")
                .filter(|&n| n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.stats_interval),
        };

        tracing::info!(
            http_addr = %config.http_addr,
            tcp_addr = ?config.tcp_addr,
            queue_capacity = config.queue_capacity,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            room_allowlist = config.allowed_rooms.is_some(),
            "Relay config loaded"
        );

        config
    }

    /// Hard cap on what a transport buffers for one inbound frame.
    ///
    /// Frames between `max_frame_bytes` and this cap still get a
    /// `FRAME_TOO_LARGE` reply; past it the transport drops the connection.
    pub fn inbound_limit(&self) -> usize {
        self.max_frame_bytes.saturating_mul(INBOUND_SLACK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: &[&str] = &[
        "PORT",
        "RELAY_BIND",
        "RELAY_TCP_PORT",
        "RELAY_QUEUE_CAPACITY",
        "RELAY_WRITE_TIMEOUT_MS",
        "RELAY_ALLOWED_ROOMS",
        "RELAY_PING_INTERVAL_SECS",
    ];

    fn clear_env() {
        for key in KEYS {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_when_env_empty() {
        clear_env();
        let config = RelayConfig::from_env();
        assert_eq!(config.http_addr.port(), 8080);
        assert!(config.tcp_addr.is_none());
        assert_eq!(config.queue_capacity, 64);
        assert!(config.allowed_rooms.is_none());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var("PORT", "9001");
        std::env::set_var("RELAY_BIND", "127.0.0.1");
        std::env::set_var("RELAY_TCP_PORT", "9002");
        std::env::set_var("RELAY_QUEUE_CAPACITY", "8");
        std::env::set_var("RELAY_WRITE_TIMEOUT_MS", "250");
        std::env::set_var("RELAY_ALLOWED_ROOMS", "general, random,,");

        let config = RelayConfig::from_env();
        assert_eq!(config.http_addr, "127.0.0.1:9001".parse().unwrap());
        assert_eq!(config.tcp_addr, Some("127.0.0.1:9002".parse().unwrap()));
        assert_eq!(config.queue_capacity, 8);
        assert_eq!(config.write_timeout, Duration::from_millis(250));
        assert_eq!(
            config.allowed_rooms,
            Some(vec!["general".to_string(), "random".to_string()])
        );
        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_values_fall_back() {
        clear_env();
        std::env::set_var("RELAY_QUEUE_CAPACITY", "0");
        std::env::set_var("RELAY_PING_INTERVAL_SECS", "soon");
        std::env::set_var("RELAY_ALLOWED_ROOMS", " , ");

        let config = RelayConfig::from_env();
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.ping_interval, Duration::from_secs(30));
        assert!(config.allowed_rooms.is_none());
        clear_env();
    }

    #[test]
    fn test_inbound_limit_scales_frame_limit() {
        let config = RelayConfig {
            max_frame_bytes: 1024,
            ..RelayConfig::default()
        };
        assert_eq!(config.inbound_limit(), 4096);

        let config = RelayConfig {
            max_frame_bytes: usize::MAX,
            ..RelayConfig::default()
        };
        assert_eq!(config.inbound_limit(), usize::MAX);
    }
}
