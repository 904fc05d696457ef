//! Conference service configuration.
//!
//! Configuration is loaded from environment variables. Sensitive fields are
//! redacted in Debug output.

use crate::media::TransportOptions;
use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use thiserror::Error;

/// Default WebSocket signaling bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:3004";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default lower bound of the engine's RTC port range.
pub const DEFAULT_RTC_MIN_PORT: u16 = 10000;

/// Default upper bound of the engine's RTC port range.
pub const DEFAULT_RTC_MAX_PORT: u16 = 10100;

/// Default transport listen IP.
pub const DEFAULT_LISTEN_IP: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// Default IP advertised in ICE candidates.
pub const DEFAULT_ANNOUNCED_IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Default initial available outgoing bitrate (bps).
pub const DEFAULT_INITIAL_OUTGOING_BITRATE: u32 = 1_000_000;

/// Default per-connection outbound message buffer.
pub const DEFAULT_OUTBOUND_QUEUE_SIZE: usize = 256;

/// Default maximum chat message length in bytes.
pub const DEFAULT_MAX_CHAT_LENGTH: usize = 4096;

/// Default instance ID prefix.
pub const DEFAULT_INSTANCE_ID_PREFIX: &str = "cs";

/// Conference service configuration.
#[derive(Clone)]
pub struct Config {
    /// Redis URL for the presence backend. `None` selects in-memory presence.
    /// Protected by `SecretString` since it may embed credentials.
    pub redis_url: Option<SecretString>,

    /// WebSocket signaling bind address (default: "0.0.0.0:3004").
    pub signaling_bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Unique identifier for this instance, attached to startup logs.
    pub instance_id: String,

    pub rtc_min_port: u16,
    pub rtc_max_port: u16,

    /// IP the engine binds transports on.
    pub listen_ip: IpAddr,

    /// IP advertised to clients in ICE candidates.
    pub announced_ip: IpAddr,

    pub initial_outgoing_bitrate: u32,

    /// Outbound frames buffered per connection before events are dropped.
    pub outbound_queue_size: usize,

    /// Maximum chat content length in bytes.
    pub max_chat_length: usize,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("redis_url", &self.redis_url.as_ref().map(|_| "[REDACTED]"))
            .field("signaling_bind_address", &self.signaling_bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("instance_id", &self.instance_id)
            .field("rtc_min_port", &self.rtc_min_port)
            .field("rtc_max_port", &self.rtc_max_port)
            .field("listen_ip", &self.listen_ip)
            .field("announced_ip", &self.announced_ip)
            .field("initial_outgoing_bitrate", &self.initial_outgoing_bitrate)
            .field("outbound_queue_size", &self.outbound_queue_size)
            .field("max_chat_length", &self.max_chat_length)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let redis_url = vars
            .get("REDIS_URL")
            .filter(|url| !url.trim().is_empty())
            .map(|url| SecretString::from(url.clone()));

        let signaling_bind_address = vars
            .get("CS_SIGNALING_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("CS_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let rtc_min_port = parse_var(vars, "CS_RTC_MIN_PORT", DEFAULT_RTC_MIN_PORT)?;
        let rtc_max_port = parse_var(vars, "CS_RTC_MAX_PORT", DEFAULT_RTC_MAX_PORT)?;
        if rtc_min_port > rtc_max_port {
            return Err(ConfigError::InvalidValue(format!(
                "CS_RTC_MIN_PORT ({rtc_min_port}) must not exceed CS_RTC_MAX_PORT ({rtc_max_port})"
            )));
        }

        let listen_ip = parse_var(vars, "CS_LISTEN_IP", DEFAULT_LISTEN_IP)?;
        let announced_ip = parse_var(vars, "CS_ANNOUNCED_IP", DEFAULT_ANNOUNCED_IP)?;

        let initial_outgoing_bitrate = parse_var(
            vars,
            "CS_INITIAL_OUTGOING_BITRATE",
            DEFAULT_INITIAL_OUTGOING_BITRATE,
        )?;

        let outbound_queue_size =
            parse_var(vars, "CS_OUTBOUND_QUEUE_SIZE", DEFAULT_OUTBOUND_QUEUE_SIZE)?;
        if outbound_queue_size == 0 {
            return Err(ConfigError::InvalidValue(
                "CS_OUTBOUND_QUEUE_SIZE must be at least 1".to_string(),
            ));
        }

        let max_chat_length = parse_var(vars, "CS_MAX_CHAT_LENGTH", DEFAULT_MAX_CHAT_LENGTH)?;

        let instance_id = vars.get("CS_INSTANCE_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_INSTANCE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            redis_url,
            signaling_bind_address,
            health_bind_address,
            instance_id,
            rtc_min_port,
            rtc_max_port,
            listen_ip,
            announced_ip,
            initial_outgoing_bitrate,
            outbound_queue_size,
            max_chat_length,
        })
    }

    /// Transport options handed to the media engine for every new transport.
    #[must_use]
    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            listen_ip: self.listen_ip,
            announced_ip: self.announced_ip,
            rtc_min_port: self.rtc_min_port,
            rtc_max_port: self.rtc_max_port,
            initial_available_outgoing_bitrate: self.initial_outgoing_bitrate,
        }
    }
}

fn parse_var<T>(vars: &HashMap<String, String>, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match vars.get(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(format!("{name}={raw:?}: {e}"))),
    }
}
