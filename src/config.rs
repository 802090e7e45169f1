use std::{env, net::IpAddr, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigErrorKind, Error};

/// Top level configuration shared by [`crate::hub::Hub`], [`crate::room::Room`] and [`crate::sfu::Sfu`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub room: RoomConfig,
    pub sfu: SfuConfig,
}

impl Config {
    /// Builds a configuration from `TSTREAM_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Config::default();
        let room = &mut config.room;
        if let Some(v) = env_parse::<usize>("TSTREAM_MESSAGE_BUFFER_SIZE")? {
            room.message_buffer_size = v;
        }
        if let Some(v) = env_parse::<usize>("TSTREAM_CHAT_BUFFER_SIZE")? {
            room.chat_buffer_size = v;
        }
        if let Some(v) = env_parse::<u64>("TSTREAM_PING_INTERVAL_SECS")? {
            room.ping_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("TSTREAM_DISCONNECT_THRESHOLD_SECS")? {
            room.disconnect_threshold = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("TSTREAM_IDLE_THRESHOLD_SECS")? {
            room.idle_threshold = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("TSTREAM_IDLE_SCAN_INTERVAL_SECS")? {
            room.idle_scan_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("TSTREAM_WRITE_TIMEOUT_SECS")? {
            room.write_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<usize>("TSTREAM_OUTBOUND_QUEUE_SIZE")? {
            room.outbound_queue_size = v;
        }
        if let Ok(v) = env::var("TSTREAM_SLOW_CONSUMER_POLICY") {
            room.slow_consumer_policy = match v.as_str() {
                "DropOldest" => SlowConsumerPolicy::DropOldest,
                "Disconnect" => SlowConsumerPolicy::Disconnect,
                other => {
                    return Err(Error::new_config(
                        format!("TSTREAM_SLOW_CONSUMER_POLICY has unknown value {}", other),
                        ConfigErrorKind::InvalidValue,
                    ))
                }
            };
        }

        let sfu = &mut config.sfu;
        if let Ok(v) = env::var("TSTREAM_PUBLIC_IP") {
            let ip = v.parse::<IpAddr>().map_err(|err| {
                Error::new_config(
                    format!("TSTREAM_PUBLIC_IP: {}", err),
                    ConfigErrorKind::InvalidValue,
                )
            })?;
            sfu.announced_ips = vec![ip];
        }
        if let (Some(min), Some(max)) = (
            env_parse::<u16>("TSTREAM_RTC_MIN_PORT")?,
            env_parse::<u16>("TSTREAM_RTC_MAX_PORT")?,
        ) {
            sfu.port_range = Some(PortRange { min, max });
        }
        if let Ok(v) = env::var("TSTREAM_STUN_URL") {
            sfu.ice_servers = vec![IceServer {
                urls: vec![v],
                ..Default::default()
            }];
        }

        Ok(config)
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>, Error>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(value) => value.parse::<T>().map(Some).map_err(|err| {
            Error::new_config(format!("{}: {}", key, err), ConfigErrorKind::InvalidValue)
        }),
        Err(_) => Ok(None),
    }
}

/// Policy values for rooms and their client connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    /// Number of recent streamer messages replayed to late joiners.
    pub message_buffer_size: usize,
    /// Number of recent chat messages replayed on request.
    pub chat_buffer_size: usize,
    pub ping_interval: Duration,
    /// A connection silent for longer than this is presumed gone.
    pub disconnect_threshold: Duration,
    /// A room whose last activity is older than this is stopped by [`crate::hub::Hub::scan_idle`].
    pub idle_threshold: Duration,
    pub idle_scan_interval: Duration,
    pub outbound_queue_size: usize,
    pub inbound_queue_size: usize,
    pub slow_consumer_policy: SlowConsumerPolicy,
    pub handshake_timeout: Duration,
    /// A single frame write taking longer than this closes the connection.
    pub write_timeout: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            message_buffer_size: 20,
            chat_buffer_size: 50,
            ping_interval: Duration::from_secs(10),
            disconnect_threshold: Duration::from_secs(60),
            idle_threshold: Duration::from_secs(60 * 10),
            idle_scan_interval: Duration::from_secs(60),
            outbound_queue_size: 256,
            inbound_queue_size: 256,
            slow_consumer_policy: SlowConsumerPolicy::DropOldest,
            handshake_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// What happens when a client's outbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SlowConsumerPolicy {
    /// Evict the oldest queued message and keep the client.
    #[default]
    DropOldest,
    /// Close the client.
    Disconnect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SfuConfig {
    pub ice_servers: Vec<IceServer>,
    /// Public addresses written into host candidates, for servers behind 1:1 NAT.
    pub announced_ips: Vec<IpAddr>,
    pub port_range: Option<PortRange>,
    /// Convergence attempts before a deferred retry is scheduled.
    pub sync_attempts: usize,
    pub sync_cooldown: Duration,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_owned()],
                ..Default::default()
            }],
            announced_ips: vec![],
            port_range: None,
            sync_attempts: 25,
            sync_cooldown: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

/// UDP port range used for ICE candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}
