//! Node configuration.
//!
//! Configuration can be built in code or loaded from JSON using the camelCase
//! key names peers in other languages use:
//!
//! ```
//! use std::time::Duration;
//! use peerwire::config::{NodeConfig, Retries};
//!
//! let config = NodeConfig::from_json_str(r#"{
//!     "client": { "maximumRetries": "unlimited", "retryTime": 250, "handshakeTimeout": -1 },
//!     "server": { "handshakeTimeout": 2000 }
//! }"#).unwrap();
//!
//! assert_eq!(config.client.maximum_retries, Retries::Unlimited);
//! assert_eq!(config.client.retry_time, Some(Duration::from_millis(250)));
//! assert_eq!(config.client.handshake_timeout, None);
//! assert_eq!(config.server.handshake_timeout, Some(Duration::from_secs(2)));
//! ```

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::Result;
use crate::protocol::DEFAULT_MAX_BODY_SIZE;

/// Default reconnection attempts after a dropped connection.
pub const DEFAULT_MAXIMUM_RETRIES: u32 = 5;

/// Default delay before each reconnection attempt.
pub const DEFAULT_RETRY_TIME: Duration = Duration::from_millis(1000);

/// Default bound on the name exchange.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default number of undelivered node events held before new ones are dropped.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// How many times a dropped client connection is re-established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retries {
    /// At most this many consecutive attempts.
    Limited(u32),
    /// Keep trying forever.
    Unlimited,
}

impl Default for Retries {
    fn default() -> Self {
        Retries::Limited(DEFAULT_MAXIMUM_RETRIES)
    }
}

impl<'de> Deserialize<'de> for Retries {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RetriesValue {
            Count(u32),
            Word(String),
        }

        match RetriesValue::deserialize(deserializer)? {
            RetriesValue::Count(n) => Ok(Retries::Limited(n)),
            RetriesValue::Word(word) if word.eq_ignore_ascii_case("unlimited") => {
                Ok(Retries::Unlimited)
            }
            RetriesValue::Word(word) => Err(serde::de::Error::custom(format!(
                "maximumRetries must be a non-negative integer or \"unlimited\", got {word:?}"
            ))),
        }
    }
}

/// Milliseconds where `null` or any non-positive value means disabled.
fn deserialize_millis<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = Option::<i64>::deserialize(deserializer)?;
    Ok(millis
        .filter(|ms| *ms > 0)
        .map(|ms| Duration::from_millis(ms as u64)))
}

/// Settings for dial-out connections.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// Reconnection attempts after an unexpected close.
    pub maximum_retries: Retries,
    /// Delay before each reconnection attempt. `None` disables reconnection.
    #[serde(deserialize_with = "deserialize_millis")]
    pub retry_time: Option<Duration>,
    /// Bound on the name exchange. `None` waits forever.
    #[serde(deserialize_with = "deserialize_millis")]
    pub handshake_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            maximum_retries: Retries::default(),
            retry_time: Some(DEFAULT_RETRY_TIME),
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
        }
    }
}

impl ClientConfig {
    /// Set the reconnection budget.
    pub fn with_maximum_retries(mut self, retries: Retries) -> Self {
        self.maximum_retries = retries;
        self
    }

    /// Set the reconnection delay.
    pub fn with_retry_time(mut self, retry_time: Option<Duration>) -> Self {
        self.retry_time = retry_time;
        self
    }

    /// Set the handshake bound.
    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

/// Settings for accepted connections.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Bound on the name exchange. `None` waits forever.
    #[serde(deserialize_with = "deserialize_millis")]
    pub handshake_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
        }
    }
}

impl ServerConfig {
    /// Set the handshake bound.
    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

/// Complete node configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeConfig {
    /// Dial-out settings.
    pub client: ClientConfig,
    /// Accepted-connection settings.
    pub server: ServerConfig,
    /// Largest body a peer may announce before the frame is treated as corrupt.
    pub max_body_size: u32,
    /// Events queued for the receiver before further events are dropped.
    pub event_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            server: ServerConfig::default(),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl NodeConfig {
    /// Parse a JSON document. Missing keys take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Replace the client settings.
    pub fn with_client(mut self, client: ClientConfig) -> Self {
        self.client = client;
        self
    }

    /// Replace the server settings.
    pub fn with_server(mut self, server: ServerConfig) -> Self {
        self.server = server;
        self
    }

    /// Set the maximum body size.
    pub fn with_max_body_size(mut self, max_body_size: u32) -> Self {
        self.max_body_size = max_body_size;
        self
    }

    /// Set how many events may wait for the receiver.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}
