use crate::error::ConfigError;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::{env, time::Duration};

pub const DEFAULT_MACKEREL_URL: &str = "https://api.mackerelio.com";
pub const DEFAULT_MACKEREL_SERVICE: &str = "rasberrypi";
pub const DEFAULT_ACCESSORY_NAME: &str = "Smart Meter";
pub const DEFAULT_ACCESSORY_LISTEN: &str = "0.0.0.0:5502";
pub const DEFAULT_ALERT_THRESHOLD: u8 = 80;
pub const DEFAULT_METER_TIMEOUT_MS: u64 = 5000;
pub const ECHONET_PORT: u16 = 3610;

/// Bridge settings, read once from the environment at startup
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub meter: MeterConfig,
    pub alert_threshold: u8,
    pub mackerel: MackerelConfig,
    pub accessory: AccessoryConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeterConfig {
    /// ECHONET Lite endpoint of the smart meter (or the gateway holding the B-route session)
    pub address: SocketAddr,
    /// Local UDP address responses are delivered to
    pub bind: SocketAddr,
    pub timeout: Duration,
}

#[derive(Clone, PartialEq)]
pub struct MackerelConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub service: String,
}

impl fmt::Debug for MackerelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MackerelConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("service", &self.service)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccessoryConfig {
    pub name: String,
    pub listen: SocketAddr,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let address: SocketAddr = match get("METER_ADDRESS") {
            Some(raw) => parse_value("METER_ADDRESS", raw)?,
            None => return Err(ConfigError::Missing("METER_ADDRESS")),
        };
        let default_bind = if address.is_ipv6() {
            format!("[::]:{ECHONET_PORT}")
        } else {
            format!("0.0.0.0:{ECHONET_PORT}")
        };
        let bind = parse_or("ECHONET_BIND", get("ECHONET_BIND"), &default_bind)?;
        let timeout_ms: u64 = parse_or(
            "METER_TIMEOUT_MS",
            get("METER_TIMEOUT_MS"),
            &DEFAULT_METER_TIMEOUT_MS.to_string(),
        )?;

        let alert_threshold: u8 = parse_or(
            "ALERT_THRESHOLD",
            get("ALERT_THRESHOLD"),
            &DEFAULT_ALERT_THRESHOLD.to_string(),
        )?;
        if alert_threshold > 100 {
            return Err(ConfigError::Invalid {
                key: "ALERT_THRESHOLD",
                value: alert_threshold.to_string(),
                reason: "must be a percentage between 0 and 100".to_string(),
            });
        }

        let mackerel = MackerelConfig {
            api_key: get("MACKEREL_APIKEY"),
            base_url: get("MACKEREL_URL")
                .unwrap_or_else(|| DEFAULT_MACKEREL_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            service: get("MACKEREL_SERVICE").unwrap_or_else(|| DEFAULT_MACKEREL_SERVICE.to_string()),
        };

        let accessory = AccessoryConfig {
            name: get("ACCESSORY_NAME").unwrap_or_else(|| DEFAULT_ACCESSORY_NAME.to_string()),
            listen: parse_or(
                "ACCESSORY_LISTEN",
                get("ACCESSORY_LISTEN"),
                DEFAULT_ACCESSORY_LISTEN,
            )?,
        };

        Ok(Self {
            meter: MeterConfig {
                address,
                bind,
                timeout: Duration::from_millis(timeout_ms),
            },
            alert_threshold,
            mackerel,
            accessory,
        })
    }
}

fn parse_or<T>(key: &'static str, raw: Option<String>, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    parse_value(key, raw.unwrap_or_else(|| default.to_string()))
}

fn parse_value<T>(key: &'static str, raw: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let parsed = raw.trim().parse::<T>();
    parsed.map_err(|e| ConfigError::Invalid {
        key,
        reason: e.to_string(),
        value: raw,
    })
}
