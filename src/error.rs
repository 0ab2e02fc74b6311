use std::time::Duration;
use thiserror::Error;

/// Failures talking to the meter. Always caught at the cycle boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no response from meter within {0:?}")]
    Timeout(Duration),
    #[error("malformed ECHONET Lite frame: {0}")]
    MalformedFrame(String),
    #[error("meter rejected request for property 0x{0:02X}")]
    Rejected(u8),
    #[error("response is missing property 0x{0:02X}")]
    MissingProperty(u8),
    #[error("meter has no data for property 0x{0:02X}")]
    NoData(u8),
}

#[derive(Debug, Error)]
pub enum ForwarderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Mackerel rejected metrics with status {status}: {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}
