use thiserror::Error;

use crate::types::{ConnectionState, MetricId, ValueKind};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SensorError {
    #[error("sensor read timed out")]
    Timeout,
    #[error("malformed frame: {0}")]
    Framing(&'static str),
    #[error("frame checksum mismatch (expected {expected:#06x}, got {actual:#06x})")]
    Checksum { expected: u16, actual: u16 },
    #[error("bus transaction failed: {0}")]
    Bus(String),
    #[error("sensor not responding")]
    NotResponding,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("unknown property {0:?}")]
    UnknownProperty(MetricId),
    #[error("property {metric:?} holds {expected:?} values, got {actual:?}")]
    KindMismatch {
        metric: MetricId,
        expected: ValueKind,
        actual: ValueKind,
    },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum UpdateError {
    #[error("invalid update url: {0}")]
    InvalidUrl(&'static str),
    #[error("update host unreachable: {0}")]
    Unreachable(String),
    #[error("update server returned HTTP {0}")]
    HttpStatus(u16),
    #[error("invalid firmware image: {0}")]
    InvalidImage(String),
    #[error("image verification failed: {0}")]
    Verification(String),
    #[error("flash failed: {0}")]
    Flash(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ServerError {
    #[error("failed to push property {property}: {reason}")]
    Push {
        property: &'static str,
        reason: String,
    },
    #[error("discovery service error: {0}")]
    Discovery(String),
    #[error("failed to start property server: {0}")]
    Start(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("wifiSsid cannot be empty")]
    EmptySsid,
    #[error("wifiSsid is {0} bytes, at most 32 are allowed")]
    SsidTooLong(usize),
    #[error("wifiPass is {0} bytes, WPA2 needs 8 to 64")]
    PasswordLength(usize),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StartError {
    #[error("sampling cannot start before the network is joined (state {})", .0.as_str())]
    NotJoined(ConnectionState),
    #[error(transparent)]
    Server(#[from] ServerError),
}
