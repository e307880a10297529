use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Integer,
    #[serde(rename = "number")]
    Real,
}

impl ValueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Real => "number",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Integer(i64),
    Real(f64),
}

impl PropertyValue {
    pub fn kind(self) -> ValueKind {
        match self {
            Self::Integer(_) => ValueKind::Integer,
            Self::Real(_) => ValueKind::Real,
        }
    }

    /// Change test used by the publisher: exact equality for integers,
    /// strict floating inequality for reals. A NaN sample always differs.
    pub fn differs_from(self, stored: Option<Self>) -> bool {
        match (self, stored) {
            (_, None) => true,
            (Self::Integer(new), Some(Self::Integer(old))) => new != old,
            (Self::Real(new), Some(Self::Real(old))) => new != old,
            _ => true,
        }
    }
}

/// Identifies one exposed metric. The discriminant order is the order the
/// properties are attached to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MetricId {
    Pm1_0,
    Pm2_5,
    Pm10,
    Temperature,
    Humidity,
    Pressure,
}

impl MetricId {
    pub const ALL: [MetricId; 6] = [
        Self::Pm1_0,
        Self::Pm2_5,
        Self::Pm10,
        Self::Temperature,
        Self::Humidity,
        Self::Pressure,
    ];

    pub fn property_name(self) -> &'static str {
        match self {
            Self::Pm1_0 => "PM1.0",
            Self::Pm2_5 => "PM2.5",
            Self::Pm10 => "PM10",
            Self::Temperature => "Temperature",
            Self::Humidity => "Humidity",
            Self::Pressure => "Pressure",
        }
    }

    pub fn from_property_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|metric| metric.property_name() == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Unprovisioned,
    Provisioning,
    Joining,
    Joined,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unprovisioned => "UNPROVISIONED",
            Self::Provisioning => "PROVISIONING",
            Self::Joining => "JOINING",
            Self::Joined => "JOINED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateOutcome {
    Succeeded,
    Failed,
}
