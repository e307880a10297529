use serde::{Deserialize, Serialize};

use crate::credentials::validate_passphrase;

pub const DEVICE_NAME_PREFIX: &str = "esp-airq-thing";
pub const PROVISIONING_AP_PASSWORD: &str = "AirQualitySetup";
pub const SEA_LEVEL_PRESSURE_HPA: f32 = 1013.25;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BootstrapTiming {
    pub provisioning_poll_ms: u64,
    pub join_poll_ms: u64,
    pub sensor_init_poll_ms: u64,
}

impl Default for BootstrapTiming {
    fn default() -> Self {
        Self {
            provisioning_poll_ms: 1_000,
            join_poll_ms: 500,
            sensor_init_poll_ms: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateConfig {
    pub url: String,
    pub signal_toggles: u32,
    pub signal_interval_ms: u64,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            url: option_env!("AIRQ_OTA_URL").unwrap_or_default().to_string(),
            signal_toggles: 10,
            signal_interval_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PinConfig {
    pub indicator: i32,
    pub pms_rx: i32,
    pub pms_tx: i32,
    pub pms_baud: u32,
    pub bme_sda: i32,
    pub bme_scl: i32,
    pub bme_address: u8,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            indicator: 2,
            pms_rx: 16,
            pms_tx: 17,
            pms_baud: 9_600,
            bme_sda: 21,
            bme_scl: 22,
            bme_address: 0x76,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    pub device_name_prefix: String,
    /// WPA2 passphrase of the provisioning access point.
    pub provisioning_password: String,
    pub sample_period_ms: u64,
    /// Sleep between idle-loop polls.
    pub idle_poll_ms: u64,
    pub particulate_timeout_ms: u64,
    pub sea_level_pressure_hpa: f32,
    pub bootstrap: BootstrapTiming,
    pub update: UpdateConfig,
    pub pins: PinConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            device_name_prefix: DEVICE_NAME_PREFIX.to_string(),
            provisioning_password: option_env!("AIRQ_AP_PASSWORD")
                .unwrap_or(PROVISIONING_AP_PASSWORD)
                .to_string(),
            sample_period_ms: 5_000,
            idle_poll_ms: 50,
            particulate_timeout_ms: 1_000,
            sea_level_pressure_hpa: SEA_LEVEL_PRESSURE_HPA,
            bootstrap: BootstrapTiming::default(),
            update: UpdateConfig::default(),
            pins: PinConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Network hostname and advertised name: `<prefix>-<chip id>`, lowercased.
    pub fn device_name(&self, chip_id: impl std::fmt::Display) -> String {
        format!("{}-{}", self.device_name_prefix, chip_id).to_lowercase()
    }

    pub fn sanitize(&mut self) {
        if self.device_name_prefix.trim().is_empty() {
            self.device_name_prefix = DEVICE_NAME_PREFIX.to_string();
        }
        if validate_passphrase(&self.provisioning_password).is_err() {
            self.provisioning_password = PROVISIONING_AP_PASSWORD.to_string();
        }
        self.sample_period_ms = self.sample_period_ms.max(100);
        self.idle_poll_ms = self.idle_poll_ms.clamp(1, self.sample_period_ms);
        self.update.signal_toggles = self.update.signal_toggles.min(100);
        if !self.sea_level_pressure_hpa.is_finite() || self.sea_level_pressure_hpa <= 0.0 {
            self.sea_level_pressure_hpa = SEA_LEVEL_PRESSURE_HPA;
        }
    }
}
