use serde::{Deserialize, Serialize};

use crate::error::CredentialError;

pub const MAX_SSID_LEN: usize = 32;
pub const MIN_PASSPHRASE_LEN: usize = 8;
pub const MAX_PASSPHRASE_LEN: usize = 64;

/// Station credentials as stored in flash and accepted by the portal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiCredentials {
    pub ssid: String,
    #[serde(default)]
    pub pass: String,
}

impl WifiCredentials {
    /// Trims the SSID and checks both fields fit the radio's fixed-size
    /// configuration. An empty password selects an open network.
    pub fn new(ssid: &str, pass: &str) -> Result<Self, CredentialError> {
        let credentials = Self {
            ssid: ssid.trim().to_string(),
            pass: pass.to_string(),
        };
        credentials.validate()?;
        Ok(credentials)
    }

    pub fn validate(&self) -> Result<(), CredentialError> {
        if self.ssid.trim().is_empty() {
            return Err(CredentialError::EmptySsid);
        }
        if self.ssid.len() > MAX_SSID_LEN {
            return Err(CredentialError::SsidTooLong(self.ssid.len()));
        }
        if !self.is_open() {
            validate_passphrase(&self.pass)?;
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.pass.is_empty()
    }
}

/// WPA2 passphrase length check, also applied to the provisioning AP.
pub fn validate_passphrase(pass: &str) -> Result<(), CredentialError> {
    if (MIN_PASSPHRASE_LEN..=MAX_PASSPHRASE_LEN).contains(&pass.len()) {
        Ok(())
    } else {
        Err(CredentialError::PasswordLength(pass.len()))
    }
}
