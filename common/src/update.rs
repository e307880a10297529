use log::{info, warn};

use crate::{
    config::UpdateConfig,
    error::UpdateError,
    indicator::{blink, Delay, Indicator},
    types::UpdateOutcome,
};

pub trait UpdateTransport {
    /// Fetch, verify and flash the image at `url` in one blocking call. On
    /// hardware a successful update restarts the device, so `Ok` is only
    /// observed by transports that cannot restart.
    fn update(&mut self, url: &str) -> Result<(), UpdateError>;
}

impl<T: UpdateTransport + ?Sized> UpdateTransport for &mut T {
    fn update(&mut self, url: &str) -> Result<(), UpdateError> {
        (**self).update(url)
    }
}

pub fn validate_update_url(url: &str) -> Result<(), UpdateError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(UpdateError::InvalidUrl("url cannot be empty"));
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(UpdateError::InvalidUrl("url must start with http:// or https://"));
    }
    if url_authority(url).is_empty() {
        return Err(UpdateError::InvalidUrl("url has no host"));
    }
    Ok(())
}

/// `host[:port]` portion of an http(s) url.
pub fn url_authority(url: &str) -> &str {
    let rest = url
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    rest.split(['/', '?', '#']).next().unwrap_or_default()
}

/// One-shot firmware update with LED signalling. Blinks before the attempt
/// and again if it fails; the indicator ends steady on.
#[derive(Debug, Clone)]
pub struct RemoteUpdateController {
    config: UpdateConfig,
}

impl RemoteUpdateController {
    pub fn new(config: UpdateConfig) -> Self {
        Self { config }
    }

    pub fn default_url(&self) -> &str {
        &self.config.url
    }

    pub fn attempt_update<T, I, D>(
        &self,
        url: &str,
        transport: &mut T,
        indicator: &mut I,
        delay: &mut D,
    ) -> UpdateOutcome
    where
        T: UpdateTransport + ?Sized,
        I: Indicator,
        D: Delay,
    {
        info!("starting remote update from `{url}`");
        indicator.set(false);
        self.signal(indicator, delay);

        let outcome = match transport.update(url) {
            Ok(()) => {
                info!("remote update applied");
                UpdateOutcome::Succeeded
            }
            Err(err) => {
                warn!("remote update failed: {err}");
                self.signal(indicator, delay);
                UpdateOutcome::Failed
            }
        };

        indicator.set(true);
        outcome
    }

    fn signal<I: Indicator, D: Delay>(&self, indicator: &mut I, delay: &mut D) {
        blink(
            indicator,
            delay,
            self.config.signal_toggles,
            self.config.signal_interval_ms,
        );
    }
}
