use log::{info, warn};

use crate::{
    error::SensorError,
    indicator::{Delay, Heartbeat, Indicator},
    types::{MetricId, PropertyValue},
};

/// Atmospheric-environment mass concentrations, µg/m³.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParticulateReading {
    pub pm1_0: u16,
    pub pm2_5: u16,
    pub pm10: u16,
}

/// Raw values as converted by the environmental sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvironmentalReading {
    pub temperature_c: f32,
    pub humidity_pct: f32,
    pub pressure_pa: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorSnapshot {
    Particulate(ParticulateReading),
    Environmental(EnvironmentalReading),
}

impl SensorSnapshot {
    /// Property values in the units the device exposes.
    pub fn metrics(&self) -> Vec<(MetricId, PropertyValue)> {
        match self {
            Self::Particulate(reading) => vec![
                (MetricId::Pm1_0, PropertyValue::Integer(i64::from(reading.pm1_0))),
                (MetricId::Pm2_5, PropertyValue::Integer(i64::from(reading.pm2_5))),
                (MetricId::Pm10, PropertyValue::Integer(i64::from(reading.pm10))),
            ],
            Self::Environmental(reading) => vec![
                (
                    MetricId::Temperature,
                    PropertyValue::Real(f64::from(reading.temperature_c)),
                ),
                (
                    MetricId::Humidity,
                    PropertyValue::Real(f64::from(reading.humidity_pct)),
                ),
                (
                    MetricId::Pressure,
                    PropertyValue::Real(f64::from(pascals_to_hectopascals(reading.pressure_pa))),
                ),
            ],
        }
    }
}

pub fn pascals_to_hectopascals(pressure_pa: f32) -> f32 {
    pressure_pa / 100.0
}

/// International barometric formula.
pub fn altitude_m(pressure_hpa: f32, sea_level_hpa: f32) -> f32 {
    44_330.0 * (1.0 - (pressure_hpa / sea_level_hpa).powf(0.1903))
}

pub trait SensorSource {
    fn name(&self) -> &'static str;

    /// Probe the device. Sources that need no bring-up keep the default.
    fn init(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    fn sample(&mut self) -> Result<SensorSnapshot, SensorError>;
}

impl<T: SensorSource + ?Sized> SensorSource for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn init(&mut self) -> Result<(), SensorError> {
        (**self).init()
    }

    fn sample(&mut self) -> Result<SensorSnapshot, SensorError> {
        (**self).sample()
    }
}

/// Block until `source.init()` succeeds, toggling the indicator every
/// `poll_ms`. Leaves the indicator on. Returns the number of attempts.
pub fn wait_for_sensor<S, I, D>(
    source: &mut S,
    indicator: &mut I,
    delay: &mut D,
    poll_ms: u64,
) -> u32
where
    S: SensorSource + ?Sized,
    I: Indicator,
    D: Delay,
{
    let mut heartbeat = Heartbeat::default();
    let mut attempts = 1_u32;

    while let Err(err) = source.init() {
        if attempts == 1 {
            warn!("{} not responding ({err}); retrying every {poll_ms} ms", source.name());
        }
        delay.delay_ms(poll_ms);
        heartbeat.toggle(indicator);
        attempts = attempts.saturating_add(1);
    }

    indicator.set(true);
    info!("{} ready after {attempts} attempt(s)", source.name());
    attempts
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::{RecordingIndicator, ScriptedSource, VirtualDelay};

    #[test]
    fn environmental_metrics_are_converted() {
        let snapshot = SensorSnapshot::Environmental(EnvironmentalReading {
            temperature_c: 21.5,
            humidity_pct: 40.0,
            pressure_pa: 101_250.0,
        });

        assert_eq!(
            snapshot.metrics(),
            vec![
                (MetricId::Temperature, PropertyValue::Real(21.5)),
                (MetricId::Humidity, PropertyValue::Real(40.0)),
                (MetricId::Pressure, PropertyValue::Real(1012.5)),
            ]
        );
    }

    #[test]
    fn particulate_metrics_are_integers() {
        let snapshot = SensorSnapshot::Particulate(ParticulateReading {
            pm1_0: 5,
            pm2_5: 9,
            pm10: 12,
        });

        assert_eq!(
            snapshot.metrics(),
            vec![
                (MetricId::Pm1_0, PropertyValue::Integer(5)),
                (MetricId::Pm2_5, PropertyValue::Integer(9)),
                (MetricId::Pm10, PropertyValue::Integer(12)),
            ]
        );
    }

    #[test]
    fn altitude_is_zero_at_reference_pressure() {
        assert!(altitude_m(1013.25, 1013.25).abs() < 0.01);
        assert!(altitude_m(900.0, 1013.25) > 900.0);
    }

    #[test]
    fn wait_for_sensor_retries_until_init_succeeds() {
        let mut source = ScriptedSource::environmental(Vec::new()).failing_init(3);
        let mut indicator = RecordingIndicator::default();
        let mut delay = VirtualDelay::default();

        let attempts = wait_for_sensor(&mut source, &mut indicator, &mut delay, 300);

        assert_eq!(attempts, 4);
        assert_eq!(delay.calls, vec![300, 300, 300]);
        assert_eq!(indicator.levels, vec![true, false, true, true]);
    }

    #[test]
    fn wait_for_sensor_returns_immediately_when_present() {
        let mut source = ScriptedSource::environmental(Vec::new());
        let mut indicator = RecordingIndicator::default();
        let mut delay = VirtualDelay::default();

        assert_eq!(wait_for_sensor(&mut source, &mut indicator, &mut delay, 300), 1);
        assert!(delay.calls.is_empty());
        assert_eq!(indicator.levels, vec![true]);
    }
}
