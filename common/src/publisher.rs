use log::{debug, warn};

use crate::{
    sensor::{SensorSnapshot, SensorSource},
    thing::PropertyStore,
    types::MetricId,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Properties whose stored value changed this cycle, in sampling order.
    pub published: Vec<MetricId>,
    pub failed_sources: Vec<&'static str>,
}

impl CycleReport {
    pub fn is_quiet(&self) -> bool {
        self.published.is_empty()
    }
}

/// Store every metric of `snapshot` that differs from the stored value.
pub fn publish_snapshot(
    store: &mut PropertyStore,
    snapshot: &SensorSnapshot,
    report: &mut CycleReport,
) {
    for (metric, value) in snapshot.metrics() {
        let stored = match store.get(metric) {
            Ok(stored) => stored,
            Err(err) => {
                warn!("skipping sampled metric: {err}");
                continue;
            }
        };

        if !value.differs_from(stored) {
            continue;
        }

        match store.set(metric, value) {
            Ok(()) => report.published.push(metric),
            Err(err) => warn!("failed to store {}: {err}", metric.property_name()),
        }
    }
}

/// One sampling pass over every source. A failing source is skipped for
/// this cycle only.
pub fn publish_cycle(
    store: &mut PropertyStore,
    sources: &mut [&mut dyn SensorSource],
) -> CycleReport {
    let mut report = CycleReport::default();

    for source in sources.iter_mut() {
        match source.sample() {
            Ok(snapshot) => publish_snapshot(store, &snapshot, &mut report),
            Err(err) => {
                warn!("{} read failed: {err}", source.name());
                report.failed_sources.push(source.name());
            }
        }
    }

    debug!(
        "sampling cycle published {} propert(ies), {} source failure(s)",
        report.published.len(),
        report.failed_sources.len()
    );
    report
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        error::SensorError,
        sensor::{EnvironmentalReading, ParticulateReading},
        thing::airq_device,
        types::PropertyValue,
    };
    use crate::testing::ScriptedSource;

    fn pm(pm1_0: u16, pm2_5: u16, pm10: u16) -> Result<SensorSnapshot, SensorError> {
        Ok(SensorSnapshot::Particulate(ParticulateReading { pm1_0, pm2_5, pm10 }))
    }

    fn env(
        temperature_c: f32,
        humidity_pct: f32,
        pressure_pa: f32,
    ) -> Result<SensorSnapshot, SensorError> {
        Ok(SensorSnapshot::Environmental(EnvironmentalReading {
            temperature_c,
            humidity_pct,
            pressure_pa,
        }))
    }

    #[test]
    fn stored_value_changes_only_when_sample_differs() {
        let samples = [3_u16, 3, 4, 4, 4, 3, 3, 0];
        let mut store = airq_device("t").properties;
        let mut source =
            ScriptedSource::particulate(samples.iter().map(|&v| pm(v, v, v)).collect());

        let mut previous: Option<u16> = None;
        for sample in samples {
            let report = publish_cycle(&mut store, &mut [&mut source]);
            let expect_change = previous != Some(sample);

            assert_eq!(report.published.contains(&MetricId::Pm2_5), expect_change);
            assert_eq!(
                store.get(MetricId::Pm2_5),
                Ok(Some(PropertyValue::Integer(i64::from(sample))))
            );
            previous = Some(sample);
        }
    }

    #[test]
    fn particulate_failure_does_not_block_environmental() {
        let mut store = airq_device("t").properties;
        let mut particulate = ScriptedSource::particulate(vec![Err(SensorError::Timeout)]);
        let mut environmental = ScriptedSource::environmental(vec![env(20.0, 50.0, 100_000.0)]);

        let report = publish_cycle(&mut store, &mut [&mut particulate, &mut environmental]);

        assert_eq!(
            report.published,
            vec![MetricId::Temperature, MetricId::Humidity, MetricId::Pressure]
        );
        assert_eq!(report.failed_sources, vec!["particulate"]);
        assert_eq!(store.get(MetricId::Pm1_0), Ok(None));
        assert_eq!(store.get(MetricId::Pressure), Ok(Some(PropertyValue::Real(1000.0))));
    }

    #[test]
    fn environmental_failure_does_not_block_particulate() {
        let mut store = airq_device("t").properties;
        let mut particulate = ScriptedSource::particulate(vec![pm(1, 2, 3), pm(1, 4, 3)]);
        let mut environmental = ScriptedSource::environmental(vec![
            env(20.0, 50.0, 100_000.0),
            Err(SensorError::Bus("nack".to_string())),
        ]);

        publish_cycle(&mut store, &mut [&mut particulate, &mut environmental]);
        let report = publish_cycle(&mut store, &mut [&mut particulate, &mut environmental]);

        assert_eq!(report.published, vec![MetricId::Pm2_5]);
        assert_eq!(report.failed_sources, vec!["environmental"]);
        assert_eq!(store.get(MetricId::Temperature), Ok(Some(PropertyValue::Real(20.0))));
    }

    #[test]
    fn identical_snapshots_cause_no_writes() {
        let mut store = airq_device("t").properties;
        let mut particulate = ScriptedSource::particulate(vec![pm(5, 9, 12), pm(5, 9, 12)]);
        let mut environmental = ScriptedSource::environmental(vec![
            env(21.3, 40.0, 101_250.0),
            env(21.3, 40.0, 101_250.0),
        ]);

        publish_cycle(&mut store, &mut [&mut particulate, &mut environmental]);
        let writes = store.writes();
        let report = publish_cycle(&mut store, &mut [&mut particulate, &mut environmental]);

        assert!(report.is_quiet());
        assert_eq!(store.writes(), writes);
    }

    #[test]
    fn tiny_real_changes_are_published() {
        let mut store = airq_device("t").properties;
        let mut environmental = ScriptedSource::environmental(vec![
            env(21.3, 40.0, 101_250.0),
            env(21.300_002, 40.0, 101_250.0),
        ]);

        publish_cycle(&mut store, &mut [&mut environmental]);
        let report = publish_cycle(&mut store, &mut [&mut environmental]);

        assert_eq!(report.published, vec![MetricId::Temperature]);
    }
}
