use std::collections::BTreeMap;

use serde::Serialize;

use crate::{
    error::StoreError,
    types::{MetricId, PropertyValue, ValueKind},
};

pub const DEVICE_ID: &str = "airq";
pub const DEVICE_TYPE: &str = "AirQualitySensor";
const THING_CONTEXT: &str = "https://webthings.io/schemas";

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDescriptor {
    pub metric: MetricId,
    pub title: &'static str,
    pub description: &'static str,
    pub semantic_type: &'static str,
    pub kind: ValueKind,
    pub read_only: bool,
    pub unit: Option<&'static str>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
}

impl PropertyDescriptor {
    pub fn name(&self) -> &'static str {
        self.metric.property_name()
    }
}

#[derive(Debug, Clone)]
struct PropertySlot {
    descriptor: PropertyDescriptor,
    value: Option<PropertyValue>,
    pending: bool,
}

/// Current value of every exposed property. `None` means nothing has been
/// sampled yet.
#[derive(Debug, Clone)]
pub struct PropertyStore {
    slots: Vec<PropertySlot>,
    writes: u64,
}

impl PropertyStore {
    pub fn new(descriptors: Vec<PropertyDescriptor>) -> Self {
        Self {
            slots: descriptors
                .into_iter()
                .map(|descriptor| PropertySlot {
                    descriptor,
                    value: None,
                    pending: false,
                })
                .collect(),
            writes: 0,
        }
    }

    pub fn get(&self, metric: MetricId) -> Result<Option<PropertyValue>, StoreError> {
        self.slot(metric).map(|slot| slot.value)
    }

    pub fn set(&mut self, metric: MetricId, value: PropertyValue) -> Result<(), StoreError> {
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| slot.descriptor.metric == metric)
            .ok_or(StoreError::UnknownProperty(metric))?;

        if slot.descriptor.kind != value.kind() {
            return Err(StoreError::KindMismatch {
                metric,
                expected: slot.descriptor.kind,
                actual: value.kind(),
            });
        }

        slot.value = Some(value);
        slot.pending = true;
        self.writes = self.writes.saturating_add(1);
        Ok(())
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &PropertyDescriptor> {
        self.slots.iter().map(|slot| &slot.descriptor)
    }

    pub fn values(&self) -> impl Iterator<Item = (MetricId, Option<PropertyValue>)> + '_ {
        self.slots
            .iter()
            .map(|slot| (slot.descriptor.metric, slot.value))
    }

    /// Total number of successful `set` calls since construction.
    pub fn writes(&self) -> u64 {
        self.writes
    }

    /// Properties written since the previous call, in device order.
    pub fn take_pending(&mut self) -> Vec<MetricId> {
        self.slots
            .iter_mut()
            .filter(|slot| slot.pending)
            .map(|slot| {
                slot.pending = false;
                slot.descriptor.metric
            })
            .collect()
    }

    fn slot(&self, metric: MetricId) -> Result<&PropertySlot, StoreError> {
        self.slots
            .iter()
            .find(|slot| slot.descriptor.metric == metric)
            .ok_or(StoreError::UnknownProperty(metric))
    }
}

#[derive(Debug, Clone)]
pub struct Device {
    pub id: &'static str,
    pub title: String,
    pub types: Vec<&'static str>,
    pub properties: PropertyStore,
}

impl Device {
    pub fn description(&self, base_href: &str) -> ThingDescription {
        let base_href = base_href.trim_end_matches('/');
        let properties = self
            .properties
            .descriptors()
            .map(|descriptor| {
                let name = descriptor.name();
                let href = format!("{base_href}/things/{}/properties/{name}", self.id);
                (
                    name.to_string(),
                    PropertyDescription {
                        title: descriptor.title,
                        description: descriptor.description,
                        semantic_type: descriptor.semantic_type,
                        kind: descriptor.kind.as_str(),
                        read_only: descriptor.read_only,
                        unit: descriptor.unit,
                        minimum: descriptor.minimum,
                        maximum: descriptor.maximum,
                        links: vec![Link { href }],
                    },
                )
            })
            .collect();

        ThingDescription {
            context: THING_CONTEXT,
            id: format!("{base_href}/things/{}", self.id),
            title: self.title.clone(),
            types: self.types.clone(),
            properties,
        }
    }

    /// Read response for one property: `{"<name>": value}` or `null` before
    /// the first sample.
    pub fn property_json(&self, metric: MetricId) -> Result<serde_json::Value, StoreError> {
        let value = self.properties.get(metric)?;
        let mut body = serde_json::Map::new();
        body.insert(metric.property_name().to_string(), value_json(value));
        Ok(serde_json::Value::Object(body))
    }

    pub fn properties_json(&self) -> serde_json::Value {
        let body = self
            .properties
            .values()
            .map(|(metric, value)| (metric.property_name().to_string(), value_json(value)))
            .collect();
        serde_json::Value::Object(body)
    }
}

fn value_json(value: Option<PropertyValue>) -> serde_json::Value {
    match value {
        Some(PropertyValue::Integer(v)) => serde_json::Value::from(v),
        Some(PropertyValue::Real(v)) => serde_json::Number::from_f64(v)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        None => serde_json::Value::Null,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Link {
    pub href: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PropertyDescription {
    pub title: &'static str,
    pub description: &'static str,
    #[serde(rename = "@type")]
    pub semantic_type: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(rename = "readOnly")]
    pub read_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    pub links: Vec<Link>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThingDescription {
    #[serde(rename = "@context")]
    pub context: &'static str,
    pub id: String,
    pub title: String,
    #[serde(rename = "@type")]
    pub types: Vec<&'static str>,
    pub properties: BTreeMap<String, PropertyDescription>,
}

fn density(metric: MetricId, title: &'static str, description: &'static str) -> PropertyDescriptor {
    PropertyDescriptor {
        metric,
        title,
        description,
        semantic_type: "DensityProperty",
        kind: ValueKind::Integer,
        read_only: true,
        unit: Some("micrograms per cubic metre"),
        minimum: None,
        maximum: None,
    }
}

/// The air quality device with its six properties, all unset.
pub fn airq_device(title: impl Into<String>) -> Device {
    let descriptors = vec![
        density(MetricId::Pm1_0, "PM 1.0", "Level of PM1.0 particles"),
        density(MetricId::Pm2_5, "PM 2.5", "Level of PM2.5 particles"),
        density(MetricId::Pm10, "PM 10", "Level of PM10 particles"),
        PropertyDescriptor {
            metric: MetricId::Temperature,
            title: "Temperature",
            description: "Temperature",
            semantic_type: "TemperatureProperty",
            kind: ValueKind::Real,
            read_only: true,
            unit: Some("degree celsius"),
            minimum: None,
            maximum: None,
        },
        PropertyDescriptor {
            metric: MetricId::Humidity,
            title: "Humidity",
            description: "Humidity",
            semantic_type: "LevelProperty",
            kind: ValueKind::Real,
            read_only: true,
            unit: Some("percent"),
            minimum: Some(0.0),
            maximum: Some(100.0),
        },
        PropertyDescriptor {
            metric: MetricId::Pressure,
            title: "Pressure",
            description: "Pressure",
            semantic_type: "BarometricPressureProperty",
            kind: ValueKind::Real,
            read_only: true,
            unit: Some("hPa"),
            minimum: None,
            maximum: None,
        },
    ];

    Device {
        id: DEVICE_ID,
        title: title.into(),
        types: vec![DEVICE_TYPE],
        properties: PropertyStore::new(descriptors),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn fresh_device_has_no_values() {
        let device = airq_device("esp-airq-thing-1");
        let values: Vec<_> = device.properties.values().collect();

        assert_eq!(values.len(), 6);
        assert!(values.iter().all(|(_, value)| value.is_none()));
        assert_eq!(device.properties.writes(), 0);
    }

    #[test]
    fn properties_keep_attachment_order() {
        let device = airq_device("t");
        let metrics: Vec<_> = device.properties.descriptors().map(|d| d.metric).collect();
        assert_eq!(metrics, MetricId::ALL.to_vec());
    }

    #[test]
    fn set_overwrites_unconditionally() {
        let mut store = airq_device("t").properties;
        store.set(MetricId::Pm2_5, PropertyValue::Integer(9)).unwrap();
        store.set(MetricId::Pm2_5, PropertyValue::Integer(9)).unwrap();

        assert_eq!(store.get(MetricId::Pm2_5), Ok(Some(PropertyValue::Integer(9))));
        assert_eq!(store.writes(), 2);
    }

    #[test]
    fn set_rejects_wrong_kind() {
        let mut store = airq_device("t").properties;
        let err = store
            .set(MetricId::Humidity, PropertyValue::Integer(40))
            .unwrap_err();

        assert_eq!(
            err,
            StoreError::KindMismatch {
                metric: MetricId::Humidity,
                expected: ValueKind::Real,
                actual: ValueKind::Integer,
            }
        );
        assert_eq!(store.get(MetricId::Humidity), Ok(None));
    }

    #[test]
    fn bounds_are_not_enforced() {
        let mut store = airq_device("t").properties;
        store.set(MetricId::Humidity, PropertyValue::Real(140.0)).unwrap();
        assert_eq!(store.get(MetricId::Humidity), Ok(Some(PropertyValue::Real(140.0))));
    }

    #[test]
    fn pending_is_drained_once() {
        let mut store = airq_device("t").properties;
        store.set(MetricId::Pressure, PropertyValue::Real(1012.5)).unwrap();
        store.set(MetricId::Pm1_0, PropertyValue::Integer(5)).unwrap();

        assert_eq!(store.take_pending(), vec![MetricId::Pm1_0, MetricId::Pressure]);
        assert!(store.take_pending().is_empty());
    }

    #[test]
    fn description_lists_every_property() {
        let device = airq_device("esp-airq-thing-1");
        let description = serde_json::to_value(device.description("http://10.0.0.5/")).unwrap();

        assert_eq!(description["@type"], serde_json::json!(["AirQualitySensor"]));
        assert_eq!(description["id"], "http://10.0.0.5/things/airq");
        assert_eq!(description["properties"].as_object().unwrap().len(), 6);
        assert_eq!(description["properties"]["Humidity"]["maximum"], 100.0);
        assert_eq!(description["properties"]["PM2.5"]["type"], "integer");
        assert_eq!(description["properties"]["Pressure"]["unit"], "hPa");
        assert_eq!(
            description["properties"]["PM10"]["links"][0]["href"],
            "http://10.0.0.5/things/airq/properties/PM10"
        );
        assert!(description["properties"]["Temperature"].get("minimum").is_none());
    }

    #[test]
    fn property_json_reports_null_before_first_sample() {
        let mut device = airq_device("t");
        assert_eq!(
            device.property_json(MetricId::Temperature).unwrap(),
            serde_json::json!({ "Temperature": null })
        );

        device
            .properties
            .set(MetricId::Temperature, PropertyValue::Real(21.5))
            .unwrap();
        assert_eq!(
            device.property_json(MetricId::Temperature).unwrap(),
            serde_json::json!({ "Temperature": 21.5 })
        );
    }
}
