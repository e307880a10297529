use crate::types::MetricId;

pub const TOPIC_PREFIX: &str = "airq";

pub fn status_topic(device_name: &str) -> String {
    format!("{TOPIC_PREFIX}/{device_name}/status")
}

pub fn property_topic(device_name: &str, metric: MetricId) -> String {
    format!("{TOPIC_PREFIX}/{device_name}/properties/{}", metric.property_name())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_embed_device_and_property_names() {
        assert_eq!(status_topic("esp-airq-thing-1"), "airq/esp-airq-thing-1/status");
        assert_eq!(
            property_topic("esp-airq-thing-1", MetricId::Pm2_5),
            "airq/esp-airq-thing-1/properties/PM2.5"
        );
    }
}
