pub mod bootstrap;
pub mod config;
pub mod credentials;
pub mod error;
pub mod image;
pub mod indicator;
pub mod node;
pub mod pms;
pub mod publisher;
pub mod scheduler;
pub mod sensor;
pub mod thing;
pub mod topics;
pub mod types;
pub mod update;

#[cfg(test)]
mod testing;

pub use bootstrap::{bootstrap, ConnectivityBootstrapper, NetworkLink};
pub use config::{BootstrapTiming, NodeConfig, PinConfig, UpdateConfig};
pub use credentials::WifiCredentials;
pub use error::{CredentialError, SensorError, ServerError, StartError, StoreError, UpdateError};
pub use image::{stream_image, ImageSummary};
pub use indicator::{blink, Delay, Heartbeat, Indicator};
pub use node::{NoUpdates, PropertyServer, SensorNode, UpdateTrigger};
pub use pms::PmsFrameDecoder;
pub use publisher::{publish_cycle, CycleReport};
pub use scheduler::{Clock, SamplingScheduler};
pub use sensor::{
    wait_for_sensor, EnvironmentalReading, ParticulateReading, SensorSnapshot, SensorSource,
};
pub use thing::{airq_device, Device, PropertyDescriptor, PropertyStore};
pub use topics::*;
pub use types::{ConnectionState, MetricId, PropertyValue, UpdateOutcome, ValueKind};
pub use update::{validate_update_url, RemoteUpdateController, UpdateTransport};
