//! Deterministic doubles for the hardware and network seams.

use std::{cell::Cell, collections::VecDeque, rc::Rc};

use crate::{
    bootstrap::NetworkLink,
    error::{SensorError, ServerError, UpdateError},
    indicator::{Delay, Indicator},
    node::PropertyServer,
    scheduler::Clock,
    sensor::{SensorSnapshot, SensorSource},
    thing::Device,
    types::MetricId,
    update::UpdateTransport,
};

#[derive(Debug, Default)]
pub struct RecordingIndicator {
    pub levels: Vec<bool>,
}

impl Indicator for RecordingIndicator {
    fn set(&mut self, on: bool) {
        self.levels.push(on);
    }
}

#[derive(Debug, Default)]
pub struct VirtualDelay {
    pub calls: Vec<u64>,
}

impl VirtualDelay {
    pub fn total_ms(&self) -> u64 {
        self.calls.iter().sum()
    }
}

impl Delay for VirtualDelay {
    fn delay_ms(&mut self, ms: u64) {
        self.calls.push(ms);
    }
}

/// Shared virtual clock: delays advance it, clones observe the same time.
#[derive(Debug, Clone, Default)]
pub struct VirtualTime {
    now: Rc<Cell<u64>>,
}

impl Clock for VirtualTime {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }
}

impl Delay for VirtualTime {
    fn delay_ms(&mut self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }
}

pub struct ScriptedSource {
    name: &'static str,
    samples: VecDeque<Result<SensorSnapshot, SensorError>>,
    init_failures: u32,
}

impl ScriptedSource {
    pub fn particulate(samples: Vec<Result<SensorSnapshot, SensorError>>) -> Self {
        Self {
            name: "particulate",
            samples: samples.into(),
            init_failures: 0,
        }
    }

    pub fn environmental(samples: Vec<Result<SensorSnapshot, SensorError>>) -> Self {
        Self {
            name: "environmental",
            samples: samples.into(),
            init_failures: 0,
        }
    }

    pub fn failing_init(mut self, times: u32) -> Self {
        self.init_failures = times;
        self
    }
}

impl SensorSource for ScriptedSource {
    fn name(&self) -> &'static str {
        self.name
    }

    fn init(&mut self) -> Result<(), SensorError> {
        if self.init_failures > 0 {
            self.init_failures -= 1;
            return Err(SensorError::NotResponding);
        }
        Ok(())
    }

    fn sample(&mut self) -> Result<SensorSnapshot, SensorError> {
        self.samples.pop_front().unwrap_or(Err(SensorError::Timeout))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCall {
    SetHostname(String),
    BeginProvisioning,
    StopProvisioning,
    BeginJoin,
    EnableAutoReconnect,
}

/// Network link that completes provisioning and joining after a fixed
/// number of unsuccessful polls.
#[derive(Debug)]
pub struct ScriptedLink {
    credentials: bool,
    provisioning_polls_left: u32,
    join_polls_left: u32,
    rejected_joins_left: u32,
    pub calls: Vec<LinkCall>,
}

impl ScriptedLink {
    pub fn new(credentials: bool, provisioning_polls: u32, join_polls: u32) -> Self {
        Self {
            credentials,
            provisioning_polls_left: provisioning_polls,
            join_polls_left: join_polls,
            rejected_joins_left: 0,
            calls: Vec::new(),
        }
    }

    /// Refuse the first `times` join requests.
    pub fn rejecting_joins(mut self, times: u32) -> Self {
        self.rejected_joins_left = times;
        self
    }
}

impl NetworkLink for ScriptedLink {
    fn set_hostname(&mut self, name: &str) {
        self.calls.push(LinkCall::SetHostname(name.to_string()));
    }

    fn has_credentials(&mut self) -> bool {
        self.credentials
    }

    fn begin_provisioning(&mut self) {
        self.calls.push(LinkCall::BeginProvisioning);
    }

    fn provisioning_complete(&mut self) -> bool {
        if self.provisioning_polls_left == 0 {
            self.credentials = true;
            return true;
        }
        self.provisioning_polls_left -= 1;
        false
    }

    fn stop_provisioning(&mut self) {
        self.calls.push(LinkCall::StopProvisioning);
    }

    fn begin_join(&mut self) -> bool {
        self.calls.push(LinkCall::BeginJoin);
        if self.rejected_joins_left > 0 {
            self.rejected_joins_left -= 1;
            return false;
        }
        true
    }

    fn is_joined(&mut self) -> bool {
        if self.join_polls_left == 0 {
            return true;
        }
        self.join_polls_left -= 1;
        false
    }

    fn enable_auto_reconnect(&mut self) {
        self.calls.push(LinkCall::EnableAutoReconnect);
    }
}

#[derive(Debug, Default)]
pub struct RecordingServer {
    pub started: Option<String>,
    pub discovery_calls: u32,
    pub flushes: Vec<Vec<MetricId>>,
    pub fail_updates: bool,
}

impl PropertyServer for RecordingServer {
    fn start(&mut self, device: &Device) -> Result<(), ServerError> {
        self.started = Some(device.title.clone());
        Ok(())
    }

    fn maintain_discovery(&mut self) -> Result<(), ServerError> {
        self.discovery_calls += 1;
        Ok(())
    }

    fn update(&mut self, _device: &Device, changed: &[MetricId]) -> Result<(), ServerError> {
        self.flushes.push(changed.to_vec());
        if self.fail_updates {
            return Err(ServerError::Push {
                property: "*",
                reason: "client gone".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ScriptedTransport {
    result: Result<(), UpdateError>,
    pub requests: Vec<String>,
}

impl ScriptedTransport {
    pub fn failing(err: UpdateError) -> Self {
        Self {
            result: Err(err),
            requests: Vec::new(),
        }
    }

    pub fn succeeding() -> Self {
        Self {
            result: Ok(()),
            requests: Vec::new(),
        }
    }
}

impl UpdateTransport for ScriptedTransport {
    fn update(&mut self, url: &str) -> Result<(), UpdateError> {
        self.requests.push(url.to_string());
        self.result.clone()
    }
}
