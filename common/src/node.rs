use std::sync::mpsc::{Receiver, TryRecvError};

use log::{debug, info, warn};

use crate::{
    config::NodeConfig,
    error::{ServerError, StartError},
    indicator::{Delay, Indicator},
    publisher::{publish_cycle, CycleReport},
    scheduler::{Clock, SamplingScheduler},
    sensor::SensorSource,
    thing::Device,
    types::{ConnectionState, MetricId, UpdateOutcome},
    update::{RemoteUpdateController, UpdateTransport},
};

/// The property-protocol server as seen from the sampling loop.
pub trait PropertyServer {
    /// Start serving `device` and announce it on the network.
    fn start(&mut self, device: &Device) -> Result<(), ServerError>;

    fn maintain_discovery(&mut self) -> Result<(), ServerError>;

    /// Push the properties in `changed` to connected clients.
    fn update(&mut self, device: &Device, changed: &[MetricId]) -> Result<(), ServerError>;
}

/// Source of on-demand update requests. An empty url means "use the
/// configured default".
pub trait UpdateTrigger {
    fn poll_request(&mut self) -> Option<String>;
}

impl UpdateTrigger for Receiver<String> {
    fn poll_request(&mut self) -> Option<String> {
        match self.try_recv() {
            Ok(url) => Some(url),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoUpdates;

impl UpdateTrigger for NoUpdates {
    fn poll_request(&mut self) -> Option<String> {
        None
    }
}

/// Context object owning everything the sampling loop touches: the device
/// and its property store, both sensor sources, the protocol server and the
/// scheduler.
pub struct SensorNode<P, E, S> {
    device: Device,
    particulate: P,
    environmental: E,
    server: S,
    scheduler: SamplingScheduler,
    updater: RemoteUpdateController,
    idle_poll_ms: u64,
    last_update: Option<UpdateOutcome>,
}

impl<P, E, S> SensorNode<P, E, S>
where
    P: SensorSource,
    E: SensorSource,
    S: PropertyServer,
{
    pub fn new(
        config: &NodeConfig,
        device: Device,
        particulate: P,
        environmental: E,
        server: S,
    ) -> Self {
        Self {
            device,
            particulate,
            environmental,
            server,
            scheduler: SamplingScheduler::new(config.sample_period_ms),
            updater: RemoteUpdateController::new(config.update.clone()),
            idle_poll_ms: config.idle_poll_ms,
            last_update: None,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn server(&self) -> &S {
        &self.server
    }

    pub fn scheduler(&self) -> &SamplingScheduler {
        &self.scheduler
    }

    pub fn last_update(&self) -> Option<UpdateOutcome> {
        self.last_update
    }

    /// Start the protocol server and arm the scheduler. Only allowed once
    /// the bootstrapper has reached `Joined`.
    pub fn start(&mut self, connection: ConnectionState, now_ms: u64) -> Result<(), StartError> {
        if connection != ConnectionState::Joined {
            return Err(StartError::NotJoined(connection));
        }

        self.server.start(&self.device)?;
        self.scheduler.start(now_ms);
        info!(
            "serving `{}`; sampling every {} ms",
            self.device.title,
            self.scheduler.period_ms()
        );
        Ok(())
    }

    /// One sampling tick: discovery upkeep, a publish cycle, then a flush of
    /// whatever changed.
    pub fn tick(&mut self) -> CycleReport {
        if let Err(err) = self.server.maintain_discovery() {
            warn!("{err}");
        }

        let report = publish_cycle(
            &mut self.device.properties,
            &mut [&mut self.particulate, &mut self.environmental],
        );

        let changed = self.device.properties.take_pending();
        if let Err(err) = self.server.update(&self.device, &changed) {
            warn!("{err}");
        }

        if !report.is_quiet() {
            debug!(
                "published {:?}",
                report
                    .published
                    .iter()
                    .map(|metric| metric.property_name())
                    .collect::<Vec<_>>()
            );
        }
        report
    }

    /// Blocking update attempt. Sampling is suspended for its duration
    /// because nothing else runs until it returns.
    pub fn attempt_update<T, I, D>(
        &mut self,
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
        let url = if url.trim().is_empty() {
            self.updater.default_url().to_string()
        } else {
            url.trim().to_string()
        };

        let outcome = self.updater.attempt_update(&url, transport, indicator, delay);
        self.last_update = Some(outcome);
        outcome
    }

    /// One pass of the idle loop without sleeping: serve at most one update
    /// request, then run a tick if one is due.
    pub fn poll<C, U, T, I, D>(
        &mut self,
        clock: &C,
        trigger: &mut U,
        transport: &mut T,
        indicator: &mut I,
        delay: &mut D,
    ) -> Option<CycleReport>
    where
        C: Clock + ?Sized,
        U: UpdateTrigger + ?Sized,
        T: UpdateTransport + ?Sized,
        I: Indicator,
        D: Delay,
    {
        if let Some(url) = trigger.poll_request() {
            self.attempt_update(&url, transport, indicator, delay);
        }

        if self.scheduler.poll(clock.now_ms()) {
            Some(self.tick())
        } else {
            None
        }
    }

    pub fn run<C, U, T, I, D>(
        &mut self,
        clock: &C,
        trigger: &mut U,
        transport: &mut T,
        indicator: &mut I,
        delay: &mut D,
    ) -> !
    where
        C: Clock + ?Sized,
        U: UpdateTrigger + ?Sized,
        T: UpdateTransport + ?Sized,
        I: Indicator,
        D: Delay,
    {
        loop {
            self.poll(clock, trigger, transport, indicator, delay);
            delay.delay_ms(self.idle_poll_ms);
        }
    }
}
