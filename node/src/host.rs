use std::{
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    sync::{mpsc, Arc, PoisonError, RwLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{debug, info, trace, warn};

use airq_common::{
    airq_device, bootstrap, pms::FRAME_LEN, property_topic, sensor::altitude_m, status_topic,
    update::url_authority, validate_update_url, Clock, Delay, Device, EnvironmentalReading,
    Indicator, MetricId, NetworkLink, NodeConfig, PmsFrameDecoder, PropertyServer, SensorError,
    SensorNode, SensorSnapshot, SensorSource, ServerError, UpdateError, UpdateTransport,
    WifiCredentials,
};

const DEFAULT_HTTP_PORT: u16 = 8080;
const ANNOUNCE_EVERY_TICKS: u32 = 12;
const UPDATE_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct Published {
    description: Option<serde_json::Value>,
    properties: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Default, Clone, Serialize)]
struct UpdateStatus {
    #[serde(rename = "inProgress")]
    in_progress: bool,
    #[serde(rename = "lastSourceUrl")]
    last_source_url: Option<String>,
    #[serde(rename = "lastError")]
    last_error: Option<String>,
    #[serde(rename = "lastCompletedEpoch")]
    last_completed_epoch: Option<i64>,
}

#[derive(Clone)]
struct HttpState {
    published: Arc<RwLock<Published>>,
    update_status: Arc<RwLock<UpdateStatus>>,
    update_requests: mpsc::Sender<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct UpdateRequest {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Serialize)]
struct UpdateAccepted {
    accepted: bool,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = host_config();
    let chip_id = std::env::var("AIRQ_CHIP_ID").unwrap_or_else(|_| "host".to_string());
    let device_name = config.device_name(&chip_id);

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);

    let mut mqtt_options = MqttOptions::new(device_name.clone(), mqtt_host, mqtt_port);

    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }

    let (mqtt, mut eventloop) = AsyncClient::new(mqtt_options, 32);

    tokio::spawn(async move {
        loop {
            if let Err(err) = eventloop.poll().await {
                warn!("node mqtt poll error: {err}");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    });

    let published = Arc::new(RwLock::new(Published::default()));
    let update_status = Arc::new(RwLock::new(UpdateStatus::default()));
    let (update_tx, update_rx) = mpsc::channel::<String>();

    let http_port = std::env::var("AIRQ_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(DEFAULT_HTTP_PORT);
    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], http_port)))
        .await
        .with_context(|| format!("failed to bind property server on port {http_port}"))?;

    let app = router(HttpState {
        published: published.clone(),
        update_status: update_status.clone(),
        update_requests: update_tx,
    });
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            warn!("property server stopped: {err}");
        }
    });

    let advertised_host =
        std::env::var("AIRQ_ADVERTISED_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let server = HostServer {
        device_name: device_name.clone(),
        base_href: format!("http://{advertised_host}:{http_port}"),
        published,
        mqtt,
        ticks_since_announce: 0,
    };

    info!("node `{device_name}` starting (http port {http_port})");

    tokio::task::spawn_blocking(move || {
        run_node(config, device_name, server, update_rx, update_status)
    })
    .await
    .context("node loop panicked")?
}

fn host_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    if let Some(period) = std::env::var("AIRQ_SAMPLE_PERIOD_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        config.sample_period_ms = period;
    }
    if let Ok(url) = std::env::var("AIRQ_OTA_URL") {
        config.update.url = url;
    }
    config.sanitize();
    config
}

fn run_node(
    config: NodeConfig,
    device_name: String,
    server: HostServer,
    mut update_requests: mpsc::Receiver<String>,
    update_status: Arc<RwLock<UpdateStatus>>,
) -> anyhow::Result<()> {
    let clock = MonotonicClock::new();
    let mut indicator = LogIndicator;
    let mut delay = ThreadDelay;

    let init_failures = std::env::var("AIRQ_SIM_SENSOR_INIT_FAILURES")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(0);
    let mut environmental = SimulatedEnvironment::new(init_failures, config.sea_level_pressure_hpa);
    airq_common::wait_for_sensor(
        &mut environmental,
        &mut indicator,
        &mut delay,
        config.bootstrap.sensor_init_poll_ms,
    );

    let mut link = SimulatedLink::from_env();
    let state = bootstrap(
        &device_name,
        config.bootstrap.clone(),
        &mut link,
        &mut indicator,
        &mut delay,
    );

    let mut node = SensorNode::new(
        &config,
        airq_device(device_name.as_str()),
        SimulatedParticulate::default(),
        environmental,
        server,
    );
    node.start(state, clock.now_ms())
        .context("failed to start property server")?;

    let mut transport = HostUpdateTransport {
        status: update_status,
    };
    node.run(
        &clock,
        &mut update_requests,
        &mut transport,
        &mut indicator,
        &mut delay,
    )
}

fn router(state: HttpState) -> Router {
    Router::new()
        .route("/things", get(list_things))
        .route("/things/{id}", get(get_thing))
        .route("/things/{id}/properties", get(get_properties))
        .route("/things/{id}/properties/{name}", get(get_property))
        .route("/api/update", post(request_update))
        .route("/api/update/status", get(get_update_status))
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

async fn list_things(State(state): State<HttpState>) -> Response {
    let published = state.published.read().unwrap_or_else(PoisonError::into_inner);
    match &published.description {
        Some(description) => Json(vec![description.clone()]).into_response(),
        None => error_response(StatusCode::SERVICE_UNAVAILABLE, "device not started"),
    }
}

async fn get_thing(State(state): State<HttpState>, Path(id): Path<String>) -> Response {
    if id != airq_common::thing::DEVICE_ID {
        return error_response(StatusCode::NOT_FOUND, format!("unknown thing `{id}`"));
    }
    let published = state.published.read().unwrap_or_else(PoisonError::into_inner);
    match &published.description {
        Some(description) => Json(description.clone()).into_response(),
        None => error_response(StatusCode::SERVICE_UNAVAILABLE, "device not started"),
    }
}

async fn get_properties(State(state): State<HttpState>, Path(id): Path<String>) -> Response {
    if id != airq_common::thing::DEVICE_ID {
        return error_response(StatusCode::NOT_FOUND, format!("unknown thing `{id}`"));
    }
    let published = state.published.read().unwrap_or_else(PoisonError::into_inner);
    if published.description.is_none() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "device not started");
    }
    Json(published.properties.clone()).into_response()
}

async fn get_property(
    State(state): State<HttpState>,
    Path((id, name)): Path<(String, String)>,
) -> Response {
    if id != airq_common::thing::DEVICE_ID {
        return error_response(StatusCode::NOT_FOUND, format!("unknown thing `{id}`"));
    }
    let published = state.published.read().unwrap_or_else(PoisonError::into_inner);
    match published.properties.get(&name) {
        Some(value) => {
            let mut body = serde_json::Map::new();
            body.insert(name, value.clone());
            Json(body).into_response()
        }
        None => error_response(StatusCode::NOT_FOUND, format!("unknown property `{name}`")),
    }
}

async fn request_update(
    State(state): State<HttpState>,
    Json(request): Json<UpdateRequest>,
) -> Response {
    let url = request.url.unwrap_or_default();
    if !url.trim().is_empty() {
        if let Err(err) = validate_update_url(&url) {
            return error_response(StatusCode::BAD_REQUEST, err.to_string());
        }
    }

    if state
        .update_status
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .in_progress
    {
        return error_response(StatusCode::CONFLICT, "update already in progress");
    }

    if state.update_requests.send(url).is_err() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "node loop is not running");
    }

    (StatusCode::ACCEPTED, Json(UpdateAccepted { accepted: true })).into_response()
}

async fn get_update_status(State(state): State<HttpState>) -> impl IntoResponse {
    let status = state
        .update_status
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    Json(status)
}

/// Serves the last flushed values over HTTP and mirrors every change to
/// retained MQTT topics.
struct HostServer {
    device_name: String,
    base_href: String,
    published: Arc<RwLock<Published>>,
    mqtt: AsyncClient,
    ticks_since_announce: u32,
}

impl HostServer {
    fn announce(&mut self) -> Result<(), ServerError> {
        self.ticks_since_announce = 0;
        self.mqtt
            .try_publish(
                status_topic(&self.device_name),
                QoS::AtLeastOnce,
                true,
                "online",
            )
            .map_err(|err| ServerError::Discovery(err.to_string()))
    }
}

impl PropertyServer for HostServer {
    fn start(&mut self, device: &Device) -> Result<(), ServerError> {
        let description = serde_json::to_value(device.description(&self.base_href))
            .map_err(|err| ServerError::Discovery(err.to_string()))?;
        let properties = match device.properties_json() {
            serde_json::Value::Object(properties) => properties,
            _ => serde_json::Map::new(),
        };

        {
            let mut published = self.published.write().unwrap_or_else(PoisonError::into_inner);
            published.description = Some(description);
            published.properties = properties;
        }

        info!("thing description available at {}/things/{}", self.base_href, device.id);
        self.announce()
    }

    fn maintain_discovery(&mut self) -> Result<(), ServerError> {
        self.ticks_since_announce += 1;
        if self.ticks_since_announce >= ANNOUNCE_EVERY_TICKS {
            self.announce()?;
        }
        Ok(())
    }

    fn update(&mut self, device: &Device, changed: &[MetricId]) -> Result<(), ServerError> {
        let mut values = Vec::with_capacity(changed.len());
        for &metric in changed {
            let body = device.property_json(metric).map_err(|err| ServerError::Push {
                property: metric.property_name(),
                reason: err.to_string(),
            })?;
            values.push((metric, body[metric.property_name()].clone()));
        }

        {
            let mut published = self.published.write().unwrap_or_else(PoisonError::into_inner);
            for (metric, value) in &values {
                published
                    .properties
                    .insert(metric.property_name().to_string(), value.clone());
            }
        }

        let mut first_err = None;
        for (metric, value) in values {
            let result = self.mqtt.try_publish(
                property_topic(&self.device_name, metric),
                QoS::AtLeastOnce,
                true,
                value.to_string(),
            );
            if let Err(err) = result {
                first_err.get_or_insert(ServerError::Push {
                    property: metric.property_name(),
                    reason: err.to_string(),
                });
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Stands in for the radio: credentials come from `AIRQ_WIFI_SSID` and
/// `AIRQ_WIFI_PASS`. Without valid ones the node provisions itself after a
/// few polls.
struct SimulatedLink {
    ssid: Option<String>,
    provisioning_polls: u32,
    join_polls: u32,
}

impl SimulatedLink {
    fn from_env() -> Self {
        let polls = |key: &str, default: u32| {
            std::env::var(key)
                .ok()
                .and_then(|value| value.parse::<u32>().ok())
                .unwrap_or(default)
        };
        let ssid = std::env::var("AIRQ_WIFI_SSID").ok().and_then(|ssid| {
            let pass = std::env::var("AIRQ_WIFI_PASS").unwrap_or_default();
            match WifiCredentials::new(&ssid, &pass) {
                Ok(credentials) => Some(credentials.ssid),
                Err(err) => {
                    warn!("ignoring AIRQ_WIFI_SSID: {err}");
                    None
                }
            }
        });
        Self {
            ssid,
            provisioning_polls: polls("AIRQ_SIM_PROVISIONING_POLLS", 3),
            join_polls: polls("AIRQ_SIM_JOIN_POLLS", 2),
        }
    }
}

impl NetworkLink for SimulatedLink {
    fn set_hostname(&mut self, name: &str) {
        debug!("hostname set to `{name}`");
    }

    fn has_credentials(&mut self) -> bool {
        self.ssid.is_some()
    }

    fn begin_provisioning(&mut self) {
        info!(
            "simulated provisioning started; completes after {} poll(s)",
            self.provisioning_polls
        );
    }

    fn provisioning_complete(&mut self) -> bool {
        if self.provisioning_polls > 0 {
            self.provisioning_polls -= 1;
            return false;
        }
        self.ssid.get_or_insert_with(|| "simulated".to_string());
        true
    }

    fn stop_provisioning(&mut self) {}

    fn begin_join(&mut self) -> bool {
        info!("joining `{}`", self.ssid.as_deref().unwrap_or_default());
        self.ssid.is_some()
    }

    fn is_joined(&mut self) -> bool {
        if self.join_polls > 0 {
            self.join_polls -= 1;
            return false;
        }
        true
    }

    fn enable_auto_reconnect(&mut self) {}
}

struct LogIndicator;

impl Indicator for LogIndicator {
    fn set(&mut self, on: bool) {
        trace!("indicator {}", if on { "on" } else { "off" });
    }
}

struct ThreadDelay;

impl Delay for ThreadDelay {
    fn delay_ms(&mut self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }
}

struct MonotonicClock {
    started: Instant,
}

impl MonotonicClock {
    fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Emits synthetic PMS frames and decodes them like the UART path does.
/// Every eleventh read times out.
#[derive(Default)]
struct SimulatedParticulate {
    tick: u64,
    decoder: PmsFrameDecoder,
}

impl SensorSource for SimulatedParticulate {
    fn name(&self) -> &'static str {
        "particulate"
    }

    fn sample(&mut self) -> Result<SensorSnapshot, SensorError> {
        self.tick = self.tick.saturating_add(1);
        if self.tick % 11 == 0 {
            return Err(SensorError::Timeout);
        }

        let pm2_5 = 8 + (self.tick % 5) as u16;
        let frame = encode_frame(pm2_5 / 2, pm2_5, pm2_5 + 3);
        self.decoder.reset();
        self.decoder
            .decode(&frame)
            .unwrap_or(Err(SensorError::Timeout))
            .map(SensorSnapshot::Particulate)
    }
}

fn encode_frame(pm1_0: u16, pm2_5: u16, pm10: u16) -> [u8; FRAME_LEN] {
    let mut frame = [0_u8; FRAME_LEN];
    frame[0] = 0x42;
    frame[1] = 0x4D;
    frame[2..4].copy_from_slice(&28_u16.to_be_bytes());
    for (word, value) in [pm1_0, pm2_5, pm10, pm1_0, pm2_5, pm10].into_iter().enumerate() {
        frame[4 + word * 2..6 + word * 2].copy_from_slice(&value.to_be_bytes());
    }
    let sum = frame[..30]
        .iter()
        .fold(0_u16, |sum, &byte| sum.wrapping_add(u16::from(byte)));
    frame[30..].copy_from_slice(&sum.to_be_bytes());
    frame
}

struct SimulatedEnvironment {
    tick: u64,
    init_failures: u32,
    sea_level_hpa: f32,
}

impl SimulatedEnvironment {
    fn new(init_failures: u32, sea_level_hpa: f32) -> Self {
        Self {
            tick: 0,
            init_failures,
            sea_level_hpa,
        }
    }
}

impl SensorSource for SimulatedEnvironment {
    fn name(&self) -> &'static str {
        "environmental"
    }

    fn init(&mut self) -> Result<(), SensorError> {
        if self.init_failures > 0 {
            self.init_failures -= 1;
            return Err(SensorError::NotResponding);
        }
        Ok(())
    }

    fn sample(&mut self) -> Result<SensorSnapshot, SensorError> {
        self.tick = self.tick.saturating_add(1);

        let reading = EnvironmentalReading {
            temperature_c: 21.0 + ((self.tick % 8) as f32 * 0.1),
            humidity_pct: 40.0 + ((self.tick % 6) as f32 * 0.5),
            pressure_pa: 101_250.0 + ((self.tick % 4) as f32 * 10.0),
        };
        trace!(
            "simulated altitude {:.1} m",
            altitude_m(reading.pressure_pa / 100.0, self.sea_level_hpa)
        );
        Ok(SensorSnapshot::Environmental(reading))
    }
}

/// Checks that the image host is reachable; the host build has no flash to
/// write to, so a reachable host still ends in a flash error.
struct HostUpdateTransport {
    status: Arc<RwLock<UpdateStatus>>,
}

impl HostUpdateTransport {
    fn fetch(url: &str) -> Result<(), UpdateError> {
        validate_update_url(url)?;

        let url = url.trim();
        let authority = url_authority(url);
        let target = if authority.contains(':') {
            authority.to_string()
        } else if url.starts_with("https://") {
            format!("{authority}:443")
        } else {
            format!("{authority}:80")
        };

        let addr = target
            .to_socket_addrs()
            .map_err(|err| UpdateError::Unreachable(format!("{authority}: {err}")))?
            .next()
            .ok_or_else(|| UpdateError::Unreachable(format!("{authority}: no address")))?;
        TcpStream::connect_timeout(&addr, UPDATE_CONNECT_TIMEOUT)
            .map_err(|err| UpdateError::Unreachable(format!("{addr}: {err}")))?;

        Err(UpdateError::Flash("host build has no OTA partition".to_string()))
    }
}

impl UpdateTransport for HostUpdateTransport {
    fn update(&mut self, url: &str) -> Result<(), UpdateError> {
        {
            let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
            status.in_progress = true;
            status.last_source_url = Some(url.to_string());
            status.last_error = None;
        }

        let result = Self::fetch(url);

        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        status.in_progress = false;
        status.last_error = result.as_ref().err().map(ToString::to_string);
        status.last_completed_epoch = Some(chrono::Utc::now().timestamp());
        result
    }
}
