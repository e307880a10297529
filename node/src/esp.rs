use std::{
    sync::{mpsc, Arc, Mutex, PoisonError},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use bme280::i2c::BME280;
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::{Read, Write},
    mqtt::client::QoS,
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::{Ets, FreeRtos, TickType},
    gpio::{AnyIOPin, AnyOutputPin, Output, PinDriver},
    i2c::{I2cConfig, I2cDriver, I2C0},
    uart::{config::Config as UartConfig, UartDriver, UART1},
    units::Hertz,
};
use esp_idf_svc::{
    eventloop::{EspSubscription, EspSystemEventLoop, System},
    hal::prelude::Peripherals,
    http::{
        client::{Configuration as HttpClientConfiguration, EspHttpConnection},
        server::{Configuration as HttpConfiguration, EspHttpServer},
    },
    log::EspLogger,
    mdns::EspMdns,
    mqtt::client::{EspMqttClient, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    ota::EspOta,
    sys::{esp_err_t, EspError, ESP_ERR_INVALID_STATE, ESP_OK},
    wifi::{EspWifi, WifiEvent},
};
use log::{debug, info, warn};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use airq_common::{
    airq_device, bootstrap, pms::FRAME_LEN, property_topic, sensor::altitude_m, status_topic,
    stream_image, thing::DEVICE_ID, validate_update_url, wait_for_sensor, Clock, Delay, Device,
    EnvironmentalReading, ImageSummary, Indicator, MetricId, NetworkLink, NodeConfig,
    PmsFrameDecoder, PropertyServer, SensorError, SensorNode, SensorSnapshot, SensorSource,
    ServerError, UpdateError, UpdateTransport, WifiCredentials,
};

const NVS_NAMESPACE: &str = "airq";
const NVS_WIFI_KEY: &str = "wifi_json";

const MAX_HTTP_BODY: usize = 4096;
const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(90);
const OTA_HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const UART_READ_SLICE_MS: u64 = 20;
const WEBTHING_PORT: u16 = 80;
const PROPERTY_PREFIX: &str = "/things/airq/properties/";

const PORTAL_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Air Quality Node Setup</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:560px;margin:2rem auto;padding:0 1rem;color:#111}
    label{display:block;margin:.5rem 0 .2rem}
    input{width:100%;padding:.5rem;box-sizing:border-box}
    button{padding:.55rem .9rem;margin-top:.8rem}
    .ok{color:#106010}.err{color:#a00000}
  </style>
</head>
<body>
  <h1>Air Quality Node Setup</h1>
  <label>WiFi SSID</label><input id="wifiSsid" type="text">
  <label>WiFi Password</label><input id="wifiPass" type="password">
  <button id="save">Join Network</button>
  <p id="status"></p>
  <script>
    const q=(id)=>document.getElementById(id);
    q('save').addEventListener('click', async ()=>{
      q('status').className=''; q('status').textContent='Saving...';
      try{
        const r=await fetch('/api/wifi',{method:'PUT',headers:{'content-type':'application/json'},
          body:JSON.stringify({wifiSsid:q('wifiSsid').value.trim(),wifiPass:q('wifiPass').value})});
        let b={}; try{b=await r.json();}catch(_){}
        if(!r.ok) throw new Error(b.error||('Request failed: '+r.status));
        q('status').className='ok'; q('status').textContent='Saved. Joining network...';
      }catch(err){q('status').className='err'; q('status').textContent=err.message;}
    });
  </script>
</body>
</html>
"#;

#[derive(Debug, Deserialize)]
struct WifiCredentialsUpdate {
    #[serde(rename = "wifiSsid")]
    wifi_ssid: String,
    #[serde(rename = "wifiPass", default)]
    wifi_pass: Option<String>,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Default)]
struct Published {
    description: Option<serde_json::Value>,
    properties: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Default, Clone, Serialize)]
struct UpdateStatus {
    #[serde(rename = "inProgress")]
    in_progress: bool,
    #[serde(rename = "bytesWritten")]
    bytes_written: u64,
    #[serde(rename = "totalBytes")]
    total_bytes: Option<u64>,
    #[serde(rename = "lastError")]
    last_error: Option<String>,
    #[serde(rename = "lastSha256")]
    last_sha256: Option<String>,
    #[serde(rename = "lastSourceUrl")]
    last_source_url: Option<String>,
    #[serde(rename = "lastCompletedEpoch")]
    last_completed_epoch: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct UpdateRequest {
    #[serde(default)]
    url: Option<String>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let mut config = NodeConfig::default();
    config.sanitize();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let Peripherals {
        modem, uart1, i2c0, ..
    } = Peripherals::take()?;

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    let watchdog = TaskWatchdog::subscribe(WATCHDOG_TIMEOUT)?;

    let clock = UptimeClock::new();
    let mut delay = WatchdogDelay { watchdog };
    let mut indicator = LedIndicator::new(config.pins.indicator)?;

    let mut environmental =
        Bme280Source::new(i2c0, &config).context("failed to initialize BME280 bus")?;
    wait_for_sensor(
        &mut environmental,
        &mut indicator,
        &mut delay,
        config.bootstrap.sensor_init_poll_ms,
    );

    let particulate = PmsUart::new(uart1, &config).context("failed to initialize PMS uart")?;

    let device_name = config.device_name(chip_id()?);

    let credentials = nvs_store.load_credentials().unwrap_or_else(|err| {
        warn!("failed to load wifi credentials from NVS: {err:#}");
        None
    });
    let wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut link = EspLink {
        wifi,
        sys_loop,
        nvs_store,
        ap_ssid: device_name.clone(),
        ap_password: config.provisioning_password.clone(),
        credentials: Arc::new(Mutex::new(credentials.or_else(compiled_credentials))),
        station: None,
        portal: None,
        reconnect: None,
    };

    let state = bootstrap(
        &device_name,
        config.bootstrap.clone(),
        &mut link,
        &mut indicator,
        &mut delay,
    );
    link.disable_power_save();

    let (update_tx, mut update_rx) = mpsc::channel::<String>();
    let update_status = Arc::new(Mutex::new(UpdateStatus::default()));
    let mqtt = create_mqtt_client(&device_name)?;

    let server = EspPropertyServer {
        device_name: device_name.clone(),
        published: Arc::new(Mutex::new(Published::default())),
        update_status: update_status.clone(),
        update_requests: update_tx,
        http: None,
        mdns: None,
        mqtt,
    };

    let mut node = SensorNode::new(
        &config,
        airq_device(device_name.as_str()),
        particulate,
        environmental,
        server,
    );
    node.start(state, clock.now_ms())
        .context("failed to start property server")?;

    let mut transport = EspOtaTransport {
        watchdog,
        status: update_status,
        expected_sha256: compiled_sha256(),
    };

    node.run(
        &clock,
        &mut update_rx,
        &mut transport,
        &mut indicator,
        &mut delay,
    )
}

struct UptimeClock {
    started: Instant,
}

impl UptimeClock {
    fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Clock for UptimeClock {
    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Task delay that keeps the task watchdog fed.
struct WatchdogDelay {
    watchdog: TaskWatchdog,
}

impl Delay for WatchdogDelay {
    fn delay_ms(&mut self, ms: u64) {
        self.watchdog.feed();
        FreeRtos::delay_ms(ms.min(u64::from(u32::MAX)) as u32);
    }
}

struct LedIndicator {
    pin: PinDriver<'static, AnyOutputPin, Output>,
}

impl LedIndicator {
    fn new(gpio: i32) -> anyhow::Result<Self> {
        // SAFETY: the indicator pin is not claimed by any other driver.
        let pin = unsafe { AnyOutputPin::new(gpio) };
        Ok(Self {
            pin: PinDriver::output(pin)?,
        })
    }
}

impl Indicator for LedIndicator {
    fn set(&mut self, on: bool) {
        let result = if on {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };
        if let Err(err) = result {
            warn!("failed to drive indicator: {err:?}");
        }
    }
}

/// Plantower sensor on UART1, read one frame per sample.
struct PmsUart {
    uart: UartDriver<'static>,
    decoder: PmsFrameDecoder,
    timeout: Duration,
}

impl PmsUart {
    fn new(uart: UART1, config: &NodeConfig) -> anyhow::Result<Self> {
        // SAFETY: the PMS pins are not claimed by any other driver.
        let (tx, rx) = unsafe {
            (
                AnyIOPin::new(config.pins.pms_tx),
                AnyIOPin::new(config.pins.pms_rx),
            )
        };
        let uart_config = UartConfig::default().baudrate(Hertz(config.pins.pms_baud));
        let uart = UartDriver::new(
            uart,
            tx,
            rx,
            Option::<AnyIOPin>::None,
            Option::<AnyIOPin>::None,
            &uart_config,
        )?;
        info!(
            "PMS uart ready (rx GPIO{}, tx GPIO{}, {} baud)",
            config.pins.pms_rx, config.pins.pms_tx, config.pins.pms_baud
        );

        Ok(Self {
            uart,
            decoder: PmsFrameDecoder::default(),
            timeout: Duration::from_millis(config.particulate_timeout_ms),
        })
    }
}

impl SensorSource for PmsUart {
    fn name(&self) -> &'static str {
        "particulate"
    }

    fn sample(&mut self) -> Result<SensorSnapshot, SensorError> {
        // The sensor streams continuously; only a frame started after this
        // call is fresh.
        if let Err(err) = self.uart.clear_rx() {
            debug!("failed to flush PMS rx buffer: {err:?}");
        }
        self.decoder.reset();

        let deadline = Instant::now() + self.timeout;
        let mut buf = [0_u8; FRAME_LEN];
        let mut last_err = SensorError::Timeout;

        while Instant::now() < deadline {
            let read = self
                .uart
                .read(&mut buf, TickType::new_millis(UART_READ_SLICE_MS).ticks())
                .map_err(|err| SensorError::Bus(format!("{err:?}")))?;

            for &byte in &buf[..read] {
                match self.decoder.push(byte) {
                    Some(Ok(reading)) => return Ok(SensorSnapshot::Particulate(reading)),
                    Some(Err(err)) => last_err = err,
                    None => {}
                }
            }
        }

        Err(last_err)
    }
}

struct Bme280Source {
    sensor: BME280<I2cDriver<'static>>,
    delay: Ets,
    sea_level_hpa: f32,
}

impl Bme280Source {
    fn new(i2c: I2C0, config: &NodeConfig) -> anyhow::Result<Self> {
        // SAFETY: the I2C pins are not claimed by any other driver.
        let (sda, scl) = unsafe {
            (
                AnyIOPin::new(config.pins.bme_sda),
                AnyIOPin::new(config.pins.bme_scl),
            )
        };
        let i2c = I2cDriver::new(i2c, sda, scl, &I2cConfig::new().baudrate(Hertz(100_000)))?;
        let sensor = if config.pins.bme_address == 0x77 {
            BME280::new_secondary(i2c)
        } else {
            BME280::new_primary(i2c)
        };

        Ok(Self {
            sensor,
            delay: Ets,
            sea_level_hpa: config.sea_level_pressure_hpa,
        })
    }
}

impl SensorSource for Bme280Source {
    fn name(&self) -> &'static str {
        "environmental"
    }

    fn init(&mut self) -> Result<(), SensorError> {
        self.sensor
            .init(&mut self.delay)
            .map_err(|err| SensorError::Bus(format!("{err:?}")))
    }

    fn sample(&mut self) -> Result<SensorSnapshot, SensorError> {
        let measurements = self
            .sensor
            .measure(&mut self.delay)
            .map_err(|err| SensorError::Bus(format!("{err:?}")))?;

        debug!(
            "[BME280] {:.1} °C, {:.1} %, {:.1} hPa, ~{:.0} m",
            measurements.temperature,
            measurements.humidity,
            measurements.pressure / 100.0,
            altitude_m(measurements.pressure / 100.0, self.sea_level_hpa)
        );

        Ok(SensorSnapshot::Environmental(EnvironmentalReading {
            temperature_c: measurements.temperature,
            humidity_pct: measurements.humidity,
            pressure_pa: measurements.pressure,
        }))
    }
}

/// Station link. Without credentials it raises a WPA2 provisioning AP named
/// after the device; the AP is torn down once the station has joined.
struct EspLink {
    wifi: EspWifi<'static>,
    sys_loop: EspSystemEventLoop,
    nvs_store: NvsStore,
    ap_ssid: String,
    ap_password: String,
    credentials: Arc<Mutex<Option<WifiCredentials>>>,
    station: Option<ClientConfiguration>,
    portal: Option<EspHttpServer<'static>>,
    reconnect: Option<EspSubscription<'static, System>>,
}

impl EspLink {
    fn access_point(&self) -> anyhow::Result<AccessPointConfiguration> {
        Ok(AccessPointConfiguration {
            ssid: self
                .ap_ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("provisioning AP SSID too long"))?,
            password: self
                .ap_password
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("provisioning AP password too long"))?,
            auth_method: AuthMethod::WPAWPA2Personal,
            channel: 1,
            ..Default::default()
        })
    }

    fn start_portal(&mut self) -> anyhow::Result<()> {
        self.wifi
            .set_configuration(&Configuration::AccessPoint(self.access_point()?))?;
        self.wifi.start()?;
        self.portal = Some(create_portal_server(
            self.nvs_store.clone(),
            self.credentials.clone(),
        )?);
        info!(
            "provisioning AP started on `{}` (password: `{}`)",
            self.ap_ssid, self.ap_password
        );
        Ok(())
    }

    fn join(&mut self) -> anyhow::Result<()> {
        let credentials = self
            .credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| anyhow!("no wifi credentials stored"))?;

        credentials.validate()?;

        let client = ClientConfiguration {
            ssid: credentials
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi ssid too long"))?,
            password: credentials
                .pass
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi password too long"))?,
            auth_method: if credentials.is_open() {
                AuthMethod::None
            } else {
                AuthMethod::WPAWPA2Personal
            },
            ..Default::default()
        };

        // Keep the portal reachable until the station link is up.
        let configuration = if self.portal.is_some() {
            Configuration::Mixed(client.clone(), self.access_point()?)
        } else {
            Configuration::Client(client.clone())
        };
        self.wifi.set_configuration(&configuration)?;
        self.station = Some(client);
        if !self.wifi.is_started()? {
            self.wifi.start()?;
        }
        self.wifi.connect()?;
        info!("wifi started, connecting to `{}`", credentials.ssid);
        Ok(())
    }

    /// Drop the AP half of a mixed configuration, keeping the station.
    fn leave_mixed_mode(&mut self) -> anyhow::Result<()> {
        if !matches!(self.wifi.get_configuration()?, Configuration::Mixed(..)) {
            return Ok(());
        }
        let client = self
            .station
            .clone()
            .ok_or_else(|| anyhow!("no station configuration to keep"))?;
        self.wifi.set_configuration(&Configuration::Client(client))?;
        info!("provisioning AP shut down");
        Ok(())
    }

    fn disable_power_save(&self) {
        let rc = unsafe {
            esp_idf_svc::sys::esp_wifi_set_ps(esp_idf_svc::sys::wifi_ps_type_t_WIFI_PS_NONE)
        };
        if rc == ESP_OK {
            info!("wifi power save disabled");
        } else {
            warn!("failed to disable wifi power save: esp_err_t={rc}");
        }
    }
}

impl NetworkLink for EspLink {
    fn set_hostname(&mut self, name: &str) {
        self.ap_ssid = name.to_string();
        if let Err(err) = self.wifi.sta_netif_mut().set_hostname(name) {
            warn!("failed to set hostname `{name}`: {err:?}");
        }
    }

    fn has_credentials(&mut self) -> bool {
        self.credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn begin_provisioning(&mut self) {
        if let Err(err) = self.start_portal() {
            warn!("failed to start provisioning portal: {err:#}");
        }
    }

    fn provisioning_complete(&mut self) -> bool {
        self.has_credentials()
    }

    fn stop_provisioning(&mut self) {
        if self.portal.take().is_some() {
            info!("provisioning portal stopped");
        }
        if let Err(err) = self.leave_mixed_mode() {
            warn!("failed to shut down provisioning AP: {err:#}");
        }
    }

    fn begin_join(&mut self) -> bool {
        match self.join() {
            Ok(()) => true,
            Err(err) => {
                warn!("wifi join failed to start: {err:#}");
                false
            }
        }
    }

    fn is_joined(&mut self) -> bool {
        self.wifi.is_connected().unwrap_or(false) && self.wifi.is_up().unwrap_or(false)
    }

    fn enable_auto_reconnect(&mut self) {
        let subscription = self.sys_loop.subscribe::<WifiEvent, _>(|event| {
            if matches!(event, WifiEvent::StaDisconnected { .. }) {
                let rc = unsafe { esp_idf_svc::sys::esp_wifi_connect() };
                if rc != ESP_OK {
                    warn!("wifi reconnect request failed: esp_err_t={rc}");
                }
            }
        });

        match subscription {
            Ok(subscription) => self.reconnect = Some(subscription),
            Err(err) => warn!("failed to enable wifi auto-reconnect: {err:?}"),
        }
    }
}

/// Web-thing property server over HTTP with mDNS discovery; changes are
/// mirrored to MQTT when a broker is configured.
struct EspPropertyServer {
    device_name: String,
    published: Arc<Mutex<Published>>,
    update_status: Arc<Mutex<UpdateStatus>>,
    update_requests: mpsc::Sender<String>,
    http: Option<EspHttpServer<'static>>,
    mdns: Option<EspMdns>,
    mqtt: Option<EspMqttClient<'static>>,
}

impl EspPropertyServer {
    fn start_mdns(&mut self) -> Result<(), ServerError> {
        let discovery = |err: EspError| ServerError::Discovery(format!("{err:?}"));

        let mut mdns = EspMdns::take().map_err(discovery)?;
        mdns.set_hostname(&self.device_name).map_err(discovery)?;
        mdns.set_instance_name(&self.device_name).map_err(discovery)?;
        mdns.add_service(
            Some(&self.device_name),
            "_webthing",
            "_tcp",
            WEBTHING_PORT,
            &[("path", "/")],
        )
        .map_err(discovery)?;

        info!("mDNS responder started for `{}.local`", self.device_name);
        self.mdns = Some(mdns);
        Ok(())
    }

    fn publish_mqtt(&mut self, topic: String, payload: &[u8]) -> Result<(), String> {
        let Some(mqtt) = self.mqtt.as_mut() else {
            return Ok(());
        };
        mqtt.publish(&topic, QoS::AtLeastOnce, true, payload)
            .map(|_| ())
            .map_err(|err| format!("{err:?}"))
    }
}

impl PropertyServer for EspPropertyServer {
    fn start(&mut self, device: &Device) -> Result<(), ServerError> {
        let description = serde_json::to_value(device.description(&format!(
            "http://{}.local",
            self.device_name
        )))
        .map_err(|err| ServerError::Start(err.to_string()))?;
        let properties = match device.properties_json() {
            serde_json::Value::Object(properties) => properties,
            _ => serde_json::Map::new(),
        };
        {
            let mut published = self.published.lock().unwrap_or_else(PoisonError::into_inner);
            published.description = Some(description);
            published.properties = properties;
        }

        let http = create_http_server(
            self.published.clone(),
            self.update_status.clone(),
            self.update_requests.clone(),
        )
        .map_err(|err| ServerError::Start(format!("{err:#}")))?;
        self.http = Some(http);

        self.start_mdns()?;

        if let Err(err) = self.publish_mqtt(status_topic(&self.device_name), b"online") {
            warn!("failed to publish online status: {err}");
        }
        Ok(())
    }

    fn maintain_discovery(&mut self) -> Result<(), ServerError> {
        if self.mdns.is_none() {
            self.start_mdns()?;
        }
        Ok(())
    }

    fn update(&mut self, device: &Device, changed: &[MetricId]) -> Result<(), ServerError> {
        let mut first_err = None;

        for &metric in changed {
            let name = metric.property_name();
            let body = device.property_json(metric).map_err(|err| ServerError::Push {
                property: name,
                reason: err.to_string(),
            })?;
            let value = body[name].clone();

            self.published
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .properties
                .insert(name.to_string(), value.clone());

            let topic = property_topic(&self.device_name, metric);
            if let Err(reason) = self.publish_mqtt(topic, value.to_string().as_bytes()) {
                first_err.get_or_insert(ServerError::Push {
                    property: name,
                    reason,
                });
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

struct EspOtaTransport {
    watchdog: TaskWatchdog,
    status: Arc<Mutex<UpdateStatus>>,
    expected_sha256: Option<&'static str>,
}

impl UpdateTransport for EspOtaTransport {
    fn update(&mut self, url: &str) -> Result<(), UpdateError> {
        validate_update_url(url)?;
        let url = url.trim();

        {
            let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            status.in_progress = true;
            status.bytes_written = 0;
            status.total_bytes = None;
            status.last_error = None;
            status.last_sha256 = None;
            status.last_source_url = Some(url.to_string());
        }

        let result = download_and_apply_ota(self.watchdog, &self.status, url, self.expected_sha256);

        {
            let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            status.in_progress = false;
            status.last_completed_epoch = Some(chrono::Utc::now().timestamp());
            match &result {
                Ok(summary) => {
                    status.bytes_written = summary.bytes;
                    status.last_sha256 = Some(summary.sha256.clone());
                }
                Err(err) => status.last_error = Some(err.to_string()),
            }
        }

        let summary = result?;
        info!("OTA image applied ({} bytes); restarting", summary.bytes);
        restart_device();
        Ok(())
    }
}

/// Runs on the watchdog-registered main task, so every step that can block
/// for up to `OTA_HTTP_TIMEOUT` is bracketed by a feed.
fn download_and_apply_ota(
    watchdog: TaskWatchdog,
    status: &Arc<Mutex<UpdateStatus>>,
    url: &str,
    expected_sha256: Option<&str>,
) -> Result<ImageSummary, UpdateError> {
    fn unreachable_host(err: impl std::fmt::Debug) -> UpdateError {
        UpdateError::Unreachable(format!("{err:?}"))
    }

    let http_conf = HttpClientConfiguration {
        timeout: Some(OTA_HTTP_TIMEOUT),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    let connection = EspHttpConnection::new(&http_conf).map_err(unreachable_host)?;
    let mut client = HttpClient::wrap(connection);
    let request = client.request(Method::Get, url, &[]).map_err(unreachable_host)?;

    watchdog.feed();
    let mut response = request.submit().map_err(unreachable_host)?;
    watchdog.feed();

    let code = response.status();
    if !(200..300).contains(&code) {
        return Err(UpdateError::HttpStatus(code));
    }

    let content_length = response
        .header("content-length")
        .or_else(|| response.header("Content-Length"))
        .and_then(|value| value.parse::<u64>().ok());
    status
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .total_bytes = content_length;

    let mut ota = EspOta::new().map_err(|err| UpdateError::Flash(format!("{err:?}")))?;
    // Erasing the target slot can take seconds.
    watchdog.feed();
    let mut update = ota
        .initiate_update()
        .map_err(|err| UpdateError::Flash(format!("failed to initiate OTA update: {err:?}")))?;

    let summary = stream_image(
        |chunk| {
            response
                .read(chunk)
                .map_err(|err| UpdateError::Unreachable(format!("download interrupted: {err:?}")))
        },
        |chunk| {
            update
                .write(chunk)
                .map(|_| ())
                .map_err(|err| UpdateError::Flash(format!("failed writing OTA data: {err:?}")))
        },
        |written| {
            watchdog.feed();
            status
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .bytes_written = written;
        },
        expected_sha256,
    );

    match summary {
        Ok(summary) => {
            update.complete().map_err(|err| {
                UpdateError::Flash(format!("failed finalizing OTA image: {err:?}"))
            })?;
            Ok(summary)
        }
        Err(err) => {
            if let Err(abort) = update.abort() {
                warn!("failed to abort OTA update: {abort:?}");
            }
            Err(err)
        }
    }
}

fn restart_device() {
    thread::sleep(Duration::from_millis(800));
    unsafe { esp_idf_svc::sys::esp_restart() };
}

fn create_http_server(
    published: Arc<Mutex<Published>>,
    update_status: Arc<Mutex<UpdateStatus>>,
    update_requests: mpsc::Sender<String>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        http_port: WEBTHING_PORT,
        uri_match_wildcard: true,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let published = published.clone();
        server.fn_handler::<anyhow::Error, _>("/things", Method::Get, move |req| {
            let description = published
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .description
                .clone();
            match description {
                Some(description) => respond_json(req, 200, &[description]),
                None => respond_error(req, 503, "device not started"),
            }
        })?;
    }

    {
        let published = published.clone();
        server.fn_handler::<anyhow::Error, _>(
            &format!("/things/{DEVICE_ID}"),
            Method::Get,
            move |req| {
                let description = published
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .description
                    .clone();
                match description {
                    Some(description) => respond_json(req, 200, &description),
                    None => respond_error(req, 503, "device not started"),
                }
            },
        )?;
    }

    {
        let published = published.clone();
        server.fn_handler::<anyhow::Error, _>(
            &format!("/things/{DEVICE_ID}/properties"),
            Method::Get,
            move |req| {
                let properties = published
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .properties
                    .clone();
                respond_json(req, 200, &properties)
            },
        )?;
    }

    {
        let published = published.clone();
        server.fn_handler::<anyhow::Error, _>(
            &format!("{PROPERTY_PREFIX}*"),
            Method::Get,
            move |req| {
                let name = req
                    .uri()
                    .strip_prefix(PROPERTY_PREFIX)
                    .unwrap_or_default()
                    .split('?')
                    .next()
                    .unwrap_or_default()
                    .to_string();
                let value = published
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .properties
                    .get(&name)
                    .cloned();
                match value {
                    Some(value) => {
                        let mut body = serde_json::Map::new();
                        body.insert(name, value);
                        respond_json(req, 200, &body)
                    }
                    None => respond_error(req, 404, &format!("unknown property `{name}`")),
                }
            },
        )?;
    }

    {
        let update_status = update_status.clone();
        server.fn_handler::<anyhow::Error, _>("/api/update", Method::Post, move |mut req| {
            let request: UpdateRequest = read_json(&mut req).context("invalid update payload")?;
            let url = request.url.unwrap_or_default();

            if !url.trim().is_empty() {
                if let Err(err) = validate_update_url(&url) {
                    return respond_error(req, 400, &err.to_string());
                }
            }
            if update_status
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .in_progress
            {
                return respond_error(req, 409, "update already in progress");
            }
            if update_requests.send(url).is_err() {
                return respond_error(req, 503, "node loop is not running");
            }

            respond_json(req, 200, &serde_json::json!({ "accepted": true }))
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/api/update/status", Method::Get, move |req| {
        let status = update_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        respond_json(req, 200, &status)
    })?;

    Ok(server)
}

fn create_portal_server(
    nvs_store: NvsStore,
    credentials: Arc<Mutex<Option<WifiCredentials>>>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    for path in [
        "/",
        "/generate_204",
        "/gen_204",
        "/hotspot-detect.html",
        "/connecttest.txt",
        "/ncsi.txt",
        "/fwlink",
    ] {
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
                .write_all(PORTAL_HTML.as_bytes())?;
            Ok(())
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/api/wifi", Method::Put, move |mut req| {
        let update: WifiCredentialsUpdate = read_json(&mut req).context("invalid wifi payload")?;
        let pass = update.wifi_pass.unwrap_or_default();
        let stored = match WifiCredentials::new(&update.wifi_ssid, &pass) {
            Ok(stored) => stored,
            Err(err) => return respond_error(req, 400, &err.to_string()),
        };
        nvs_store.save_credentials(&stored)?;
        info!("wifi credentials received for `{}`", stored.ssid);
        *credentials.lock().unwrap_or_else(PoisonError::into_inner) = Some(stored);

        respond_json(req, 200, &serde_json::json!({ "saved": true }))
    })?;

    Ok(server)
}

type HttpRequest<'r, 'c> =
    esp_idf_svc::http::server::Request<&'r mut esp_idf_svc::http::server::EspHttpConnection<'c>>;

fn read_json<T: DeserializeOwned>(req: &mut HttpRequest<'_, '_>) -> anyhow::Result<T> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    req.read_exact(&mut body)?;
    Ok(serde_json::from_slice(&body)?)
}

fn respond_json<T: Serialize + ?Sized>(
    req: HttpRequest<'_, '_>,
    status: u16,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        status,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn respond_error(req: HttpRequest<'_, '_>, status: u16, message: &str) -> anyhow::Result<()> {
    respond_json(req, status, &serde_json::json!({ "error": message }))
}

fn compiled_credentials() -> Option<WifiCredentials> {
    let ssid = option_env!("WIFI_SSID")?;
    match WifiCredentials::new(ssid, option_env!("WIFI_PASS").unwrap_or_default()) {
        Ok(credentials) => Some(credentials),
        Err(err) => {
            warn!("ignoring compiled-in wifi credentials: {err}");
            None
        }
    }
}

fn compiled_sha256() -> Option<&'static str> {
    let value = option_env!("AIRQ_OTA_SHA256")?.trim();
    if value.len() != 64 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
        warn!("ignoring AIRQ_OTA_SHA256: expected 64 hex characters");
        return None;
    }
    Some(value)
}

fn create_mqtt_client(device_name: &str) -> anyhow::Result<Option<EspMqttClient<'static>>> {
    let Some(url) = option_env!("MQTT_URL").filter(|url| !url.trim().is_empty()) else {
        info!("no MQTT broker configured; property mirroring disabled");
        return Ok(None);
    };

    let conf = MqttClientConfiguration {
        client_id: Some(device_name),
        username: option_env!("MQTT_USER"),
        password: option_env!("MQTT_PASS"),
        ..Default::default()
    };

    let (client, mut conn) = EspMqttClient::new(url, &conf)?;

    thread::Builder::new()
        .name("mqtt-poll".to_string())
        .stack_size(8192)
        .spawn(move || loop {
            if let Err(err) = conn.next() {
                warn!("node mqtt poll error: {err:?}");
                thread::sleep(Duration::from_secs(2));
            }
        })
        .context("failed to spawn mqtt thread")?;

    Ok(Some(client))
}

fn chip_id() -> anyhow::Result<String> {
    let mut mac = [0_u8; 6];
    let rc = unsafe { esp_idf_svc::sys::esp_efuse_mac_get_default(mac.as_mut_ptr()) };
    if rc != ESP_OK {
        return Err(anyhow!("esp_efuse_mac_get_default failed with code {rc}"));
    }
    Ok(format!("{:02x}{:02x}{:02x}", mac[3], mac[4], mac[5]))
}

impl NvsStore {
    fn load_credentials(&self) -> anyhow::Result<Option<WifiCredentials>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 512];

        let Some(value) = nvs.get_str(NVS_WIFI_KEY, &mut buffer)? else {
            return Ok(None);
        };
        let credentials = serde_json::from_str::<WifiCredentials>(value)?;
        if let Err(err) = credentials.validate() {
            // Unusable record: fall back to provisioning instead of a join
            // that can never start.
            warn!("discarding stored wifi credentials: {err}");
            nvs.remove(NVS_WIFI_KEY)?;
            return Ok(None);
        }
        Ok(Some(credentials))
    }

    fn save_credentials(&self, credentials: &WifiCredentials) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(credentials)?;
        nvs.set_str(NVS_WIFI_KEY, &payload)?;
        Ok(())
    }
}

/// Proof that the main task is subscribed to the ESP-IDF task watchdog. The
/// task panics the device if it goes `WATCHDOG_TIMEOUT` without a feed.
#[derive(Debug, Clone, Copy)]
struct TaskWatchdog {
    _subscribed: (),
}

impl TaskWatchdog {
    fn subscribe(timeout: Duration) -> anyhow::Result<Self> {
        let config = esp_idf_svc::sys::esp_task_wdt_config_t {
            timeout_ms: u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX),
            idle_core_mask: 0,
            trigger_panic: true,
        };
        // Already initialised or already subscribed is fine.
        let tolerate = |what: &str, rc: esp_err_t| {
            if rc == ESP_OK || rc == ESP_ERR_INVALID_STATE {
                Ok(())
            } else {
                Err(anyhow!("{what} failed with code {rc}"))
            }
        };

        let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
        tolerate("esp_task_wdt_init", rc)?;
        let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
        tolerate("esp_task_wdt_add", rc)?;
        info!("task watchdog armed ({}s)", timeout.as_secs());
        Ok(Self { _subscribed: () })
    }

    fn feed(self) {
        let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
        if rc != ESP_OK {
            debug!("watchdog feed rejected: esp_err_t={rc}");
        }
    }
}
