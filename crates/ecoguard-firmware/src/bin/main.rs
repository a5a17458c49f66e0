#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]
#![deny(clippy::large_stack_frames)]

use bt_hci::controller::ExternalController;
use ecoguard_core::command::{CommandChannel, Restart};
use ecoguard_core::config::{Config, TransportConfig};
use ecoguard_core::controller::NodeController;
use ecoguard_core::node_state::{NodeError, NodeState, SharedNodeState};
use ecoguard_core::sampling::NodeSensors;
use ecoguard_core::sensors::{Bmp280Sensor, Hcsr04Sensor, MicrophoneSensor};
use ecoguard_core::supervisor::ConnectionSupervisor;
use ecoguard_core::transport::ble::BleLink;
use ecoguard_core::transport::mqtt::MqttLink;
use ecoguard_core::transport::{BleNotifyChannel, MqttPublishChannel};
use ecoguard_firmware::hardware::{MicrophoneAdc, SoftwareReset, UltrasonicPins, FATAL_RESTART_DELAY, restart_after_failure};
use ecoguard_firmware::{ble, mqtt, settings};
use embassy_executor::Spawner;
use embassy_net::StackResources;
use embassy_time::{Duration, Timer};
use esp_hal::Async;
use esp_hal::analog::adc::{Adc, AdcConfig, Attenuation};
use esp_hal::clock::CpuClock;
use esp_hal::gpio::{Input, InputConfig, Level, Output, OutputConfig, Pull};
use esp_hal::i2c::master::{Config as I2cConfig, I2c};
use esp_hal::rng::Rng;
use esp_hal::time::Rate;
use esp_hal::timer::timg::TimerGroup;
use esp_radio::ble::controller::BleConnector;
use log::{error, info};
use static_cell::StaticCell;

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    rtt_target::rprintln!("PANIC: {}", info);
    esp_hal::delay::Delay::new().delay_millis(FATAL_RESTART_DELAY.as_millis() as u32);

    let mut reset = SoftwareReset;
    loop {
        reset.restart();
    }
}

extern crate alloc;

// This creates a default app-descriptor required by the esp-idf bootloader.
esp_bootloader_esp_idf::esp_app_desc!();

type Sensors = NodeSensors<
    Bmp280Sensor<I2c<'static, Async>>,
    MicrophoneSensor<MicrophoneAdc<'static>, embassy_time::Delay>,
    Hcsr04Sensor<UltrasonicPins<'static>>,
>;

static BLE_LINK: BleLink = BleLink::new();
static MQTT_LINK: MqttLink = MqttLink::new();
static NODE_STATE: StaticCell<SharedNodeState> = StaticCell::new();
static RADIO: StaticCell<esp_radio::Controller<'static>> = StaticCell::new();
static NET_RESOURCES: StaticCell<StackResources<3>> = StaticCell::new();

#[embassy_executor::task]
async fn ble_sampling_task(mut controller: NodeController<'static, Sensors, BleNotifyChannel<'static>>) -> ! {
    controller.run().await
}

#[embassy_executor::task]
async fn mqtt_sampling_task(mut controller: NodeController<'static, Sensors, MqttPublishChannel<'static>>) -> ! {
    controller.run().await
}

#[embassy_executor::task]
async fn command_task(state: &'static SharedNodeState) -> ! {
    CommandChannel::new(state)
        .run(BLE_LINK.inbound(), &mut SoftwareReset)
        .await
}

#[embassy_executor::task]
async fn ble_task(controller: ExternalController<BleConnector<'static>, 20>, name: &'static str) {
    ble::run(controller, &BLE_LINK, name).await;
}

#[allow(
    clippy::large_stack_frames,
    reason = "it's not unusual to allocate larger buffers etc. in main"
)]
#[esp_rtos::main]
async fn main(spawner: Spawner) -> ! {
    rtt_target::rtt_init_log!();

    let (config, identity) = match settings::load().and_then(|c| c.validate().map(|id| (c, id))) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("{}, falling back to default settings", NodeError::from(e));
            let config = Config::default();
            let identity = config.validate().expect("default settings are valid");
            (config, identity)
        }
    };

    let hal_config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(hal_config);

    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: 73744);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    info!("Embassy initialized!");

    // Sensors
    let i2c = match I2c::new(
        peripherals.I2C0,
        I2cConfig::default().with_frequency(Rate::from_khz(100)),
    ) {
        Ok(i2c) => i2c,
        Err(e) => restart_after_failure("i2c", e).await,
    }
    .with_sda(peripherals.GPIO21)
    .with_scl(peripherals.GPIO22)
    .into_async();

    let mut adc_config = AdcConfig::new();
    let mic_pin = adc_config.enable_pin(peripherals.GPIO34, Attenuation::_11dB);
    let adc = Adc::new(peripherals.ADC1, adc_config);

    let trigger = Output::new(peripherals.GPIO26, Level::Low, OutputConfig::default());
    let echo = Input::new(peripherals.GPIO27, InputConfig::default().with_pull(Pull::Down));

    let sensors = NodeSensors::new(
        Bmp280Sensor::new(i2c),
        MicrophoneSensor::new(
            MicrophoneAdc::new(adc, mic_pin),
            embassy_time::Delay,
            config.sampling.sound_mode,
        )
        .with_burst(config.sampling.sound_samples, config.sampling.sound_interval_us),
        Hcsr04Sensor::new(UltrasonicPins::new(trigger, echo)),
    );

    let state: &'static SharedNodeState = NODE_STATE.init(SharedNodeState::new(NodeState::new(identity)));
    let period = config.sampling.period();
    let backoff = config.retry.backoff();

    let radio = match esp_radio::init() {
        Ok(radio) => RADIO.init(radio),
        Err(e) => restart_after_failure("radio", e).await,
    };

    match config.transport {
        TransportConfig::Ble { layout } => {
            let connector = match BleConnector::new(radio, peripherals.BT, Default::default()) {
                Ok(connector) => connector,
                Err(e) => restart_after_failure("ble", e).await,
            };
            spawner.spawn(ble_task(ExternalController::new(connector), config.node.device_name)).unwrap();
            spawner.spawn(command_task(state)).unwrap();

            let supervisor = ConnectionSupervisor::new(BleNotifyChannel::new(&BLE_LINK, layout), backoff);
            spawner.spawn(ble_sampling_task(NodeController::new(state, sensors, supervisor, period))).unwrap();
            info!("BLE transport, advertising as {}", config.node.device_name);
        }
        TransportConfig::Mqtt(mqtt_config) => {
            let broker = match mqtt_config.broker_ipv4() {
                Ok(broker) => broker,
                Err(e) => restart_after_failure("mqtt broker address", e).await,
            };
            let (wifi, interfaces) = match esp_radio::wifi::new(radio, peripherals.WIFI, Default::default()) {
                Ok(wifi) => wifi,
                Err(e) => restart_after_failure("wifi", e).await,
            };

            let rng = Rng::new();
            let seed = (u64::from(rng.random()) << 32) | u64::from(rng.random());
            let (stack, runner) = embassy_net::new(
                interfaces.sta,
                embassy_net::Config::dhcpv4(Default::default()),
                NET_RESOURCES.init(StackResources::new()),
                seed,
            );

            let station = esp_radio::wifi::ClientConfig::default()
                .with_ssid(mqtt_config.ssid.into())
                .with_password(mqtt_config.password.into());
            spawner.spawn(mqtt::wifi_task(wifi, station)).unwrap();
            spawner.spawn(mqtt::net_task(runner)).unwrap();
            spawner.spawn(mqtt::mqtt_task(
                stack,
                &MQTT_LINK,
                mqtt::Session {
                    broker,
                    port: mqtt_config.broker_port,
                    client_id: mqtt_config.client_id.unwrap_or(config.node.device_id),
                    keep_alive_secs: mqtt_config.keep_alive_secs,
                },
            )).unwrap();

            let supervisor = ConnectionSupervisor::new(MqttPublishChannel::new(&MQTT_LINK), backoff)
                .with_handshake_timeout(config.retry.handshake_timeout());
            spawner.spawn(mqtt_sampling_task(NodeController::new(state, sensors, supervisor, period))).unwrap();
            info!("MQTT transport, broker {}:{}", broker, mqtt_config.broker_port);
        }
    }

    loop {
        Timer::after(Duration::from_secs(3600)).await;
    }
}
