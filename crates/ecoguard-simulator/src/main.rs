//! Desktop simulator for the EcoGuard sensor node.
//!
//! Runs the real `ecoguard-core` controller, supervisor and command channel
//! against synthetic sensors and a simulated radio stack. The sampling tick,
//! the command task and the radio stack each run on their own thread, sharing
//! the same `SharedNodeState` and `Link` the firmware uses.
//!
//! ```text
//! ecoguard-simulator [config.json]
//! ```
//!
//! Without a config file the node uses its defaults (BLE, JSON on TX).
//!
//! # Console input
//!
//! | Input                  | Effect                                        |
//! |------------------------|-----------------------------------------------|
//! | `wake`/`sleep`/`reboot`| Written to the RX characteristic as a command |
//! | `{"command":...}`      | Written to the RX characteristic verbatim     |
//! | `drop`                 | The peer (BLE) or broker (MQTT) drops the link|
//! | `outage`               | Toggle refusing new connections               |
//! | `quit`                 | Stop the simulator                            |

use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration as StdDuration, Instant as StdInstant};

use embassy_futures::block_on;
use embassy_time::{Duration, Instant};
use embedded_hal_async::delay::DelayNs;
use log::{debug, error, info, warn};

use ecoguard_core::command::{Command, CommandChannel, REBOOT_FLUSH_DELAY, Restart};
use ecoguard_core::config::{Config, TransportConfig};
use ecoguard_core::controller::{NodeController, TickOutcome};
use ecoguard_core::node_state::{NodeError, NodeState, SharedNodeState};
use ecoguard_core::sampling::{NodeSensors, SensorSampler};
use ecoguard_core::sensors::{
    AnalogSource, Bmp280Readings, EchoPulse, Hcsr04Sensor, MicrophoneSensor, Sensor,
    SensorChannel, SensorError, SensorType, Unit,
};
use ecoguard_core::supervisor::ConnectionSupervisor;
use ecoguard_core::transport::ble::{BleLink, BleNotifyChannel, NotifyFrame};
use ecoguard_core::transport::link::InboundQueue;
use ecoguard_core::transport::mqtt::{MqttLink, MqttPublishChannel, PublishFrame};
use ecoguard_core::transport::{Link, LinkEvent, LinkRequest, TransportChannel};

// ---------------------------------------------------------------------------
// Timing constants
// ---------------------------------------------------------------------------

/// Time for a simulated peer to find the node or a broker to accept it
const HANDSHAKE_DELAY: StdDuration = StdDuration::from_millis(1500);

/// Polling interval of the radio and command threads
const POLL_INTERVAL: StdDuration = StdDuration::from_millis(20);

// ---------------------------------------------------------------------------
// Shared simulator state
// ---------------------------------------------------------------------------

/// Monotonic clock handed to the core as `embassy_time::Instant`s
struct Clock {
    start: StdInstant,
}

impl Clock {
    fn new() -> Self {
        Self {
            start: StdInstant::now(),
        }
    }

    fn now(&self) -> Instant {
        Instant::from_micros(self.start.elapsed().as_micros() as u64)
    }
}

/// Flags flipped from the console
#[derive(Default)]
struct Controls {
    quit: AtomicBool,
    drop_link: AtomicBool,
    outage: AtomicBool,
}

impl Controls {
    fn running(&self) -> bool {
        !self.quit.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Synthetic sensors
// ---------------------------------------------------------------------------

/// Barometer producing slowly drifting temperature and pressure
#[derive(Default)]
struct SyntheticBarometer {
    reads: u32,
}

impl Sensor<2> for SyntheticBarometer {
    type Readings = Bmp280Readings;

    fn sensor_id(&self) -> &'static str {
        "bmp280"
    }

    fn channels(&self) -> [SensorChannel; 2] {
        [
            SensorChannel::new(SensorType::Temperature, Unit::Celsius),
            SensorChannel::new(SensorType::Pressure, Unit::HectoPascal),
        ]
    }

    async fn read(&mut self) -> Result<Bmp280Readings, SensorError> {
        self.reads += 1;
        let t = self.reads as f64;

        // Temperature: 20–23 °C, pressure: 1011–1015 hPa
        Ok(Bmp280Readings {
            temperature_celsius: 21.5 + 1.5 * (t / 60.0).sin(),
            pressure_hpa: 1013.25 + 2.0 * (t / 300.0).cos(),
        })
    }
}

/// Ranger that loses its echo every 15th pulse
#[derive(Default)]
struct SyntheticEcho {
    pulses: u32,
}

impl EchoPulse for SyntheticEcho {
    type Error = core::convert::Infallible;

    async fn measure_echo_us(&mut self, _timeout: Duration) -> Result<u32, Self::Error> {
        self.pulses += 1;
        if self.pulses % 15 == 0 {
            return Ok(0);
        }

        let distance_cm = 120.0 + 40.0 * (self.pulses as f64 / 20.0).sin();
        Ok((distance_cm * 2.0 / 0.0343) as u32)
    }
}

/// 12-bit microphone ADC centered on mid-scale
#[derive(Default)]
struct SyntheticMicrophone {
    phase: f64,
}

impl AnalogSource for SyntheticMicrophone {
    type Error = core::convert::Infallible;

    fn read_raw(&mut self) -> Result<u16, Self::Error> {
        self.phase += 0.7;
        let loudness = 150.0 + 120.0 * (self.phase / 500.0).sin();
        Ok((2048.0 + loudness * self.phase.sin()) as u16)
    }
}

struct StdDelay;

impl DelayNs for StdDelay {
    async fn delay_ns(&mut self, ns: u32) {
        thread::sleep(StdDuration::from_nanos(ns as u64));
    }
}

// ---------------------------------------------------------------------------
// Simulated radio stack
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RadioKind {
    Ble,
    Mqtt,
}

impl RadioKind {
    fn up_events(self) -> &'static [LinkEvent] {
        match self {
            RadioKind::Ble => &[LinkEvent::PeerConnected, LinkEvent::PeerSubscribed],
            RadioKind::Mqtt => &[LinkEvent::BrokerConnected],
        }
    }

    fn down_event(self) -> LinkEvent {
        match self {
            RadioKind::Ble => LinkEvent::PeerDisconnected,
            RadioKind::Mqtt => LinkEvent::BrokerDisconnected,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Radio {
    Idle,
    Handshaking { since: StdInstant },
    Up,
}

/// Stack side of a link: answers requests, reports link events and "transmits"
/// outbound frames by logging them.
fn radio_stack<F, const N: usize>(
    link: &Link<F, N>,
    kind: RadioKind,
    peer_label: &str,
    controls: &Controls,
    mut transmit: impl FnMut(F),
) {
    let mut radio = Radio::Idle;

    while controls.running() {
        match link.try_take_request() {
            Some(LinkRequest::Connect) => {
                if kind == RadioKind::Ble {
                    info!("[radio] advertising as {}", peer_label);
                    link.try_report(LinkEvent::AdvertisingStarted);
                } else {
                    info!("[radio] connecting to {}", peer_label);
                }
                radio = Radio::Handshaking {
                    since: StdInstant::now(),
                };
            }
            Some(LinkRequest::Abort) => {
                info!("[radio] attempt aborted");
                radio = Radio::Idle;
            }
            None => {}
        }

        if let Radio::Handshaking { since } = radio {
            if since.elapsed() >= HANDSHAKE_DELAY {
                if !controls.outage.load(Ordering::Relaxed) {
                    for event in kind.up_events() {
                        link.try_report(*event);
                    }
                    radio = Radio::Up;
                } else if kind == RadioKind::Mqtt {
                    // A refused broker session fails; an unseen BLE node keeps advertising
                    link.try_report(LinkEvent::HandshakeFailed);
                    radio = Radio::Idle;
                }
            }
        }

        if controls.drop_link.swap(false, Ordering::Relaxed) {
            if let Radio::Up = radio {
                info!("[radio] link dropped");
                link.try_report(kind.down_event());
                radio = Radio::Idle;
            }
        }

        while let Some(frame) = link.try_next_frame() {
            transmit(frame);
        }

        thread::sleep(POLL_INTERVAL);
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// A reboot resets the node state and drops the radio link.
struct SimulatedRestart<'a> {
    state: &'a SharedNodeState,
    controls: &'a Controls,
}

impl Restart for SimulatedRestart<'_> {
    fn restart(&mut self) {
        warn!("rebooting");
        self.state.reset();
        self.controls.drop_link.store(true, Ordering::Relaxed);
    }
}

/// Command task: applies commands written to the RX characteristic.
fn command_task(state: &SharedNodeState, inbound: &InboundQueue, clock: &Clock, controls: &Controls) {
    let commands = CommandChannel::new(state);
    let mut restart = SimulatedRestart { state, controls };

    while controls.running() {
        while let Ok(frame) = inbound.try_receive() {
            if let Some(Command::Reboot) = commands.on_command(&frame, clock.now()) {
                thread::sleep(StdDuration::from_millis(REBOOT_FLUSH_DELAY.as_millis()));
                restart.restart();
            }
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Read console lines until `quit` or end of input.
fn console<F, const N: usize>(link: &Link<F, N>, accepts_commands: bool, controls: &Controls) {
    let stdin = std::io::stdin();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let line = line.trim();

        let payload = match line {
            "" => continue,
            "quit" | "q" => {
                controls.quit.store(true, Ordering::Relaxed);
                return;
            }
            "drop" => {
                controls.drop_link.store(true, Ordering::Relaxed);
                continue;
            }
            "outage" => {
                let refusing = !controls.outage.fetch_xor(true, Ordering::Relaxed);
                info!("connection outage {}", if refusing { "started" } else { "ended" });
                continue;
            }
            "wake" | "sleep" | "reboot" => format!("{{\"command\":\"{}\"}}", line),
            raw => raw.to_string(),
        };

        if !accepts_commands {
            warn!("commands are only accepted over BLE");
        } else if !link.push_inbound(payload.as_bytes()) {
            warn!("command dropped");
        }
    }

    debug!("console closed");
}

// ---------------------------------------------------------------------------
// Sampling tick
// ---------------------------------------------------------------------------

fn run_node<S, T>(
    state: &SharedNodeState,
    sampler: S,
    supervisor: ConnectionSupervisor<T>,
    period: Duration,
    clock: &Clock,
    controls: &Controls,
) where
    S: SensorSampler,
    T: TransportChannel,
{
    let tick_period = StdDuration::from_millis(period.as_millis());
    let mut controller = NodeController::new(state, sampler, supervisor, period);

    while controls.running() {
        let started = StdInstant::now();
        let report = block_on(controller.tick(clock.now()));

        match report.outcome {
            TickOutcome::Asleep => info!("asleep (link {:?})", report.link),
            TickOutcome::Sampled {
                readings,
                sent,
                dropped,
                skipped,
            } => info!(
                "{} reading(s): {} sent, {} dropped, {} skipped (link {:?})",
                readings, sent, dropped, skipped, report.link
            ),
        }

        if let Some(remaining) = tick_period.checked_sub(started.elapsed()) {
            thread::sleep(remaining);
        }
    }

    let stats = controller.supervisor().stats();
    info!(
        "connection attempts: {}, failures: {}, link losses: {}",
        stats.attempts, stats.failures, stats.link_losses
    );
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn load_config_text() -> Option<String> {
    let path = std::env::args().nth(1)?;

    match std::fs::read_to_string(&path) {
        Ok(text) => Some(text),
        Err(e) => {
            error!("Cannot read {}: {}", path, e);
            std::process::exit(1);
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("Starting EcoGuard simulator");

    let text = load_config_text();
    let config: Config = match text.as_deref() {
        Some(text) => match serde_json::from_str(text) {
            Ok(config) => config,
            Err(e) => {
                error!("Invalid config: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    let identity = match config.validate() {
        Ok(identity) => identity,
        Err(e) => {
            error!("{}", NodeError::from(e));
            std::process::exit(1);
        }
    };
    info!(
        "Node {} in room {}, sampling every {} ms",
        identity.device_id,
        identity.room_id,
        config.sampling.period_ms
    );
    info!("Console: wake  sleep  reboot  drop  outage  quit");

    let state = SharedNodeState::new(NodeState::new(identity));
    let controls = Controls::default();
    let clock = Clock::new();

    let sensors = NodeSensors::new(
        SyntheticBarometer::default(),
        MicrophoneSensor::new(SyntheticMicrophone::default(), StdDelay, config.sampling.sound_mode)
            .with_burst(config.sampling.sound_samples, config.sampling.sound_interval_us),
        Hcsr04Sensor::new(SyntheticEcho::default()),
    );
    let period = config.sampling.period();

    match config.transport {
        TransportConfig::Ble { layout } => {
            let link = BleLink::new();
            let supervisor = ConnectionSupervisor::new(
                BleNotifyChannel::new(&link, layout),
                config.retry.backoff(),
            );
            let device_name = config.node.device_name;
            info!("Transport: BLE ({:?})", layout);

            thread::scope(|s| {
                s.spawn(|| {
                    radio_stack(&link, RadioKind::Ble, device_name, &controls, |frame: NotifyFrame| {
                        info!("[radio] notify {}: {}", frame.characteristic.uuid(), frame.payload)
                    })
                });
                s.spawn(|| command_task(&state, link.inbound(), &clock, &controls));
                s.spawn(|| console(&link, true, &controls));

                run_node(&state, sensors, supervisor, period, &clock, &controls);
            });
        }
        TransportConfig::Mqtt(mqtt) => {
            let link = MqttLink::new();
            let supervisor = ConnectionSupervisor::new(MqttPublishChannel::new(&link), config.retry.backoff())
                .with_handshake_timeout(config.retry.handshake_timeout());
            info!(
                "Transport: MQTT to {}:{} (Wi-Fi \"{}\")",
                mqtt.broker_host, mqtt.broker_port, mqtt.ssid
            );
            let broker_host = mqtt.broker_host;

            thread::scope(|s| {
                s.spawn(|| {
                    radio_stack(&link, RadioKind::Mqtt, broker_host, &controls, |frame: PublishFrame| {
                        info!(
                            "[radio] publish {}{}: {}",
                            frame.topic,
                            if frame.retain { " (retained)" } else { "" },
                            frame.payload
                        )
                    })
                });
                s.spawn(|| console(&link, false, &controls));

                run_node(&state, sensors, supervisor, period, &clock, &controls);
            });
        }
    }

    info!("Simulator exiting");
}
