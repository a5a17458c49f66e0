//! Wi-Fi station and MQTT session tasks
//!
//! The session task owns the TCP socket and the MQTT client. It sits idle
//! until the supervisor requests a connection on the [`MqttLink`], reports
//! `BrokerConnected` once CONNACK arrives and then publishes queued frames
//! until the session breaks or an abort is requested.

use core::net::Ipv4Addr;

use ecoguard_core::transport::mqtt::MqttLink;
use ecoguard_core::transport::{LinkEvent, LinkRequest};
use embassy_futures::select::{Either, select};
use embassy_net::tcp::{ConnectError, TcpSocket};
use embassy_net::{Runner, Stack};
use embassy_time::{Duration, Timer};
use esp_radio::wifi::{ClientConfig as WifiClientConfig, ModeConfig, WifiController, WifiDevice};
use log::{error, info, warn};
use rust_mqtt::client::client::MqttClient;
use rust_mqtt::client::client_config::{ClientConfig, MqttVersion};
use rust_mqtt::packet::v5::publish_packet::QualityOfService;
use rust_mqtt::packet::v5::reason_codes::ReasonCode;
use rust_mqtt::utils::rng_generator::CountingRng;
use thiserror_no_std::Error;

const SOCKET_BUFFER_LEN: usize = 1024;
const MQTT_BUFFER_LEN: usize = 512;

/// Broker coordinates and session options for [`mqtt_task`]
pub struct Session {
    pub broker: Ipv4Addr,
    pub port: u16,
    pub client_id: &'static str,
    pub keep_alive_secs: u16,
}

#[derive(Error, Debug)]
enum SessionError {
    #[error("TCP connect failed: {0:?}")]
    Tcp(ConnectError),
    #[error("MQTT error: {0:?}")]
    Mqtt(ReasonCode),
}

/// Joins the access point and keeps the station associated.
#[embassy_executor::task]
pub async fn wifi_task(mut wifi: WifiController<'static>, config: WifiClientConfig) {
    if let Err(e) = wifi.set_config(&ModeConfig::Client(config)) {
        error!("wifi set_config failed: {:?}", e);
        return;
    }

    if let Err(e) = wifi.start() {
        error!("wifi start failed: {:?}", e);
        return;
    }
    info!("wifi: started STA mode");

    loop {
        if !wifi.is_connected().unwrap_or(false) {
            info!("wifi: connecting...");
            if let Err(e) = wifi.connect() {
                error!("wifi connect failed: {:?}", e);
            }

            while !wifi.is_connected().unwrap_or(false) {
                Timer::after(Duration::from_millis(100)).await;
            }
            info!("wifi: connected");
        }

        Timer::after(Duration::from_secs(5)).await;
    }
}

#[embassy_executor::task]
pub async fn net_task(mut runner: Runner<'static, WifiDevice<'static>>) -> ! {
    runner.run().await
}

#[embassy_executor::task]
pub async fn mqtt_task(stack: Stack<'static>, link: &'static MqttLink, session: Session) -> ! {
    loop {
        if link.next_request().await != LinkRequest::Connect {
            continue;
        }

        match select(run_session(stack, link, &session), aborted(link)).await {
            Either::First(Ok(())) => {}
            Either::First(Err(e)) => warn!("mqtt: {}", e),
            Either::Second(()) => info!("mqtt: attempt aborted"),
        }

        link.report(LinkEvent::BrokerDisconnected).await;
    }
}

async fn aborted(link: &MqttLink) {
    while link.next_request().await != LinkRequest::Abort {}
}

async fn run_session(stack: Stack<'static>, link: &MqttLink, session: &Session) -> Result<(), SessionError> {
    stack.wait_config_up().await;

    let mut rx = [0u8; SOCKET_BUFFER_LEN];
    let mut tx = [0u8; SOCKET_BUFFER_LEN];
    let mut socket = TcpSocket::new(stack, &mut rx, &mut tx);
    socket.set_timeout(Some(Duration::from_secs(u64::from(session.keep_alive_secs) * 2)));
    socket
        .connect((session.broker, session.port))
        .await
        .map_err(SessionError::Tcp)?;

    let mut config = ClientConfig::new(MqttVersion::MQTTv5, CountingRng(20_000));
    config.add_client_id(session.client_id);
    config.keep_alive = session.keep_alive_secs;
    config.max_packet_size = MQTT_BUFFER_LEN as u32;

    let mut recv = [0u8; MQTT_BUFFER_LEN];
    let mut write = [0u8; MQTT_BUFFER_LEN];
    let mut client =
        MqttClient::<_, 5, _>::new(socket, &mut write, MQTT_BUFFER_LEN, &mut recv, MQTT_BUFFER_LEN, config);

    client.connect_to_broker().await.map_err(SessionError::Mqtt)?;
    info!("mqtt: connected to {}:{}", session.broker, session.port);
    link.report(LinkEvent::BrokerConnected).await;

    let ping_every = Duration::from_secs(u64::from(session.keep_alive_secs / 2).max(1));
    loop {
        match select(link.next_frame(), Timer::after(ping_every)).await {
            Either::First(frame) => client
                .send_message(
                    frame.topic.as_str(),
                    frame.payload.as_bytes(),
                    QualityOfService::QoS0,
                    frame.retain,
                )
                .await
                .map_err(SessionError::Mqtt)?,
            Either::Second(()) => client.send_ping().await.map_err(SessionError::Mqtt)?,
        }
    }
}
