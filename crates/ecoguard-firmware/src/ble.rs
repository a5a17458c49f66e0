//! BLE GATT server driving the [`BleLink`]
//!
//! One service exposes the JSON TX characteristic, the command RX
//! characteristic and one characteristic per sensor type. Advertising starts
//! only when the supervisor requests a connection; a peer enabling
//! notifications on any notify characteristic completes the handshake.

use ecoguard_core::record::MAX_JSON_LEN;
use ecoguard_core::sensors::SensorType;
use ecoguard_core::transport::link::MAX_INBOUND_LEN;
use ecoguard_core::transport::ble::{BleLink, Characteristic as Target, NotifyFrame};
use ecoguard_core::transport::{LinkEvent, LinkRequest};
use embassy_futures::join::join;
use embassy_futures::select::{Either, select};
use log::{error, info, warn};
use trouble_host::prelude::*;

const CONNECTIONS_MAX: usize = 1;
const L2CAP_CHANNELS_MAX: usize = 2;

type Value = heapless::Vec<u8, MAX_JSON_LEN>;
type CommandValue = heapless::Vec<u8, MAX_INBOUND_LEN>;

#[gatt_server]
pub struct Server {
    pub telemetry: TelemetryService,
}

#[gatt_service(uuid = "4fafc201-1fb5-459e-8fcc-c5c9c331914b")]
pub struct TelemetryService {
    #[characteristic(uuid = "beb5483e-36e1-4688-b7f5-ea07361b26a8", read, notify)]
    pub tx: Value,
    #[characteristic(uuid = "beb5483e-36e1-4688-b7f5-ea07361b26a9", write)]
    pub rx: CommandValue,
    #[characteristic(uuid = "beb5483e-36e1-4688-b7f5-ea07361b26b0", read, notify)]
    pub temperature: Value,
    #[characteristic(uuid = "beb5483e-36e1-4688-b7f5-ea07361b26b1", read, notify)]
    pub pressure: Value,
    #[characteristic(uuid = "beb5483e-36e1-4688-b7f5-ea07361b26b2", read, notify)]
    pub sound: Value,
    #[characteristic(uuid = "beb5483e-36e1-4688-b7f5-ea07361b26b3", read, notify)]
    pub distance: Value,
}

impl TelemetryService {
    fn target(&self, target: Target) -> &Characteristic<Value> {
        match target {
            Target::Tx => &self.tx,
            Target::Sensor(SensorType::Temperature) => &self.temperature,
            Target::Sensor(SensorType::Pressure) => &self.pressure,
            Target::Sensor(SensorType::Sound) => &self.sound,
            Target::Sensor(SensorType::Distance) => &self.distance,
        }
    }

    fn is_notify_cccd(&self, handle: u16) -> bool {
        [
            &self.tx,
            &self.temperature,
            &self.pressure,
            &self.sound,
            &self.distance,
        ]
        .iter()
        .any(|c| c.cccd_handle == Some(handle))
    }
}

/// Run the BLE host and the peripheral loop forever.
pub async fn run<C: Controller>(controller: C, link: &BleLink, name: &str) {
    let address = Address::random([0xff, 0x8f, 0x1a, 0x05, 0xe4, 0xff]);
    let mut resources: HostResources<DefaultPacketPool, CONNECTIONS_MAX, L2CAP_CHANNELS_MAX> =
        HostResources::new();
    let stack = trouble_host::new(controller, &mut resources).set_random_address(address);
    let Host {
        mut peripheral,
        mut runner,
        ..
    } = stack.build();

    let server = match Server::new_with_config(GapConfig::Peripheral(PeripheralConfig {
        name,
        appearance: &appearance::sensor::GENERIC_SENSOR,
    })) {
        Ok(server) => server,
        Err(e) => {
            error!("ble: GATT server setup failed: {:?}", e);
            return;
        }
    };

    let host = async {
        if let Err(e) = runner.run().await {
            error!("ble: host stopped: {:?}", e);
        }
    };
    join(host, serve(&mut peripheral, &server, link, name)).await;
}

async fn serve<'v, C: Controller>(
    peripheral: &mut Peripheral<'v, C, DefaultPacketPool>,
    server: &'v Server<'v>,
    link: &BleLink,
    name: &'v str,
) {
    loop {
        while link.next_request().await != LinkRequest::Connect {}

        link.report(LinkEvent::AdvertisingStarted).await;
        info!("ble: advertising as {}", name);

        let conn = match select(advertise(name, peripheral, server), aborted(link)).await {
            Either::First(Ok(conn)) => conn,
            Either::First(Err(e)) => {
                warn!("ble: advertising failed: {:?}", e);
                link.report(LinkEvent::HandshakeFailed).await;
                continue;
            }
            Either::Second(()) => continue,
        };

        link.report(LinkEvent::PeerConnected).await;
        select(gatt_events(server, &conn, link), notify_frames(server, &conn, link)).await;
        link.report(LinkEvent::PeerDisconnected).await;
    }
}

async fn aborted(link: &BleLink) {
    while link.next_request().await != LinkRequest::Abort {}
}

async fn advertise<'v, 's, C: Controller>(
    name: &'v str,
    peripheral: &mut Peripheral<'v, C, DefaultPacketPool>,
    server: &'s Server<'v>,
) -> Result<GattConnection<'v, 's, DefaultPacketPool>, BleHostError<C::Error>> {
    let mut adv_data = [0; 31];
    let len = AdStructure::encode_slice(
        &[
            AdStructure::Flags(LE_GENERAL_DISCOVERABLE | BR_EDR_NOT_SUPPORTED),
            AdStructure::CompleteLocalName(name.as_bytes()),
        ],
        &mut adv_data[..],
    )?;

    let advertiser = peripheral
        .advertise(
            &Default::default(),
            Advertisement::ConnectableScannableUndirected {
                adv_data: &adv_data[..len],
                scan_data: &[],
            },
        )
        .await?;
    let conn = advertiser.accept().await?.with_attribute_server(server)?;
    Ok(conn)
}

/// Forward command writes and subscription changes until the peer leaves.
async fn gatt_events(server: &Server<'_>, conn: &GattConnection<'_, '_, DefaultPacketPool>, link: &BleLink) {
    let service = &server.telemetry;

    loop {
        match conn.next().await {
            GattConnectionEvent::Disconnected { reason } => {
                info!("ble: peer disconnected: {:?}", reason);
                return;
            }
            GattConnectionEvent::Gatt { event } => {
                if let GattEvent::Write(write) = &event {
                    if write.handle() == service.rx.handle {
                        link.push_inbound(write.data());
                    } else if service.is_notify_cccd(write.handle()) {
                        let enabled = write.data().first().is_some_and(|flags| flags & 0x01 != 0);
                        let event = if enabled {
                            LinkEvent::PeerSubscribed
                        } else {
                            LinkEvent::PeerUnsubscribed
                        };
                        link.report(event).await;
                    }
                }

                match event.accept() {
                    Ok(reply) => reply.send().await,
                    Err(e) => warn!("ble: error sending response: {:?}", e),
                }
            }
            _ => {}
        }
    }
}

async fn notify_frames(server: &Server<'_>, conn: &GattConnection<'_, '_, DefaultPacketPool>, link: &BleLink) {
    loop {
        let NotifyFrame { characteristic, payload } = link.next_frame().await;
        let Ok(value) = Value::from_slice(payload.as_bytes()) else {
            continue;
        };

        if let Err(e) = server.telemetry.target(characteristic).notify(conn, &value).await {
            warn!("ble: notify failed: {:?}", e);
        }
    }
}
