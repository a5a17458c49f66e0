//! The sample → encode → send cycle
//!
//! [`NodeController::tick`] is one cycle. The link is serviced on every tick,
//! awake or not, so a sleeping node still keeps its connection alive and
//! reconnects on schedule.

use embassy_time::{Duration, Instant, Timer};
use log::{debug, info, warn};

use crate::node_state::SharedNodeState;
use crate::record;
use crate::sampling::SensorSampler;
use crate::supervisor::ConnectionSupervisor;
use crate::transport::{ConnectionState, Delivery, TransportChannel, TransportError};

/// What one tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub link: ConnectionState,
    pub outcome: TickOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Asleep,
    Sampled {
        readings: usize,
        sent: usize,
        /// Encoded but not delivered (link down, no subscriber, queue full)
        dropped: usize,
        /// Failed readings, never encoded
        skipped: usize,
    },
}

pub struct NodeController<'a, S, T> {
    state: &'a SharedNodeState,
    sampler: S,
    supervisor: ConnectionSupervisor<T>,
    period: Duration,
}

impl<'a, S, T> NodeController<'a, S, T>
where
    S: SensorSampler,
    T: TransportChannel,
{
    pub fn new(
        state: &'a SharedNodeState,
        sampler: S,
        supervisor: ConnectionSupervisor<T>,
        period: Duration,
    ) -> Self {
        Self {
            state,
            sampler,
            supervisor,
            period,
        }
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor<T> {
        &self.supervisor
    }

    pub async fn tick(&mut self, now: Instant) -> TickReport {
        let link = self.supervisor.step(now);

        let snapshot = self.state.update(|state| {
            if state.is_awake && state.last_wake_time.is_none() {
                state.last_wake_time = Some(now);
            }
            state.clone()
        });

        if !snapshot.is_awake {
            debug!("asleep, link {:?}", link);
            return TickReport {
                link,
                outcome: TickOutcome::Asleep,
            };
        }

        let readings = self.sampler.sample_all(now).await;
        let (mut sent, mut dropped, mut skipped) = (0, 0, 0);

        for reading in &readings {
            let Some(record) = record::encode(reading, &snapshot) else {
                skipped += 1;
                continue;
            };

            match self.supervisor.deliver(&record) {
                Ok(Delivery::Queued) => sent += 1,
                Ok(Delivery::Dropped) | Err(TransportError::NotConnected) => dropped += 1,
                Err(e) => {
                    warn!("{} record dropped: {}", record.sensor_type.as_str(), e);
                    dropped += 1;
                }
            }
        }

        if dropped > 0 {
            warn!("{} record(s) dropped, link {:?}", dropped, link);
        }
        debug!(
            "tick: {} reading(s), {} sent, {} skipped",
            readings.len(),
            sent,
            skipped
        );

        TickReport {
            link,
            outcome: TickOutcome::Sampled {
                readings: readings.len(),
                sent,
                dropped,
                skipped,
            },
        }
    }

    /// Sampling task body: one tick per period. A slow tick delays the next
    /// one; missed periods are not made up.
    pub async fn run(&mut self) -> ! {
        info!("sampling every {} ms", self.period.as_millis());

        loop {
            let started = Instant::now();
            self.tick(started).await;
            Timer::at(started + self.period).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;
    use alloc::vec::Vec;
    use core::cell::Cell;

    use super::*;
    use crate::command::CommandChannel;
    use crate::node_state::{NodeIdentity, NodeState};
    use crate::sensors::{Reading, SensorChannel, SensorType, Unit};
    use crate::supervisor::Backoff;
    use crate::transport::ble::{BleLayout, BleLink, BleNotifyChannel};
    use crate::transport::link::LinkEvent;
    use crate::transport::mqtt::{MqttLink, MqttPublishChannel};
    use crate::test_clock::{exclusive, settle};
    use embassy_futures::block_on;
    use embassy_futures::select::select;
    use embassy_time::MockDriver;

    /// Sampler returning fixed values and counting calls
    struct FixedSampler {
        calls: usize,
        distance: Option<f64>,
    }

    impl SensorSampler for FixedSampler {
        async fn sample_all(&mut self, now: Instant) -> Vec<Reading> {
            self.calls += 1;
            let distance = SensorChannel::new(SensorType::Distance, Unit::Centimeter);
            vec![
                Reading::new(
                    "bmp280",
                    SensorChannel::new(SensorType::Temperature, Unit::Celsius),
                    21.5,
                    now,
                ),
                match self.distance {
                    Some(cm) => Reading::new("hcsr04", distance, cm, now),
                    None => Reading::failed("hcsr04", distance, now),
                },
            ]
        }
    }

    fn sampler() -> FixedSampler {
        FixedSampler {
            calls: 0,
            distance: Some(42.0),
        }
    }

    fn shared() -> SharedNodeState {
        SharedNodeState::new(NodeState::new(NodeIdentity::new("esp32_sensor_001", "C4").unwrap()))
    }

    fn backoff() -> Backoff {
        Backoff::new(Duration::from_millis(500), Duration::from_millis(30_000))
    }

    fn ms(value: u64) -> Instant {
        Instant::from_millis(value)
    }

    fn sampled(sent: usize, dropped: usize, skipped: usize) -> TickOutcome {
        TickOutcome::Sampled {
            readings: 2,
            sent,
            dropped,
            skipped,
        }
    }

    fn drain(link: &MqttLink) -> Vec<Published> {
        let mut frames = Vec::new();
        while let Some(frame) = link.try_next_frame() {
            frames.push(Published {
                topic: frame.topic.as_str().into(),
                retain: frame.retain,
            });
        }
        frames
    }

    #[derive(Debug, PartialEq)]
    struct Published {
        topic: alloc::string::String,
        retain: bool,
    }

    #[test]
    fn test_connected_tick_publishes_every_valid_reading() {
        let state = shared();
        let link = MqttLink::new();
        let supervisor = ConnectionSupervisor::new(MqttPublishChannel::new(&link), backoff());
        let mut controller = NodeController::new(&state, sampler(), supervisor, Duration::from_secs(1));

        let report = block_on(controller.tick(ms(0)));
        assert_eq!(report.link, ConnectionState::Connecting);
        assert_eq!(report.outcome, sampled(0, 2, 0));

        link.try_report(LinkEvent::BrokerConnected);
        let report = block_on(controller.tick(ms(1000)));
        assert_eq!(report.link, ConnectionState::Connected);
        assert_eq!(report.outcome, sampled(2, 0, 0));

        let frames = drain(&link);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].topic, "ecoguard/sensors/C4/temperature");
        assert_eq!(frames[1].topic, "ecoguard/sensors/C4/distance");
        assert!(frames.iter().all(|f| f.retain));
    }

    #[test]
    fn test_failed_reading_is_skipped_not_sent() {
        let state = shared();
        let link = MqttLink::new();
        let supervisor = ConnectionSupervisor::new(MqttPublishChannel::new(&link), backoff());
        let mut sampler = sampler();
        sampler.distance = None;
        let mut controller = NodeController::new(&state, sampler, supervisor, Duration::from_secs(1));

        block_on(controller.tick(ms(0)));
        link.try_report(LinkEvent::BrokerConnected);
        let report = block_on(controller.tick(ms(1000)));

        assert_eq!(report.outcome, sampled(1, 0, 1));
        assert_eq!(drain(&link).len(), 1);
    }

    #[test]
    fn test_sleeping_node_keeps_servicing_link() {
        let state = shared();
        let link = BleLink::new();
        let supervisor = ConnectionSupervisor::new(BleNotifyChannel::new(&link, BleLayout::JsonTx), backoff());
        let mut controller = NodeController::new(&state, sampler(), supervisor, Duration::from_secs(1));
        state.update(|s| s.sleep());

        let report = block_on(controller.tick(ms(0)));
        assert_eq!(report.outcome, TickOutcome::Asleep);
        assert_eq!(report.link, ConnectionState::Connecting);

        link.try_report(LinkEvent::PeerSubscribed);
        let report = block_on(controller.tick(ms(1000)));
        assert_eq!(report.link, ConnectionState::Connected);
        assert_eq!(controller.sampler.calls, 0);
        assert_eq!(link.try_next_frame(), None);
    }

    #[test]
    fn test_wake_command_resumes_sampling() {
        let state = shared();
        let commands = CommandChannel::new(&state);
        let link = BleLink::new();
        let supervisor = ConnectionSupervisor::new(BleNotifyChannel::new(&link, BleLayout::JsonTx), backoff());
        let mut controller = NodeController::new(&state, sampler(), supervisor, Duration::from_secs(1));

        commands.on_command(br#"{"command":"sleep"}"#, ms(10));
        assert_eq!(block_on(controller.tick(ms(1000))).outcome, TickOutcome::Asleep);

        commands.on_command(br#"{"command":"wake"}"#, ms(1500));
        let report = block_on(controller.tick(ms(2000)));

        assert!(matches!(report.outcome, TickOutcome::Sampled { readings: 2, .. }));
        assert_eq!(controller.sampler.calls, 1);
        assert_eq!(state.snapshot().last_wake_time, Some(ms(1500)));
    }

    #[test]
    fn test_first_awake_tick_sets_wake_time() {
        let state = shared();
        let link = BleLink::new();
        let supervisor = ConnectionSupervisor::new(BleNotifyChannel::new(&link, BleLayout::JsonTx), backoff());
        let mut controller = NodeController::new(&state, sampler(), supervisor, Duration::from_secs(1));

        block_on(controller.tick(ms(250)));
        block_on(controller.tick(ms(1250)));

        assert_eq!(state.snapshot().last_wake_time, Some(ms(250)));
    }

    #[test]
    fn test_link_loss_drops_records_until_backoff_reconnect() {
        let state = shared();
        let link = MqttLink::new();
        let supervisor = ConnectionSupervisor::new(MqttPublishChannel::new(&link), backoff());
        let mut controller = NodeController::new(&state, sampler(), supervisor, Duration::from_millis(200));

        block_on(controller.tick(ms(0)));
        link.try_report(LinkEvent::BrokerConnected);
        block_on(controller.tick(ms(200)));
        drain(&link);
        assert_eq!(link.try_take_request(), Some(crate::transport::LinkRequest::Connect));

        link.try_report(LinkEvent::BrokerDisconnected);
        let report = block_on(controller.tick(ms(400)));
        assert_eq!(report.link, ConnectionState::Disconnected);
        assert_eq!(report.outcome, sampled(0, 2, 0));

        // Still inside the 500 ms backoff: no new attempt, sampling goes on
        let report = block_on(controller.tick(ms(600)));
        assert_eq!(report.link, ConnectionState::Disconnected);
        assert_eq!(report.outcome, sampled(0, 2, 0));
        assert_eq!(link.try_take_request(), None);

        let report = block_on(controller.tick(ms(900)));
        assert_eq!(report.link, ConnectionState::Connecting);
        assert_eq!(link.try_take_request(), Some(crate::transport::LinkRequest::Connect));
        assert_eq!(controller.supervisor().stats().link_losses, 1);
        assert_eq!(controller.sampler.calls, 5);
    }

    /// Sampler whose `stall_on`-th call takes `stall` of mock time
    struct StallingSampler<'a> {
        calls: &'a Cell<usize>,
        stall_on: usize,
        stall: Duration,
    }

    impl SensorSampler for StallingSampler<'_> {
        async fn sample_all(&mut self, _now: Instant) -> Vec<Reading> {
            self.calls.set(self.calls.get() + 1);
            if self.calls.get() == self.stall_on {
                MockDriver::get().advance(self.stall);
            }
            Vec::new()
        }
    }

    #[test]
    fn test_slow_tick_delays_next_without_catch_up_burst() {
        let _clock = exclusive();
        let state = shared();
        let link = MqttLink::new();
        let supervisor = ConnectionSupervisor::new(MqttPublishChannel::new(&link), backoff());
        let calls = Cell::new(0);
        let sampler = StallingSampler {
            calls: &calls,
            stall_on: 2,
            stall: Duration::from_millis(350),
        };
        let mut controller = NodeController::new(&state, sampler, supervisor, Duration::from_millis(100));

        let script = async {
            settle().await;
            assert_eq!(calls.get(), 1);

            // Second tick overruns by 250 ms; the third follows right away
            MockDriver::get().advance(Duration::from_millis(100));
            settle().await;
            assert_eq!(calls.get(), 3);

            MockDriver::get().advance(Duration::from_millis(99));
            settle().await;
            assert_eq!(calls.get(), 3);

            MockDriver::get().advance(Duration::from_millis(1));
            settle().await;
            assert_eq!(calls.get(), 4);
        };

        let _ = block_on(select(controller.run(), script));
    }
}
