//! Reconnect policy for a transport
//!
//! The supervisor is advanced by [`ConnectionSupervisor::step`] once per tick.
//! It never waits: a retry that is not due yet is simply skipped until a
//! later step.

use embassy_time::{Duration, Instant};
use log::{debug, error, info, warn};

use crate::record::TelemetryRecord;
use crate::transport::{ConnectionState, Delivery, TransportChannel, TransportError};

/// Capped exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub const fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay before the next retry
    pub const fn current(&self) -> Duration {
        self.current
    }

    /// Take the current delay and double it for next time, up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let doubled = Duration::from_ticks(self.current.as_ticks().saturating_mul(2));
        self.current = if doubled > self.max { self.max } else { doubled };
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    pub attempts: u32,
    pub failures: u32,
    pub link_losses: u32,
}

pub struct ConnectionSupervisor<T> {
    transport: T,
    backoff: Backoff,
    handshake_timeout: Option<Duration>,
    /// `None` until the first failure: the first attempt is immediate.
    retry_at: Option<Instant>,
    attempt_started: Option<Instant>,
    observed: ConnectionState,
    stats: SupervisorStats,
}

impl<T: TransportChannel> ConnectionSupervisor<T> {
    pub fn new(transport: T, backoff: Backoff) -> Self {
        let observed = transport.current_state();
        Self {
            transport,
            backoff,
            handshake_timeout: None,
            retry_at: None,
            attempt_started: None,
            observed,
            stats: SupervisorStats::default(),
        }
    }

    /// Abort attempts still `Connecting` after `timeout`.
    ///
    /// Left unset for BLE, where advertising legitimately waits for a peer.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.observed
    }

    pub fn stats(&self) -> SupervisorStats {
        self.stats
    }

    /// When the next connection attempt is allowed, if one is pending
    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Service the link: observe transitions, enforce the handshake timeout and
    /// start a new attempt once the backoff has elapsed.
    pub fn step(&mut self, now: Instant) -> ConnectionState {
        let previous = self.observed;
        let mut state = self.transport.poll();

        match (previous, state) {
            (ConnectionState::Connecting, ConnectionState::Connected) => self.link_up(),
            (ConnectionState::Connected, ConnectionState::Disconnected) => {
                self.stats.link_losses += 1;
                warn!("link lost ({} so far)", self.stats.link_losses);
                self.schedule_retry(now);
            }
            (ConnectionState::Connecting, ConnectionState::Disconnected) => {
                self.stats.failures += 1;
                error!("connection attempt failed");
                self.schedule_retry(now);
            }
            _ => {}
        }

        if state == ConnectionState::Connecting && self.handshake_timed_out(now) {
            self.stats.failures += 1;
            error!("handshake timed out");
            self.transport.abort();
            self.schedule_retry(now);
            state = self.transport.current_state();
        }

        if state == ConnectionState::Disconnected && self.retry_at.is_none_or(|at| now >= at) {
            self.stats.attempts += 1;
            debug!("connection attempt {}", self.stats.attempts);

            match self.transport.connect() {
                Ok(()) if self.transport.current_state() == ConnectionState::Connected => self.link_up(),
                Ok(()) => {
                    self.attempt_started = Some(now);
                    self.retry_at = None;
                }
                Err(e) => {
                    self.stats.failures += 1;
                    error!("could not start connection attempt: {}", e);
                    self.schedule_retry(now);
                }
            }
            state = self.transport.current_state();
        }

        self.observed = state;
        state
    }

    /// Hand a record to the transport, only while `Connected`.
    pub fn deliver(&mut self, record: &TelemetryRecord) -> Result<Delivery, TransportError> {
        if self.transport.current_state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        self.transport.send(record)
    }

    fn link_up(&mut self) {
        info!(
            "link up after {} attempt(s), {} failure(s)",
            self.stats.attempts, self.stats.failures
        );
        self.backoff.reset();
        self.attempt_started = None;
        self.retry_at = None;
    }

    fn handshake_timed_out(&self, now: Instant) -> bool {
        match (self.handshake_timeout, self.attempt_started) {
            (Some(timeout), Some(started)) => now.saturating_duration_since(started) >= timeout,
            _ => false,
        }
    }

    fn schedule_retry(&mut self, now: Instant) {
        let delay = self.backoff.next_delay();
        self.attempt_started = None;
        self.retry_at = Some(now + delay);
        info!("retrying connection in {} ms", delay.as_millis());
    }
}
