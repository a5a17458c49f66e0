//! Channel bundle between a transport and the task driving the radio stack
//!
//! The core side ([`super::TransportChannel`] impls) only ever uses the
//! `try_*` methods and never waits. The stack side awaits requests and frames
//! and reports what the radio did. All primitives are `const`-constructible so
//! a `Link` can live in a `static`.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use log::warn;

use super::TransportError;

pub const EVENT_CAPACITY: usize = 8;
pub const INBOUND_CAPACITY: usize = 4;

/// Longest inbound command accepted from a peer (the ATT attribute maximum)
pub const MAX_INBOUND_LEN: usize = 512;

pub type InboundFrame = heapless::Vec<u8, MAX_INBOUND_LEN>;
pub type InboundQueue = Channel<CriticalSectionRawMutex, InboundFrame, INBOUND_CAPACITY>;

/// What the radio stack reports back to the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    AdvertisingStarted,
    PeerConnected,
    PeerSubscribed,
    PeerUnsubscribed,
    PeerDisconnected,
    BrokerConnected,
    BrokerDisconnected,
    /// Advertising could not start, or the broker/network refused the session
    HandshakeFailed,
}

/// What the transport asks of the radio stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRequest {
    /// Start advertising (BLE) or bring up the broker session (MQTT)
    Connect,
    /// Stop the attempt in progress
    Abort,
}

pub struct Link<F, const N: usize> {
    frames: Channel<CriticalSectionRawMutex, F, N>,
    events: Channel<CriticalSectionRawMutex, LinkEvent, EVENT_CAPACITY>,
    requests: Signal<CriticalSectionRawMutex, LinkRequest>,
    inbound: InboundQueue,
}

impl<F, const N: usize> Link<F, N> {
    pub const fn new() -> Self {
        Self {
            frames: Channel::new(),
            events: Channel::new(),
            requests: Signal::new(),
            inbound: Channel::new(),
        }
    }

    pub fn try_send_frame(&self, frame: F) -> Result<(), TransportError> {
        self.frames
            .try_send(frame)
            .map_err(|_| TransportError::QueueFull)
    }

    pub fn try_next_event(&self) -> Option<LinkEvent> {
        self.events.try_receive().ok()
    }

    /// Replaces any request the stack has not picked up yet.
    pub fn request(&self, request: LinkRequest) {
        self.requests.signal(request);
    }

    /// Drop every frame still waiting to go out.
    pub fn discard_frames(&self) -> usize {
        let mut count = 0;
        while self.frames.try_receive().is_ok() {
            count += 1;
        }
        count
    }

    // Stack side

    pub async fn next_request(&self) -> LinkRequest {
        self.requests.wait().await
    }

    pub fn try_take_request(&self) -> Option<LinkRequest> {
        self.requests.try_take()
    }

    pub async fn next_frame(&self) -> F {
        self.frames.receive().await
    }

    pub fn try_next_frame(&self) -> Option<F> {
        self.frames.try_receive().ok()
    }

    pub async fn report(&self, event: LinkEvent) {
        self.events.send(event).await;
    }

    pub fn try_report(&self, event: LinkEvent) -> bool {
        let sent = self.events.try_send(event).is_ok();
        if !sent {
            warn!("link event queue full, dropping {:?}", event);
        }
        sent
    }

    /// Bytes written by a peer, for the command task
    pub fn inbound(&self) -> &InboundQueue {
        &self.inbound
    }

    /// Hand a peer write to the command task. Oversized writes are rejected whole.
    pub fn push_inbound(&self, bytes: &[u8]) -> bool {
        let Ok(frame) = InboundFrame::from_slice(bytes) else {
            warn!("rejecting {} byte command, limit is {}", bytes.len(), MAX_INBOUND_LEN);
            return false;
        };

        let queued = self.inbound.try_send(frame).is_ok();
        if !queued {
            warn!("inbound command queue full, dropping {} bytes", bytes.len());
        }
        queued
    }
}

impl<F, const N: usize> Default for Link<F, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_queue_reports_full() {
        let link: Link<u8, 2> = Link::new();

        assert_eq!(link.try_send_frame(1), Ok(()));
        assert_eq!(link.try_send_frame(2), Ok(()));
        assert_eq!(link.try_send_frame(3), Err(TransportError::QueueFull));

        assert_eq!(link.try_next_frame(), Some(1));
        assert_eq!(link.discard_frames(), 1);
        assert_eq!(link.try_next_frame(), None);
    }

    #[test]
    fn test_latest_request_wins() {
        let link: Link<u8, 1> = Link::new();

        link.request(LinkRequest::Connect);
        link.request(LinkRequest::Abort);

        assert_eq!(link.try_take_request(), Some(LinkRequest::Abort));
        assert_eq!(link.try_take_request(), None);
    }

    #[test]
    fn test_events_keep_order() {
        let link: Link<u8, 1> = Link::new();

        assert!(link.try_report(LinkEvent::PeerConnected));
        assert!(link.try_report(LinkEvent::PeerSubscribed));

        assert_eq!(link.try_next_event(), Some(LinkEvent::PeerConnected));
        assert_eq!(link.try_next_event(), Some(LinkEvent::PeerSubscribed));
        assert_eq!(link.try_next_event(), None);
    }

    #[test]
    fn test_oversized_inbound_is_rejected() {
        let link: Link<u8, 1> = Link::new();

        assert!(!link.push_inbound(&[b'x'; MAX_INBOUND_LEN + 1]));
        assert!(link.inbound().try_receive().is_err());

        assert!(link.push_inbound(&[b'x'; MAX_INBOUND_LEN]));
        assert_eq!(link.inbound().try_receive().unwrap().len(), MAX_INBOUND_LEN);
    }
}
