//! Remote control commands
//!
//! Commands arrive as raw bytes written by a peer, e.g. `{"command":"sleep"}`.
//! Matching is by substring, so any surrounding JSON is accepted. Unknown or
//! empty payloads are ignored without a reply.

use embassy_time::{Duration, Instant, Timer};
use log::{debug, info};

use crate::node_state::SharedNodeState;
use crate::transport::link::InboundQueue;

/// Time given to in-flight notifications before restarting
pub const REBOOT_FLUSH_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Wake,
    Sleep,
    Reboot,
}

impl Command {
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if contains(raw, br#""command":"wake""#) {
            Some(Self::Wake)
        } else if contains(raw, br#""command":"sleep""#) {
            Some(Self::Sleep)
        } else if contains(raw, br#""command":"reboot""#) {
            Some(Self::Reboot)
        } else {
            None
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// Platform hook performing a full restart
pub trait Restart {
    fn restart(&mut self);
}

/// Applies inbound commands to the shared node state.
pub struct CommandChannel<'a> {
    state: &'a SharedNodeState,
}

impl<'a> CommandChannel<'a> {
    pub fn new(state: &'a SharedNodeState) -> Self {
        Self { state }
    }

    /// Parse and apply one command received at `now`.
    ///
    /// `Reboot` is returned to the caller, which owns the restart.
    pub fn on_command(&self, raw: &[u8], now: Instant) -> Option<Command> {
        let Some(command) = Command::parse(raw) else {
            debug!("ignoring {} byte(s) of unrecognized command input", raw.len());
            return None;
        };

        match command {
            Command::Wake => {
                self.state.update(|state| state.wake(now));
                info!("wake command received");
            }
            Command::Sleep => {
                self.state.update(|state| state.sleep());
                info!("sleep command received");
            }
            Command::Reboot => info!("reboot command received"),
        }

        Some(command)
    }

    /// Command task body: apply queued commands as they arrive.
    pub async fn run<R: Restart>(&self, inbound: &InboundQueue, restart: &mut R) -> ! {
        loop {
            let frame = inbound.receive().await;

            if let Some(Command::Reboot) = self.on_command(&frame, Instant::now()) {
                Timer::after(REBOOT_FLUSH_DELAY).await;
                restart.restart();
            }
        }
    }
}
