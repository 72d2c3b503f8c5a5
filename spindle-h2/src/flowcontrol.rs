//! HTTP/2 flow control windows (RFC 7540 Section 6.9).
//!
//! [`FlowControl`] is the send side: what the peer allows us to send.
//! [`RecvWindow`] is the receive side: what we have allowed the peer, plus
//! the bytes the application has consumed but we have not yet announced.

use crate::error::H2Error;
use crate::settings::MAX_WINDOW_SIZE;

/// Default initial window size (RFC 7540 Section 6.9.2).
pub const DEFAULT_WINDOW_SIZE: u32 = 65_535;

/// Send window. Signed because a SETTINGS change can drive it negative.
#[derive(Debug, Clone)]
pub struct FlowControl {
    window: i64,
}

impl FlowControl {
    pub fn new(initial: u32) -> Self {
        Self {
            window: i64::from(initial),
        }
    }

    pub fn window(&self) -> i64 {
        self.window
    }

    /// Bytes that may be sent right now.
    pub fn available(&self) -> usize {
        self.window.max(0) as usize
    }

    /// Charge `amount` sent bytes. Fails without changing the window if
    /// it does not cover them.
    pub fn consume(&mut self, amount: u32) -> Result<(), H2Error> {
        let new = self.window - i64::from(amount);
        if new < 0 {
            return Err(H2Error::FlowControlError);
        }
        self.window = new;
        Ok(())
    }

    /// Apply a WINDOW_UPDATE. Fails if the window would exceed 2^31 - 1.
    pub fn increase(&mut self, increment: u32) -> Result<(), H2Error> {
        self.adjust(i64::from(increment))
    }

    /// Shift by the difference between a new and old INITIAL_WINDOW_SIZE.
    pub fn adjust(&mut self, delta: i64) -> Result<(), H2Error> {
        let new = self.window + delta;
        if new > i64::from(MAX_WINDOW_SIZE) {
            return Err(H2Error::FlowControlError);
        }
        self.window = new;
        Ok(())
    }
}

impl Default for FlowControl {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

/// Receive window with deferred acknowledgement.
///
/// Received bytes shrink the window at once. Released bytes (consumed by
/// the application) are only announced in a WINDOW_UPDATE once they add
/// up to `target / ratio`, which keeps update traffic low.
#[derive(Debug, Clone)]
pub struct RecvWindow {
    /// What the peer may still send.
    window: i64,
    /// The window size we aim to keep open.
    target: u32,
    /// Released but not yet announced.
    unacked: u32,
    ratio: u32,
}

impl RecvWindow {
    /// `initial` is the window the peer currently assumes; `ratio` of 2
    /// acknowledges after half the target has been consumed.
    pub fn new(initial: u32, ratio: u32) -> Self {
        Self {
            window: i64::from(initial),
            target: initial,
            unacked: 0,
            ratio: ratio.max(1),
        }
    }

    pub fn window(&self) -> i64 {
        self.window
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    pub fn set_ratio(&mut self, ratio: u32) {
        self.ratio = ratio.max(1);
    }

    /// Charge `amount` received bytes. Exceeding the window is a flow
    /// control violation by the peer.
    pub fn consume(&mut self, amount: u32) -> Result<(), H2Error> {
        let new = self.window - i64::from(amount);
        if new < 0 {
            return Err(H2Error::FlowControlError);
        }
        self.window = new;
        Ok(())
    }

    /// Return `amount` consumed bytes to the peer. Yields the increment
    /// to put in a WINDOW_UPDATE once enough has accumulated.
    pub fn release(&mut self, amount: u32) -> Option<u32> {
        self.unacked = self.unacked.saturating_add(amount);
        if self.unacked == 0 || self.unacked < self.target / self.ratio {
            return None;
        }
        let increment = std::mem::take(&mut self.unacked);
        self.window += i64::from(increment);
        Some(increment)
    }

    /// Raise the target window. Yields the increment that announces the
    /// extra room, if any.
    pub fn grow_to(&mut self, target: u32) -> Option<u32> {
        let target = target.min(MAX_WINDOW_SIZE);
        let increment = target.checked_sub(self.target).filter(|&n| n > 0)?;
        self.target = target;
        self.window += i64::from(increment);
        Some(increment)
    }
}
