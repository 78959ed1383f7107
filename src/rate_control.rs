//! Periodic rate-control reset scheduling.
//!
//! The VPU's rate control accumulates error over long runs. When frame
//! skipping is enabled the encoder resets the accumulator on a wall-clock
//! schedule derived from the bitrate, but only once an IDR interval has
//! passed since the last intra picture, and forces an IDR on the next
//! coded picture after each reset.

use std::time::{Duration, Instant};

/// Bitrate assumed when none is configured.
pub const DEFAULT_BITRATE: u32 = 1_000_000;

/// Wall-clock period between resets for a bitrate.
#[must_use]
pub fn reset_interval(bitrate: u32) -> Duration {
    let bps = if bitrate == 0 { DEFAULT_BITRATE } else { bitrate };
    Duration::from_secs((240_000_000 / u64::from(bps)) * 60)
}

/// Debug view of the controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateControlSnapshot {
    pub idr_countdown: u32,
    pub idr_interval: u32,
    pub next_reset: Option<Instant>,
    pub reset_interval: Duration,
}

/// Rate-control reset scheduler.
#[derive(Debug, Clone)]
pub struct RateController {
    enabled: bool,
    idr_interval: u32,
    idr_countdown: u32,
    reset_interval: Duration,
    next_reset: Option<Instant>,
    pending_idr: bool,
}

impl RateController {
    #[must_use]
    pub fn new(enabled: bool, bitrate: u32, idr_interval: u32) -> Self {
        Self {
            enabled,
            idr_interval,
            idr_countdown: idr_interval,
            reset_interval: reset_interval(bitrate),
            next_reset: None,
            pending_idr: true,
        }
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Schedule the first reset. Later calls do nothing.
    pub fn arm(&mut self, now: Instant) {
        if self.enabled && self.next_reset.is_none() {
            self.next_reset = Some(now + self.reset_interval);
        }
    }

    #[must_use]
    pub fn should_reset(&self, now: Instant) -> bool {
        self.enabled
            && self.idr_countdown == 0
            && self.next_reset.map_or(false, |next| now >= next)
    }

    /// Record a reset and schedule the next one.
    pub fn on_reset(&mut self, now: Instant) {
        self.next_reset = Some(now + self.reset_interval);
        self.pending_idr = true;
    }

    /// An intra picture went out, satisfying any pending IDR request.
    pub fn on_idr_emitted(&mut self) {
        self.idr_countdown = self.idr_interval;
        self.pending_idr = false;
    }

    pub fn on_frame_advance(&mut self) {
        self.idr_countdown = self.idr_countdown.saturating_sub(1);
    }

    /// Whether the next picture must be an IDR.
    ///
    /// Set for a new stream and after each reset. Stays set until an intra
    /// picture is emitted, so a skipped frame carries it to the next one.
    #[must_use]
    pub fn pending_idr(&self) -> bool {
        self.pending_idr
    }

    /// Ask for an IDR on the next picture.
    pub fn request_idr(&mut self) {
        self.pending_idr = true;
    }

    #[must_use]
    pub fn snapshot(&self) -> Option<RateControlSnapshot> {
        self.enabled.then(|| RateControlSnapshot {
            idr_countdown: self.idr_countdown,
            idr_interval: self.idr_interval,
            next_reset: self.next_reset,
            reset_interval: self.reset_interval,
        })
    }
}
