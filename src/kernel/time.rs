/// Seconds on the audio output clock. Monotonic, owned by the output device.
pub type ClockTime = f64;

/// Start times closer than this to the natural continuation point are not gaps.
pub const GAP_EPSILON: ClockTime = 0.001;

/// Timing knobs of the gapless scheduler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timing {
    /// Lead time before the first segment after start, resume or seek.
    pub settle_delay: ClockTime,
    /// Minimum distance between "now" and any scheduled start.
    pub safety_margin: ClockTime,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            settle_delay: 0.05,
            safety_margin: 0.02,
        }
    }
}

impl Timing {
    pub fn from_millis(settle_delay_ms: u64, safety_margin_ms: u64) -> Self {
        Self {
            settle_delay: ms_to_secs(settle_delay_ms),
            safety_margin: ms_to_secs(safety_margin_ms),
        }
    }
}

pub fn ms_to_secs(ms: u64) -> ClockTime {
    ms as f64 / 1000.0
}
