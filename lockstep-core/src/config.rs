use std::time::Duration;

/// The configuration of the sync engine
#[derive(Debug, Clone)]
pub struct Config {
    /// How many ping samples a clock sync run takes
    pub sample_count: usize,
    /// How long to wait between two samples, in milliseconds
    pub inter_sample_delay_ms: u64,
    /// How long to wait for a matching pong before a sample is abandoned
    pub ping_timeout_ms: u64,
    /// How often a session refreshes its clock estimate, in milliseconds
    pub resync_interval_ms: u64,
    /// How far in the future commands take effect, so every participant
    /// receives and schedules them before they fire
    pub command_lead_time_ms: u64,
    /// Drift below this magnitude is left alone, in milliseconds
    pub soft_drift_threshold_ms: f64,
    /// Drift at or above this magnitude forces a seek instead of a rate nudge
    pub hard_drift_threshold_ms: f64,
    /// How much the playback rate is nudged during a soft correction
    pub soft_correction_rate_delta: f64,
    /// How long a soft correction holds before the rate reverts
    pub soft_correction_duration_ms: u64,
    /// Minimum time between two hard corrections
    pub hard_correction_cooldown_ms: u64,
    /// How long drift samples are retained for telemetry
    pub drift_history_window_ms: u64,
    /// How long a collective vote stays open before it fails
    pub vote_ttl_ms: u64,
}

impl Config {
    /// How long to wait for a matching pong
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// How long to wait between two samples
    pub fn inter_sample_delay(&self) -> Duration {
        Duration::from_millis(self.inter_sample_delay_ms)
    }

    /// How often a session refreshes its clock estimate
    pub fn resync_interval(&self) -> Duration {
        Duration::from_millis(self.resync_interval_ms)
    }

    /// Returns the rate multiplier that nudges a drifting participant back,
    /// slowing it down when ahead and speeding it up when behind.
    pub fn soft_rate_multiplier(&self, drift_ms: f64) -> f64 {
        if drift_ms > 0.0 {
            1.0 - self.soft_correction_rate_delta
        } else {
            1.0 + self.soft_correction_rate_delta
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Enough to reject a latency spike without dragging the sync out
            sample_count: 5,
            // Spreads samples out so one congestion burst doesn't taint them all
            inter_sample_delay_ms: 100,
            ping_timeout_ms: 5000,
            // Keeps the offset fresh without noticeable traffic
            resync_interval_ms: 30_000,
            // Enough headroom for delivery and scheduling on every participant
            command_lead_time_ms: 200,
            // Below this the gap is imperceptible in lock-step viewing
            soft_drift_threshold_ms: 300.0,
            // Beyond this a rate nudge would take too long to close the gap
            hard_drift_threshold_ms: 1000.0,
            // A 3% nudge goes unnoticed by most viewers
            soft_correction_rate_delta: 0.03,
            soft_correction_duration_ms: 2000,
            // Avoids seek oscillation when reports are noisy
            hard_correction_cooldown_ms: 5000,
            // Five minutes of drift history is plenty for diagnostics
            drift_history_window_ms: 300_000,
            // Long enough to actually vote, short enough that playback
            // is not held hostage by an abandoned vote
            vote_ttl_ms: 15_000,
        }
    }
}
