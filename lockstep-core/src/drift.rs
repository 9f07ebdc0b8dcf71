use std::collections::VecDeque;

use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{Config, Introspect, PlaybackAnchor};

/// One comparison of a participant's reported position against the
/// anchor-derived expectation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriftSample {
    /// Positive when the participant is ahead of where it should be
    pub drift_ms: f64,
    /// The correction this observation issued, if any
    pub correction: Option<CorrectionKind>,
    /// The reference time the report was observed at
    pub timestamp_ms: i64,
}

/// How a drift gets closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionKind {
    /// A temporary rate nudge, imperceptible but gradual
    Soft,
    /// A seek, instant but visible
    Hard,
}

/// An instruction to the player layer.
///
/// The monitor only ever decides. Changing the rate or seeking is the
/// player's job, and a soft multiplier scales the anchor's nominal rate
/// rather than replacing it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CorrectionIntent {
    /// Scale the playback rate for a bounded interval, then revert.
    Soft {
        rate_multiplier: f64,
        duration_ms: u64,
    },
    /// Seek straight to the expected position.
    Hard { target_media_time_ms: f64 },
    /// Drift re-entered tolerance, restore the nominal rate early.
    Revert,
}

impl CorrectionIntent {
    fn kind(self) -> Option<CorrectionKind> {
        match self {
            Self::Soft { .. } => Some(CorrectionKind::Soft),
            Self::Hard { .. } => Some(CorrectionKind::Hard),
            Self::Revert => None,
        }
    }
}

/// The outcome of one position report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftObservation {
    /// The measurement, as retained in the monitor's history
    pub sample: DriftSample,
    /// What the player layer should do about it, if anything
    pub intent: Option<CorrectionIntent>,
}

/// Watches how far a player's actual position strays from the anchor and
/// decides when a correction is warranted.
///
/// Corrections are throttled so noisy reports cannot cause oscillation:
/// while a soft correction holds no further correction is issued until the
/// drift re-enters tolerance or the nudge interval runs out, and hard
/// corrections respect a cooldown.
pub struct DriftMonitor {
    config: Config,
    state: Mutex<MonitorState>,
}

#[derive(Debug, Default)]
struct MonitorState {
    /// Bounded rolling history of observations, for telemetry
    history: VecDeque<DriftSample>,
    /// Set while a soft correction holds
    soft_active_until_ms: Option<i64>,
    /// When the last hard correction was issued
    last_hard_at_ms: Option<i64>,
}

impl DriftMonitor {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
            state: Default::default(),
        }
    }

    /// Records a position report and decides whether to correct.
    ///
    /// Drift is classified by magnitude: below the soft threshold it is left
    /// alone, between the thresholds a temporary rate nudge closes it, at the
    /// hard threshold and beyond a seek does.
    pub fn observe(
        &self,
        reported_media_time_ms: f64,
        reference_time_ms: i64,
        anchor: &PlaybackAnchor,
    ) -> DriftObservation {
        let expected_ms = anchor.expected_media_time_ms(reference_time_ms);
        let drift_ms = reported_media_time_ms - expected_ms;

        let mut state = self.state.lock();
        let intent = self.decide(&mut state, drift_ms, reference_time_ms, anchor);

        let sample = DriftSample {
            drift_ms,
            correction: intent.and_then(CorrectionIntent::kind),
            timestamp_ms: reference_time_ms,
        };

        state.history.push_back(sample);
        self.prune_history(&mut state, reference_time_ms);

        DriftObservation { sample, intent }
    }

    /// The retained samples, oldest first.
    pub fn history(&self) -> Vec<DriftSample> {
        self.state.lock().history.iter().copied().collect()
    }

    fn decide(
        &self,
        state: &mut MonitorState,
        drift_ms: f64,
        now_ms: i64,
        anchor: &PlaybackAnchor,
    ) -> Option<CorrectionIntent> {
        let within_tolerance = drift_ms.abs() < self.config.soft_drift_threshold_ms;

        // An active soft correction suppresses further corrections until it
        // runs out or does its job.
        if let Some(until_ms) = state.soft_active_until_ms {
            if within_tolerance {
                state.soft_active_until_ms = None;
                return Some(CorrectionIntent::Revert);
            }

            if now_ms < until_ms {
                return None;
            }

            state.soft_active_until_ms = None;
        }

        if within_tolerance {
            return None;
        }

        if drift_ms.abs() >= self.config.hard_drift_threshold_ms {
            return self.issue_hard(state, drift_ms, now_ms, anchor);
        }

        state.soft_active_until_ms = Some(now_ms + self.config.soft_correction_duration_ms as i64);

        debug!("Soft correction issued for a drift of {}ms", drift_ms);

        Some(CorrectionIntent::Soft {
            rate_multiplier: self.config.soft_rate_multiplier(drift_ms),
            duration_ms: self.config.soft_correction_duration_ms,
        })
    }

    fn issue_hard(
        &self,
        state: &mut MonitorState,
        drift_ms: f64,
        now_ms: i64,
        anchor: &PlaybackAnchor,
    ) -> Option<CorrectionIntent> {
        let cooling_down = state
            .last_hard_at_ms
            .is_some_and(|at_ms| now_ms - at_ms < self.config.hard_correction_cooldown_ms as i64);

        if cooling_down {
            return None;
        }

        state.last_hard_at_ms = Some(now_ms);

        debug!("Hard correction issued for a drift of {}ms", drift_ms);

        Some(CorrectionIntent::Hard {
            target_media_time_ms: anchor.expected_media_time_ms(now_ms),
        })
    }

    fn prune_history(&self, state: &mut MonitorState, now_ms: i64) {
        let cutoff_ms = now_ms - self.config.drift_history_window_ms as i64;

        while state
            .history
            .front()
            .is_some_and(|sample| sample.timestamp_ms < cutoff_ms)
        {
            state.history.pop_front();
        }
    }
}

#[derive(Debug)]
pub struct DriftMonitorIntrospection {
    pub history: Vec<DriftSample>,
    pub soft_active_until_ms: Option<i64>,
    pub last_hard_at_ms: Option<i64>,
}

impl Introspect<DriftMonitorIntrospection> for DriftMonitor {
    fn introspect(&self) -> DriftMonitorIntrospection {
        let state = self.state.lock();

        DriftMonitorIntrospection {
            history: state.history.iter().copied().collect(),
            soft_active_until_ms: state.soft_active_until_ms,
            last_hard_at_ms: state.last_hard_at_ms,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn playing_anchor() -> PlaybackAnchor {
        PlaybackAnchor {
            room_id: 1,
            source_id: "source".to_string(),
            is_playing: true,
            playback_rate: 1.,
            anchor_reference_time_ms: 0,
            anchor_media_time_ms: 0.,
            sequence_number: 1,
        }
    }

    fn monitor() -> DriftMonitor {
        DriftMonitor::new(&Config::default())
    }

    /// The anchor starts at zero and advances one ms per ms, so the expected
    /// position equals the reference time and the report is expected + drift.
    fn observe_at(monitor: &DriftMonitor, now_ms: i64, drift_ms: f64) -> DriftObservation {
        monitor.observe(now_ms as f64 + drift_ms, now_ms, &playing_anchor())
    }

    #[test]
    fn test_classification_boundaries() {
        let cases = [
            (299., None),
            (-299., None),
            (300., Some(CorrectionKind::Soft)),
            (999., Some(CorrectionKind::Soft)),
            (1000., Some(CorrectionKind::Hard)),
            (-1200., Some(CorrectionKind::Hard)),
        ];

        for (drift_ms, expected) in cases {
            let observation = observe_at(&monitor(), 0, drift_ms);

            assert_eq!(
                observation.sample.correction, expected,
                "a drift of {}ms classifies as {:?}",
                drift_ms, expected
            );

            assert_eq!(
                observation.sample.drift_ms, drift_ms,
                "the sample records the measured drift"
            );
        }
    }

    #[test]
    fn test_soft_nudge_direction() {
        let config = Config::default();

        let ahead = observe_at(&monitor(), 0, 500.);

        assert_eq!(
            ahead.intent,
            Some(CorrectionIntent::Soft {
                rate_multiplier: 1. - config.soft_correction_rate_delta,
                duration_ms: config.soft_correction_duration_ms,
            }),
            "a participant ahead of the anchor is slowed down"
        );

        let behind = observe_at(&monitor(), 0, -500.);

        assert_eq!(
            behind.intent,
            Some(CorrectionIntent::Soft {
                rate_multiplier: 1. + config.soft_correction_rate_delta,
                duration_ms: config.soft_correction_duration_ms,
            }),
            "a participant behind the anchor is sped up"
        );
    }

    #[test]
    fn test_active_soft_correction_throttles_further_corrections() {
        let monitor = monitor();

        let first = observe_at(&monitor, 0, 500.);
        assert!(first.intent.is_some(), "the first drift is corrected");

        let second = observe_at(&monitor, 100, 600.);
        assert_eq!(
            second.intent, None,
            "no new correction while the nudge holds"
        );

        let third = observe_at(&monitor, 200, 1500.);
        assert_eq!(
            third.intent, None,
            "even a hard-range drift waits for the nudge to finish"
        );
    }

    #[test]
    fn test_revert_when_drift_reenters_tolerance() {
        let monitor = monitor();

        observe_at(&monitor, 0, 500.);

        let recovered = observe_at(&monitor, 500, 100.);

        assert_eq!(
            recovered.intent,
            Some(CorrectionIntent::Revert),
            "the nudge ends early once the drift is back in tolerance"
        );

        assert_eq!(
            recovered.sample.correction, None,
            "a revert is not a correction"
        );

        let relapse = observe_at(&monitor, 600, 400.);

        assert!(
            matches!(relapse.intent, Some(CorrectionIntent::Soft { .. })),
            "after the revert a new drift is corrected again"
        );
    }

    #[test]
    fn test_expired_soft_correction_allows_a_new_one() {
        let monitor = monitor();
        let duration_ms = Config::default().soft_correction_duration_ms as i64;

        observe_at(&monitor, 0, 500.);

        let still_active = observe_at(&monitor, duration_ms - 1, 500.);
        assert_eq!(still_active.intent, None);

        let after = observe_at(&monitor, duration_ms, 500.);

        assert!(
            matches!(after.intent, Some(CorrectionIntent::Soft { .. })),
            "a drift that outlives the nudge interval is corrected again"
        );
    }

    #[test]
    fn test_hard_corrections_respect_the_cooldown() {
        let monitor = monitor();
        let cooldown_ms = Config::default().hard_correction_cooldown_ms as i64;

        let first = observe_at(&monitor, 0, 1500.);
        assert!(
            matches!(first.intent, Some(CorrectionIntent::Hard { .. })),
            "the first hard drift seeks"
        );

        let during = observe_at(&monitor, cooldown_ms - 1, 1500.);
        assert_eq!(during.intent, None, "no second seek within the cooldown");

        let after = observe_at(&monitor, cooldown_ms, 1500.);
        assert!(
            matches!(after.intent, Some(CorrectionIntent::Hard { .. })),
            "the cooldown ends after the configured window"
        );
    }

    #[test]
    fn test_hard_correction_targets_the_expected_position() {
        let anchor = PlaybackAnchor {
            anchor_reference_time_ms: 1000,
            anchor_media_time_ms: 10_000.,
            ..playing_anchor()
        };

        let observation = monitor().observe(20_000., 3000, &anchor);

        assert_eq!(
            observation.intent,
            Some(CorrectionIntent::Hard {
                target_media_time_ms: 12_000.
            }),
            "the seek target is where playback should be right now"
        );
    }

    #[test]
    fn test_history_is_bounded_by_the_retention_window() {
        let monitor = monitor();
        let window_ms = Config::default().drift_history_window_ms as i64;

        observe_at(&monitor, 0, 0.);
        observe_at(&monitor, 10, 0.);
        observe_at(&monitor, window_ms + 100, 0.);

        let history = monitor.history();

        assert_eq!(history.len(), 1, "samples older than the window are gone");
        assert_eq!(history[0].timestamp_ms, window_ms + 100);
    }

    #[test]
    fn test_paused_anchor_expectation_is_frozen() {
        let anchor = PlaybackAnchor {
            is_playing: false,
            anchor_media_time_ms: 10_000.,
            ..playing_anchor()
        };

        let tolerated = monitor().observe(10_250., 90_000, &anchor);

        assert_eq!(
            tolerated.intent, None,
            "drift is measured against the frozen position, not elapsed time"
        );

        let rogue = monitor().observe(11_100., 90_000, &anchor);

        assert_eq!(
            rogue.intent,
            Some(CorrectionIntent::Hard {
                target_media_time_ms: 10_000.
            }),
            "a participant playing against a paused anchor is pulled back"
        );
    }
}
