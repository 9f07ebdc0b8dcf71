use std::sync::Arc;

use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{sleep, timeout_at, Instant};

use crate::{local_now_ms, Config, TimePong, TimeSource};

/// One round-trip measurement against the reference clock.
/// Created during a sync run and discarded after aggregation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSample {
    /// What this round trip suggests the clock offset is
    pub offset_ms: f64,
    /// How long the round trip took
    pub rtt_ms: f64,
    /// When the sample was taken, in local unix milliseconds
    pub taken_at_local_ms: i64,
}

/// The relation between the local clock and the reference clock.
///
/// Adding `offset_ms` to a local reading yields reference time. The default
/// value is the never-synchronized state, where the offset degrades to zero
/// and `synced` tells callers the translation is a raw fallback.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClockEstimate {
    pub offset_ms: f64,
    /// Mean round-trip time across all samples, for diagnostics
    pub average_rtt_ms: f64,
    /// True once at least one sample was successfully aggregated
    pub synced: bool,
}

#[derive(Debug, Error)]
pub enum ClockError {
    /// No matching pong arrived within the per-sample deadline
    #[error("Timed out waiting for a matching pong")]
    Timeout,
    /// The time source closed before replying
    #[error("Time source is no longer available")]
    SourceClosed,
}

impl ClockEstimate {
    /// Translates a local wall-clock reading into reference time.
    pub fn reference_time_ms(&self, local_time_ms: i64) -> i64 {
        local_time_ms + self.offset_ms.round() as i64
    }

    /// Translates a reference-clock instant into local wall-clock time.
    pub fn local_time_ms(&self, reference_time_ms: i64) -> i64 {
        reference_time_ms - self.offset_ms.round() as i64
    }
}

impl Default for ClockEstimate {
    fn default() -> Self {
        Self {
            offset_ms: 0.,
            average_rtt_ms: 0.,
            synced: false,
        }
    }
}

/// Estimates the offset between the local clock and a reference clock
/// from repeated ping/pong round trips.
pub struct ClockSynchronizer<T> {
    config: Config,
    source: Arc<T>,
}

impl<T> ClockSynchronizer<T>
where
    T: TimeSource,
{
    pub fn new(config: Config, source: Arc<T>) -> Self {
        Self { config, source }
    }

    /// Runs a full sampling round against the source and aggregates the result.
    ///
    /// A lost pong fails only its own sample. The run errors only when no
    /// sample at all could be taken, so the caller keeps its prior estimate.
    pub async fn sync(&self) -> Result<ClockEstimate, ClockError> {
        let mut samples = Vec::with_capacity(self.config.sample_count);
        let mut last_error = None;

        for round in 0..self.config.sample_count {
            match self.take_sample().await {
                Ok(sample) => samples.push(sample),
                Err(err) => {
                    warn!("Clock sample {} failed: {}", round + 1, err);
                    last_error = Some(err);
                }
            }

            let is_last_round = round + 1 == self.config.sample_count;

            if !is_last_round {
                sleep(self.config.inter_sample_delay()).await;
            }
        }

        aggregate_samples(&samples).ok_or_else(|| last_error.unwrap_or(ClockError::Timeout))
    }

    /// Performs one ping/pong round trip.
    async fn take_sample(&self) -> Result<ClockSample, ClockError> {
        let send_time_ms = local_now_ms();
        self.source.send_ping(send_time_ms).await;

        let deadline = Instant::now() + self.config.ping_timeout();

        loop {
            let pong = timeout_at(deadline, self.source.recv_pong())
                .await
                .map_err(|_| ClockError::Timeout)?
                .ok_or(ClockError::SourceClosed)?;

            // A reply to an older ping. Keep waiting for the matching one
            // within the same deadline.
            if pong.client_send_time_ms != send_time_ms {
                continue;
            }

            return Ok(sample_from_pong(send_time_ms, local_now_ms(), pong));
        }
    }
}

/// Computes the offset a single round trip suggests, assuming the one-way
/// delay is symmetric.
fn sample_from_pong(send_time_ms: i64, receive_time_ms: i64, pong: TimePong) -> ClockSample {
    let rtt_ms = (receive_time_ms - send_time_ms) as f64;

    // The pong left the reference clock half a round trip ago, so the
    // reference clock reads this at the receive instant.
    let reference_at_receive = pong.reference_time_ms as f64 + rtt_ms / 2.;

    ClockSample {
        offset_ms: reference_at_receive - receive_time_ms as f64,
        rtt_ms,
        taken_at_local_ms: receive_time_ms,
    }
}

/// Combines the samples of one sync run into an estimate.
///
/// Only the samples with the lowest round-trip times contribute to the
/// offset, since a low RTT means the symmetric-delay assumption held best.
/// The average RTT is taken over every sample regardless.
pub fn aggregate_samples(samples: &[ClockSample]) -> Option<ClockEstimate> {
    if samples.is_empty() {
        return None;
    }

    let mut by_rtt: Vec<_> = samples.to_vec();
    by_rtt.sort_by(|a, b| a.rtt_ms.total_cmp(&b.rtt_ms));

    let best = &by_rtt[..best_sample_count(samples.len())];
    let offset_ms = best.iter().map(|s| s.offset_ms).sum::<f64>() / best.len() as f64;

    let average_rtt_ms = samples.iter().map(|s| s.rtt_ms).sum::<f64>() / samples.len() as f64;

    Some(ClockEstimate {
        offset_ms,
        average_rtt_ms,
        synced: true,
    })
}

/// How many of the lowest round-trip samples contribute to the offset.
/// At least three when available, otherwise half of them rounded up.
fn best_sample_count(total: usize) -> usize {
    total.div_ceil(2).max(3).min(total)
}
