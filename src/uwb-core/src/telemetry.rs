// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Telemetry admission and throttling.
//!
//! Decoded tag frames pass two gates before they are sent upstream: an
//! admission filter on ranging quality, then a per-device minimum interval
//! that is bypassed while live tracking is enabled.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::frame::LocationFrame;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_MIN_NEIGHBORS: usize = 3;
pub const DEFAULT_MIN_QUALITY: u8 = 5;

/// Rejects frames with too few or too poor ranging measurements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionFilter {
    pub min_neighbors: usize,
    pub min_quality: u8,
}

impl Default for AdmissionFilter {
    fn default() -> Self {
        Self {
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
            min_quality: DEFAULT_MIN_QUALITY,
        }
    }
}

impl AdmissionFilter {
    pub fn new(min_neighbors: usize, min_quality: u8) -> Self {
        Self {
            min_neighbors,
            min_quality,
        }
    }

    /// Frames without a distance list are never admitted.
    pub fn admit(&self, frame: &LocationFrame) -> bool {
        let Some(distances) = frame.distances() else {
            return false;
        };
        distances.len() >= self.min_neighbors
            && distances.iter().all(|d| d.quality >= self.min_quality)
    }
}

/// Outcome of [`TelemetryThrottle::maybe_forward`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardDecision {
    /// Failed the admission filter.
    Rejected,
    /// Inside the per-device interval.
    Throttled,
    Forwarded,
    /// Emit attempted but the backend reported non-delivery.
    Undelivered,
}

impl ForwardDecision {
    pub fn is_forwarded(self) -> bool {
        matches!(self, Self::Forwarded)
    }
}

/// Per-device send-rate limiter. The only writer of `last_sent`.
#[derive(Debug)]
pub struct TelemetryThrottle {
    filter: AdmissionFilter,
    interval: Duration,
    last_sent: HashMap<String, Instant>,
}

impl Default for TelemetryThrottle {
    fn default() -> Self {
        Self::new(AdmissionFilter::default(), DEFAULT_INTERVAL)
    }
}

impl TelemetryThrottle {
    pub fn new(filter: AdmissionFilter, interval: Duration) -> Self {
        Self {
            filter,
            interval,
            last_sent: HashMap::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn last_sent(&self, address: &str) -> Option<Instant> {
        self.last_sent.get(address).copied()
    }

    /// Decide whether `frame` goes upstream now and, if so, hand it to
    /// `emit`. `emit` returns whether the backend accepted the event;
    /// `last_sent` only advances on delivery.
    pub fn maybe_forward<F>(
        &mut self,
        address: &str,
        frame: &LocationFrame,
        tracking_enabled: bool,
        now: Instant,
        emit: F,
    ) -> ForwardDecision
    where
        F: FnOnce(&str, &LocationFrame) -> bool,
    {
        if !self.filter.admit(frame) {
            return ForwardDecision::Rejected;
        }

        if !tracking_enabled {
            if let Some(last) = self.last_sent.get(address) {
                if now.saturating_duration_since(*last) < self.interval {
                    return ForwardDecision::Throttled;
                }
            }
        }

        if !emit(address, frame) {
            return ForwardDecision::Undelivered;
        }
        self.last_sent.insert(address.to_string(), now);
        ForwardDecision::Forwarded
    }
}
