// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::sync::atomic::{AtomicBool, Ordering};

/// Process-wide flags toggled by backend events.
#[derive(Debug, Default)]
pub struct GatewayState {
    tracking: AtomicBool,
}

impl GatewayState {
    pub fn new() -> Self {
        Self::default()
    }

    /// While tracking is on, tag frames bypass the telemetry interval.
    pub fn tracking_enabled(&self) -> bool {
        self.tracking.load(Ordering::Acquire)
    }

    /// Returns the previous value.
    pub fn set_tracking(&self, enabled: bool) -> bool {
        self.tracking.swap(enabled, Ordering::AcqRel)
    }
}
