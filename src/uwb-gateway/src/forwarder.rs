// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace};

use uwb_core::{ForwardDecision, LocationFrame, TelemetryThrottle};
use uwb_protocol::{OutboundEvent, TagData};

use crate::backend::BackendChannel;
use crate::state::GatewayState;

/// A decoded tag notification on its way to the throttle.
#[derive(Debug, Clone)]
pub struct TagFrame {
    pub address: String,
    pub frame: LocationFrame,
}

/// Single consumer of the tag frame queue. Owns the throttle, so
/// `last_sent` is only ever touched here.
pub async fn run_telemetry_forwarder(
    mut frames_rx: mpsc::Receiver<TagFrame>,
    mut throttle: TelemetryThrottle,
    state: Arc<GatewayState>,
    backend: Arc<dyn BackendChannel>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(
        "Telemetry forwarder started (interval {:?})",
        throttle.interval()
    );
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                match changed {
                    Ok(()) if *shutdown_rx.borrow() => break,
                    Ok(()) => {}
                    Err(_) => break,
                }
            }
            next = frames_rx.recv() => {
                let Some(TagFrame { address, frame }) = next else {
                    break;
                };
                let decision = throttle.maybe_forward(
                    &address,
                    &frame,
                    state.tracking_enabled(),
                    Instant::now(),
                    |mac, frame| {
                        backend.emit(OutboundEvent::TagData(TagData {
                            mac: mac.to_string(),
                            data: frame.clone(),
                        }))
                    },
                );
                match decision {
                    ForwardDecision::Forwarded => trace!("[{}] tag data forwarded", address),
                    ForwardDecision::Undelivered => debug!("[{}] tag data not delivered", address),
                    ForwardDecision::Rejected => trace!("[{}] frame below admission threshold", address),
                    ForwardDecision::Throttled => {}
                }
            }
        }
    }
    info!("Telemetry forwarder stopped");
}
