// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use uwb_protocol::BackendEvent;

use crate::arbiter::CommandArbiter;
use crate::state::GatewayState;

/// Apply one inbound backend event. Commands are queued on the arbiter and
/// never awaited here, so a slow write cannot stall the event stream.
pub fn handle_backend_event(event: BackendEvent, state: &GatewayState, arbiter: &CommandArbiter) {
    match event {
        BackendEvent::StartTracking => {
            if !state.set_tracking(true) {
                info!("Tracking enabled");
            }
        }
        BackendEvent::StopTracking => {
            if state.set_tracking(false) {
                info!("Tracking disabled");
            }
        }
        BackendEvent::Command(request) => {
            debug!("[{}] command {} received", request.mac, request.command);
            let _ = arbiter.submit(request);
        }
    }
}

pub async fn run_dispatch_loop(
    mut inbound_rx: mpsc::Receiver<BackendEvent>,
    state: Arc<GatewayState>,
    arbiter: CommandArbiter,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                match changed {
                    Ok(()) if *shutdown_rx.borrow() => break,
                    Ok(()) => {}
                    Err(_) => break,
                }
            }
            event = inbound_rx.recv() => {
                let Some(event) = event else {
                    break;
                };
                handle_backend_event(event, &state, &arbiter);
            }
        }
    }
    arbiter.close();
    info!("Backend dispatch stopped");
}
