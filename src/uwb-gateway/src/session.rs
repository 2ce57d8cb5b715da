// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Per-device acquisition task.
//!
//! A session owns the radio connection of one module. Tags are connected,
//! subscribed to location notifications and held open until cancelled.
//! Anchors are connected, read once, reported and released. Connect
//! and acquisition failures are retried in bounded rounds separated by a
//! backoff; every exit path unsubscribes and disconnects.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time;
use tracing::{debug, info, warn};

use uwb_core::controller::{FixedDelay, RetryPolicy, SessionEvent, SessionStateMachine};
use uwb_core::{frame, Characteristic, DeviceRole, DeviceStatus, OperationMode, RadioLink};
use uwb_protocol::{AnchorData, OutboundEvent};

use crate::backend::BackendChannel;
use crate::forwarder::TagFrame;

/// Timing knobs shared by every session.
#[derive(Debug, Clone)]
pub struct SessionTiming {
    pub connect: FixedDelay,
    pub backoff: Duration,
    pub hold_interval: Duration,
    pub anchor_read_gap: Duration,
    pub notification_buffer: usize,
}

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SessionContext {
    pub link: Arc<dyn RadioLink>,
    pub backend: Arc<dyn BackendChannel>,
    pub frames_tx: mpsc::Sender<TagFrame>,
    pub timing: Arc<SessionTiming>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Anchor report delivered.
    Completed,
    Cancelled,
}

enum ConnectRound {
    Connected,
    Exhausted,
    Cancelled,
}

enum Acquisition {
    Completed,
    /// Acquisition failed before delivering anything.
    Failed,
    /// An established stream was lost.
    Interrupted,
    Cancelled,
}

/// Resolves once `cancel` reads `true` or its sender is dropped.
pub async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    if *cancel.borrow() {
        return;
    }
    while cancel.changed().await.is_ok() {
        if *cancel.borrow() {
            return;
        }
    }
}

/// Sleep for `duration`; returns `false` if cancelled first.
async fn pause(duration: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = time::sleep(duration) => true,
        _ = wait_cancelled(cancel) => false,
    }
}

struct Session<'a> {
    ctx: &'a SessionContext,
    address: &'a str,
    role: DeviceRole,
    machine: SessionStateMachine,
    status_tx: &'a watch::Sender<DeviceStatus>,
}

impl Session<'_> {
    fn apply(&mut self, event: SessionEvent) {
        if self.machine.process_event(event) {
            debug!("[{}] session -> {}", self.address, self.machine.state());
            let status = self.machine.status();
            self.status_tx.send_if_modified(|current| {
                let changed = *current != status;
                *current = status;
                changed
            });
        }
    }

    async fn connect_round(&mut self, cancel: &mut watch::Receiver<bool>) -> ConnectRound {
        let ctx = self.ctx;
        let policy = &ctx.timing.connect;
        let max = policy.max_attempts();
        for attempt in 0..max {
            let result = tokio::select! {
                result = ctx.link.connect(self.address) => result,
                _ = wait_cancelled(cancel) => return ConnectRound::Cancelled,
            };
            let error = match result {
                Ok(()) => return ConnectRound::Connected,
                Err(e) => e,
            };
            warn!(
                "[{}] connect attempt {}/{} failed: {}",
                self.address,
                attempt + 1,
                max,
                error
            );
            if !policy.should_retry(attempt, &error) {
                break;
            }
            self.apply(SessionEvent::ConnectFailed);
            if !pause(policy.delay(attempt), cancel).await {
                return ConnectRound::Cancelled;
            }
        }
        ConnectRound::Exhausted
    }

    async fn stream(
        &mut self,
        cancel: &mut watch::Receiver<bool>,
        subscribed: &mut bool,
    ) -> Acquisition {
        let ctx = self.ctx;
        let link = &ctx.link;
        let (sink_tx, mut sink_rx) = mpsc::channel(ctx.timing.notification_buffer);
        let result = tokio::select! {
            result = link.subscribe(self.address, Characteristic::LocationData, sink_tx) => result,
            _ = wait_cancelled(cancel) => return Acquisition::Cancelled,
        };
        if let Err(e) = result {
            warn!("[{}] subscribe failed: {}", self.address, e);
            return Acquisition::Failed;
        }
        *subscribed = true;
        info!("[{}] streaming location data", self.address);

        let hold_interval = ctx.timing.hold_interval;
        let mut hold = time::interval_at(time::Instant::now() + hold_interval, hold_interval);
        let mut held = false;
        let lost = |held: bool| {
            if held {
                Acquisition::Interrupted
            } else {
                Acquisition::Failed
            }
        };
        loop {
            tokio::select! {
                _ = wait_cancelled(cancel) => return Acquisition::Cancelled,
                value = sink_rx.recv() => {
                    let Some(value) = value else {
                        warn!("[{}] notification stream ended", self.address);
                        return lost(held);
                    };
                    held = true;
                    self.forward_notification(&value);
                }
                _ = hold.tick() => {
                    match link.is_connected(self.address).await {
                        Ok(true) => held = true,
                        Ok(false) => {
                            warn!("[{}] link lost", self.address);
                            return lost(held);
                        }
                        Err(e) => {
                            warn!("[{}] link check failed: {}", self.address, e);
                            return lost(held);
                        }
                    }
                }
            }
        }
    }

    fn forward_notification(&self, value: &[u8]) {
        let frame = match frame::decode(value) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("[{}] dropping notification: {}", self.address, e);
                return;
            }
        };
        let tag_frame = TagFrame {
            address: self.address.to_string(),
            frame,
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = self.ctx.frames_tx.try_send(tag_frame) {
            warn!("[{}] telemetry queue full, dropping frame", self.address);
        }
    }

    async fn poll_anchor(&mut self, cancel: &mut watch::Receiver<bool>) -> Acquisition {
        let ctx = self.ctx;
        let link = &ctx.link;
        let gap = ctx.timing.anchor_read_gap;

        let location = tokio::select! {
            result = link.read(self.address, Characteristic::LocationData) => result,
            _ = wait_cancelled(cancel) => return Acquisition::Cancelled,
        };
        let location = match location {
            Ok(value) => value,
            Err(e) => {
                warn!("[{}] location read failed: {}", self.address, e);
                return Acquisition::Failed;
            }
        };
        if !pause(gap, cancel).await {
            return Acquisition::Cancelled;
        }
        let mode = tokio::select! {
            result = link.read(self.address, Characteristic::OperationMode) => result,
            _ = wait_cancelled(cancel) => return Acquisition::Cancelled,
        };
        let mode = match mode {
            Ok(value) => value,
            Err(e) => {
                warn!("[{}] operation mode read failed: {}", self.address, e);
                return Acquisition::Failed;
            }
        };
        if !pause(gap, cancel).await {
            return Acquisition::Cancelled;
        }

        let data = match frame::decode(&location) {
            Ok(data) => data,
            Err(e) => {
                warn!("[{}] undecodable anchor location: {}", self.address, e);
                return Acquisition::Failed;
            }
        };
        let operation_mode = match OperationMode::from_read_value(&mode) {
            Ok(mode) => mode,
            Err(e) => {
                warn!("[{}] undecodable operation mode: {}", self.address, e);
                return Acquisition::Failed;
            }
        };

        let event = OutboundEvent::AnchorData(AnchorData {
            mac: self.address.to_string(),
            data,
            operation_mode,
        });
        if !ctx.backend.emit(event) {
            warn!("[{}] backend unavailable, anchor report not delivered", self.address);
            return Acquisition::Failed;
        }
        info!("[{}] anchor report sent ({})", self.address, operation_mode);
        Acquisition::Completed
    }

    async fn teardown(&self, subscribed: bool) {
        let link = &self.ctx.link;
        if subscribed {
            if let Err(e) = link
                .unsubscribe(self.address, Characteristic::LocationData)
                .await
            {
                debug!("[{}] unsubscribe failed: {}", self.address, e);
            }
        }
        if let Err(e) = link.disconnect(self.address).await {
            debug!("[{}] disconnect failed: {}", self.address, e);
        }
    }

    async fn run(&mut self, cancel: &mut watch::Receiver<bool>) -> SessionOutcome {
        // Acquisition failures since the last established stream.
        let mut failures: u32 = 0;
        loop {
            self.apply(SessionEvent::ConnectRequested);
            match self.connect_round(cancel).await {
                ConnectRound::Connected => {}
                ConnectRound::Cancelled => {
                    self.teardown(false).await;
                    return SessionOutcome::Cancelled;
                }
                ConnectRound::Exhausted => {
                    self.apply(SessionEvent::RetriesExhausted);
                    warn!(
                        "[{}] connect retries exhausted, backing off {:?}",
                        self.address, self.ctx.timing.backoff
                    );
                    if !pause(self.ctx.timing.backoff, cancel).await {
                        return SessionOutcome::Cancelled;
                    }
                    continue;
                }
            }

            self.apply(SessionEvent::Connected(self.role));
            let mut subscribed = false;
            let acquisition = match self.role {
                DeviceRole::Tag => self.stream(cancel, &mut subscribed).await,
                DeviceRole::Anchor => self.poll_anchor(cancel).await,
            };
            self.teardown(subscribed).await;

            match acquisition {
                Acquisition::Cancelled => return SessionOutcome::Cancelled,
                Acquisition::Completed => {
                    self.apply(SessionEvent::Completed);
                    return SessionOutcome::Completed;
                }
                Acquisition::Interrupted => {
                    failures = 0;
                    self.apply(SessionEvent::LinkLost);
                }
                Acquisition::Failed => {
                    self.apply(SessionEvent::LinkLost);
                    failures += 1;
                    let ctx = self.ctx;
                    let policy = &ctx.timing.connect;
                    let delay = if self.role.is_anchor() || failures >= policy.max_attempts() {
                        self.apply(SessionEvent::RetriesExhausted);
                        warn!(
                            "[{}] acquisition failed {} time(s), backing off {:?}",
                            self.address, failures, ctx.timing.backoff
                        );
                        failures = 0;
                        ctx.timing.backoff
                    } else {
                        policy.delay(failures - 1)
                    };
                    if !pause(delay, cancel).await {
                        return SessionOutcome::Cancelled;
                    }
                }
            }
        }
    }
}

/// Drive one device until its acquisition completes or `cancel` fires.
///
/// Status changes are published on `status_tx`. The radio connection is
/// released on every exit path except task abort, which the registry
/// covers with its own disconnect.
pub async fn run_device_session(
    ctx: SessionContext,
    address: String,
    role: DeviceRole,
    status_tx: watch::Sender<DeviceStatus>,
    mut cancel: watch::Receiver<bool>,
) -> SessionOutcome {
    info!("[{}] session started as {}", address, role);
    let mut session = Session {
        ctx: &ctx,
        address: &address,
        role,
        machine: SessionStateMachine::new(),
        status_tx: &status_tx,
    };
    let outcome = session.run(&mut cancel).await;
    if outcome == SessionOutcome::Cancelled {
        session.apply(SessionEvent::Cancelled);
    }
    info!("[{}] session ended: {:?}", address, outcome);
    outcome
}
