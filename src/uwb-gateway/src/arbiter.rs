// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Configuration writes.
//!
//! Commands are validated on submit and queued per device. One worker per
//! address runs them in order: suspend the session, write with retries,
//! persist a role change, resume the session and acknowledge. Workers of
//! different addresses run independently.
//!
//! Once closed, new and still-queued commands are refused and a running
//! write gives up at its next retry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use uwb_app::normalize_mac;
use uwb_core::controller::{FixedDelay, RetryPolicy, SessionEvent, SessionStateMachine};
use uwb_core::{Characteristic, DeviceRole, DeviceStatus, GatewayCommand, LinkResult, RadioLink};
use uwb_protocol::{request_to_command, CommandAck, CommandRequest, OutboundEvent};

use crate::backend::BackendChannel;
use crate::registry::SessionRegistry;
use crate::store::RegistryStore;

const SHUTTING_DOWN: &str = "gateway shutting down";

#[derive(Debug, Clone)]
pub struct ArbiterConfig {
    pub write: FixedDelay,
    /// Pause between suspending a session and the first write.
    pub settle: Duration,
    pub queue_size: usize,
}

struct PendingCommand {
    name: String,
    address: String,
    command: GatewayCommand,
    reply: oneshot::Sender<CommandAck>,
}

struct Worker {
    tx: mpsc::Sender<PendingCommand>,
    join: JoinHandle<()>,
}

struct ArbiterInner {
    registry: Arc<SessionRegistry>,
    link: Arc<dyn RadioLink>,
    store: Arc<RegistryStore>,
    backend: Arc<dyn BackendChannel>,
    config: ArbiterConfig,
    workers: Mutex<HashMap<String, Worker>>,
    /// Workers detached by `close`, awaited by `shutdown`.
    retired: Mutex<Vec<(String, JoinHandle<()>)>>,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct CommandArbiter {
    inner: Arc<ArbiterInner>,
}

impl CommandArbiter {
    pub fn new(
        registry: Arc<SessionRegistry>,
        link: Arc<dyn RadioLink>,
        store: Arc<RegistryStore>,
        backend: Arc<dyn BackendChannel>,
        config: ArbiterConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ArbiterInner {
                registry,
                link,
                store,
                backend,
                config,
                workers: Mutex::new(HashMap::new()),
                retired: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Validate `request` and queue it behind earlier commands for the same
    /// device. Rejections are acknowledged immediately, without touching the
    /// radio. The returned receiver resolves with the acknowledgement that
    /// was also sent to the backend.
    pub fn submit(&self, request: CommandRequest) -> oneshot::Receiver<CommandAck> {
        let (reply_tx, reply_rx) = oneshot::channel();
        match self.prepare(&request) {
            Ok((address, command)) => {
                let pending = PendingCommand {
                    name: request.command,
                    address,
                    command,
                    reply: reply_tx,
                };
                if let Err(pending) = self.enqueue(pending) {
                    let ack = CommandAck::error(
                        pending.name.as_str(),
                        pending.address.as_str(),
                        "command queue full",
                    );
                    self.inner.acknowledge(ack, pending.reply);
                }
            }
            Err(ack) => self.inner.acknowledge(ack, reply_tx),
        }
        reply_rx
    }

    fn prepare(&self, request: &CommandRequest) -> Result<(String, GatewayCommand), CommandAck> {
        if self.inner.is_closed() {
            return Err(CommandAck::error(
                request.command.as_str(),
                request.mac.as_str(),
                SHUTTING_DOWN,
            ));
        }
        let Some(address) = normalize_mac(&request.mac) else {
            warn!("Rejecting {}: malformed address '{}'", request.command, request.mac);
            return Err(CommandAck::error(
                request.command.as_str(),
                request.mac.as_str(),
                "unknown device",
            ));
        };
        if !self.inner.registry.contains(&address) {
            warn!("[{}] rejecting {}: unknown device", address, request.command);
            return Err(CommandAck::error(
                request.command.as_str(),
                address.as_str(),
                "unknown device",
            ));
        }
        match request_to_command(request) {
            Ok(command) => Ok((address, command)),
            Err(e) => {
                warn!("[{}] rejecting {}: {}", address, request.command, e);
                Err(CommandAck::error(
                    request.command.as_str(),
                    address.as_str(),
                    e.to_string(),
                ))
            }
        }
    }

    fn enqueue(&self, pending: PendingCommand) -> Result<(), PendingCommand> {
        let mut workers = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let worker = workers
            .entry(pending.address.clone())
            .or_insert_with(|| self.spawn_worker(&pending.address));
        match worker.tx.try_send(pending) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(pending)) => Err(pending),
            Err(mpsc::error::TrySendError::Closed(pending)) => {
                warn!("[{}] command worker gone, restarting", pending.address);
                let address = pending.address.clone();
                let worker = self.spawn_worker(&address);
                let result = worker.tx.try_send(pending).map_err(|e| e.into_inner());
                workers.insert(address, worker);
                result
            }
        }
    }

    fn spawn_worker(&self, address: &str) -> Worker {
        let (tx, rx) = mpsc::channel(self.inner.config.queue_size);
        let join = tokio::spawn(run_worker(self.inner.clone(), address.to_string(), rx));
        Worker { tx, join }
    }

    /// Stop accepting commands. Commands still queued are refused.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let drained: Vec<(String, JoinHandle<()>)> = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(address, worker)| (address, worker.join))
            .collect();
        self.inner
            .retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(drained);
    }

    /// Close and wait for running commands, at most `timeout` per worker.
    /// A worker still busy after that is aborted and its link released.
    pub async fn shutdown(&self, timeout: Duration) {
        self.close();
        let retired = std::mem::take(
            &mut *self
                .inner
                .retired
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        join_all(
            retired
                .into_iter()
                .map(|(address, join)| self.inner.drain_worker(address, join, timeout)),
        )
        .await;
    }
}

async fn run_worker(
    inner: Arc<ArbiterInner>,
    address: String,
    mut rx: mpsc::Receiver<PendingCommand>,
) {
    debug!("[{}] command worker started", address);
    while let Some(pending) = rx.recv().await {
        let ack = if inner.is_closed() {
            CommandAck::error(pending.name.as_str(), pending.address.as_str(), SHUTTING_DOWN)
        } else {
            inner
                .handle(&pending.name, &pending.address, &pending.command)
                .await
        };
        inner.acknowledge(ack, pending.reply);
    }
    debug!("[{}] command worker stopped", address);
}

impl ArbiterInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn drain_worker(&self, address: String, mut join: JoinHandle<()>, timeout: Duration) {
        if time::timeout(timeout, &mut join).await.is_ok() {
            return;
        }
        warn!(
            "[{}] command still running after {:?}, aborting",
            address, timeout
        );
        join.abort();
        let _ = join.await;
        if let Err(e) = self.link.disconnect(&address).await {
            debug!("[{}] disconnect after abort failed: {}", address, e);
        }
    }

    fn publish_status(&self, address: &str, status: DeviceStatus) {
        if let Err(e) = self.registry.set_status(address, status) {
            debug!("[{}] status {} not published: {}", address, status, e);
        }
    }

    fn acknowledge(&self, ack: CommandAck, reply: oneshot::Sender<CommandAck>) {
        if !self.backend.emit(OutboundEvent::CommandAck(ack.clone())) {
            warn!("[{}] {} acknowledgement not delivered", ack.mac, ack.command);
        }
        let _ = reply.send(ack);
    }

    /// Run one command to completion. The session of `address` is always
    /// resumed, whether or not the write succeeded.
    async fn handle(&self, name: &str, address: &str, command: &GatewayCommand) -> CommandAck {
        let Some((role, status)) = self.registry.get(address) else {
            return CommandAck::error(name, address, "unknown device");
        };
        let payload = match command.encode() {
            Ok(payload) => payload,
            Err(e) => return CommandAck::error(name, address, e.to_string()),
        };

        match self.registry.stop(address).await {
            Ok(true) => {
                if status.is_acquiring() {
                    info!("[{}] interrupting {} session for {}", address, status, name);
                } else {
                    debug!("[{}] session suspended for {} (was {})", address, name, status);
                }
                time::sleep(self.config.settle).await;
            }
            Ok(false) => {}
            Err(e) => return CommandAck::error(name, address, e.to_string()),
        }
        if self.is_closed() {
            return CommandAck::error(name, address, SHUTTING_DOWN);
        }

        let mut machine = SessionStateMachine::new();
        machine.process_event(SessionEvent::WriteStarted);
        self.publish_status(address, machine.status());
        let result = self
            .write_with_retry(address, command.characteristic(), &payload)
            .await;
        machine.process_event(SessionEvent::WriteFinished);
        self.publish_status(address, machine.status());

        let mut current_role = role;
        if result.is_ok() {
            if let Some(new_role) = command.target_role().filter(|r| *r != role) {
                self.change_role(address, role, new_role, command).await;
                current_role = new_role;
            }
        }

        if self.is_closed() {
            debug!("[{}] closing, session left stopped", address);
        } else if let Err(e) = self.registry.start(address, current_role).await {
            warn!("[{}] session not resumed: {}", address, e);
        }

        match result {
            Ok(attempts) => {
                info!("[{}] {} applied after {} attempt(s)", address, name, attempts);
                CommandAck::success(name, address)
            }
            Err(e) => {
                error!("[{}] {} failed: {}", address, name, e);
                CommandAck::error(name, address, e.to_string())
            }
        }
    }

    async fn change_role(
        &self,
        address: &str,
        old: DeviceRole,
        new: DeviceRole,
        command: &GatewayCommand,
    ) {
        info!("[{}] role changed: {} -> {}", address, old, new);
        if let Err(e) = self.registry.set_role(address, new) {
            debug!("[{}] role not recorded: {}", address, e);
        }
        let mode = match command {
            GatewayCommand::SetOperationMode(mode) => Some(*mode),
            _ => None,
        };
        if let Err(e) = self.store.update(address, new, mode).await {
            error!("[{}] failed to persist role: {}", address, e);
        }
    }

    /// Each attempt connects, writes and disconnects. Retries stop once the
    /// arbiter is closed. Returns the number of
    /// attempts used.
    async fn write_with_retry(
        &self,
        address: &str,
        characteristic: Characteristic,
        payload: &[u8],
    ) -> LinkResult<u32> {
        let policy = &self.config.write;
        let mut attempt = 0;
        loop {
            let result = self.write_once(address, characteristic, payload).await;
            if let Err(e) = self.link.disconnect(address).await {
                debug!("[{}] disconnect after write failed: {}", address, e);
            }
            match result {
                Ok(()) => return Ok(attempt + 1),
                Err(e) if policy.should_retry(attempt, &e) && !self.is_closed() => {
                    let delay = policy.delay(attempt);
                    warn!(
                        "[{}] write attempt {}/{} failed: {}; retrying in {:?}",
                        address,
                        attempt + 1,
                        policy.max_attempts(),
                        e,
                        delay
                    );
                    time::sleep(delay).await;
                    if self.is_closed() {
                        return Err(e);
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn write_once(
        &self,
        address: &str,
        characteristic: Characteristic,
        payload: &[u8],
    ) -> LinkResult<()> {
        if !self.link.is_connected(address).await.unwrap_or(false) {
            self.link.connect(address).await?;
        }
        self.link.write(address, characteristic, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    use uwb_core::{frame, DistanceRecord, LocationFrame};

    use crate::forwarder::TagFrame;
    use crate::testing::{session_context, wait_until, Call, MockBackend, MockLink};

    const TAG: &str = "C4:1A:22:33:44:5F";
    const ANCHOR: &str = "D1:00:00:00:00:02";

    struct Harness {
        link: Arc<MockLink>,
        backend: Arc<MockBackend>,
        registry: Arc<SessionRegistry>,
        store: Arc<RegistryStore>,
        arbiter: CommandArbiter,
        _frames: mpsc::Receiver<TagFrame>,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modules.json");
        std::fs::write(
            &path,
            format!(
                r#"[{{"id": "{TAG}", "type": "tag"}}, {{"id": "{ANCHOR}", "type": "anchor"}}]"#
            ),
        )
        .unwrap();
        let store = Arc::new(RegistryStore::new(&path));
        store.load().await.unwrap();

        let link = Arc::new(MockLink::new());
        let backend = Arc::new(MockBackend::connected());
        let (ctx, frames) = session_context(link.clone(), backend.clone());
        let registry = Arc::new(SessionRegistry::new(ctx, Duration::from_secs(10)));
        registry.register(TAG, DeviceRole::Tag);
        registry.register(ANCHOR, DeviceRole::Anchor);

        let arbiter = CommandArbiter::new(
            registry.clone(),
            link.clone(),
            store.clone(),
            backend.clone(),
            ArbiterConfig {
                write: FixedDelay::new(3, Duration::from_secs(3)),
                settle: Duration::from_millis(500),
                queue_size: 8,
            },
        );
        Harness {
            link,
            backend,
            registry,
            store,
            arbiter,
            _frames: frames,
            _dir: dir,
        }
    }

    fn request(command: &str, mac: &str, payload: serde_json::Value) -> CommandRequest {
        CommandRequest {
            command: command.to_string(),
            mac: mac.to_string(),
            payload,
        }
    }

    fn anchor_readings(link: &MockLink, address: &str) {
        let location = frame::encode(&LocationFrame::Distances(
            (1..=3)
                .map(|node_id| DistanceRecord {
                    node_id,
                    distance: 3.25,
                    quality: 100,
                })
                .collect(),
        ));
        link.set_read(address, Characteristic::LocationData, location);
        link.set_read(address, Characteristic::OperationMode, vec![0xA0, 0x00]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_role_flip_restarts_as_anchor() {
        let h = harness().await;
        anchor_readings(&h.link, TAG);
        h.registry.start(TAG, DeviceRole::Tag).await.unwrap();
        wait_until(|| h.link.is_subscribed(TAG)).await;
        assert_eq!(
            h.registry.get(TAG),
            Some((DeviceRole::Tag, DeviceStatus::Streaming))
        );

        let ack = h
            .arbiter
            .submit(request("set_operation_mode", TAG, json!("1010000000000000")))
            .await
            .unwrap();
        assert!(ack.is_success(), "{ack:?}");
        assert_eq!(
            h.link.writes(TAG),
            vec![(Characteristic::OperationMode, vec![0xA0, 0x00])]
        );
        assert_eq!(h.registry.get(TAG).map(|(role, _)| role), Some(DeviceRole::Anchor));

        wait_until(|| !h.backend.anchor_reports().is_empty()).await;
        let calls = h.link.calls_for(TAG);
        let write_at = calls
            .iter()
            .position(|c| matches!(c, Call::Write(..)))
            .unwrap();
        let before = &calls[..write_at];
        let after = &calls[write_at..];
        assert!(before.iter().any(|c| matches!(c, Call::Unsubscribe(..))));
        assert!(!after.iter().any(|c| matches!(c, Call::Subscribe(..))));
        assert!(after
            .iter()
            .any(|c| matches!(c, Call::Read(_, Characteristic::LocationData))));

        let records = RegistryStore::new(h.store.path()).load().await.unwrap();
        let record = records.iter().find(|r| r.address == TAG).unwrap();
        assert_eq!(record.role, DeviceRole::Anchor);
        assert_eq!(record.operation_mode.as_deref(), Some("1010000000000000"));
        assert_eq!(h.backend.acks(), vec![ack]);
        h.registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_still_resumes() {
        let h = harness().await;
        h.link.fail_writes(TAG, 10);
        h.registry.start(TAG, DeviceRole::Tag).await.unwrap();
        wait_until(|| h.link.is_subscribed(TAG)).await;

        let started = time::Instant::now();
        let ack = h
            .arbiter
            .submit(request(
                "set_tag_rate",
                TAG,
                json!({"moving": 100, "stationary": 1000}),
            ))
            .await
            .unwrap();
        assert!(!ack.is_success());
        assert!(started.elapsed() >= Duration::from_secs(6));
        assert_eq!(h.link.overlapping_connects(), 0);

        wait_until(|| h.link.is_subscribed(TAG)).await;
        assert_eq!(
            h.registry.get(TAG),
            Some((DeviceRole::Tag, DeviceStatus::Streaming))
        );
        // one streaming connect, three write attempts, one resumed session
        assert_eq!(h.link.connect_attempts(TAG), 5);
        h.registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejections_skip_the_radio() {
        let h = harness().await;

        let unknown = h
            .arbiter
            .submit(request("set_location_mode", "00:11:22:33:44:55", json!(1)))
            .await
            .unwrap();
        assert!(!unknown.is_success());
        assert_eq!(unknown.error.as_deref(), Some("unknown device"));

        let malformed = h
            .arbiter
            .submit(request("set_location_mode", "bogus", json!(1)))
            .await
            .unwrap();
        assert!(!malformed.is_success());

        let bad_quality = h
            .arbiter
            .submit(request(
                "set_anchor_location",
                ANCHOR,
                json!({"x": 1.0, "y": 2.0, "z": 0.5, "quality": 150}),
            ))
            .await
            .unwrap();
        assert!(!bad_quality.is_success());
        assert_eq!(bad_quality.mac, ANCHOR);

        assert!(h.link.calls().is_empty());
        assert_eq!(h.backend.acks().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_device_commands_run_in_order() {
        let h = harness().await;
        h.registry.start(TAG, DeviceRole::Tag).await.unwrap();
        wait_until(|| h.link.is_subscribed(TAG)).await;

        let first = h
            .arbiter
            .submit(request("set_location_mode", TAG, json!(1)));
        let second = h
            .arbiter
            .submit(request("set_location_mode", &TAG.to_lowercase(), json!({"mode": 2})));
        let first = first.await.unwrap();
        let second = second.await.unwrap();
        assert!(first.is_success() && second.is_success());

        assert_eq!(
            h.link.writes(TAG),
            vec![
                (Characteristic::LocationDataMode, vec![1]),
                (Characteristic::LocationDataMode, vec![2]),
            ]
        );
        assert_eq!(h.backend.acks(), vec![first, second]);
        assert_eq!(h.link.overlapping_connects(), 0);
        h.registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_devices_are_handled_concurrently() {
        let h = harness().await;
        anchor_readings(&h.link, ANCHOR);
        h.link.fail_writes(TAG, 2);

        let slow = h.arbiter.submit(request(
            "set_tag_rate",
            TAG,
            json!({"u1": 100, "u2": 5000}),
        ));
        let fast = h.arbiter.submit(request(
            "set_anchor_location",
            ANCHOR,
            json!({"x": 1.0, "y": 2.0, "z": 0.5, "quality_factor": 100}),
        ));
        let fast = fast.await.unwrap();
        let slow = slow.await.unwrap();
        assert!(fast.is_success() && slow.is_success());
        assert_eq!(h.backend.acks(), vec![fast, slow]);
        h.registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_retrying_write() {
        let h = harness().await;
        h.link.fail_writes(TAG, 10);
        h.registry.start(TAG, DeviceRole::Tag).await.unwrap();
        wait_until(|| h.link.is_subscribed(TAG)).await;

        let reply = h.arbiter.submit(request("set_location_mode", TAG, json!(1)));
        wait_until(|| h.registry.get(TAG).map(|(_, s)| s) == Some(DeviceStatus::Writing)).await;

        let before = time::Instant::now();
        h.arbiter.shutdown(Duration::from_secs(10)).await;
        assert!(before.elapsed() < Duration::from_secs(4));

        let ack = reply.await.unwrap();
        assert!(!ack.is_success());
        // one streaming connect, one write attempt
        assert_eq!(h.link.connect_attempts(TAG), 2);
        assert!(!h.link.is_connected_now(TAG));
        assert!(!h.registry.is_live(TAG).await);

        let late = h
            .arbiter
            .submit(request("set_location_mode", TAG, json!(2)))
            .await
            .unwrap();
        assert_eq!(late.error.as_deref(), Some(SHUTTING_DOWN));
        assert_eq!(h.link.connect_attempts(TAG), 2);
        h.registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_stuck_write() {
        let h = harness().await;
        h.link.stall(ANCHOR);

        let reply = h.arbiter.submit(request("set_location_mode", ANCHOR, json!(0)));
        wait_until(|| h.registry.get(ANCHOR).map(|(_, s)| s) == Some(DeviceStatus::Writing))
            .await;

        let before = time::Instant::now();
        h.arbiter.shutdown(Duration::from_secs(2)).await;
        assert!(before.elapsed() >= Duration::from_secs(2));
        assert!(reply.await.is_err());
        assert!(h
            .link
            .calls_for(ANCHOR)
            .iter()
            .any(|c| matches!(c, Call::Disconnect(_))));
        h.registry.shutdown().await;
    }
}
