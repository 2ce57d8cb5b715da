// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Address → device mapping and session lifecycle.
//!
//! Each device has a slot guarded by an async mutex; `start` and `stop`
//! hold it across cancel, await and spawn, so two sessions for the same
//! address can never be live at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use uwb_core::{DeviceRole, DeviceStatus};

use crate::session::{run_device_session, SessionContext, SessionOutcome};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown device {0}")]
    UnknownDevice(String),

    #[error("registry is shut down")]
    Closed,
}

struct SessionHandle {
    cancel_tx: watch::Sender<bool>,
    join: JoinHandle<SessionOutcome>,
}

struct DeviceEntry {
    role: Mutex<DeviceRole>,
    status_tx: watch::Sender<DeviceStatus>,
    slot: AsyncMutex<Option<SessionHandle>>,
}

impl DeviceEntry {
    fn new(role: DeviceRole) -> Self {
        let (status_tx, _) = watch::channel(DeviceStatus::Idle);
        Self {
            role: Mutex::new(role),
            status_tx,
            slot: AsyncMutex::new(None),
        }
    }

    fn role(&self) -> DeviceRole {
        *self.role.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_role(&self, role: DeviceRole) {
        *self.role.lock().unwrap_or_else(PoisonError::into_inner) = role;
    }
}

pub struct SessionRegistry {
    ctx: SessionContext,
    stop_timeout: Duration,
    devices: RwLock<HashMap<String, Arc<DeviceEntry>>>,
    closed: AtomicBool,
}

impl SessionRegistry {
    pub fn new(ctx: SessionContext, stop_timeout: Duration) -> Self {
        Self {
            ctx,
            stop_timeout,
            devices: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Add a device, or update the role of a known one.
    pub fn register(&self, address: &str, role: DeviceRole) {
        let mut devices = self
            .devices
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match devices.get(address) {
            Some(entry) => entry.set_role(role),
            None => {
                devices.insert(address.to_string(), Arc::new(DeviceEntry::new(role)));
            }
        }
    }

    fn entry(&self, address: &str) -> Result<Arc<DeviceEntry>, RegistryError> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownDevice(address.to_string()))
    }

    pub fn contains(&self, address: &str) -> bool {
        self.entry(address).is_ok()
    }

    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        addresses.sort();
        addresses
    }

    pub fn get(&self, address: &str) -> Option<(DeviceRole, DeviceStatus)> {
        let entry = self.entry(address).ok()?;
        let status = *entry.status_tx.borrow();
        Some((entry.role(), status))
    }

    pub fn set_role(&self, address: &str, role: DeviceRole) -> Result<(), RegistryError> {
        self.entry(address)?.set_role(role);
        Ok(())
    }

    pub fn set_status(&self, address: &str, status: DeviceStatus) -> Result<(), RegistryError> {
        self.entry(address)?.status_tx.send_replace(status);
        Ok(())
    }

    /// Start a session for `address` as `role`, first stopping any live one.
    pub async fn start(&self, address: &str, role: DeviceRole) -> Result<(), RegistryError> {
        let entry = self.entry(address)?;
        let mut slot = entry.slot.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(RegistryError::Closed);
        }
        if let Some(handle) = slot.take() {
            self.stop_handle(address, &entry, handle).await;
        }

        entry.set_role(role);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let join = tokio::spawn(run_device_session(
            self.ctx.clone(),
            address.to_string(),
            role,
            entry.status_tx.clone(),
            cancel_rx,
        ));
        *slot = Some(SessionHandle { cancel_tx, join });
        debug!("[{}] session slot filled ({})", address, role);
        Ok(())
    }

    /// Cancel and await the session of `address`. Returns whether a live
    /// session was stopped.
    pub async fn stop(&self, address: &str) -> Result<bool, RegistryError> {
        let entry = self.entry(address)?;
        let mut slot = entry.slot.lock().await;
        match slot.take() {
            Some(handle) => Ok(self.stop_handle(address, &entry, handle).await),
            None => Ok(false),
        }
    }

    pub async fn is_live(&self, address: &str) -> bool {
        let Ok(entry) = self.entry(address) else {
            return false;
        };
        let slot = entry.slot.lock().await;
        slot.as_ref().is_some_and(|h| !h.join.is_finished())
    }

    /// Stop every session and refuse further starts.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let addresses = self.addresses();
        info!("Stopping {} device sessions", addresses.len());
        join_all(addresses.iter().map(|address| self.stop(address))).await;
    }

    async fn stop_handle(&self, address: &str, entry: &DeviceEntry, mut handle: SessionHandle) -> bool {
        if handle.join.is_finished() {
            let _ = handle.join.await;
            return false;
        }

        let _ = handle.cancel_tx.send(true);
        match time::timeout(self.stop_timeout, &mut handle.join).await {
            Ok(Ok(outcome)) => debug!("[{}] session stopped: {:?}", address, outcome),
            Ok(Err(e)) => {
                warn!("[{}] session task failed: {}", address, e);
                self.release_link(address).await;
            }
            Err(_) => {
                warn!(
                    "[{}] session did not stop within {:?}, aborting",
                    address, self.stop_timeout
                );
                handle.join.abort();
                let _ = handle.join.await;
                self.release_link(address).await;
            }
        }
        entry.status_tx.send_replace(DeviceStatus::Idle);
        true
    }

    async fn release_link(&self, address: &str) {
        if let Err(e) = self.ctx.link.disconnect(address).await {
            debug!("[{}] disconnect after abort failed: {}", address, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    use crate::forwarder::TagFrame;
    use crate::testing::{session_context, wait_until, Call, MockBackend, MockLink};

    const TAG: &str = "C4:1A:22:33:44:5F";
    const OTHER: &str = "C4:1A:22:33:44:60";

    fn registry() -> (
        Arc<SessionRegistry>,
        Arc<MockLink>,
        mpsc::Receiver<TagFrame>,
    ) {
        let link = Arc::new(MockLink::new());
        let backend = Arc::new(MockBackend::connected());
        let (ctx, frames_rx) = session_context(link.clone(), backend);
        let registry = Arc::new(SessionRegistry::new(ctx, Duration::from_secs(10)));
        registry.register(TAG, DeviceRole::Tag);
        registry.register(OTHER, DeviceRole::Tag);
        (registry, link, frames_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_session() {
        let (registry, link, _frames) = registry();
        registry.start(TAG, DeviceRole::Tag).await.unwrap();
        wait_until(|| link.is_subscribed(TAG)).await;

        registry.start(TAG, DeviceRole::Tag).await.unwrap();
        wait_until(|| link.is_subscribed(TAG)).await;
        assert!(registry.is_live(TAG).await);
        assert_eq!(link.overlapping_connects(), 0);

        let kinds: Vec<&'static str> = link
            .calls_for(TAG)
            .iter()
            .map(|c| match c {
                Call::Connect(_) => "connect",
                Call::Subscribe(..) => "subscribe",
                Call::Unsubscribe(..) => "unsubscribe",
                Call::Disconnect(_) => "disconnect",
                _ => "other",
            })
            .collect();
        assert_eq!(
            kinds,
            vec!["connect", "subscribe", "unsubscribe", "disconnect", "connect", "subscribe"]
        );
        registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_starts_keep_one_session() {
        let (registry, link, _frames) = registry();
        let starts = (0..4).map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.start(TAG, DeviceRole::Tag).await })
        });
        for result in join_all(starts).await {
            result.unwrap().unwrap();
        }
        wait_until(|| link.is_subscribed(TAG)).await;
        assert_eq!(link.overlapping_connects(), 0);
        assert_eq!(registry.get(TAG), Some((DeviceRole::Tag, DeviceStatus::Streaming)));
        registry.shutdown().await;
        assert!(!link.is_connected_now(TAG));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_session_is_aborted_and_released() {
        let (registry, link, _frames) = registry();
        registry.start(TAG, DeviceRole::Tag).await.unwrap();
        wait_until(|| link.is_subscribed(TAG)).await;

        link.stall(TAG);
        tokio::time::sleep(Duration::from_secs(3)).await;
        let before = tokio::time::Instant::now();
        assert!(registry.stop(TAG).await.unwrap());
        assert!(before.elapsed() >= Duration::from_secs(10));
        assert!(!link.is_connected_now(TAG));
        assert!(!registry.is_live(TAG).await);
        assert_eq!(registry.get(TAG).map(|(_, s)| s), Some(DeviceStatus::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_all_and_refuses_starts() {
        let (registry, link, _frames) = registry();
        registry.start(TAG, DeviceRole::Tag).await.unwrap();
        registry.start(OTHER, DeviceRole::Tag).await.unwrap();
        wait_until(|| link.is_subscribed(TAG) && link.is_subscribed(OTHER)).await;

        registry.shutdown().await;
        assert!(!link.is_connected_now(TAG));
        assert!(!link.is_connected_now(OTHER));
        assert_eq!(
            registry.start(TAG, DeviceRole::Tag).await,
            Err(RegistryError::Closed)
        );
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let (registry, _link, _frames) = registry();
        assert_eq!(registry.get("00:00:00:00:00:00"), None);
        assert_eq!(
            registry.start("00:00:00:00:00:00", DeviceRole::Tag).await,
            Err(RegistryError::UnknownDevice("00:00:00:00:00:00".to_string()))
        );
        assert!(registry.set_role("00:00:00:00:00:00", DeviceRole::Anchor).is_err());
        assert!(!registry.stop(TAG).await.unwrap());
        assert_eq!(registry.addresses(), vec![TAG.to_string(), OTHER.to_string()]);
    }
}
