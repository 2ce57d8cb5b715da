// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Scripted radio link and recording backend for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use uwb_core::controller::FixedDelay;
use uwb_core::{Characteristic, DiscoveredDevice, LinkError, LinkFuture, RadioLink};
use uwb_protocol::{AnchorData, CommandAck, OutboundEvent};

use crate::backend::BackendChannel;
use crate::forwarder::TagFrame;
use crate::session::{SessionContext, SessionTiming};

/// Session collaborators with default timings over the given doubles.
pub fn session_context(
    link: Arc<MockLink>,
    backend: Arc<MockBackend>,
) -> (SessionContext, mpsc::Receiver<TagFrame>) {
    let (frames_tx, frames_rx) = mpsc::channel(64);
    let ctx = SessionContext {
        link,
        backend,
        frames_tx,
        timing: Arc::new(SessionTiming {
            connect: FixedDelay::new(3, Duration::from_secs(5)),
            backoff: Duration::from_secs(5),
            hold_interval: Duration::from_secs(2),
            anchor_read_gap: Duration::from_millis(500),
            notification_buffer: 8,
        }),
    };
    (ctx, frames_rx)
}

/// Poll `condition` on the (usually paused) clock, panicking after a
/// generous virtual timeout.
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..12_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 120s");
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect(String),
    Disconnect(String),
    Read(String, Characteristic),
    Write(String, Characteristic, Vec<u8>),
    Subscribe(String, Characteristic),
    Unsubscribe(String, Characteristic),
}

impl Call {
    fn address(&self) -> &str {
        match self {
            Self::Connect(a)
            | Self::Disconnect(a)
            | Self::Read(a, _)
            | Self::Write(a, ..)
            | Self::Subscribe(a, _)
            | Self::Unsubscribe(a, _) => a,
        }
    }
}

#[derive(Default)]
struct LinkState {
    calls: Vec<Call>,
    connected: HashSet<String>,
    overlapping_connects: usize,
    connect_failures: HashMap<String, u32>,
    write_failures: HashMap<String, u32>,
    subscribe_failures: HashMap<String, u32>,
    reads: HashMap<(String, Characteristic), Vec<u8>>,
    sinks: HashMap<String, mpsc::Sender<Vec<u8>>>,
    stalled: HashSet<String>,
    nearby: Vec<DiscoveredDevice>,
}

/// In-memory [`RadioLink`]. All operations complete immediately.
#[derive(Default)]
pub struct MockLink {
    state: Mutex<LinkState>,
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut LinkState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn fail_connects(&self, address: &str, count: u32) {
        self.with(|s| s.connect_failures.insert(address.to_string(), count));
    }

    pub fn fail_writes(&self, address: &str, count: u32) {
        self.with(|s| s.write_failures.insert(address.to_string(), count));
    }

    pub fn fail_subscribes(&self, address: &str, count: u32) {
        self.with(|s| s.subscribe_failures.insert(address.to_string(), count));
    }

    pub fn set_read(&self, address: &str, characteristic: Characteristic, value: Vec<u8>) {
        self.with(|s| s.reads.insert((address.to_string(), characteristic), value));
    }

    pub fn set_nearby(&self, devices: Vec<DiscoveredDevice>) {
        self.with(|s| s.nearby = devices);
    }

    /// Push a notification into the subscribed sink of `address`.
    pub async fn notify(&self, address: &str, value: Vec<u8>) -> bool {
        let Some(sink) = self.with(|s| s.sinks.get(address).cloned()) else {
            return false;
        };
        sink.send(value).await.is_ok()
    }

    /// Simulate the module going out of range.
    pub fn drop_link(&self, address: &str) {
        self.with(|s| {
            s.connected.remove(address);
            s.sinks.remove(address);
        });
    }

    /// Make link checks on `address` hang forever.
    pub fn stall(&self, address: &str) {
        self.with(|s| s.stalled.insert(address.to_string()));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.with(|s| s.calls.clone())
    }

    pub fn calls_for(&self, address: &str) -> Vec<Call> {
        self.with(|s| {
            s.calls
                .iter()
                .filter(|c| c.address() == address)
                .cloned()
                .collect()
        })
    }

    pub fn connect_attempts(&self, address: &str) -> usize {
        self.calls_for(address)
            .iter()
            .filter(|c| matches!(c, Call::Connect(_)))
            .count()
    }

    pub fn writes(&self, address: &str) -> Vec<(Characteristic, Vec<u8>)> {
        self.calls_for(address)
            .into_iter()
            .filter_map(|c| match c {
                Call::Write(_, characteristic, value) => Some((characteristic, value)),
                _ => None,
            })
            .collect()
    }

    pub fn is_connected_now(&self, address: &str) -> bool {
        self.with(|s| s.connected.contains(address))
    }

    pub fn is_subscribed(&self, address: &str) -> bool {
        self.with(|s| s.sinks.contains_key(address))
    }

    /// Connects issued while the address was already connected.
    pub fn overlapping_connects(&self) -> usize {
        self.with(|s| s.overlapping_connects)
    }
}

impl RadioLink for MockLink {
    fn connect<'a>(&'a self, address: &'a str) -> LinkFuture<'a, ()> {
        Box::pin(async move {
            self.with(|s| {
                s.calls.push(Call::Connect(address.to_string()));
                if let Some(remaining) = s.connect_failures.get_mut(address) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(LinkError::connect(format!("{address} not responding")));
                    }
                }
                if !s.connected.insert(address.to_string()) {
                    s.overlapping_connects += 1;
                }
                Ok(())
            })
        })
    }

    fn disconnect<'a>(&'a self, address: &'a str) -> LinkFuture<'a, ()> {
        Box::pin(async move {
            self.with(|s| {
                s.calls.push(Call::Disconnect(address.to_string()));
                s.connected.remove(address);
                s.sinks.remove(address);
            });
            Ok(())
        })
    }

    fn is_connected<'a>(&'a self, address: &'a str) -> LinkFuture<'a, bool> {
        Box::pin(async move {
            if self.with(|s| s.stalled.contains(address)) {
                std::future::pending::<()>().await;
            }
            Ok(self.is_connected_now(address))
        })
    }

    fn read<'a>(
        &'a self,
        address: &'a str,
        characteristic: Characteristic,
    ) -> LinkFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.with(|s| {
                s.calls.push(Call::Read(address.to_string(), characteristic));
                if !s.connected.contains(address) {
                    return Err(LinkError::not_connected(address));
                }
                s.reads
                    .get(&(address.to_string(), characteristic))
                    .cloned()
                    .ok_or_else(|| LinkError::read(format!("{characteristic} has no value")))
            })
        })
    }

    fn write<'a>(
        &'a self,
        address: &'a str,
        characteristic: Characteristic,
        value: &'a [u8],
    ) -> LinkFuture<'a, ()> {
        Box::pin(async move {
            self.with(|s| {
                if !s.connected.contains(address) {
                    return Err(LinkError::not_connected(address));
                }
                if let Some(remaining) = s.write_failures.get_mut(address) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(LinkError::write(format!("{characteristic} write rejected")));
                    }
                }
                s.calls.push(Call::Write(
                    address.to_string(),
                    characteristic,
                    value.to_vec(),
                ));
                Ok(())
            })
        })
    }

    fn subscribe<'a>(
        &'a self,
        address: &'a str,
        characteristic: Characteristic,
        sink: mpsc::Sender<Vec<u8>>,
    ) -> LinkFuture<'a, ()> {
        Box::pin(async move {
            self.with(|s| {
                s.calls
                    .push(Call::Subscribe(address.to_string(), characteristic));
                if !s.connected.contains(address) {
                    return Err(LinkError::not_connected(address));
                }
                if let Some(remaining) = s.subscribe_failures.get_mut(address) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(LinkError::unsupported(characteristic));
                    }
                }
                s.sinks.insert(address.to_string(), sink);
                Ok(())
            })
        })
    }

    fn unsubscribe<'a>(
        &'a self,
        address: &'a str,
        characteristic: Characteristic,
    ) -> LinkFuture<'a, ()> {
        Box::pin(async move {
            self.with(|s| {
                s.calls
                    .push(Call::Unsubscribe(address.to_string(), characteristic));
                s.sinks.remove(address);
            });
            Ok(())
        })
    }

    fn discover<'a>(&'a self, _duration: Duration) -> LinkFuture<'a, Vec<DiscoveredDevice>> {
        Box::pin(async move { Ok(self.with(|s| s.nearby.clone())) })
    }
}

/// Records every event accepted while "connected".
pub struct MockBackend {
    connected: AtomicBool,
    events: Mutex<Vec<OutboundEvent>>,
}

impl MockBackend {
    pub fn connected() -> Self {
        Self {
            connected: AtomicBool::new(true),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn disconnected() -> Self {
        let backend = Self::connected();
        backend.set_connected(false);
        backend
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<OutboundEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn tag_data_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, OutboundEvent::TagData(_)))
            .count()
    }

    pub fn anchor_reports(&self) -> Vec<AnchorData> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                OutboundEvent::AnchorData(data) => Some(data),
                _ => None,
            })
            .collect()
    }

    pub fn acks(&self) -> Vec<CommandAck> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                OutboundEvent::CommandAck(ack) => Some(ack),
                _ => None,
            })
            .collect()
    }
}

impl BackendChannel for MockBackend {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn emit(&self, event: OutboundEvent) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.events.lock().unwrap().push(event);
        true
    }
}
