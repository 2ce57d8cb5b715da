// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Bluetooth LE radio link on top of btleplug.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info};

use uwb_app::normalize_mac;
use uwb_core::radio::NETWORK_NODE_SERVICE;
use uwb_core::{Characteristic, DiscoveredDevice, LinkError, LinkFuture, LinkResult, RadioLink};

/// Scan window used when a peripheral is not cached yet.
const LOOKUP_SCAN: Duration = Duration::from_secs(5);
const LOOKUP_POLL: Duration = Duration::from_millis(250);

pub struct BleLink {
    adapter: Adapter,
    /// Held for the whole of a scan; the adapter has a single scan state.
    scan: AsyncMutex<()>,
    peripherals: AsyncMutex<HashMap<String, Peripheral>>,
    pumps: Mutex<HashMap<(String, Characteristic), JoinHandle<()>>>,
}

fn address_of(peripheral: &Peripheral) -> Option<String> {
    normalize_mac(&peripheral.address().to_string())
}

impl BleLink {
    /// Use the first adapter of the platform manager.
    pub async fn new() -> LinkResult<Self> {
        let manager = Manager::new()
            .await
            .map_err(|e| LinkError::adapter(e.to_string()))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|e| LinkError::adapter(e.to_string()))?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| LinkError::adapter("no Bluetooth adapter found"))?;
        if let Ok(info) = adapter.adapter_info().await {
            info!("Using Bluetooth adapter {}", info);
        }
        Ok(Self {
            adapter,
            scan: AsyncMutex::new(()),
            peripherals: AsyncMutex::new(HashMap::new()),
            pumps: Mutex::new(HashMap::new()),
        })
    }

    async fn cache_known(&self) -> LinkResult<()> {
        let found = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| LinkError::adapter(e.to_string()))?;
        let mut cache = self.peripherals.lock().await;
        for peripheral in found {
            if let Some(address) = address_of(&peripheral) {
                cache.entry(address).or_insert(peripheral);
            }
        }
        Ok(())
    }

    async fn cached(&self, address: &str) -> Option<Peripheral> {
        self.peripherals.lock().await.get(address).cloned()
    }

    /// Resolve `address`, scanning for it on a cache miss.
    async fn peripheral(&self, address: &str) -> LinkResult<Peripheral> {
        if let Some(peripheral) = self.cached(address).await {
            return Ok(peripheral);
        }
        self.cache_known().await?;
        if let Some(peripheral) = self.cached(address).await {
            return Ok(peripheral);
        }

        let _scan = self.scan.lock().await;
        // A scan that finished while waiting may have found it.
        self.cache_known().await?;
        if let Some(peripheral) = self.cached(address).await {
            return Ok(peripheral);
        }
        debug!("[{}] not cached, scanning", address);
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| LinkError::adapter(e.to_string()))?;
        let deadline = time::Instant::now() + LOOKUP_SCAN;
        let mut found = None;
        while time::Instant::now() < deadline {
            time::sleep(LOOKUP_POLL).await;
            self.cache_known().await?;
            if let Some(peripheral) = self.cached(address).await {
                found = Some(peripheral);
                break;
            }
        }
        let _ = self.adapter.stop_scan().await;
        found.ok_or_else(|| LinkError::not_found(address))
    }

    fn find_characteristic(
        peripheral: &Peripheral,
        characteristic: Characteristic,
    ) -> LinkResult<btleplug::api::Characteristic> {
        let uuid = characteristic.uuid();
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid && c.service_uuid == NETWORK_NODE_SERVICE)
            .ok_or_else(|| LinkError::unsupported(characteristic))
    }

    async fn connected_peripheral(&self, address: &str) -> LinkResult<Peripheral> {
        let peripheral = self
            .cached(address)
            .await
            .ok_or_else(|| LinkError::not_connected(address))?;
        match peripheral.is_connected().await {
            Ok(true) => Ok(peripheral),
            _ => Err(LinkError::not_connected(address)),
        }
    }

    fn stop_pump(&self, address: &str, characteristic: Characteristic) {
        let mut pumps = self.pumps.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pump) = pumps.remove(&(address.to_string(), characteristic)) {
            pump.abort();
        }
    }

    fn stop_pumps(&self, address: &str) {
        let mut pumps = self.pumps.lock().unwrap_or_else(PoisonError::into_inner);
        pumps.retain(|(pump_address, _), pump| {
            if pump_address == address {
                pump.abort();
                false
            } else {
                true
            }
        });
    }
}

impl RadioLink for BleLink {
    fn connect<'a>(&'a self, address: &'a str) -> LinkFuture<'a, ()> {
        Box::pin(async move {
            let peripheral = self.peripheral(address).await?;
            let connected = peripheral
                .is_connected()
                .await
                .map_err(|e| LinkError::connect(e.to_string()))?;
            if !connected {
                peripheral
                    .connect()
                    .await
                    .map_err(|e| LinkError::connect(e.to_string()))?;
            }
            peripheral
                .discover_services()
                .await
                .map_err(|e| LinkError::connect(e.to_string()))?;
            debug!("[{}] connected", address);
            Ok(())
        })
    }

    fn disconnect<'a>(&'a self, address: &'a str) -> LinkFuture<'a, ()> {
        Box::pin(async move {
            self.stop_pumps(address);
            let Some(peripheral) = self.cached(address).await else {
                return Ok(());
            };
            if peripheral.is_connected().await.unwrap_or(false) {
                peripheral
                    .disconnect()
                    .await
                    .map_err(|e| LinkError::connect(e.to_string()))?;
                debug!("[{}] disconnected", address);
            }
            Ok(())
        })
    }

    fn is_connected<'a>(&'a self, address: &'a str) -> LinkFuture<'a, bool> {
        Box::pin(async move {
            let Some(peripheral) = self.cached(address).await else {
                return Ok(false);
            };
            peripheral
                .is_connected()
                .await
                .map_err(|e| LinkError::adapter(e.to_string()))
        })
    }

    fn read<'a>(
        &'a self,
        address: &'a str,
        characteristic: Characteristic,
    ) -> LinkFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let peripheral = self.connected_peripheral(address).await?;
            let target = Self::find_characteristic(&peripheral, characteristic)?;
            peripheral
                .read(&target)
                .await
                .map_err(|e| LinkError::read(format!("{characteristic}: {e}")))
        })
    }

    fn write<'a>(
        &'a self,
        address: &'a str,
        characteristic: Characteristic,
        value: &'a [u8],
    ) -> LinkFuture<'a, ()> {
        Box::pin(async move {
            let peripheral = self.connected_peripheral(address).await?;
            let target = Self::find_characteristic(&peripheral, characteristic)?;
            peripheral
                .write(&target, value, WriteType::WithResponse)
                .await
                .map_err(|e| LinkError::write(format!("{characteristic}: {e}")))
        })
    }

    fn subscribe<'a>(
        &'a self,
        address: &'a str,
        characteristic: Characteristic,
        sink: mpsc::Sender<Vec<u8>>,
    ) -> LinkFuture<'a, ()> {
        Box::pin(async move {
            let peripheral = self.connected_peripheral(address).await?;
            let target = Self::find_characteristic(&peripheral, characteristic)?;
            let mut notifications = peripheral
                .notifications()
                .await
                .map_err(|e| LinkError::subscribe(e.to_string()))?;
            peripheral
                .subscribe(&target)
                .await
                .map_err(|e| LinkError::subscribe(format!("{characteristic}: {e}")))?;

            let uuid = target.uuid;
            let pump_address = address.to_string();
            let pump = tokio::spawn(async move {
                while let Some(notification) = notifications.next().await {
                    if notification.uuid != uuid {
                        continue;
                    }
                    if sink.send(notification.value).await.is_err() {
                        break;
                    }
                }
                debug!("[{}] notification pump ended", pump_address);
            });

            self.stop_pump(address, characteristic);
            self.pumps
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert((address.to_string(), characteristic), pump);
            Ok(())
        })
    }

    fn unsubscribe<'a>(
        &'a self,
        address: &'a str,
        characteristic: Characteristic,
    ) -> LinkFuture<'a, ()> {
        Box::pin(async move {
            self.stop_pump(address, characteristic);
            let peripheral = self.connected_peripheral(address).await?;
            let target = Self::find_characteristic(&peripheral, characteristic)?;
            peripheral
                .unsubscribe(&target)
                .await
                .map_err(|e| LinkError::subscribe(format!("{characteristic}: {e}")))
        })
    }

    fn discover<'a>(&'a self, duration: Duration) -> LinkFuture<'a, Vec<DiscoveredDevice>> {
        Box::pin(async move {
            let _scan = self.scan.lock().await;
            self.adapter
                .start_scan(ScanFilter::default())
                .await
                .map_err(|e| LinkError::adapter(e.to_string()))?;
            time::sleep(duration).await;
            let _ = self.adapter.stop_scan().await;

            let found = self
                .adapter
                .peripherals()
                .await
                .map_err(|e| LinkError::adapter(e.to_string()))?;
            let mut devices = Vec::with_capacity(found.len());
            let mut cache = self.peripherals.lock().await;
            for peripheral in found {
                let Some(address) = address_of(&peripheral) else {
                    continue;
                };
                let name = match peripheral.properties().await {
                    Ok(Some(props)) => props.local_name,
                    _ => None,
                };
                cache.entry(address.clone()).or_insert(peripheral);
                devices.push(DiscoveredDevice { address, name });
            }
            devices.sort_by(|a, b| a.address.cmp(&b.address));
            Ok(devices)
        })
    }
}
