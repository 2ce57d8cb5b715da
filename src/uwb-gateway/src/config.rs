// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Configuration file support for uwb-gateway.
//!
//! Config is loaded from the `[uwb-gateway]` section of `uwb-gateway.toml`.
//! Default search order:
//! 1. Path specified via `--config` CLI argument
//! 2. `./uwb-gateway.toml`
//! 3. `~/.config/uwb-gateway/uwb-gateway.toml`
//! 4. `/etc/uwb-gateway/uwb-gateway.toml`

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uwb_app::ConfigFile;
use uwb_core::controller::{ExponentialBackoff, FixedDelay};
use uwb_core::telemetry::AdmissionFilter;

/// Top-level gateway configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub general: GeneralConfig,
    /// Backend channel connection
    pub backend: BackendConfig,
    /// Device registry file
    pub registry: RegistryConfig,
    /// Radio discovery and boot behaviour
    pub radio: RadioConfig,
    /// Per-device session timing
    pub session: SessionConfig,
    /// Tag telemetry throttle
    pub telemetry: TelemetryConfig,
    /// Configuration write handling
    pub commands: CommandsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: Option<String>,
    /// Identifier announced to the backend on connect
    pub gateway_id: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: None,
            gateway_id: "uwb-gateway".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend address as host:port
    pub addr: String,
    /// Optional token sent in the hello event
    pub token: Option<String>,
    /// Reconnect attempts before falling back to the slow retry interval
    pub reconnect_attempts: u32,
    /// Delay before the first reconnect attempt; doubles per attempt
    pub reconnect_delay_ms: u64,
    /// Interval between reconnect attempts once the fast attempts are used up
    pub slow_retry_ms: u64,
    /// Outbound event queue capacity
    pub outbound_buffer: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5000".to_string(),
            token: None,
            reconnect_attempts: 3,
            reconnect_delay_ms: 5_000,
            slow_retry_ms: 10_000,
            outbound_buffer: 256,
        }
    }
}

impl BackendConfig {
    pub fn reconnect_policy(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            self.reconnect_attempts,
            Duration::from_millis(self.reconnect_delay_ms),
            Duration::from_millis(self.slow_retry_ms),
        )
    }

    pub fn slow_retry(&self) -> Duration {
        Duration::from_millis(self.slow_retry_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// JSON file listing known modules and their roles
    pub path: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("modules.json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// Scan for modules at boot and report registry devices not seen
    pub scan_on_start: bool,
    /// Scan duration in seconds
    pub scan_secs: u64,
    /// Advertised name prefixes of UWB modules (case-insensitive)
    pub name_prefixes: Vec<String>,
    /// Start one-shot anchor sessions at boot
    pub start_anchors: bool,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            scan_on_start: false,
            scan_secs: 10,
            name_prefixes: vec!["dwc".to_string(), "dwd".to_string()],
            start_anchors: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Connect attempts per round
    pub connect_attempts: u32,
    /// Delay between connect attempts within a round
    pub connect_retry_delay_ms: u64,
    /// Wait after an exhausted round before the next one
    pub backoff_ms: u64,
    /// Link check interval while streaming
    pub hold_interval_ms: u64,
    /// Maximum wait for a cancelled session to finish
    pub stop_timeout_ms: u64,
    /// Pause between anchor characteristic reads
    pub anchor_read_gap_ms: u64,
    /// Per-session notification buffer
    pub notification_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 3,
            connect_retry_delay_ms: 5_000,
            backoff_ms: 5_000,
            hold_interval_ms: 2_000,
            stop_timeout_ms: 10_000,
            anchor_read_gap_ms: 500,
            notification_buffer: 32,
        }
    }
}

impl SessionConfig {
    pub fn connect_policy(&self) -> FixedDelay {
        FixedDelay::new(
            self.connect_attempts,
            Duration::from_millis(self.connect_retry_delay_ms),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Minimum interval between tag reports while tracking is off
    pub interval_ms: u64,
    /// Minimum number of ranging neighbours in a forwarded frame
    pub min_neighbors: usize,
    /// Minimum quality factor of every ranging neighbour
    pub min_quality: u8,
    /// Decoded frame queue capacity
    pub queue_size: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            min_neighbors: 3,
            min_quality: 5,
            queue_size: 256,
        }
    }
}

impl TelemetryConfig {
    pub fn admission_filter(&self) -> AdmissionFilter {
        AdmissionFilter::new(self.min_neighbors, self.min_quality)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    /// Write attempts per command
    pub write_attempts: u32,
    /// Delay between write attempts
    pub write_retry_delay_ms: u64,
    /// Pause after stopping a session before writing
    pub settle_ms: u64,
    /// Pending commands per device
    pub queue_size: usize,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            write_attempts: 3,
            write_retry_delay_ms: 3_000,
            settle_ms: 500,
            queue_size: 8,
        }
    }
}

impl CommandsConfig {
    pub fn write_policy(&self) -> FixedDelay {
        FixedDelay::new(
            self.write_attempts,
            Duration::from_millis(self.write_retry_delay_ms),
        )
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<(), String> {
        validate_log_level(self.general.log_level.as_deref())?;

        if self.general.gateway_id.trim().is_empty() {
            return Err("[general].gateway_id must not be empty".to_string());
        }
        if self.backend.addr.trim().is_empty() {
            return Err("[backend].addr must not be empty".to_string());
        }
        if self.backend.reconnect_attempts == 0 {
            return Err("[backend].reconnect_attempts must be > 0".to_string());
        }
        if self.backend.reconnect_delay_ms == 0 || self.backend.slow_retry_ms == 0 {
            return Err("[backend] reconnect delays must be > 0".to_string());
        }
        if self.backend.outbound_buffer == 0 {
            return Err("[backend].outbound_buffer must be > 0".to_string());
        }
        if self.registry.path.as_os_str().is_empty() {
            return Err("[registry].path must not be empty".to_string());
        }
        if self.radio.scan_secs == 0 {
            return Err("[radio].scan_secs must be > 0".to_string());
        }
        if self.session.connect_attempts == 0 {
            return Err("[session].connect_attempts must be > 0".to_string());
        }
        if self.session.hold_interval_ms == 0 {
            return Err("[session].hold_interval_ms must be > 0".to_string());
        }
        if self.session.stop_timeout_ms == 0 {
            return Err("[session].stop_timeout_ms must be > 0".to_string());
        }
        if self.session.notification_buffer == 0 {
            return Err("[session].notification_buffer must be > 0".to_string());
        }
        if self.telemetry.queue_size == 0 {
            return Err("[telemetry].queue_size must be > 0".to_string());
        }
        if self.commands.write_attempts == 0 {
            return Err("[commands].write_attempts must be > 0".to_string());
        }
        if self.commands.queue_size == 0 {
            return Err("[commands].queue_size must be > 0".to_string());
        }
        Ok(())
    }

    /// Generate an example configuration under the `[uwb-gateway]` header.
    pub fn example_toml() -> String {
        #[derive(Serialize)]
        struct Wrapper {
            #[serde(rename = "uwb-gateway")]
            inner: GatewayConfig,
        }
        let example = GatewayConfig {
            general: GeneralConfig {
                log_level: Some("info".to_string()),
                ..GeneralConfig::default()
            },
            ..GatewayConfig::default()
        };
        toml::to_string_pretty(&Wrapper { inner: example }).unwrap_or_default()
    }
}

impl ConfigFile for GatewayConfig {
    fn section_key() -> &'static str {
        "uwb-gateway"
    }
}

fn validate_log_level(level: Option<&str>) -> Result<(), String> {
    if let Some(level) = level {
        if uwb_app::logging::parse_level(level).is_none() {
            return Err(format!(
                "[general].log_level '{}' is invalid (expected one of: trace, debug, info, warn, error)",
                level
            ));
        }
    }
    Ok(())
}
