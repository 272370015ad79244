//! Configuration file loading.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::device::{DeviceDescriptor, Section};
use crate::message::register::MAX_WORDS;
use crate::scheduler::SchedulerSettings;
use crate::sequencer::Pacing;

/// Environment variables with this prefix override the file, `__` separating nested keys
pub const ENV_PREFIX: &str = "BATTPOLL_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default)]
    pub enable_polling: bool,
    /// Seconds between the starts of two polling rounds
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// Fields to report; empty reports everything
    #[serde(default)]
    pub fields: Vec<String>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            enable_polling: false,
            poll_interval: default_poll_interval(),
            fields: Vec::new(),
        }
    }
}

fn default_poll_interval() -> u64 {
    60
}

/// All values in seconds unless the name says otherwise
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_connect")]
    pub connect: u64,
    #[serde(default = "default_read")]
    pub read: u64,
    #[serde(default = "default_disconnect")]
    pub disconnect: u64,
    #[serde(default = "default_request")]
    pub request: u64,
    #[serde(default = "default_discovery")]
    pub discovery: u64,
    #[serde(default = "default_spacing_ms")]
    pub spacing_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: default_connect(),
            read: default_read(),
            disconnect: default_disconnect(),
            request: default_request(),
            discovery: default_discovery(),
            spacing_ms: default_spacing_ms(),
        }
    }
}

fn default_connect() -> u64 {
    35
}

fn default_read() -> u64 {
    30
}

fn default_disconnect() -> u64 {
    5
}

fn default_request() -> u64 {
    15
}

fn default_discovery() -> u64 {
    10
}

fn default_spacing_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceType {
    #[serde(rename = "EW_BAT")]
    EcoWorthyBattery,
    #[serde(rename = "BLE_ESP")]
    BleEsp,
    #[serde(rename = "REGISTERS")]
    RegisterMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionConfig {
    pub register: u16,
    pub words: u16,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub alias: String,
    pub mac_addr: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    #[serde(default = "default_device_id")]
    pub device_id: u8,
    #[serde(default)]
    pub read_cellv: bool,
    #[serde(default)]
    pub sections: Vec<SectionConfig>,
}

fn default_device_id() -> u8 {
    255
}

impl DeviceConfig {
    pub fn descriptor(&self) -> DeviceDescriptor {
        match self.device_type {
            DeviceType::EcoWorthyBattery => {
                DeviceDescriptor::eco_worthy_battery(&self.mac_addr, &self.alias, self.read_cellv)
            }
            DeviceType::BleEsp => DeviceDescriptor::ble_esp(&self.mac_addr, &self.alias, self.device_id),
            DeviceType::RegisterMap => DeviceDescriptor::register_map(
                &self.mac_addr,
                &self.alias,
                self.device_id,
                self.sections
                    .iter()
                    .map(|s| Section::raw(s.register, s.words, &s.label))
                    .collect(),
            ),
        }
    }
}

impl Config {
    /// Load the TOML file at `path`, overridden by `BATTPOLL_` environment variables
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config: Config = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.devices.is_empty() {
            bail!("No devices configured");
        }
        for device in &self.devices {
            if device.device_type == DeviceType::RegisterMap && device.sections.is_empty() {
                bail!("Device {} has no sections to read", device.alias);
            }
            for section in &device.sections {
                if section.words == 0 || section.words > MAX_WORDS {
                    bail!(
                        "Device {} section {} reads {} words, must be 1 to {MAX_WORDS}",
                        device.alias,
                        section.label,
                        section.words
                    );
                }
            }
        }
        Ok(())
    }

    pub fn descriptors(&self) -> Vec<DeviceDescriptor> {
        self.devices.iter().map(DeviceConfig::descriptor).collect()
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            enable_polling: self.data.enable_polling,
            poll_interval: Duration::from_secs(self.data.poll_interval),
            connect_timeout: Duration::from_secs(self.timeouts.connect),
            read_timeout: Duration::from_secs(self.timeouts.read),
            disconnect_timeout: Duration::from_secs(self.timeouts.disconnect),
        }
    }

    pub fn pacing(&self) -> Pacing {
        Pacing {
            request_timeout: Duration::from_secs(self.timeouts.request),
            spacing: Duration::from_millis(self.timeouts.spacing_ms),
        }
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.discovery)
    }
}

#[cfg(test)]
use crate::device::{DeviceFamily, ProtocolDescriptor};
#[cfg(test)]
use std::io::Write;

#[cfg(test)]
const SAMPLE: &str = r#"
[data]
enable_polling = true
poll_interval = 30
fields = ["voltage", "current"]

[[devices]]
alias = "BT-TH-161E"
mac_addr = "80:6F:B0:0F:XX:XX"
type = "REGISTERS"
device_id = 255
sections = [
    { register = 5000, words = 8, label = "cells" },
    { register = 5042, words = 1, label = "current" },
]

[[devices]]
alias = "ECO-1"
mac_addr = "A4:C1:38:00:00:01"
type = "EW_BAT"
read_cellv = true
"#;

#[cfg(test)]
fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_loads_devices_and_defaults() {
    let file = write_config(SAMPLE);
    let config = Config::load(file.path()).unwrap();

    assert!(config.data.enable_polling);
    assert_eq!(config.scheduler_settings().poll_interval, Duration::from_secs(30));
    assert_eq!(config.scheduler_settings().connect_timeout, Duration::from_secs(35));
    assert_eq!(config.pacing().spacing, Duration::from_millis(500));

    let devices = config.descriptors();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].family, DeviceFamily::RegisterMap);
    match &devices[0].protocol {
        ProtocolDescriptor::Register { device_id, sections } => {
            assert_eq!(*device_id, 255);
            assert_eq!(sections.len(), 2);
            assert_eq!(sections[1].register, 5042);
        }
        other => panic!("unexpected protocol {other:?}"),
    }
    assert!(matches!(
        devices[1].protocol,
        ProtocolDescriptor::Frame { read_cell_voltages: true }
    ));
}

#[test]
fn test_rejects_register_map_without_sections() {
    let file = write_config(
        r#"
[[devices]]
alias = "a"
mac_addr = "b"
type = "REGISTERS"
"#,
    );
    assert!(Config::load(file.path()).is_err());
}

#[test]
fn test_rejects_oversized_section() {
    let file = write_config(
        r#"
[[devices]]
alias = "a"
mac_addr = "b"
type = "REGISTERS"
sections = [{ register = 0, words = 126, label = "x" }]
"#,
    );
    assert!(Config::load(file.path()).is_err());
}

#[test]
fn test_example_config_is_valid() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config.example.toml");
    let config = Config::load(&path).unwrap();
    let families: Vec<DeviceFamily> = config.descriptors().iter().map(|d| d.family).collect();
    assert_eq!(
        families,
        vec![DeviceFamily::EcoWorthyBattery, DeviceFamily::RegisterMap, DeviceFamily::BleEsp]
    );
}

#[test]
fn test_rejects_empty_device_list() {
    let file = write_config("devices = []\n");
    assert!(Config::load(file.path()).is_err());
}
