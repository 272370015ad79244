//! [`Transport`] over Bluetooth Low Energy, using `bluest`.

use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bluest::{Adapter, AdvertisingDevice, Characteristic, Device};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::device::{DeviceDescriptor, DeviceFamily, GattChannels};
use crate::error::{Error, Result};
use crate::transport::Transport;

/// Notifications buffered between the radio and the session
const NOTIFICATION_BUFFER: usize = 64;

/// Hex digits in a MAC address
const ADDRESS_DIGITS: usize = 12;

struct Link {
    adapter: Adapter,
    device: Device,
    write: Characteristic,
    notify: Characteristic,
}

/// A BLE link to one device, found by address or, failing that, by name.
pub struct BleTransport {
    address: String,
    alias: String,
    family: DeviceFamily,
    discovery_timeout: Duration,
    link: Option<Link>,
    forwarder: Option<JoinHandle<()>>,
}

impl BleTransport {
    pub fn new(device: &DeviceDescriptor, discovery_timeout: Duration) -> Self {
        Self {
            address: device.address.clone(),
            alias: device.alias.clone(),
            family: device.family,
            discovery_timeout,
            link: None,
            forwarder: None,
        }
    }

    async fn open(&self) -> anyhow::Result<Link> {
        let adapter = Adapter::default()
            .await
            .ok_or(anyhow!("Default adapter not found"))?;
        adapter.wait_available().await?;

        info!("Connecting to {} ({})", self.alias, self.address);
        let found = self.discover_device(&adapter).await?;
        adapter.connect_device(&found.device).await?;
        info!("Connected to {} ({:?})", self.alias, found.device.id());

        let (write, notify) = Self::find_channels(&found.device, self.family.channels()).await?;
        Ok(Link {
            adapter,
            device: found.device,
            write,
            notify,
        })
    }

    /// Scan until a device with the configured address shows up.
    ///
    /// Devices advertising the alias, or one of the family's name prefixes,
    /// are remembered and used if the scan runs out without an address match.
    async fn discover_device(&self, adapter: &Adapter) -> anyhow::Result<AdvertisingDevice> {
        let wanted = normalize_address(&self.address);
        if wanted.len() != ADDRESS_DIGITS {
            warn!("{} is not a full address, matching {} by name only", self.address, self.alias);
        }
        let mut fallback: Option<AdvertisingDevice> = None;
        let mut adapter_events = adapter.scan(&[]).await?;

        let scan = async {
            while let Some(device) = adapter_events.next().await {
                if address_matches(&wanted, &format!("{:?}", device.device.id())) {
                    return Some(device);
                }
                if fallback.is_none() {
                    let name = device.adv_data.local_name.clone().unwrap_or_default();
                    if self.name_matches(&name) {
                        debug!("Remembering {name} as fallback for {}", self.alias);
                        fallback = Some(device);
                    }
                }
            }
            None
        };

        match timeout(self.discovery_timeout, scan).await {
            Ok(Some(device)) => Ok(device),
            _ => match fallback {
                Some(device) => {
                    warn!("{} not found by address, using device matched by name", self.address);
                    Ok(device)
                }
                None => Err(anyhow!("Cannot find device {}", self.address)),
            },
        }
    }

    fn name_matches(&self, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        name == self.alias
            || self
                .family
                .alias_prefixes()
                .iter()
                .any(|prefix| name.starts_with(prefix))
    }

    /// The notify characteristic may live in any service, the write one must be in the write service.
    async fn find_channels(
        device: &Device,
        channels: GattChannels,
    ) -> anyhow::Result<(Characteristic, Characteristic)> {
        let mut write = None;
        let mut notify = None;
        for service in device.discover_services().await? {
            for characteristic in service.discover_characteristics().await? {
                let uuid = characteristic.uuid();
                if uuid == channels.notify && notify.is_none() {
                    debug!("Found notify characteristic {uuid} in service {}", service.uuid());
                    notify = Some(characteristic.clone());
                }
                if uuid == channels.write && service.uuid() == channels.service {
                    debug!("Found write characteristic {uuid} in service {}", service.uuid());
                    write = Some(characteristic);
                }
            }
        }
        let write = write.ok_or(anyhow!("The device does not have write characteristic {}", channels.write))?;
        let notify = notify.ok_or(anyhow!("The device does not have notify characteristic {}", channels.notify))?;
        Ok((write, notify))
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn connect(&mut self) -> Result<()> {
        if let Some(link) = &self.link {
            if link.device.is_connected().await {
                return Ok(());
            }
        }
        let link = self
            .open()
            .await
            .map_err(|err| Error::Connect(format!("{}: {err}", self.alias)))?;
        self.link = Some(link);
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<mpsc::Receiver<Vec<u8>>> {
        let link = self.link.as_ref().ok_or(Error::NotConnected(self.alias.clone()))?;
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }

        let notify = link.notify.clone();
        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        let alias = self.alias.clone();
        self.forwarder = Some(tokio::spawn(async move {
            let mut reader = match notify.notify().await {
                Ok(reader) => reader,
                Err(err) => {
                    warn!("{alias}: cannot subscribe to notifications: {err}");
                    return;
                }
            };
            while let Some(notification) = reader.next().await {
                match notification {
                    Ok(data) => {
                        debug!("{alias}: RX notification: 0x{}", hex::encode(&data));
                        if tx.send(data).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!("{alias}: notification error: {err}");
                        break;
                    }
                }
            }
            debug!("{alias}: end of notification stream");
        }));
        Ok(rx)
    }

    async fn write(&mut self, frame: &[u8]) -> Result<()> {
        let link = self.link.as_ref().ok_or(Error::NotConnected(self.alias.clone()))?;
        debug!("{}: TX: {}", self.alias, hex::encode(frame));
        link.write.write_without_response(frame).await?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        if let Some(link) = self.link.take() {
            if link.device.is_connected().await {
                info!("Disconnecting {}", self.alias);
                link.adapter.disconnect_device(&link.device).await?;
            }
        }
        Ok(())
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

/// Uppercase hex digits only, so "aa:bb:cc" and "AABBCC" compare equal
fn normalize_address(address: &str) -> String {
    address
        .chars()
        .filter(char::is_ascii_hexdigit)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Whether the platform device id carries the complete `wanted` address
fn address_matches(wanted: &str, device_id: &str) -> bool {
    wanted.len() == ADDRESS_DIGITS && normalize_address(device_id).contains(wanted)
}

#[test]
fn test_normalize_address() {
    assert_eq!(normalize_address("c3:7a:68:17:6b:fc"), "C37A68176BFC");
    assert_eq!(normalize_address("C3-7A-68-17-6B-FC"), "C37A68176BFC");
    assert_eq!(normalize_address(""), "");
}

#[test]
fn test_address_match_needs_full_address() {
    let id = "DeviceId(\"/org/bluez/hci0/dev_80_6F_B0_0F_12_34\")";
    assert!(address_matches(&normalize_address("80:6f:b0:0f:12:34"), id));
    assert!(!address_matches(&normalize_address("80:6F:B0:0F:XX:XX"), id));
    assert!(!address_matches(&normalize_address("80:6F:B0:0F:12:35"), id));
    assert!(!address_matches("", id));
}
