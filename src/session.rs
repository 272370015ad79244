//! One device, its link and its sequencer.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::device::DeviceDescriptor;
use crate::error::{Error, Result};
use crate::reading::{Fields, Reading};
use crate::sequencer::{Pacing, Sequencer, Step};
use crate::timeout::expired;
use crate::transport::Transport;

/// Couples a device with its transport and runs whole poll cycles over it.
///
/// The sequencer only ever has one request in flight, and a session is only
/// driven through `&mut self`, so requests to one device never overlap.
pub struct DeviceSession<T> {
    device: DeviceDescriptor,
    transport: T,
    sequencer: Sequencer,
    notifications: Option<mpsc::Receiver<Vec<u8>>>,
}

impl<T: Transport> DeviceSession<T> {
    pub fn new(device: DeviceDescriptor, transport: T, pacing: Pacing) -> Self {
        let sequencer = Sequencer::for_device(&device, pacing);
        info!(
            "Init {}: {} => {}",
            device.family.client_name(),
            device.alias,
            device.address
        );
        Self {
            device,
            transport,
            sequencer,
            notifications: None,
        }
    }

    pub fn alias(&self) -> &str {
        &self.device.alias
    }

    pub fn is_connected(&self) -> bool {
        self.notifications.is_some()
    }

    /// Connect and subscribe to notifications. Reads are refused until this succeeds.
    pub async fn connect(&mut self) -> Result<()> {
        self.notifications = None;
        self.transport.connect().await.map_err(|err| match err {
            Error::Connect(_) => err,
            other => Error::Connect(other.to_string()),
        })?;
        let notifications = self.transport.subscribe().await.map_err(|err| Error::Connect(err.to_string()))?;
        self.notifications = Some(notifications);
        Ok(())
    }

    /// Run exactly one poll cycle to completion.
    pub async fn read(&mut self) -> Result<Reading> {
        if self.notifications.is_none() {
            return Err(Error::NotConnected(self.device.alias.clone()));
        }

        let outcome = self.run_cycle().await;
        if outcome.is_err() {
            self.sequencer.reset();
        }
        outcome.map(|fields| Reading {
            device: self.device.alias.clone(),
            client: self.device.family.client_name().to_string(),
            fields,
        })
    }

    async fn run_cycle(&mut self) -> Result<Fields> {
        let mut step = self.sequencer.start_cycle();
        loop {
            step = match step {
                Step::Send { delay, frame } => {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    // duplicates of the previous response must not answer this request
                    self.drain_stale_notifications();
                    self.transport.write(&frame).await?;
                    self.sequencer.on_sent();
                    self.await_response().await?
                }
                Step::Complete(fields) => return Ok(fields),
                Step::Failed(err) => return Err(err),
            };
        }
    }

    /// Wait for the sequencer to make progress on the request in flight
    async fn await_response(&mut self) -> Result<Step> {
        let Some(notifications) = self.notifications.as_mut() else {
            return Err(Error::NotConnected(self.device.alias.clone()));
        };
        loop {
            let deadline = self.sequencer.deadline();
            let delivery = tokio::select! {
                delivery = notifications.recv() => delivery,
                _ = expired(deadline) => return Ok(self.sequencer.on_timeout()),
            };
            match delivery {
                Some(delivery) => {
                    if let Some(step) = self.sequencer.on_delivery(&delivery) {
                        return Ok(step);
                    }
                }
                None => {
                    warn!("{}: notification stream closed", self.device.alias);
                    self.notifications = None;
                    return Err(Error::NotificationsClosed);
                }
            }
        }
    }

    /// Abandon a cycle that was cancelled from outside, e.g. by a read timeout
    pub fn abort_cycle(&mut self) {
        if !self.sequencer.is_idle() {
            debug!("{}: aborting cycle in progress", self.device.alias);
        }
        self.sequencer.reset();
        self.drain_stale_notifications();
    }

    fn drain_stale_notifications(&mut self) {
        if let Some(notifications) = self.notifications.as_mut() {
            while let Ok(stale) = notifications.try_recv() {
                debug!("{}: discarding stale notification {}", self.device.alias, hex::encode(stale));
            }
        }
    }

    /// Disconnect. Safe to call on a session that never connected.
    pub async fn disconnect(&mut self) -> Result<()> {
        self.sequencer.reset();
        self.notifications = None;
        self.transport.disconnect().await
    }
}
