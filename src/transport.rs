//! The contract a wireless link has to fulfil for a session to poll over it.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// A GATT style link to one peripheral.
///
/// Writes are fire-and-forget: delivery is only ever confirmed by a later
/// notification. Notifications arrive on the channel returned by
/// [`Transport::subscribe`] in the order they were received and may be
/// smaller than a logical frame.
#[async_trait]
pub trait Transport: Send {
    /// Find the peripheral and establish the link
    async fn connect(&mut self) -> Result<()>;

    /// Start receiving notifications from the notify characteristic
    async fn subscribe(&mut self) -> Result<mpsc::Receiver<Vec<u8>>>;

    /// Write to the write characteristic without asking for a response
    async fn write(&mut self, frame: &[u8]) -> Result<()>;

    /// Tear the link down. Must tolerate an already broken or closed link.
    async fn disconnect(&mut self) -> Result<()>;
}
