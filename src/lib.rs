//! Poll telemetry from battery and charge-controller peripherals over Bluetooth Low Energy.
//!
//! The peripherals are reached through a GATT write characteristic (requests)
//! and a notify characteristic (responses). On top of that two strictly
//! half-duplex request/response protocols are spoken:
//!
//! - Modbus-style register reads ("read holding registers", function 3),
//!   answered by one frame with a MODBUS CRC. A device is read as an ordered
//!   list of register sections.
//! - The vendor BMS protocol, where fixed 7-byte commands are answered by
//!   0xDD ... 0x77 frames that may arrive split over several notifications.
//!
//! Each device gets a [`DeviceSession`] that runs one poll cycle at a time and
//! turns timeouts, partial frames and bad checksums into errors instead of
//! hangs. A [`PollScheduler`] connects all sessions, reads them on a fixed,
//! drift corrected period and always disconnects them on the way out.
//!
//! # Example
//!
//! ```no_run
//! # use std::time::Duration;
//! use battpoll::{BleTransport, DeviceDescriptor, DeviceSession, Pacing};
//! #
//! # #[tokio::main]
//! # pub async fn main() -> anyhow::Result<()> {
//!     let device = DeviceDescriptor::eco_worthy_battery("A4:C1:38:00:00:01", "battery", true);
//!     let transport = BleTransport::new(&device, Duration::from_secs(10));
//!     let mut session = DeviceSession::new(device, transport, Pacing::default());
//!     session.connect().await?;
//!     loop {
//!         let reading = session.read().await?;
//!         println!("{reading:?}");
//!         tokio::time::sleep(Duration::from_secs(5)).await;
//!     }
//! # }
//! ```

mod ble;
pub mod config;
pub mod crc;
pub mod device;
mod error;
pub mod message;
mod reading;
pub mod scheduler;
pub mod sequencer;
mod session;
pub mod sink;
pub mod timeout;
mod transport;

pub use ble::BleTransport;
pub use device::{DeviceDescriptor, DeviceFamily, ProtocolDescriptor, Section};
pub use error::{DecodeError, Error, Result};
pub use reading::{Fields, Reading, Value};
pub use scheduler::{PollScheduler, SchedulerSettings};
pub use sequencer::Pacing;
pub use session::DeviceSession;
pub use sink::{LogSink, MemorySink, ResultSink};
pub use transport::Transport;
