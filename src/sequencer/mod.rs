//! State machines that decide what to send next and when a cycle is over.
//!
//! Sequencers never touch the transport. They hand the session a [`Step`]
//! and are told what came back, so the request/response ordering can be
//! exercised without a radio.

mod frame;
mod section;

use std::time::Duration;

use tokio::time::Instant;

pub use frame::FramePollSequencer;
pub use section::SectionPollSequencer;

use crate::device::{DeviceDescriptor, ProtocolDescriptor};
use crate::error::Error;
use crate::reading::Fields;

/// What the session has to do next
#[derive(Debug)]
pub enum Step {
    /// Wait `delay`, write `frame`, then wait for the response
    Send { delay: Duration, frame: Vec<u8> },
    /// The cycle finished; these are all fields read
    Complete(Fields),
    /// The cycle was aborted
    Failed(Error),
}

/// Timing shared by both sequencers
#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    /// Deadline for each response
    pub request_timeout: Duration,
    /// Pause between a response and the next request in the same cycle
    pub spacing: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(15),
            spacing: Duration::from_millis(500),
        }
    }
}

/// The sequencer matching a device's protocol
#[derive(Debug)]
pub enum Sequencer {
    Section(SectionPollSequencer),
    Frame(FramePollSequencer),
}

impl Sequencer {
    pub fn for_device(device: &DeviceDescriptor, pacing: Pacing) -> Self {
        match &device.protocol {
            ProtocolDescriptor::Register {
                device_id,
                sections,
            } => Sequencer::Section(SectionPollSequencer::new(*device_id, sections.clone(), pacing)),
            ProtocolDescriptor::Frame { read_cell_voltages } => {
                Sequencer::Frame(FramePollSequencer::new(*read_cell_voltages, pacing))
            }
        }
    }

    pub fn start_cycle(&mut self) -> Step {
        match self {
            Sequencer::Section(s) => s.start_cycle(),
            Sequencer::Frame(s) => s.start_cycle(),
        }
    }

    /// The request from the last [`Step::Send`] is on the air
    pub fn on_sent(&mut self) {
        match self {
            Sequencer::Section(s) => s.on_sent(),
            Sequencer::Frame(s) => s.on_sent(),
        }
    }

    /// Feed one notification. `None` means keep waiting.
    pub fn on_delivery(&mut self, delivery: &[u8]) -> Option<Step> {
        match self {
            Sequencer::Section(s) => s.on_response(delivery),
            Sequencer::Frame(s) => s.on_delivery(delivery),
        }
    }

    pub fn on_timeout(&mut self) -> Step {
        match self {
            Sequencer::Section(s) => s.on_timeout(),
            Sequencer::Frame(s) => s.on_timeout(),
        }
    }

    /// When the in-flight request times out, if one is armed
    pub fn deadline(&self) -> Option<Instant> {
        match self {
            Sequencer::Section(s) => s.deadline(),
            Sequencer::Frame(s) => s.deadline(),
        }
    }

    /// Abandon the current cycle and return to idle
    pub fn reset(&mut self) {
        match self {
            Sequencer::Section(s) => s.reset(),
            Sequencer::Frame(s) => s.reset(),
        }
    }

    pub fn is_idle(&self) -> bool {
        match self {
            Sequencer::Section(s) => s.is_idle(),
            Sequencer::Frame(s) => s.is_idle(),
        }
    }
}
