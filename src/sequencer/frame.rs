use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::{Pacing, Step};
use crate::error::Error;
use crate::message::vendor::{
    decode_basic_info, decode_cell_voltages, FrameAssembler, VendorFrame, OPERATION_BASIC_INFO,
    OPERATION_CELL_VOLTAGES, REQUEST_BASIC_INFO, REQUEST_CELL_VOLTAGES, STATUS_SUCCESS,
};
use crate::reading::Fields;
use crate::timeout::TimeoutSupervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    BasicInfo,
    CellVoltages,
}

impl Command {
    fn for_operation(operation: u8) -> Option<Self> {
        match operation {
            OPERATION_BASIC_INFO => Some(Command::BasicInfo),
            OPERATION_CELL_VOLTAGES => Some(Command::CellVoltages),
            _ => None,
        }
    }

    fn request(&self) -> &'static [u8] {
        match self {
            Command::BasicInfo => &REQUEST_BASIC_INFO,
            Command::CellVoltages => &REQUEST_CELL_VOLTAGES,
        }
    }
}

/// Runs the fixed vendor command exchange: basic info, then optionally cell voltages.
#[derive(Debug)]
pub struct FramePollSequencer {
    read_cell_voltages: bool,
    fetched_basic: bool,
    fetched_cells: bool,
    in_flight: Option<Command>,
    assembler: FrameAssembler,
    fields: Fields,
    timeout: TimeoutSupervisor,
    spacing: Duration,
}

impl FramePollSequencer {
    pub fn new(read_cell_voltages: bool, pacing: Pacing) -> Self {
        Self {
            read_cell_voltages,
            fetched_basic: false,
            fetched_cells: false,
            in_flight: None,
            assembler: FrameAssembler::new(),
            fields: Fields::new(),
            timeout: TimeoutSupervisor::new(pacing.request_timeout),
            spacing: pacing.spacing,
        }
    }

    pub fn start_cycle(&mut self) -> Step {
        self.reset();
        self.fetch_next(Duration::ZERO)
    }

    fn fetch_next(&mut self, delay: Duration) -> Step {
        let command = if !self.fetched_basic {
            Command::BasicInfo
        } else if self.read_cell_voltages && !self.fetched_cells {
            Command::CellVoltages
        } else {
            debug!("All commands answered");
            let fields = std::mem::take(&mut self.fields);
            self.reset();
            return Step::Complete(fields);
        };

        self.in_flight = Some(command);
        Step::Send {
            delay,
            frame: command.request().to_vec(),
        }
    }

    pub fn on_sent(&mut self) {
        if self.in_flight.is_some() {
            self.timeout.disarm();
            self.timeout.arm();
        }
    }

    pub fn on_delivery(&mut self, delivery: &[u8]) -> Option<Step> {
        let Some(command) = self.in_flight else {
            warn!("Dropping notification with no command in flight: {}", hex::encode(delivery));
            return None;
        };

        match self.assembler.push(delivery)? {
            Ok(frame) => match Command::for_operation(frame.operation) {
                None => {
                    warn!("Unknown operation {:#04x}: {}", frame.operation, hex::encode(&frame.payload));
                    return Some(self.fail(Error::UnexpectedOperation(frame.operation)));
                }
                Some(answered) if answered != command => {
                    warn!("Ignoring {answered:?} response while waiting for {command:?}");
                    return None;
                }
                Some(_) if frame.status != STATUS_SUCCESS => {
                    warn!("{command:?} failed: {}", Error::DeviceError(frame.status));
                    self.mark_fetched(command);
                }
                Some(_) => self.on_frame(command, &frame),
            },
            Err(err) => {
                warn!("{command:?} failed: {err}");
                self.mark_fetched(command);
            }
        }

        self.timeout.disarm();
        Some(self.fetch_next(self.spacing))
    }

    /// Decode the answer to `command` into the cycle's fields
    fn on_frame(&mut self, command: Command, frame: &VendorFrame) {
        let decoded = match command {
            Command::BasicInfo => decode_basic_info(&frame.payload),
            Command::CellVoltages => decode_cell_voltages(&frame.payload, frame.declared_len),
        };

        match decoded {
            Ok(fields) => {
                debug!("{command:?} decoded {} fields", fields.len());
                self.fields.extend(fields);
            }
            Err(err) => warn!("Decoding {command:?} failed: {err}"),
        }
        self.mark_fetched(command);
    }

    fn mark_fetched(&mut self, command: Command) {
        match command {
            Command::BasicInfo => self.fetched_basic = true,
            Command::CellVoltages => self.fetched_cells = true,
        }
    }

    fn fail(&mut self, err: Error) -> Step {
        error!("Cycle failed: {err}");
        self.reset();
        Step::Failed(err)
    }

    pub fn on_timeout(&mut self) -> Step {
        let period = self.timeout.period();
        if let Some(command) = self.in_flight {
            error!("Timed out waiting for {command:?}");
        }
        self.reset();
        Step::Failed(Error::Timeout(period))
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.timeout.deadline()
    }

    pub fn reset(&mut self) {
        self.fetched_basic = false;
        self.fetched_cells = false;
        self.in_flight = None;
        self.assembler.reset();
        self.fields.clear();
        self.timeout.disarm();
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none()
    }
}

#[cfg(test)]
use crate::message::vendor::encode_frame;

#[cfg(test)]
fn basic_info() -> Vec<u8> {
    let mut payload = vec![0u8; 27];
    payload[0..2].copy_from_slice(&1260u16.to_be_bytes());
    payload[2..4].copy_from_slice(&(-50i16).to_be_bytes());
    payload[4..6].copy_from_slice(&5000u16.to_be_bytes());
    payload[6..8].copy_from_slice(&10000u16.to_be_bytes());
    payload[23..25].copy_from_slice(&2981u16.to_be_bytes());
    encode_frame(OPERATION_BASIC_INFO, 0, &payload)
}

#[cfg(test)]
fn sent(step: &Step) -> &[u8] {
    match step {
        Step::Send { frame, .. } => frame,
        other => panic!("expected a command, got {other:?}"),
    }
}

#[test]
fn test_basic_only_cycle() {
    let mut seq = FramePollSequencer::new(false, Pacing::default());
    assert_eq!(sent(&seq.start_cycle()), REQUEST_BASIC_INFO);
    seq.on_sent();
    let Some(Step::Complete(fields)) = seq.on_delivery(&basic_info()) else {
        panic!("expected completion");
    };
    assert!((fields["power"].as_f64().unwrap() + 6.3).abs() < 1e-9);
    assert!(seq.is_idle());
    assert!(seq.deadline().is_none());
}

#[test]
fn test_cell_voltages_follow_basic_info() {
    let mut seq = FramePollSequencer::new(true, Pacing::default());
    seq.start_cycle();
    seq.on_sent();
    let next = seq.on_delivery(&basic_info()).unwrap();
    assert_eq!(sent(&next), REQUEST_CELL_VOLTAGES);

    let cells = encode_frame(OPERATION_CELL_VOLTAGES, 0, &[0x0c, 0xe4, 0x0c, 0xe5]);
    assert!(seq.on_delivery(&cells[..3]).is_none());
    let Some(Step::Complete(fields)) = seq.on_delivery(&cells[3..]) else {
        panic!("expected completion");
    };
    assert!(fields.contains_key("voltage"));
    assert!(fields.contains_key("voltage_cell2"));
}

#[test]
fn test_unknown_operation_fails_cycle() {
    let mut seq = FramePollSequencer::new(false, Pacing::default());
    seq.start_cycle();
    let step = seq.on_delivery(&encode_frame(0x05, 0, &[0x01])).unwrap();
    assert!(matches!(step, Step::Failed(Error::UnexpectedOperation(0x05))));
    assert!(seq.is_idle());
}

#[test]
fn test_answer_to_another_command_is_ignored() {
    let mut seq = FramePollSequencer::new(true, Pacing::default());
    seq.start_cycle();
    seq.on_sent();
    let next = seq.on_delivery(&basic_info()).unwrap();
    assert_eq!(sent(&next), REQUEST_CELL_VOLTAGES);
    seq.on_sent();

    // a late basic info frame must not trigger another request
    assert!(seq.on_delivery(&basic_info()).is_none());
    assert!(seq.deadline().is_some());

    let cells = encode_frame(OPERATION_CELL_VOLTAGES, 0, &[0x0c, 0xe4]);
    let Some(Step::Complete(fields)) = seq.on_delivery(&cells) else {
        panic!("expected completion");
    };
    assert!(fields.contains_key("voltage_cell1"));
}

#[test]
fn test_device_status_error_skips_command() {
    let mut seq = FramePollSequencer::new(true, Pacing::default());
    seq.start_cycle();
    let next = seq.on_delivery(&encode_frame(OPERATION_BASIC_INFO, 0x80, &[])).unwrap();
    assert_eq!(sent(&next), REQUEST_CELL_VOLTAGES);
}

#[test]
fn test_undecodable_frame_omits_fields() {
    let mut seq = FramePollSequencer::new(false, Pacing::default());
    seq.start_cycle();
    let short = encode_frame(OPERATION_BASIC_INFO, 0, &[0x04, 0xec]);
    let Some(Step::Complete(fields)) = seq.on_delivery(&short) else {
        panic!("expected completion");
    };
    assert!(fields.is_empty());
}

#[test]
fn test_timeout_resets_fetched_flags() {
    let mut seq = FramePollSequencer::new(true, Pacing::default());
    seq.start_cycle();
    seq.on_delivery(&basic_info());
    seq.on_sent();
    assert!(matches!(seq.on_timeout(), Step::Failed(Error::Timeout(_))));
    assert_eq!(sent(&seq.start_cycle()), REQUEST_BASIC_INFO);
}
