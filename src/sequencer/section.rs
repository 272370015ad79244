use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::{Pacing, Step};
use crate::device::Section;
use crate::error::Error;
use crate::message::register::{decode_response, ReadRequest, RegisterResponse, FUNCTION_READ};
use crate::reading::Fields;
use crate::timeout::TimeoutSupervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectionState {
    Idle,
    Requesting(usize),
}

/// Reads a device's register sections in order, one request at a time.
///
/// A failed section (device error, malformed frame, decoder failure) only
/// leaves its fields out; the cycle carries on with the next section. A
/// missing response aborts the whole cycle.
#[derive(Debug)]
pub struct SectionPollSequencer {
    device_id: u8,
    sections: Vec<Section>,
    state: SectionState,
    fields: Fields,
    timeout: TimeoutSupervisor,
    spacing: Duration,
}

impl SectionPollSequencer {
    pub fn new(device_id: u8, sections: Vec<Section>, pacing: Pacing) -> Self {
        Self {
            device_id,
            sections,
            state: SectionState::Idle,
            fields: Fields::new(),
            timeout: TimeoutSupervisor::new(pacing.request_timeout),
            spacing: pacing.spacing,
        }
    }

    pub fn start_cycle(&mut self) -> Step {
        self.reset();
        if self.sections.is_empty() {
            error!("No sections configured for device id {}", self.device_id);
            return Step::Failed(Error::EmptyCycle);
        }
        self.issue(0, Duration::ZERO)
    }

    fn issue(&mut self, index: usize, delay: Duration) -> Step {
        let section = &self.sections[index];
        let request = match ReadRequest::new(self.device_id, FUNCTION_READ, section.register, section.words) {
            Ok(request) => request,
            Err(err) => {
                error!("Cannot build request for register {}: {err}", section.register);
                self.reset();
                return Step::Failed(err);
            }
        };
        let frame = request.encode();
        debug!("Request register {} x{}: {}", section.register, section.words, hex::encode(frame));
        self.state = SectionState::Requesting(index);
        Step::Send {
            delay,
            frame: frame.to_vec(),
        }
    }

    pub fn on_sent(&mut self) {
        if let SectionState::Requesting(_) = self.state {
            self.timeout.disarm();
            self.timeout.arm();
        }
    }

    pub fn on_response(&mut self, frame: &[u8]) -> Option<Step> {
        let SectionState::Requesting(index) = self.state else {
            warn!("Dropping response with no request in flight: {}", hex::encode(frame));
            return None;
        };
        self.timeout.disarm();

        let section = &self.sections[index];
        match decode_response(frame, section.words) {
            RegisterResponse::Data(payload) => match (section.decode)(section, payload) {
                Ok(fields) => {
                    debug!("Register {} decoded {} fields", section.register, fields.len());
                    self.fields.extend(fields);
                }
                Err(err) => warn!("Decoding register {} failed: {err}", section.register),
            },
            RegisterResponse::DeviceError(code) => {
                warn!("Register {} read failed: {}", section.register, Error::DeviceError(code))
            }
            RegisterResponse::Malformed(reason) => warn!(
                "Register {} read failed: {reason}: {}",
                section.register,
                hex::encode(frame)
            ),
        }

        if index + 1 >= self.sections.len() {
            let fields = std::mem::take(&mut self.fields);
            self.reset();
            Some(Step::Complete(fields))
        } else {
            Some(self.issue(index + 1, self.spacing))
        }
    }

    pub fn on_timeout(&mut self) -> Step {
        let register = match self.state {
            SectionState::Requesting(index) => self.sections[index].register,
            SectionState::Idle => {
                self.timeout.disarm();
                return Step::Failed(Error::Timeout(self.timeout.period()));
            }
        };
        error!("Timed out waiting for register {register}, check the device id ({})", self.device_id);
        let period = self.timeout.period();
        self.reset();
        Step::Failed(Error::Timeout(period))
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.timeout.deadline()
    }

    pub fn reset(&mut self) {
        self.state = SectionState::Idle;
        self.fields.clear();
        self.timeout.disarm();
    }

    pub fn is_idle(&self) -> bool {
        self.state == SectionState::Idle
    }
}

#[cfg(test)]
use crate::message::register::encode_response;

#[cfg(test)]
fn sequencer() -> SectionPollSequencer {
    SectionPollSequencer::new(
        255,
        vec![Section::raw(5000, 2, "block"), Section::raw(5042, 1, "current")],
        Pacing::default(),
    )
}

#[cfg(test)]
fn sent_request(step: &Step) -> ReadRequest {
    match step {
        Step::Send { frame, .. } => ReadRequest::parse(frame).unwrap(),
        other => panic!("expected a request, got {other:?}"),
    }
}

#[test]
fn test_walks_sections_in_order() {
    let mut seq = sequencer();
    let first = seq.start_cycle();
    assert_eq!(sent_request(&first).register, 5000);
    assert!(matches!(first, Step::Send { delay, .. } if delay.is_zero()));

    let second = seq.on_response(&encode_response(255, &[0, 1, 0, 2])).unwrap();
    assert_eq!(sent_request(&second).register, 5042);
    assert!(matches!(second, Step::Send { delay, .. } if delay == Duration::from_millis(500)));

    let done = seq.on_response(&encode_response(255, &[0, 3])).unwrap();
    let Step::Complete(fields) = done else {
        panic!("expected completion");
    };
    assert_eq!(fields.len(), 3);
    assert_eq!(fields["current"].as_f64(), Some(3.0));
    assert!(seq.is_idle());
}

#[test]
fn test_failed_section_does_not_abort_cycle() {
    let mut seq = sequencer();
    seq.start_cycle();
    let next = seq.on_response(&[0xff, 0x83, 0x02, 0x00, 0x00]).unwrap();
    assert_eq!(sent_request(&next).register, 5042);

    let Step::Complete(fields) = seq.on_response(&encode_response(255, &[0, 3])).unwrap() else {
        panic!("expected completion");
    };
    assert_eq!(fields.len(), 1);
}

#[test]
fn test_malformed_and_undecodable_sections_are_skipped() {
    let mut seq = SectionPollSequencer::new(
        1,
        vec![Section::raw(0, 1, "a"), Section::raw(1, 1, "b")],
        Pacing::default(),
    );
    seq.start_cycle();
    // wrong length for one word
    seq.on_response(&encode_response(1, &[0, 1, 0, 2])).unwrap();
    let Step::Complete(fields) = seq.on_response(&[0x01, 0x03]).unwrap() else {
        panic!("expected completion");
    };
    assert!(fields.is_empty());
}

#[test]
fn test_timeout_fails_cycle_and_resets() {
    let mut seq = sequencer();
    seq.start_cycle();
    seq.on_sent();
    assert!(seq.deadline().is_some());
    let step = seq.on_timeout();
    assert!(matches!(step, Step::Failed(Error::Timeout(_))));
    assert!(seq.is_idle());
    assert!(seq.deadline().is_none());
    assert!(seq.on_response(&encode_response(255, &[0, 1, 0, 2])).is_none());
}

#[test]
fn test_response_disarms_timeout() {
    let mut seq = sequencer();
    seq.start_cycle();
    seq.on_sent();
    seq.on_response(&encode_response(255, &[0, 1, 0, 2]));
    assert!(seq.deadline().is_none());
}

#[test]
fn test_empty_section_list_fails() {
    let mut seq = SectionPollSequencer::new(1, vec![], Pacing::default());
    assert!(matches!(seq.start_cycle(), Step::Failed(Error::EmptyCycle)));
}

#[test]
fn test_new_cycle_starts_from_first_section() {
    let mut seq = sequencer();
    seq.start_cycle();
    seq.on_response(&encode_response(255, &[0, 1, 0, 2]));
    let restart = seq.start_cycle();
    assert_eq!(sent_request(&restart).register, 5000);
}
