mod common;

use std::time::Duration;

use battpoll::message::register::ReadRequest;
use battpoll::message::vendor::{
    encode_frame, OPERATION_CELL_VOLTAGES, REQUEST_BASIC_INFO, REQUEST_CELL_VOLTAGES,
};
use battpoll::{
    DecodeError, DeviceDescriptor, DeviceSession, Error, Fields, Pacing, Section, Value,
};
use common::{basic_info_frame, register_responder, ConnectBehavior, MockTransport};

fn decode_summary(_section: &Section, payload: &[u8]) -> Result<Fields, DecodeError> {
    let mut fields = Fields::new();
    fields.insert("summary_words".into(), Value::Number((payload.len() / 2) as f64));
    fields.insert(
        "summary_first".into(),
        Value::Number(u16::from_be_bytes([payload[0], payload[1]]) as f64),
    );
    Ok(fields)
}

fn decode_status(_section: &Section, payload: &[u8]) -> Result<Fields, DecodeError> {
    let mut fields = Fields::new();
    fields.insert(
        "status".into(),
        Value::Number(u16::from_be_bytes([payload[0], payload[1]]) as f64),
    );
    Ok(fields)
}

fn two_section_device() -> DeviceDescriptor {
    DeviceDescriptor::register_map(
        "80:6F:B0:0F:00:01",
        "BT-TH-TEST",
        255,
        vec![
            Section::new(5000, 8, "summary", decode_summary),
            Section::new(5042, 1, "status", decode_status),
        ],
    )
}

fn requested_registers(log: &common::MockLog) -> Vec<u16> {
    log.writes
        .iter()
        .map(|(_, frame)| ReadRequest::parse(frame).unwrap().register)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn register_device_reads_all_sections_into_one_reading() {
    let (transport, log) = MockTransport::new(register_responder(255, &[]));
    let mut session = DeviceSession::new(two_section_device(), transport, Pacing::default());
    session.connect().await.unwrap();

    let reading = session.read().await.unwrap();

    assert_eq!(reading.device, "BT-TH-TEST");
    assert_eq!(reading.client, "register_map");
    assert_eq!(reading.get("summary_words"), Some(8.0));
    assert_eq!(reading.get("summary_first"), Some(5000.0));
    assert_eq!(reading.get("status"), Some(5042.0));
    assert_eq!(requested_registers(&log.lock().unwrap()), vec![5000, 5042]);

    // the sequencer is back at the first section for the next cycle
    let again = session.read().await.unwrap();
    assert_eq!(again, reading);
    assert_eq!(
        requested_registers(&log.lock().unwrap()),
        vec![5000, 5042, 5000, 5042]
    );
}

#[tokio::test(start_paused = true)]
async fn requests_are_paced() {
    let (transport, log) = MockTransport::new(register_responder(255, &[]));
    let mut session = DeviceSession::new(two_section_device(), transport, Pacing::default());
    session.connect().await.unwrap();
    session.read().await.unwrap();

    let log = log.lock().unwrap();
    let gap = log.writes[1].0 - log.writes[0].0;
    assert_eq!(gap, Duration::from_millis(500));
}

#[tokio::test(start_paused = true)]
async fn duplicated_responses_never_answer_the_next_section() {
    let mut answer = register_responder(255, &[]);
    let responder: common::Responder = Box::new(move |frame: &[u8]| -> Vec<Vec<u8>> {
        answer(frame)
            .into_iter()
            .flat_map(|response| [response.clone(), response])
            .collect()
    });
    let device = DeviceDescriptor::register_map(
        "80:6F:B0:0F:00:01",
        "BT-TH-TEST",
        255,
        vec![Section::raw(5000, 1, "a"), Section::raw(5001, 1, "b")],
    );
    let (transport, log) = MockTransport::new(responder);
    let mut session = DeviceSession::new(device, transport, Pacing::default());
    session.connect().await.unwrap();

    for _ in 0..2 {
        let reading = session.read().await.unwrap();
        assert_eq!(reading.get("a"), Some(5000.0));
        assert_eq!(reading.get("b"), Some(5001.0));
    }
    assert_eq!(
        requested_registers(&log.lock().unwrap()),
        vec![5000, 5001, 5000, 5001]
    );
}

#[tokio::test(start_paused = true)]
async fn timeout_on_a_section_fails_cycle_without_further_requests() {
    let device = DeviceDescriptor::register_map(
        "80:6F:B0:0F:00:01",
        "BT-TH-TEST",
        255,
        vec![
            Section::raw(5000, 8, "a"),
            Section::raw(5017, 2, "b"),
            Section::raw(5042, 1, "c"),
        ],
    );
    let (transport, log) = MockTransport::new(register_responder(255, &[5017]));
    let mut session = DeviceSession::new(device, transport, Pacing::default());
    session.connect().await.unwrap();

    let err = session.read().await.unwrap_err();

    assert!(matches!(err, Error::Timeout(d) if d == Duration::from_secs(15)));
    assert_eq!(requested_registers(&log.lock().unwrap()), vec![5000, 5017]);

    // the next cycle starts over from the first section
    let _ = session.read().await;
    assert_eq!(
        requested_registers(&log.lock().unwrap())[2],
        5000
    );
}

#[tokio::test(start_paused = true)]
async fn device_error_section_is_skipped() {
    let responder: common::Responder = Box::new(|frame: &[u8]| -> Vec<Vec<u8>> {
        let request = ReadRequest::parse(frame).unwrap();
        if request.register == 5000 {
            vec![vec![0xff, 0x83, 0x02, 0x00, 0x00]]
        } else {
            vec![battpoll::message::register::encode_response(255, &[0x00, 0x07])]
        }
    });
    let (transport, _log) = MockTransport::new(responder);
    let mut session = DeviceSession::new(two_section_device(), transport, Pacing::default());
    session.connect().await.unwrap();

    let reading = session.read().await.unwrap();
    assert_eq!(reading.get("summary_words"), None);
    assert_eq!(reading.get("status"), Some(7.0));
}

#[tokio::test(start_paused = true)]
async fn fragmented_vendor_frames_produce_one_reading() {
    let responder: common::Responder = Box::new(|frame: &[u8]| -> Vec<Vec<u8>> {
        if frame == REQUEST_BASIC_INFO {
            let frame = basic_info_frame(1260, -50);
            vec![frame[..10].to_vec(), frame[10..20].to_vec(), frame[20..].to_vec()]
        } else if frame == REQUEST_CELL_VOLTAGES {
            vec![encode_frame(OPERATION_CELL_VOLTAGES, 0, &[0x0c, 0xe4, 0x0c, 0xe5])]
        } else {
            vec![]
        }
    });
    let device = DeviceDescriptor::eco_worthy_battery("A4:C1:38:00:00:01", "ECO-1", true);
    let (transport, log) = MockTransport::new(responder);
    let mut session = DeviceSession::new(device, transport, Pacing::default());
    session.connect().await.unwrap();

    let reading = session.read().await.unwrap();

    assert_eq!(reading.client, "eco_worthy_battery");
    assert!((reading.get("voltage").unwrap() - 12.60).abs() < 1e-9);
    assert!((reading.get("current").unwrap() + 0.50).abs() < 1e-9);
    assert!((reading.get("power").unwrap() + 6.30).abs() < 1e-9);
    assert!((reading.get("voltage_cell2").unwrap() - 3.301).abs() < 1e-9);
    assert_eq!(log.lock().unwrap().writes.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn silent_vendor_device_times_out() {
    let device = DeviceDescriptor::eco_worthy_battery("A4:C1:38:00:00:01", "ECO-1", false);
    let (transport, log) = MockTransport::new(Box::new(|_: &[u8]| Vec::new()));
    let mut session = DeviceSession::new(device, transport, Pacing::default());
    session.connect().await.unwrap();

    assert!(matches!(session.read().await, Err(Error::Timeout(_))));
    assert_eq!(log.lock().unwrap().writes.len(), 1);
}

#[tokio::test]
async fn read_before_connect_is_refused() {
    let (transport, log) = MockTransport::new(register_responder(255, &[]));
    let mut session = DeviceSession::new(two_section_device(), transport, Pacing::default());

    assert!(matches!(session.read().await, Err(Error::NotConnected(_))));
    assert!(log.lock().unwrap().writes.is_empty());
}

#[tokio::test]
async fn connect_failure_blocks_reads() {
    let (transport, log) = MockTransport::new(register_responder(255, &[]));
    let transport = transport.with_connect(ConnectBehavior::Fail);
    let mut session = DeviceSession::new(two_section_device(), transport, Pacing::default());

    assert!(matches!(session.connect().await, Err(Error::Connect(_))));
    assert!(!session.is_connected());
    assert!(matches!(session.read().await, Err(Error::NotConnected(_))));
    assert!(log.lock().unwrap().writes.is_empty());
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let (transport, log) = MockTransport::new(register_responder(255, &[]));
    let mut session = DeviceSession::new(two_section_device(), transport, Pacing::default());
    session.disconnect().await.unwrap();
    session.connect().await.unwrap();
    session.disconnect().await.unwrap();
    session.disconnect().await.unwrap();
    assert!(!session.is_connected());
    assert_eq!(log.lock().unwrap().disconnects, 3);
}
