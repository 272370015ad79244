#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use battpoll::message::register::{encode_response, ReadRequest};
use battpoll::message::vendor::{encode_frame, OPERATION_BASIC_INFO};
use battpoll::{Error, Result, Transport};
use tokio::sync::mpsc;
use tokio::time::Instant;

pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    Succeed,
    Fail,
    /// Fail this many times, then succeed
    FailTimes(usize),
    Hang,
}

/// What the mock saw, shared with the test after the transport is moved into a session
#[derive(Debug, Default)]
pub struct MockLog {
    pub connects: usize,
    pub disconnects: usize,
    pub writes: Vec<(Instant, Vec<u8>)>,
}

pub struct MockTransport {
    connect: ConnectBehavior,
    responder: Responder,
    response_delay: Duration,
    tx: Option<mpsc::Sender<Vec<u8>>>,
    log: Arc<Mutex<MockLog>>,
}

impl MockTransport {
    pub fn new(responder: Responder) -> (Self, Arc<Mutex<MockLog>>) {
        let log = Arc::new(Mutex::new(MockLog::default()));
        let transport = Self {
            connect: ConnectBehavior::Succeed,
            responder,
            response_delay: Duration::ZERO,
            tx: None,
            log: log.clone(),
        };
        (transport, log)
    }

    pub fn with_connect(mut self, connect: ConnectBehavior) -> Self {
        self.connect = connect;
        self
    }

    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self) -> Result<()> {
        self.log.lock().unwrap().connects += 1;
        match self.connect {
            ConnectBehavior::Succeed => Ok(()),
            ConnectBehavior::Fail => Err(Error::Connect("no device found".into())),
            ConnectBehavior::FailTimes(0) => Ok(()),
            ConnectBehavior::FailTimes(n) => {
                self.connect = ConnectBehavior::FailTimes(n - 1);
                Err(Error::Connect("no device found".into()))
            }
            ConnectBehavior::Hang => std::future::pending().await,
        }
    }

    async fn subscribe(&mut self) -> Result<mpsc::Receiver<Vec<u8>>> {
        let (tx, rx) = mpsc::channel(64);
        self.tx = Some(tx);
        Ok(rx)
    }

    async fn write(&mut self, frame: &[u8]) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .writes
            .push((Instant::now(), frame.to_vec()));
        let Some(tx) = self.tx.clone() else {
            return Err(Error::Transport("not subscribed".into()));
        };
        let deliveries = (self.responder)(frame);
        let delay = self.response_delay;
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            for delivery in deliveries {
                if tx.send(delivery).await.is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.log.lock().unwrap().disconnects += 1;
        self.tx = None;
        Ok(())
    }
}

/// Answers every register read with `words` incrementing words, except the listed registers
pub fn register_responder(device_id: u8, silent: &'static [u16]) -> Responder {
    Box::new(move |frame: &[u8]| -> Vec<Vec<u8>> {
        let Some(request) = ReadRequest::parse(frame) else {
            return vec![];
        };
        if silent.contains(&request.register) {
            return vec![];
        }
        let payload: Vec<u8> = (0..request.words)
            .flat_map(|w| (request.register.wrapping_add(w)).to_be_bytes())
            .collect();
        vec![encode_response(device_id, &payload)]
    })
}

/// Basic info payload with the given raw voltage and current
pub fn basic_info_frame(voltage: u16, current: i16) -> Vec<u8> {
    let mut payload = vec![0u8; 27];
    payload[0..2].copy_from_slice(&voltage.to_be_bytes());
    payload[2..4].copy_from_slice(&current.to_be_bytes());
    payload[4..6].copy_from_slice(&5000u16.to_be_bytes());
    payload[6..8].copy_from_slice(&10000u16.to_be_bytes());
    payload[23..25].copy_from_slice(&2981u16.to_be_bytes());
    encode_frame(OPERATION_BASIC_INFO, 0, &payload)
}
