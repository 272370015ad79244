//! Drives every session through connect, periodic reads and disconnect.

use std::time::Duration;

use anyhow::bail;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::Error;
use crate::reading::Reading;
use crate::session::DeviceSession;
use crate::sink::ResultSink;
use crate::transport::Transport;

/// Shortest pause between two polling rounds
pub const MIN_ROUND_SLEEP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    /// Keep polling forever instead of reading each device once
    pub enable_polling: bool,
    /// Target time from the start of one round to the start of the next
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub disconnect_timeout: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enable_polling: false,
            poll_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(35),
            read_timeout: Duration::from_secs(30),
            disconnect_timeout: Duration::from_secs(5),
        }
    }
}

/// How long to sleep after a round that took `elapsed`, so rounds start every `interval`.
pub fn next_sleep(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed).max(MIN_ROUND_SLEEP)
}

/// Owns all sessions and polls them one after the other.
pub struct PollScheduler<T, S> {
    sessions: Vec<DeviceSession<T>>,
    sink: S,
    settings: SchedulerSettings,
}

impl<T: Transport, S: ResultSink> PollScheduler<T, S> {
    pub fn new(sessions: Vec<DeviceSession<T>>, sink: S, settings: SchedulerSettings) -> Self {
        Self {
            sessions,
            sink,
            settings,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Connect, poll until done, failed or cancelled, then disconnect every session.
    pub async fn run(&mut self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let outcome = tokio::select! {
            outcome = self.poll() => outcome,
            _ = shutdown.cancelled() => {
                info!("Shutdown requested");
                Ok(())
            }
        };
        if let Err(err) = &outcome {
            error!("Polling stopped: {err:#}");
        }
        self.shutdown().await;
        outcome
    }

    async fn poll(&mut self) -> anyhow::Result<()> {
        self.connect_all().await?;

        if !self.settings.enable_polling {
            self.read_round().await;
            return Ok(());
        }

        loop {
            let started = Instant::now();
            self.read_round().await;
            let wait = next_sleep(self.settings.poll_interval, started.elapsed());
            info!("Waiting for {:.1} s", wait.as_secs_f64());
            sleep(wait).await;
        }
    }

    /// Connect every session. A connect that hangs past the timeout aborts startup.
    pub async fn connect_all(&mut self) -> anyhow::Result<()> {
        for session in &mut self.sessions {
            match timeout(self.settings.connect_timeout, session.connect()).await {
                Ok(Ok(())) => info!("{}: connected", session.alias()),
                Ok(Err(err)) => report_error(&mut self.sink, session.alias(), &err),
                Err(_) => bail!(
                    "Connecting to {} timed out after {:?}",
                    session.alias(),
                    self.settings.connect_timeout
                ),
            }
        }
        Ok(())
    }

    /// Read every session once, reconnecting sessions that lost their link first.
    pub async fn read_round(&mut self) {
        let settings = self.settings;
        for session in &mut self.sessions {
            if !session.is_connected() {
                info!("{}: reconnecting", session.alias());
                let reconnect = match timeout(settings.connect_timeout, session.connect()).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Connect(format!(
                        "connect timed out after {:?}",
                        settings.connect_timeout
                    ))),
                };
                if let Err(err) = reconnect {
                    report_error(&mut self.sink, session.alias(), &err);
                    continue;
                }
            }

            match timeout(settings.read_timeout, session.read()).await {
                Ok(Ok(reading)) => deliver(&mut self.sink, &reading),
                Ok(Err(err)) => report_error(&mut self.sink, session.alias(), &err),
                Err(_) => {
                    session.abort_cycle();
                    report_error(
                        &mut self.sink,
                        session.alias(),
                        &Error::Timeout(settings.read_timeout),
                    );
                }
            }
        }
    }

    /// Disconnect every session, including ones that never finished connecting.
    pub async fn shutdown(&mut self) {
        for session in &mut self.sessions {
            match timeout(self.settings.disconnect_timeout, session.disconnect()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("{}: error during disconnect: {err}", session.alias()),
                Err(_) => warn!(
                    "{}: disconnect timed out after {:?}",
                    session.alias(),
                    self.settings.disconnect_timeout
                ),
            }
        }
    }
}

fn deliver<S: ResultSink>(sink: &mut S, reading: &Reading) {
    if let Err(err) = sink.on_reading(reading) {
        error!("{}: result sink failed: {err:#}", reading.device);
    }
}

fn report_error<S: ResultSink>(sink: &mut S, device: &str, error: &Error) {
    if let Err(err) = sink.on_error(device, error) {
        error!("{device}: result sink failed: {err:#}");
    }
}

#[test]
fn test_sleep_subtracts_elapsed_time() {
    assert_eq!(
        next_sleep(Duration::from_secs(5), Duration::from_secs(2)),
        Duration::from_secs(3)
    );
}

#[test]
fn test_sleep_floors_at_one_second() {
    assert_eq!(
        next_sleep(Duration::from_secs(5), Duration::from_secs(7)),
        MIN_ROUND_SLEEP
    );
    assert_eq!(
        next_sleep(Duration::from_secs(5), Duration::from_millis(4500)),
        MIN_ROUND_SLEEP
    );
    assert_eq!(next_sleep(Duration::ZERO, Duration::ZERO), MIN_ROUND_SLEEP);
}
