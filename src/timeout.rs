//! Per-request response deadline.

use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

/// Tracks the deadline of the one request a sequencer has in flight.
///
/// Arming records a deadline; the session waits on [`expired`] alongside the
/// notification stream and reports expiry back to the sequencer. Disarming
/// cancels it.
#[derive(Debug)]
pub struct TimeoutSupervisor {
    period: Duration,
    deadline: Option<Instant>,
}

impl TimeoutSupervisor {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            deadline: None,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Start the deadline for a request that was just sent
    pub fn arm(&mut self) {
        if self.deadline.is_some() {
            warn!("Re-arming a response timeout that was never disarmed");
        }
        self.deadline = Some(Instant::now() + self.period);
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// Completes when `deadline` passes. Never completes for `None`.
pub async fn expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[tokio::test(start_paused = true)]
async fn test_armed_deadline_expires() {
    let mut supervisor = TimeoutSupervisor::new(Duration::from_secs(15));
    supervisor.arm();
    let start = Instant::now();
    expired(supervisor.deadline()).await;
    assert_eq!(start.elapsed(), Duration::from_secs(15));
}

#[tokio::test(start_paused = true)]
async fn test_disarmed_deadline_never_expires() {
    let mut supervisor = TimeoutSupervisor::new(Duration::from_secs(15));
    supervisor.arm();
    supervisor.disarm();
    assert!(supervisor.deadline().is_none());
    let waited = tokio::time::timeout(Duration::from_secs(60), expired(supervisor.deadline())).await;
    assert!(waited.is_err());
}
