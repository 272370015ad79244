//! Where finished poll cycles go.

use tracing::{error, info};

use crate::error::Error;
use crate::reading::Reading;

/// Receives exactly one event per poll cycle: a reading or the error that ended it.
///
/// Errors returned from a sink are logged by the scheduler and never stop polling.
pub trait ResultSink {
    fn on_reading(&mut self, reading: &Reading) -> anyhow::Result<()>;

    fn on_error(&mut self, device: &str, error: &Error) -> anyhow::Result<()>;
}

/// Logs each reading as one JSON object, keeping only the configured fields.
#[derive(Debug, Default)]
pub struct LogSink {
    fields: Vec<String>,
}

impl LogSink {
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }
}

impl ResultSink for LogSink {
    fn on_reading(&mut self, reading: &Reading) -> anyhow::Result<()> {
        let mut filtered = reading.clone();
        filtered.retain_fields(&self.fields);
        info!(" => {}", serde_json::to_string(&filtered)?);
        Ok(())
    }

    fn on_error(&mut self, device: &str, error: &Error) -> anyhow::Result<()> {
        error!("{device}: {error}");
        Ok(())
    }
}

/// Collects everything it is given, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub readings: Vec<Reading>,
    pub errors: Vec<(String, String)>,
}

impl ResultSink for MemorySink {
    fn on_reading(&mut self, reading: &Reading) -> anyhow::Result<()> {
        self.readings.push(reading.clone());
        Ok(())
    }

    fn on_error(&mut self, device: &str, error: &Error) -> anyhow::Result<()> {
        self.errors.push((device.to_string(), error.to_string()));
        Ok(())
    }
}
