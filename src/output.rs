use std::io::{self, Write};
use std::time::Duration;

use serde::Serialize;

use crate::pipeline::{EventLevel, ProgressEvent, ProgressSink, RunReport, StatusReport};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Human,
    Json,
}

/// Forwards pipeline events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn event(&self, event: ProgressEvent) {
        let stage = event.stage.map(|stage| stage.as_str()).unwrap_or("-");
        let elapsed_ms = event.elapsed.map(millis);
        match event.level {
            EventLevel::Info => tracing::info!(
                dataset = %event.dataset,
                stage,
                elapsed_ms,
                "{}",
                event.message
            ),
            EventLevel::Warn => tracing::warn!(
                dataset = %event.dataset,
                stage,
                "{}",
                event.message
            ),
        }
    }
}

/// Whole milliseconds, saturating at `u64::MAX`.
fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_runs(results: &[RunReport]) -> io::Result<()> {
        Self::print_json(&results)
    }

    pub fn print_status(result: &StatusReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// Machine output keeps stdout clean; events are dropped.
impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}
