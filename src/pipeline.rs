//! Staged pipeline engine.
//!
//! Every (dataset, stage) pair is either not started or completed, recorded
//! by a marker file. A stage runs only when its own marker is absent and its
//! predecessor's is present; the marker is written after the body succeeds.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::archive::ArchiveCodec;
use crate::config::ResolvedConfig;
use crate::domain::{DatasetId, Stage};
use crate::error::IngestError;
use crate::layout::Layout;
use crate::marker::Markers;
use crate::remote::{DEFAULT_BASE_URL, RemoteFetch};
use crate::section::ParserLimits;
use crate::stages::{self, StageContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub dataset: DatasetId,
    pub stage: Option<Stage>,
    pub level: EventLevel,
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageAction {
    Executed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub action: StageAction,
    pub elapsed_ms: u128,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub dataset: DatasetId,
    pub stages: Vec<StageReport>,
}

impl RunReport {
    pub fn executed(&self) -> Vec<Stage> {
        self.stages
            .iter()
            .filter(|report| report.action == StageAction::Executed)
            .map(|report| report.stage)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageStatus {
    pub stage: Stage,
    pub complete: bool,
    pub marker: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub dataset: DatasetId,
    pub stages: Vec<StageStatus>,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub remote_base_url: String,
    pub lock_timeout: Duration,
    pub limits: ParserLimits,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            remote_base_url: DEFAULT_BASE_URL.to_string(),
            lock_timeout: Duration::ZERO,
            limits: ParserLimits::default(),
        }
    }
}

impl From<&ResolvedConfig> for PipelineOptions {
    fn from(config: &ResolvedConfig) -> Self {
        Self {
            remote_base_url: config.remote_base_url.clone(),
            lock_timeout: config.lock_timeout,
            limits: config.limits,
        }
    }
}

pub struct Pipeline<F: RemoteFetch, A: ArchiveCodec> {
    layout: Layout,
    markers: Markers,
    fetcher: F,
    codec: A,
    options: PipelineOptions,
    sink: Arc<dyn ProgressSink>,
}

impl<F: RemoteFetch, A: ArchiveCodec> Pipeline<F, A> {
    pub fn new(
        layout: Layout,
        fetcher: F,
        codec: A,
        options: PipelineOptions,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            markers: Markers::new(layout.clone()),
            layout,
            fetcher,
            codec,
            options,
            sink,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Runs `stages` in order, stopping at the first failure.
    pub fn execute(&self, id: &DatasetId, stages: &[Stage]) -> Result<RunReport, IngestError> {
        let mut reports = Vec::with_capacity(stages.len());
        for &stage in stages {
            reports.push(self.run_stage(id, stage)?);
        }
        Ok(RunReport {
            dataset: id.clone(),
            stages: reports,
        })
    }

    pub fn execute_all(&self, id: &DatasetId) -> Result<RunReport, IngestError> {
        self.execute(id, &Stage::ALL)
    }

    pub fn execute_until(&self, id: &DatasetId, last: Stage) -> Result<RunReport, IngestError> {
        self.execute(id, &last.through())
    }

    /// Runs one stage under its lock: skip if complete, refuse if the
    /// predecessor is not, otherwise run the body and record completion.
    pub fn run_stage(&self, id: &DatasetId, stage: Stage) -> Result<StageReport, IngestError> {
        let started = Instant::now();
        let _lock = self.markers.lock(id, stage, self.options.lock_timeout)?;

        if self.markers.exists(id, stage) {
            self.emit(id, stage, EventLevel::Info, "already complete, skipping".to_string(), None);
            return Ok(StageReport {
                stage,
                action: StageAction::Skipped,
                elapsed_ms: started.elapsed().as_millis(),
                warnings: Vec::new(),
            });
        }

        if let Some(predecessor) = stage.predecessor() {
            if !self.markers.exists(id, predecessor) {
                return Err(IngestError::Dependency {
                    dataset: id.clone(),
                    stage,
                    predecessor,
                });
            }
        }

        self.emit(id, stage, EventLevel::Info, "starting".to_string(), None);
        let ctx = StageContext::new(
            id,
            stage,
            &self.layout,
            &self.fetcher,
            &self.codec,
            &self.options,
            self.sink.as_ref(),
        );
        let outcome = stages::run(&ctx).and_then(|()| self.markers.complete(id, stage));
        if let Err(source) = outcome {
            self.emit(id, stage, EventLevel::Warn, format!("failed: {source}"), None);
            return Err(IngestError::Stage {
                dataset: id.clone(),
                stage,
                source: Box::new(source),
            });
        }

        let elapsed = started.elapsed();
        self.emit(id, stage, EventLevel::Info, "complete".to_string(), Some(elapsed));
        Ok(StageReport {
            stage,
            action: StageAction::Executed,
            elapsed_ms: elapsed.as_millis(),
            warnings: ctx.into_warnings(),
        })
    }

    pub fn status(&self, id: &DatasetId) -> StatusReport {
        let stages = Stage::ALL
            .into_iter()
            .map(|stage| StageStatus {
                stage,
                complete: self.markers.exists(id, stage),
                marker: self.layout.marker(id, stage).to_string(),
                completed_at: self.markers.read(id, stage).map(|record| record.completed_at),
            })
            .collect();
        StatusReport {
            dataset: id.clone(),
            stages,
        }
    }

    /// Forgets `from` and every later stage so the next run repeats them.
    /// Artifacts are left for the stage bodies to overwrite; resetting
    /// download deletes the archive, since it is its own marker.
    pub fn reset(&self, id: &DatasetId, from: Stage) -> Result<Vec<Stage>, IngestError> {
        let mut cleared = Vec::new();
        for stage in from.onwards().into_iter().rev() {
            let _lock = self.markers.lock(id, stage, self.options.lock_timeout)?;
            if self.markers.clear(id, stage)? {
                self.emit(id, stage, EventLevel::Info, "marker cleared".to_string(), None);
                cleared.push(stage);
            }
        }
        cleared.reverse();
        Ok(cleared)
    }

    fn emit(
        &self,
        id: &DatasetId,
        stage: Stage,
        level: EventLevel,
        message: String,
        elapsed: Option<Duration>,
    ) {
        self.sink.event(ProgressEvent {
            dataset: id.clone(),
            stage: Some(stage),
            level,
            message,
            elapsed,
        });
    }
}
