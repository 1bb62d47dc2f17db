//! LaTeX → PNG rendering: admission, scratch workspaces and the external tool chain.

mod admission;
mod pipeline;
mod stage;
mod types;
mod workspace;

use std::time::{Duration, Instant as StdInstant};

use bytes::Bytes;
use metrics::{counter, histogram};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::RenderSettings;

pub use admission::{AdmissionGate, AdmissionSlot};
pub use pipeline::{
    CROPPED_OUTPUT, Pipeline, RASTER_OUTPUT, RASTER_PREFIX, SOURCE_FILE, TYPESET_OUTPUT,
};
pub use stage::StageError;
pub use types::{EmptySource, IoOp, PipelineStage, RenderError, RenderRequest, StageKind};
pub use workspace::{Workspace, WorkspaceManager};

/// Process-wide render entry point shared by every request handler.
#[derive(Debug, Clone)]
pub struct RenderService {
    gate: AdmissionGate,
    workspaces: WorkspaceManager,
    pipeline: Pipeline,
    command_timeout: Duration,
}

impl RenderService {
    pub fn new(settings: &RenderSettings) -> Self {
        Self {
            gate: AdmissionGate::new(settings.worker_limit),
            workspaces: WorkspaceManager::new(settings.workspace_root.clone()),
            pipeline: Pipeline::new(settings),
            command_timeout: settings.command_timeout,
        }
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Claim a render slot without waiting. `None` means every slot is busy.
    pub fn try_admit(&self) -> Option<AdmissionSlot> {
        let slot = self.gate.try_acquire();
        if slot.is_none() {
            counter!("texshot_render_rejected_busy_total").increment(1);
        }
        slot
    }

    /// Accept `source` for rendering. The deadline is the configured command
    /// timeout, shortened to `inherited` when the caller has less time left.
    pub fn prepare(
        &self,
        source: Bytes,
        inherited: Option<Instant>,
    ) -> Result<RenderRequest, EmptySource> {
        let own = Instant::now() + self.command_timeout;
        let deadline = inherited.map_or(own, |inherited| inherited.min(own));
        RenderRequest::new(source, deadline)
    }

    /// Run the pipeline in a fresh workspace. Holding `_slot` proves admission;
    /// the workspace is gone by the time this returns.
    pub async fn render(
        &self,
        _slot: &AdmissionSlot,
        request: &RenderRequest,
    ) -> Result<Bytes, RenderError> {
        let started_at = StdInstant::now();
        let workspace = self.workspaces.create().map_err(RenderError::Workspace)?;
        let result = self.pipeline.execute(&workspace, request).await;
        workspace.destroy();

        let elapsed_ms = started_at.elapsed().as_millis() as u64;
        let outcome = match &result {
            Ok(png) => {
                info!(
                    target = "application::render",
                    elapsed_ms,
                    source_bytes = request.source().len(),
                    png_bytes = png.len(),
                    "render completed"
                );
                "ok"
            }
            Err(err) => {
                warn!(
                    target = "application::render",
                    elapsed_ms,
                    stage = err.stage().map(StageKind::as_str).unwrap_or("none"),
                    error = %err,
                    diagnostic = err.diagnostic(),
                    "render failed"
                );
                err.outcome()
            }
        };
        counter!("texshot_render_total", "outcome" => outcome).increment(1);
        histogram!("texshot_render_duration_ms").record(elapsed_ms as f64);

        result
    }
}
