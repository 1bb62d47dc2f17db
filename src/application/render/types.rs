use std::{ffi::OsString, fmt, io, path::PathBuf, time::Duration};

use bytes::Bytes;
use thiserror::Error;
use tokio::time::Instant;

use super::stage::StageError;

/// The three external steps of a render, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Typeset,
    Crop,
    Rasterize,
}

impl StageKind {
    pub const ALL: [StageKind; 3] = [StageKind::Typeset, StageKind::Crop, StageKind::Rasterize];

    /// One-based position in the pipeline.
    pub fn index(self) -> usize {
        match self {
            StageKind::Typeset => 1,
            StageKind::Crop => 2,
            StageKind::Rasterize => 3,
        }
    }

    pub fn next(self) -> Option<StageKind> {
        match self {
            StageKind::Typeset => Some(StageKind::Crop),
            StageKind::Crop => Some(StageKind::Rasterize),
            StageKind::Rasterize => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Typeset => "typeset",
            StageKind::Crop => "crop",
            StageKind::Rasterize => "rasterize",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fixed external command plus the workspace files it consumes and produces.
#[derive(Debug, Clone)]
pub struct PipelineStage {
    pub kind: StageKind,
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub input: &'static str,
    pub output: &'static str,
}

#[derive(Debug, Error)]
#[error("LaTeX source is empty")]
pub struct EmptySource;

/// Accepted source bytes together with the instant every stage must finish by.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    source: Bytes,
    deadline: Instant,
}

impl RenderRequest {
    pub fn new(source: Bytes, deadline: Instant) -> Result<Self, EmptySource> {
        if source.is_empty() {
            return Err(EmptySource);
        }
        Ok(Self { source, deadline })
    }

    pub fn source(&self) -> &[u8] {
        &self.source
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    WriteInput,
    ReadOutput,
}

impl fmt::Display for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoOp::WriteInput => f.write_str("write input"),
            IoOp::ReadOutput => f.write_str("read output"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to create workspace: {0}")]
    Workspace(#[source] io::Error),
    #[error("failed to {op} `{name}`: {source}")]
    Io {
        op: IoOp,
        name: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("stage {index} ({stage}) failed: {source}", index = .stage.index())]
    Stage {
        stage: StageKind,
        #[source]
        source: StageError,
    },
}

impl RenderError {
    /// The stage at which the pipeline stopped, if a stage was the cause.
    pub fn stage(&self) -> Option<StageKind> {
        match self {
            RenderError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Captured tool output; empty for non-stage failures and timeouts.
    pub fn diagnostic(&self) -> &str {
        match self {
            RenderError::Stage { source, .. } => source.output(),
            _ => "",
        }
    }

    pub fn outcome(&self) -> &'static str {
        match self {
            RenderError::Workspace(_) => "workspace_error",
            RenderError::Io { .. } => "io_error",
            RenderError::Stage {
                source: StageError::TimedOut,
                ..
            } => "timeout",
            RenderError::Stage { .. } => "stage_error",
        }
    }
}
