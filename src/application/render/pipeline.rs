use std::{ffi::OsString, sync::Arc};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::config::RenderSettings;

use super::{
    stage,
    types::{IoOp, PipelineStage, RenderError, RenderRequest, StageKind},
    workspace::Workspace,
};

pub const SOURCE_FILE: &str = "document.tex";
pub const TYPESET_OUTPUT: &str = "document.pdf";
pub const CROPPED_OUTPUT: &str = "document-cropped.pdf";
pub const RASTER_PREFIX: &str = "output";
/// pdftoppm numbers pages from one; only the first page is returned.
pub const RASTER_OUTPUT: &str = "output-1.png";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    Writing,
    Running(StageKind),
    Done,
}

/// The typeset → crop → rasterize chain, built once at startup.
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Arc<[PipelineStage; 3]>,
}

impl Pipeline {
    pub fn new(settings: &RenderSettings) -> Self {
        let escape_flag = if settings.allow_shell_escape {
            "-shell-escape"
        } else {
            "-no-shell-escape"
        };

        let typeset = PipelineStage {
            kind: StageKind::Typeset,
            program: settings.pdflatex_path.clone(),
            args: os_args([
                "-halt-on-error",
                "-interaction=nonstopmode",
                escape_flag,
                SOURCE_FILE,
            ]),
            input: SOURCE_FILE,
            output: TYPESET_OUTPUT,
        };
        let crop = PipelineStage {
            kind: StageKind::Crop,
            program: settings.pdfcrop_path.clone(),
            args: os_args([TYPESET_OUTPUT, CROPPED_OUTPUT]),
            input: TYPESET_OUTPUT,
            output: CROPPED_OUTPUT,
        };
        let dpi = settings.dpi.to_string();
        let rasterize = PipelineStage {
            kind: StageKind::Rasterize,
            program: settings.pdftoppm_path.clone(),
            args: os_args(["-png", "-r", dpi.as_str(), CROPPED_OUTPUT, RASTER_PREFIX]),
            input: CROPPED_OUTPUT,
            output: RASTER_OUTPUT,
        };

        Self {
            stages: Arc::new([typeset, crop, rasterize]),
        }
    }

    pub fn stage(&self, kind: StageKind) -> &PipelineStage {
        &self.stages[kind.index() - 1]
    }

    pub fn stages(&self) -> &[PipelineStage] {
        self.stages.as_slice()
    }

    /// Write the source into `workspace`, run every stage in order and return
    /// the rasterized first page. The first failing step ends the run.
    pub async fn execute(
        &self,
        workspace: &Workspace,
        request: &RenderRequest,
    ) -> Result<Bytes, RenderError> {
        let mut state = PipelineState::Writing;
        loop {
            trace!(
                target = "application::render::pipeline",
                state = ?state,
                remaining_ms = request.remaining().as_millis() as u64,
                "pipeline step"
            );
            state = match state {
                PipelineState::Writing => {
                    let input = self.stage(StageKind::Typeset).input;
                    workspace
                        .write_input(input, request.source())
                        .await
                        .map_err(|source| RenderError::Io {
                            op: IoOp::WriteInput,
                            name: input,
                            source,
                        })?;
                    PipelineState::Running(StageKind::Typeset)
                }
                PipelineState::Running(kind) => {
                    let output = stage::run(self.stage(kind), workspace, request.deadline())
                        .await
                        .map_err(|source| RenderError::Stage { stage: kind, source })?;
                    debug!(
                        target = "application::render::pipeline",
                        stage = kind.as_str(),
                        output = %output,
                        "stage output"
                    );
                    match kind.next() {
                        Some(next) => PipelineState::Running(next),
                        None => PipelineState::Done,
                    }
                }
                PipelineState::Done => {
                    let output = self.stage(StageKind::Rasterize).output;
                    let bytes = workspace.read_output(output).await.map_err(|source| {
                        RenderError::Io {
                            op: IoOp::ReadOutput,
                            name: output,
                            source,
                        }
                    })?;
                    return Ok(Bytes::from(bytes));
                }
            };
        }
    }
}

fn os_args<const N: usize>(args: [&str; N]) -> Vec<OsString> {
    args.into_iter().map(OsString::from).collect()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::application::render::{stage::StageError, workspace::WorkspaceManager};
    use std::{
        fs,
        num::{NonZeroU64, NonZeroUsize},
        os::unix::fs::PermissionsExt,
        path::{Path, PathBuf},
        time::Duration,
    };
    use tempfile::TempDir;
    use tokio::time::Instant;

    struct FakeTools {
        dir: TempDir,
    }

    impl FakeTools {
        fn new() -> Self {
            Self {
                dir: TempDir::new().expect("tools dir"),
            }
        }

        fn log(&self) -> PathBuf {
            self.dir.path().join("calls.log")
        }

        fn calls(&self) -> Vec<String> {
            fs::read_to_string(self.log())
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }

        fn install(&self, name: &str, body: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            let script = format!(
                "#!/bin/sh\necho \"{name} $*\" >> \"{log}\"\n{body}",
                log = self.log().display()
            );
            fs::write(&path, script).expect("write script");
            let mut perms = fs::metadata(&path).expect("metadata").permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&path, perms).expect("set perms");
            path
        }

        /// Tools that copy their input through so the final PNG equals the source.
        fn passthrough(&self) -> RenderSettings {
            let pdflatex = self.install("pdflatex", "cp document.tex document.pdf\n");
            let pdfcrop = self.install("pdfcrop", "cp \"$1\" \"$2\"\n");
            let pdftoppm = self.install("pdftoppm", "cp \"$4\" \"$5-1.png\"\n");
            settings(pdflatex, pdfcrop, pdftoppm)
        }
    }

    fn settings(pdflatex: PathBuf, pdfcrop: PathBuf, pdftoppm: PathBuf) -> RenderSettings {
        RenderSettings {
            worker_limit: NonZeroUsize::MIN,
            max_body_bytes: NonZeroU64::MIN,
            command_timeout: Duration::from_secs(5),
            allow_shell_escape: false,
            dpi: 150,
            pdflatex_path: pdflatex,
            pdfcrop_path: pdfcrop,
            pdftoppm_path: pdftoppm,
            workspace_root: None,
        }
    }

    fn request(source: &'static [u8], timeout: Duration) -> RenderRequest {
        RenderRequest::new(Bytes::from_static(source), Instant::now() + timeout)
            .expect("non-empty source")
    }

    fn args(stage: &PipelineStage) -> Vec<&str> {
        stage
            .args
            .iter()
            .map(|arg| arg.to_str().expect("utf-8 arg"))
            .collect()
    }

    #[test]
    fn builds_legacy_command_lines() {
        let mut settings = settings(
            PathBuf::from("pdflatex"),
            PathBuf::from("pdfcrop"),
            PathBuf::from("pdftoppm"),
        );
        let pipeline = Pipeline::new(&settings);
        assert_eq!(
            args(pipeline.stage(StageKind::Typeset)),
            [
                "-halt-on-error",
                "-interaction=nonstopmode",
                "-no-shell-escape",
                "document.tex"
            ]
        );
        assert_eq!(
            args(pipeline.stage(StageKind::Crop)),
            ["document.pdf", "document-cropped.pdf"]
        );
        assert_eq!(
            args(pipeline.stage(StageKind::Rasterize)),
            ["-png", "-r", "150", "document-cropped.pdf", "output"]
        );

        settings.allow_shell_escape = true;
        settings.dpi = 300;
        let pipeline = Pipeline::new(&settings);
        assert!(args(pipeline.stage(StageKind::Typeset)).contains(&"-shell-escape"));
        assert!(args(pipeline.stage(StageKind::Rasterize)).contains(&"300"));
        assert_eq!(
            pipeline.stages().iter().map(|s| s.kind).collect::<Vec<_>>(),
            StageKind::ALL
        );
    }

    #[tokio::test]
    async fn runs_all_stages_and_returns_first_page() {
        let tools = FakeTools::new();
        let pipeline = Pipeline::new(&tools.passthrough());
        let workspace = WorkspaceManager::default().create().expect("workspace");

        let png = pipeline
            .execute(&workspace, &request(b"\\documentclass{article}", Duration::from_secs(5)))
            .await
            .expect("pipeline succeeds");

        assert_eq!(png.as_ref(), b"\\documentclass{article}");
        let calls = tools.calls();
        assert_eq!(calls.len(), 3, "{calls:?}");
        assert!(calls[0].starts_with("pdflatex "));
        assert!(calls[1].starts_with("pdfcrop "));
        assert!(calls[2].starts_with("pdftoppm "));
    }

    #[tokio::test]
    async fn typeset_failure_stops_before_crop() {
        let tools = FakeTools::new();
        let mut settings = tools.passthrough();
        settings.pdflatex_path =
            tools.install("pdflatex-broken", "echo '! Missing $ inserted.'\nexit 1\n");
        let pipeline = Pipeline::new(&settings);
        let workspace = WorkspaceManager::default().create().expect("workspace");

        let err = pipeline
            .execute(&workspace, &request(b"$x", Duration::from_secs(5)))
            .await
            .expect_err("typeset fails");

        assert_eq!(err.stage(), Some(StageKind::Typeset));
        assert!(err.diagnostic().contains("Missing $ inserted"));
        let calls = tools.calls();
        assert_eq!(calls.len(), 1, "later stages must not run: {calls:?}");
    }

    #[tokio::test]
    async fn crop_failure_is_reported_as_stage_two() {
        let tools = FakeTools::new();
        let mut settings = tools.passthrough();
        settings.pdfcrop_path = tools.install("pdfcrop-broken", "exit 3\n");
        let pipeline = Pipeline::new(&settings);
        let workspace = WorkspaceManager::default().create().expect("workspace");

        let err = pipeline
            .execute(&workspace, &request(b"x", Duration::from_secs(5)))
            .await
            .expect_err("crop fails");

        assert_eq!(err.stage().map(StageKind::index), Some(2));
        assert!(!tools.calls().iter().any(|call| call.starts_with("pdftoppm")));
    }

    #[tokio::test]
    async fn deadline_is_shared_across_stages() {
        let tools = FakeTools::new();
        let mut settings = tools.passthrough();
        settings.pdflatex_path = tools.install(
            "pdflatex-slow",
            "sleep 0.3\ncp document.tex document.pdf\n",
        );
        settings.pdfcrop_path = tools.install("pdfcrop-slow", "sleep 30\n");
        let pipeline = Pipeline::new(&settings);
        let workspace = WorkspaceManager::default().create().expect("workspace");

        let err = pipeline
            .execute(&workspace, &request(b"x", Duration::from_millis(800)))
            .await
            .expect_err("deadline elapses during crop");

        assert_eq!(err.stage(), Some(StageKind::Crop));
        assert!(matches!(
            err,
            RenderError::Stage {
                source: StageError::TimedOut,
                ..
            }
        ));
        assert_eq!(err.diagnostic(), "");
    }

    #[tokio::test]
    async fn missing_raster_output_is_a_read_error() {
        let tools = FakeTools::new();
        let mut settings = tools.passthrough();
        settings.pdftoppm_path = tools.install("pdftoppm-silent", "exit 0\n");
        let pipeline = Pipeline::new(&settings);
        let workspace = WorkspaceManager::default().create().expect("workspace");

        let err = pipeline
            .execute(&workspace, &request(b"x", Duration::from_secs(5)))
            .await
            .expect_err("no png produced");

        assert!(matches!(
            err,
            RenderError::Io {
                op: IoOp::ReadOutput,
                name: RASTER_OUTPUT,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn missing_tool_fails_the_stage() {
        let tools = FakeTools::new();
        let mut settings = tools.passthrough();
        settings.pdftoppm_path = Path::new("/nonexistent/pdftoppm").to_path_buf();
        let pipeline = Pipeline::new(&settings);
        let workspace = WorkspaceManager::default().create().expect("workspace");

        let err = pipeline
            .execute(&workspace, &request(b"x", Duration::from_secs(5)))
            .await
            .expect_err("spawn fails");

        assert_eq!(err.stage(), Some(StageKind::Rasterize));
        assert!(matches!(
            err,
            RenderError::Stage {
                source: StageError::Spawn { .. },
                ..
            }
        ));
    }
}
