#![allow(dead_code)]

use std::{
    fs,
    num::{NonZeroU64, NonZeroUsize},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, Response, StatusCode, header},
};
use bytes::Bytes;
use tempfile::TempDir;
use texshot::{
    application::render::RenderService,
    config::RenderSettings,
    infra::http::{HttpState, build_router},
};
use tower::ServiceExt;

/// Shell-script stand-ins for the TeX toolchain. Every invocation appends
/// `<tool> <args>` to `calls.log`; the passthrough variants copy their input
/// so the final PNG equals the submitted source.
pub struct Toolchain {
    dir: TempDir,
    pub workspace_root: TempDir,
}

impl Toolchain {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("tool dir"),
            workspace_root: TempDir::new().expect("workspace root"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn log(&self) -> PathBuf {
        self.dir.path().join("calls.log")
    }

    pub fn calls(&self) -> Vec<String> {
        fs::read_to_string(self.log())
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn install(&self, name: &str, body: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        let script = format!(
            "#!/bin/sh\necho \"{name} $*\" >> \"{log}\"\n{body}",
            log = self.log().display()
        );
        fs::write(&path, script).expect("write tool script");
        let mut perms = fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("set perms");
        path
    }

    pub fn settings(&self, pdflatex_body: &str) -> RenderSettings {
        RenderSettings {
            worker_limit: NonZeroUsize::new(4).expect("non-zero"),
            max_body_bytes: NonZeroU64::new(1024).expect("non-zero"),
            command_timeout: Duration::from_secs(10),
            allow_shell_escape: false,
            dpi: 150,
            pdflatex_path: self.install("pdflatex", pdflatex_body),
            pdfcrop_path: self.install("pdfcrop", "cp \"$1\" \"$2\"\n"),
            pdftoppm_path: self.install("pdftoppm", "cp \"$4\" \"$5-1.png\"\n"),
            workspace_root: Some(self.workspace_root.path().to_path_buf()),
        }
    }

    pub fn leftover_workspaces(&self) -> usize {
        fs::read_dir(self.workspace_root.path())
            .expect("read workspace root")
            .count()
    }
}

pub const PASSTHROUGH_PDFLATEX: &str = "cp document.tex document.pdf\n";

pub fn app(settings: &RenderSettings) -> Router {
    app_with(settings, None, Duration::from_secs(30))
}

pub fn app_with(
    settings: &RenderSettings,
    api_key: Option<&str>,
    write_timeout: Duration,
) -> Router {
    build_router(HttpState {
        renderer: Arc::new(RenderService::new(settings)),
        api_key: api_key.map(Arc::from),
        max_body_bytes: settings.max_body_bytes.get() as usize,
        read_timeout: Duration::from_secs(5),
        write_timeout,
    })
}

pub fn render_request(body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/render-latex")
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(body.into())
        .expect("request should build")
}

pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Response<Body>) {
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("router should respond");
    (response.status(), response)
}

pub async fn body_bytes(response: Response<Body>) -> Bytes {
    to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should collect")
}
