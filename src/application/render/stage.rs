use std::{io, process::Stdio, time::Instant as StdInstant};

use metrics::histogram;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    time::Instant,
};
use tracing::{debug, warn};

use super::{types::PipelineStage, workspace::Workspace};

/// Upper bound on retained diagnostic output; older bytes are discarded first.
const OUTPUT_LIMIT: usize = 64 * 1024;
const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("exited with {}", describe_exit(.exit_code))]
    Exit {
        exit_code: Option<i32>,
        output: String,
    },
    #[error("deadline elapsed before the command finished")]
    TimedOut,
    #[error("failed to collect command output: {0}")]
    Io(#[source] io::Error),
}

fn describe_exit(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}

impl StageError {
    pub fn output(&self) -> &str {
        match self {
            StageError::Exit { output, .. } => output,
            _ => "",
        }
    }
}

/// Run one stage inside `workspace`, returning its combined stdout and stderr.
///
/// The child is killed if `deadline` passes first, and also if the returned
/// future is dropped before completion.
pub async fn run(
    stage: &PipelineStage,
    workspace: &Workspace,
    deadline: Instant,
) -> Result<String, StageError> {
    let started_at = StdInstant::now();
    let result = execute(stage, workspace, deadline).await;
    let elapsed_ms = started_at.elapsed().as_millis() as u64;

    histogram!("texshot_stage_duration_ms", "stage" => stage.kind.as_str())
        .record(elapsed_ms as f64);

    match &result {
        Ok(output) => debug!(
            target = "application::render::stage",
            stage = stage.kind.as_str(),
            program = %stage.program.display(),
            elapsed_ms,
            output_bytes = output.len(),
            "stage completed"
        ),
        Err(err) => warn!(
            target = "application::render::stage",
            stage = stage.kind.as_str(),
            program = %stage.program.display(),
            elapsed_ms,
            error = %err,
            output = err.output(),
            "stage failed"
        ),
    }

    result
}

async fn execute(
    stage: &PipelineStage,
    workspace: &Workspace,
    deadline: Instant,
) -> Result<String, StageError> {
    if Instant::now() >= deadline {
        return Err(StageError::TimedOut);
    }

    let mut child = Command::new(&stage.program)
        .args(&stage.args)
        .current_dir(workspace.path())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| StageError::Spawn {
            program: stage.program.display().to_string(),
            source,
        })?;

    match tokio::time::timeout_at(deadline, wait_with_output(&mut child)).await {
        Ok(Ok((exit_code, output))) if exit_code == Some(0) => Ok(output),
        Ok(Ok((exit_code, output))) => Err(StageError::Exit { exit_code, output }),
        Ok(Err(err)) => Err(StageError::Io(err)),
        Err(_elapsed) => {
            terminate(&mut child).await;
            Err(StageError::TimedOut)
        }
    }
}

async fn wait_with_output(child: &mut Child) -> io::Result<(Option<i32>, String)> {
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut combined = OutputTail::default();
    let mut out_chunk = [0u8; READ_CHUNK];
    let mut err_chunk = [0u8; READ_CHUNK];

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            read = read_chunk(&mut stdout, &mut out_chunk), if stdout.is_some() => match read? {
                0 => stdout = None,
                n => combined.push(&out_chunk[..n]),
            },
            read = read_chunk(&mut stderr, &mut err_chunk), if stderr.is_some() => match read? {
                0 => stderr = None,
                n => combined.push(&err_chunk[..n]),
            },
        }
    }

    let status = child.wait().await?;
    Ok((status.code(), combined.into_string()))
}

async fn read_chunk<R>(reader: &mut Option<R>, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match reader {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn terminate(child: &mut Child) {
    if let Err(err) = child.start_kill() {
        debug!(
            target = "application::render::stage",
            error = %err,
            "child already exited before kill"
        );
        return;
    }
    if let Err(err) = child.wait().await {
        warn!(
            target = "application::render::stage",
            error = %err,
            "failed to reap killed child"
        );
    }
}

#[derive(Default)]
struct OutputTail {
    bytes: Vec<u8>,
}

impl OutputTail {
    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
        if self.bytes.len() > OUTPUT_LIMIT {
            let excess = self.bytes.len() - OUTPUT_LIMIT;
            self.bytes.drain(..excess);
        }
    }

    fn into_string(self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::application::render::{types::StageKind, workspace::WorkspaceManager};
    use std::{
        ffi::OsString,
        fs,
        os::unix::fs::PermissionsExt,
        path::{Path, PathBuf},
        time::Duration,
    };
    use tempfile::TempDir;

    fn make_executable(path: &Path) {
        let mut perms = fs::metadata(path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).expect("set perms");
    }

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write script");
        make_executable(&path);
        path
    }

    fn stage(program: PathBuf, args: &[&str]) -> PipelineStage {
        PipelineStage {
            kind: StageKind::Typeset,
            program,
            args: args.iter().map(OsString::from).collect(),
            input: "document.tex",
            output: "document.pdf",
        }
    }

    fn soon(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr_and_runs_in_workspace() {
        let tools = TempDir::new().expect("tools dir");
        let program = script(
            tools.path(),
            "fake-tool",
            "echo \"out $1\"\necho \"err line\" >&2\npwd -P > cwd.txt\n",
        );
        let workspace = WorkspaceManager::default().create().expect("workspace");

        let output = run(&stage(program, &["alpha"]), &workspace, soon(5))
            .await
            .expect("stage succeeds");

        assert!(output.contains("out alpha"), "stdout missing: {output}");
        assert!(output.contains("err line"), "stderr missing: {output}");
        let cwd = fs::read_to_string(workspace.path().join("cwd.txt")).expect("cwd written");
        let expected = fs::canonicalize(workspace.path()).expect("canonical path");
        assert_eq!(Path::new(cwd.trim()), expected.as_path());
    }

    #[tokio::test]
    async fn non_zero_exit_carries_output() {
        let tools = TempDir::new().expect("tools dir");
        let program = script(
            tools.path(),
            "fake-tool",
            "echo \"! Undefined control sequence.\"\nexit 1\n",
        );
        let workspace = WorkspaceManager::default().create().expect("workspace");

        let err = run(&stage(program, &[]), &workspace, soon(5))
            .await
            .expect_err("stage fails");
        match err {
            StageError::Exit { exit_code, output } => {
                assert_eq!(exit_code, Some(1));
                assert!(output.contains("Undefined control sequence"), "{output}");
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let tools = TempDir::new().expect("tools dir");
        let workspace = WorkspaceManager::default().create().expect("workspace");

        let err = run(
            &stage(tools.path().join("does-not-exist"), &[]),
            &workspace,
            soon(5),
        )
        .await
        .expect_err("spawn fails");
        assert!(matches!(err, StageError::Spawn { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn deadline_kills_the_child_and_reports_no_output() {
        let tools = TempDir::new().expect("tools dir");
        let program = script(tools.path(), "slow-tool", "echo started\nsleep 30\n");
        let workspace = WorkspaceManager::default().create().expect("workspace");

        let started = StdInstant::now();
        let deadline = Instant::now() + Duration::from_millis(200);
        let err = run(&stage(program, &[]), &workspace, deadline)
            .await
            .expect_err("deadline elapses");

        assert!(matches!(err, StageError::TimedOut), "{err:?}");
        assert_eq!(err.output(), "");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn expired_deadline_skips_spawning() {
        let tools = TempDir::new().expect("tools dir");
        let marker = tools.path().join("ran");
        let program = script(
            tools.path(),
            "fake-tool",
            &format!("touch \"{}\"\n", marker.display()),
        );
        let workspace = WorkspaceManager::default().create().expect("workspace");

        let err = run(&stage(program, &[]), &workspace, Instant::now())
            .await
            .expect_err("already expired");
        assert!(matches!(err, StageError::TimedOut));
        assert!(!marker.exists());
    }

    #[test]
    fn output_tail_keeps_the_most_recent_bytes() {
        let mut tail = OutputTail::default();
        tail.push(&vec![b'a'; OUTPUT_LIMIT]);
        tail.push(b"end");
        let text = tail.into_string();
        assert_eq!(text.len(), OUTPUT_LIMIT);
        assert!(text.ends_with("end"));
    }
}
