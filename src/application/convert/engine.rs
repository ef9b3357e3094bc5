use std::{
    ffi::OsString,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};

use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::EngineSettings;

use super::{ConvertError, Workspace};

pub const INPUT_FORMAT: &str = "markdown+yaml_metadata_block+raw_html+emoji";

/// Captured streams of a successful engine run.
#[derive(Debug, Clone, Default)]
pub struct EngineOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub elapsed: Duration,
}

/// Fully resolved engine command line for one conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineInvocation {
    program: PathBuf,
    args: Vec<OsString>,
    working_dir: PathBuf,
}

impl EngineInvocation {
    /// Build the argument vector. The order is fixed; `--template` is only
    /// appended for a non-empty template and is passed through verbatim.
    pub fn build(settings: &EngineSettings, workspace: &Workspace, template: Option<&str>) -> Self {
        let mut args: Vec<OsString> = vec![
            workspace.input_path().as_os_str().to_owned(),
            prefixed("--output=", workspace.output_path()),
            prefixed("--data-dir=", &settings.data_dir),
            OsString::from(format!("--from={INPUT_FORMAT}")),
            OsString::from("--sandbox"),
        ];
        if let Some(template) = template.filter(|t| !t.is_empty()) {
            args.push(OsString::from(format!("--template={template}")));
        }

        Self {
            program: settings.path.clone(),
            args,
            working_dir: workspace.root().to_path_buf(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Run the engine, bounded by `deadline`. The child is killed when the
    /// deadline expires or when the returned future is dropped.
    pub async fn run(&self, deadline: Duration) -> Result<EngineOutput, ConvertError> {
        let started_at = Instant::now();
        debug!(
            target = "folio::convert::engine",
            program = %self.program.display(),
            args = ?self.args,
            "Invoking conversion engine"
        );

        let child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                let error_code = if err.kind() == ErrorKind::NotFound {
                    "engine_not_found"
                } else {
                    "spawn_engine"
                };
                warn!(
                    target = "folio::convert::engine",
                    op = "engine::run",
                    result = "error",
                    error_code,
                    program = %self.program.display(),
                    error = %err,
                    "Failed to spawn conversion engine"
                );
                ConvertError::execution(format!("failed to spawn engine: {err}"), Vec::new())
            })?;

        // Dropping the wait future on timeout drops the child, and
        // `kill_on_drop` terminates it.
        let output = match tokio::time::timeout(deadline, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                warn!(
                    target = "folio::convert::engine",
                    op = "engine::run",
                    result = "error",
                    error_code = "wait_engine",
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    error = %err,
                    "Failed to collect conversion engine output"
                );
                return Err(ConvertError::execution(
                    format!("failed to wait for engine: {err}"),
                    Vec::new(),
                ));
            }
            Err(_) => {
                warn!(
                    target = "folio::convert::engine",
                    op = "engine::run",
                    result = "timeout",
                    error_code = "deadline_exceeded",
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    deadline_ms = deadline.as_millis() as u64,
                    "Conversion engine exceeded its deadline"
                );
                return Err(ConvertError::execution(
                    format!("engine timed out after {}ms", deadline.as_millis()),
                    Vec::new(),
                ));
            }
        };

        let elapsed = started_at.elapsed();
        if !output.status.success() {
            let exit_code = output.status.code().map(i64::from).unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                target = "folio::convert::engine",
                op = "engine::run",
                result = "error",
                error_code = "engine_exit",
                elapsed_ms = elapsed.as_millis() as u64,
                exit_code,
                stderr = %stderr,
                "Conversion engine failed"
            );
            return Err(ConvertError::execution(
                format!("engine exited with {}", output.status),
                output.stderr,
            ));
        }

        debug!(
            target = "folio::convert::engine",
            op = "engine::run",
            result = "ok",
            elapsed_ms = elapsed.as_millis() as u64,
            stdout = %String::from_utf8_lossy(&output.stdout),
            stderr = %String::from_utf8_lossy(&output.stderr),
            "Conversion engine finished"
        );

        Ok(EngineOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            elapsed,
        })
    }
}

fn prefixed(flag: &str, path: &Path) -> OsString {
    let mut arg = OsString::from(flag);
    arg.push(path.as_os_str());
    arg
}
