// src/backend/command.rs

//! Executable package backend
//!
//! Runs the package's first payload with the argument template for the
//! requested action, formatted against the variable store. Exit codes are
//! mapped through the facade's rules. The process is killed if it outlives
//! the configured timeout.

use super::{DetectRequest, DetectedState, ExecuteOutcome, ExecuteRequest, PackageBackend, RestartState};
use crate::bundle::{Action, ExeFields, ExitBehavior, Facade, PackageState};
use crate::error::{Error, Result};
use crate::progress::ProgressSink;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// Code reported when a package process times out
const TIMEOUT_CODE: i32 = 0x8007_05B4_u32 as i32;

/// Backend for `exe` packages
#[derive(Debug, Clone)]
pub struct CommandBackend {
    timeout: Duration,
    /// Interpreter the payload is handed to, e.g. `/bin/sh`
    launcher: Option<PathBuf>,
}

impl CommandBackend {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            launcher: None,
        }
    }

    /// Run payloads through an interpreter instead of executing them directly
    pub fn with_launcher(mut self, launcher: impl Into<PathBuf>) -> Self {
        self.launcher = Some(launcher.into());
        self
    }

    fn exe_fields<'a>(&self, request: &ExecuteRequest<'a>) -> Result<&'a ExeFields> {
        match request.facade {
            Facade::Exe(fields) => Ok(fields),
            other => Err(Error::UnknownPackageType {
                package: request.package.id.clone(),
                package_type: other.package_type().to_string(),
            }),
        }
    }

    /// Run `action` and interpret the exit code
    fn run(&self, request: &ExecuteRequest<'_>, action: Action) -> Result<ExecuteOutcome> {
        let package = &request.package.id;
        let fields = self.exe_fields(request)?;

        let template = fields.arguments_for(action).ok_or_else(|| Error::ExecuteFailure {
            package: package.clone(),
            code: -1,
            reason: format!("no command line for {}", action),
        })?;

        let payload = request.package.payloads.first().ok_or_else(|| Error::ExecuteFailure {
            package: package.clone(),
            code: -1,
            reason: "package has no executable payload".to_string(),
        })?;
        let program = request.cache_dir.join(&payload.file_name);

        let arguments = split_arguments(&request.variables.format(template)?);
        info!(
            "Running {} for {}: {} {}",
            action,
            package,
            program.display(),
            request.variables.format_obscured(template)?
        );

        let mut command = match &self.launcher {
            Some(launcher) => {
                let mut c = Command::new(launcher);
                c.arg(&program);
                c
            }
            None => Command::new(&program),
        };

        let mut child = command
            .args(&arguments)
            .current_dir(request.cache_dir)
            .env("CORRAL_PACKAGE_ID", package)
            .env("CORRAL_ACTION", action.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::ExecuteFailure {
                package: package.clone(),
                code: -1,
                reason: format!("failed to spawn {}: {}", program.display(), e),
            })?;

        // Drained while waiting so a chatty process never blocks on a full pipe
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match child.wait_timeout(self.timeout)? {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                // Grandchildren may still hold the pipes; the readers are left to finish alone
                drop((stdout, stderr));
                return Err(Error::ExecuteFailure {
                    package: package.clone(),
                    code: TIMEOUT_CODE,
                    reason: format!("timed out after {} seconds", self.timeout.as_secs()),
                });
            }
        };

        for line in String::from_utf8_lossy(&collect(stdout)).lines() {
            debug!("[{}] {}", package, line);
        }
        for line in String::from_utf8_lossy(&collect(stderr)).lines() {
            warn!("[{}] {}", package, line);
        }

        let code = status.code().unwrap_or(-1);
        match fields.exit_behavior(code) {
            ExitBehavior::Success => Ok(ExecuteOutcome::Success {
                restart: RestartState::None,
            }),
            ExitBehavior::RestartRequired => Ok(ExecuteOutcome::Success {
                restart: RestartState::Required,
            }),
            ExitBehavior::FilesInUse => Ok(ExecuteOutcome::FilesInUse {
                files: vec![program.display().to_string()],
            }),
            ExitBehavior::Error => Err(Error::ExecuteFailure {
                package: package.clone(),
                code,
                reason: format!("exited with code {}", code),
            }),
        }
    }
}

impl PackageBackend for CommandBackend {
    /// Executables have no installed-state query of their own; without a
    /// detect condition they are reported absent.
    fn detect(&self, request: &DetectRequest<'_>) -> Result<DetectedState> {
        debug!(
            "{} has no detect condition, reporting absent",
            request.package.id
        );
        Ok(DetectedState::new(PackageState::Absent))
    }

    fn execute(
        &self,
        request: &ExecuteRequest<'_>,
        progress: &dyn ProgressSink,
    ) -> Result<ExecuteOutcome> {
        progress.report(0);
        let outcome = self.run(request, request.action)?;
        progress.report(100);
        Ok(outcome)
    }

    fn rollback(&self, request: &ExecuteRequest<'_>, progress: &dyn ProgressSink) -> Result<()> {
        let inverse = match request.action {
            Action::Install => Action::Uninstall,
            Action::Uninstall => Action::Install,
            // Repairing again cannot undo a repair
            Action::Repair | Action::Modify | Action::None => return Ok(()),
        };

        progress.report(0);
        match self.run(request, inverse)? {
            ExecuteOutcome::Success { .. } => {
                progress.report(100);
                Ok(())
            }
            ExecuteOutcome::FilesInUse { files } => Err(Error::FilesInUse {
                package: request.package.id.clone(),
                files,
            }),
        }
    }
}

/// Read a child pipe to the end on its own thread
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut pipe) = pipe
            && let Err(e) = pipe.read_to_end(&mut buffer)
        {
            debug!("Failed to read package output: {}", e);
        }
        buffer
    })
}

fn collect(handle: JoinHandle<Vec<u8>>) -> Vec<u8> {
    handle.join().unwrap_or_default()
}

/// Split a command line on whitespace, honouring double quotes
fn split_arguments(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        args.push(current);
    }
    args
}
