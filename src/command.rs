// src/command.rs

//! External utility execution
//!
//! Platform utilities (boot control, mount, sync, property lookup,
//! telemetry) are short-lived commands. Each run has:
//!
//! - stdin nullified so a utility can never wait on the terminal
//! - a timeout, after which the child is killed
//! - stderr captured and logged on failure

use std::ffi::OsStr;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// Default timeout for platform utilities
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn { program: String, source: io::Error },

    #[error("{program} exited with status {code}: {stderr}")]
    Failed {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("{program} timed out after {secs} seconds")]
    TimedOut { program: String, secs: u64 },

    #[error("I/O error talking to {program}: {source}")]
    Io { program: String, source: io::Error },
}

/// A configured external utility
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    prefix_args: Vec<String>,
    timeout: Duration,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Arguments placed before every invocation's own arguments
    pub fn with_prefix_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefix_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn prefix_args(&self) -> &[String] {
        &self.prefix_args
    }

    /// Run and require a zero exit status
    pub fn run<S: AsRef<OsStr>>(&self, args: &[S]) -> Result<(), CommandError> {
        self.output(args).map(|_| ())
    }

    /// Run, require a zero exit status, and return stdout
    pub fn output<S: AsRef<OsStr>>(&self, args: &[S]) -> Result<String, CommandError> {
        let name = self.program.display().to_string();
        debug!("Running {} {:?}", name, self.prefix_args);

        let mut child = Command::new(&self.program)
            .args(&self.prefix_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| CommandError::Spawn {
                program: name.clone(),
                source,
            })?;

        // Drain pipes on helper threads so a chatty tool can't block on a full pipe
        let stdout = child.stdout.take().map(spawn_drain);
        let stderr = child.stderr.take().map(spawn_drain);

        let status = match child.wait_timeout(self.timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CommandError::TimedOut {
                    program: name,
                    secs: self.timeout.as_secs(),
                });
            }
            Err(source) => {
                let _ = child.kill();
                return Err(CommandError::Io {
                    program: name,
                    source,
                });
            }
        };

        let stdout = stdout.and_then(|h| h.join().ok()).unwrap_or_default();
        let stderr = stderr.and_then(|h| h.join().ok()).unwrap_or_default();

        if status.success() {
            Ok(stdout)
        } else {
            let code = status.code().unwrap_or(-1);
            warn!("{} failed with exit code {}", name, code);
            Err(CommandError::Failed {
                program: name,
                code,
                stderr: stderr.trim().to_string(),
            })
        }
    }
}

fn spawn_drain<R: Read + Send + 'static>(mut pipe: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}
