//! Store process supervision
//!
//! The store runs as a detached child recorded in a pid file. Stopping
//! distinguishes "there was nothing to stop" from "stopping failed".

use devvault_core::process::{self, Termination};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("launch command is empty")]
    EmptyCommand,

    #[error("store process is already running (pid {0})")]
    AlreadyRunning(u32),

    #[error("failed to launch '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("pid file {path}: {reason}")]
    PidFile { path: PathBuf, reason: String },
}

/// What `stop` found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// A live process was stopped
    Stopped { pid: u32, forced: bool },
    /// Nothing was running; no action was needed
    NotRunning,
}

/// Control over the one store process
pub trait StoreProcess {
    fn is_running(&self) -> bool;
    /// Launch the store; returns its pid
    fn start(&mut self, launch_command: &str) -> Result<u32, ProcessError>;
    fn stop(&mut self) -> Result<StopOutcome, ProcessError>;
}

/// Runs the store via `sh -c "exec <command>"` and tracks it by pid file
pub struct Supervisor {
    pid_file: PathBuf,
    log_file: PathBuf,
    stop_grace: Duration,
}

impl Supervisor {
    pub fn new(pid_file: &Path, log_file: &Path, stop_grace: Duration) -> Self {
        Self {
            pid_file: pid_file.to_path_buf(),
            log_file: log_file.to_path_buf(),
            stop_grace,
        }
    }

    /// Pid recorded by the last start, if the file exists
    pub fn recorded_pid(&self) -> Result<Option<u32>, ProcessError> {
        let content = match fs::read_to_string(&self.pid_file) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ProcessError::PidFile {
                    path: self.pid_file.clone(),
                    reason: e.to_string(),
                })
            }
        };

        content
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|_| ProcessError::PidFile {
                path: self.pid_file.clone(),
                reason: format!("not a pid: '{}'", content.trim()),
            })
    }

    fn live_pid(&self) -> Option<u32> {
        self.recorded_pid()
            .ok()
            .flatten()
            .filter(|pid| process::is_alive(*pid))
    }

    fn clear_pid_file(&self) -> Result<(), ProcessError> {
        match fs::remove_file(&self.pid_file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ProcessError::PidFile {
                path: self.pid_file.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn open_log(&self) -> io::Result<File> {
        if let Some(parent) = self.log_file.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(&self.log_file)
    }
}

impl StoreProcess for Supervisor {
    fn is_running(&self) -> bool {
        self.live_pid().is_some()
    }

    fn start(&mut self, launch_command: &str) -> Result<u32, ProcessError> {
        if launch_command.trim().is_empty() {
            return Err(ProcessError::EmptyCommand);
        }
        if let Some(pid) = self.live_pid() {
            return Err(ProcessError::AlreadyRunning(pid));
        }

        let spawn_err = |source| ProcessError::Spawn {
            command: launch_command.to_string(),
            source,
        };

        let log = self.open_log().map_err(spawn_err)?;
        let log_err = log.try_clone().map_err(spawn_err)?;

        let child = Command::new("sh")
            .arg("-c")
            .arg(format!("exec {}", launch_command))
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            // Own process group: survives the CLI exiting, not signalled with it
            .process_group(0)
            .spawn()
            .map_err(spawn_err)?;

        let pid = child.id();
        fs::write(&self.pid_file, pid.to_string()).map_err(|e| ProcessError::PidFile {
            path: self.pid_file.clone(),
            reason: e.to_string(),
        })?;

        info!("store process started (pid {})", pid);
        Ok(pid)
    }

    fn stop(&mut self) -> Result<StopOutcome, ProcessError> {
        let Some(pid) = self.recorded_pid()? else {
            debug!("no pid file; store not running");
            return Ok(StopOutcome::NotRunning);
        };

        let outcome = match process::terminate(pid, self.stop_grace) {
            Termination::NotRunning => StopOutcome::NotRunning,
            Termination::Graceful => StopOutcome::Stopped { pid, forced: false },
            Termination::Killed => StopOutcome::Stopped { pid, forced: true },
        };
        self.clear_pid_file()?;

        info!("store stop: {:?}", outcome);
        Ok(outcome)
    }
}
