//! Control of the external cluster manager and process supervisor.
//!
//! Provisioning node homes and keeping the node processes alive are jobs for
//! external programs. This module shells out to them behind the
//! [`ClusterBackend`] seam and owns the one piece of supervisor state the
//! harness does touch: the `command = ...` lines of `tasks.ini`.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

/// Name of the supervisor configuration file inside the cluster working
/// directory.
pub const SUPERVISOR_CONFIG: &str = "tasks.ini";

/// Replacement command for the first node when coverage is collected. The
/// `%(here)s` token is expanded by the supervisor itself to the directory
/// holding the ini file.
const COVERAGE_COMMAND: &str =
    "command = chain-maind-inst -test.coverprofile=%(here)s/coverage.txt";

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("cluster init exited with {0}")]
    InitFailed(ExitStatus),

    #[error("failed to read {0}: {1}")]
    ReadConfig(PathBuf, #[source] std::io::Error),

    #[error("failed to write {0}: {1}")]
    WriteConfig(PathBuf, #[source] std::io::Error),

    #[error("no chain-maind command found in {0}")]
    MissingCommand(PathBuf),

    #[error("failed to signal supervisor: {0}")]
    Signal(nix::Error),

    #[error("failed to wait for supervisor: {0}")]
    Wait(std::io::Error),
}

fn node_command_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^command = (.*/)?chain-maind").expect("node command regex must compile")
    })
}

/// Point the first node of `tasks.ini` at the coverage-instrumented binary.
///
/// Only the matched span of the first `command = [<path>/]chain-maind` line
/// is replaced; the node's original arguments stay appended after the
/// inserted coverage flag, and later command lines are left alone.
pub fn enable_coverage(data: &Path) -> Result<(), SupervisorError> {
    let path = data.join(SUPERVISOR_CONFIG);

    let content = std::fs::read_to_string(&path)
        .map_err(|err| SupervisorError::ReadConfig(path.clone(), err))?;

    let pattern = node_command_pattern();

    if !pattern.is_match(&content) {
        return Err(SupervisorError::MissingCommand(path));
    }

    let patched = pattern.replace(&content, regex::NoExpand(COVERAGE_COMMAND));

    std::fs::write(&path, patched.as_bytes())
        .map_err(|err| SupervisorError::WriteConfig(path.clone(), err))?;

    debug!(path = %path.display(), "rewrote node command for coverage");

    Ok(())
}

/// External programs that provision and run the cluster.
pub trait ClusterBackend: Send {
    /// Materialize node homes and the supervisor configuration under `data`.
    fn init_cluster(
        &self,
        data: &Path,
        config_path: &Path,
        base_port: u16,
    ) -> Result<(), SupervisorError>;

    /// Start the supervisor on the `tasks.ini` under `data`.
    fn start_cluster(&self, data: &Path) -> Result<SupervisorProcess, SupervisorError>;
}

/// Default backend shelling out to `pystarport` and `supervisord`.
#[derive(Debug, Clone)]
pub struct ProgramBackend {
    init_program: String,
    supervisor_program: String,
}

impl Default for ProgramBackend {
    fn default() -> Self {
        Self {
            init_program: "pystarport".to_string(),
            supervisor_program: "supervisord".to_string(),
        }
    }
}

impl ProgramBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_init_program(mut self, program: impl Into<String>) -> Self {
        self.init_program = program.into();
        self
    }

    pub fn with_supervisor_program(mut self, program: impl Into<String>) -> Self {
        self.supervisor_program = program.into();
        self
    }
}

impl ClusterBackend for ProgramBackend {
    fn init_cluster(
        &self,
        data: &Path,
        config_path: &Path,
        base_port: u16,
    ) -> Result<(), SupervisorError> {
        let status = Command::new(&self.init_program)
            .arg("init")
            .arg("--data")
            .arg(data)
            .arg("--config")
            .arg(config_path)
            .arg("--base_port")
            .arg(base_port.to_string())
            .stdin(Stdio::null())
            .status()
            .map_err(|source| SupervisorError::Spawn {
                program: self.init_program.clone(),
                source,
            })?;

        if !status.success() {
            return Err(SupervisorError::InitFailed(status));
        }

        Ok(())
    }

    fn start_cluster(&self, data: &Path) -> Result<SupervisorProcess, SupervisorError> {
        let child = Command::new(&self.supervisor_program)
            .arg("-c")
            .arg(data.join(SUPERVISOR_CONFIG))
            .arg("--nodaemon")
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                program: self.supervisor_program.clone(),
                source,
            })?;

        debug!(pid = child.id(), "supervisor started");

        Ok(SupervisorProcess::new(child))
    }
}

/// Handle on a running supervisor. Dropping the handle tears the process
/// down if the owner never did.
#[derive(Debug)]
pub struct SupervisorProcess {
    child: Child,
}

impl SupervisorProcess {
    pub(crate) fn new(child: Child) -> Self {
        Self { child }
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Ask the supervisor to shut the cluster down. Does nothing when the
    /// exit status is already known; the pid is stale at that point and may
    /// belong to another process.
    pub fn terminate(&mut self) -> Result<(), SupervisorError> {
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return Ok(());
        }

        let pid = nix::unistd::Pid::from_raw(self.child.id() as i32);

        match nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
            Ok(()) => Ok(()),
            // ESRCH means the process has already exited
            Err(nix::Error::ESRCH) => Ok(()),
            Err(err) => Err(SupervisorError::Signal(err)),
        }
    }

    /// Block until the supervisor exits.
    pub fn wait(&mut self) -> Result<ExitStatus, SupervisorError> {
        self.child.wait().map_err(SupervisorError::Wait)
    }

    /// Check for an exit without blocking.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>, SupervisorError> {
        self.child.try_wait().map_err(SupervisorError::Wait)
    }
}

impl Drop for SupervisorProcess {
    fn drop(&mut self) {
        if !matches!(self.child.try_wait(), Ok(None)) {
            return;
        }

        if let Err(err) = self.terminate() {
            warn!(%err, "could not terminate supervisor");
        }

        if let Err(err) = self.child.wait() {
            warn!(%err, "error waiting for supervisor to exit");
        }
    }
}
