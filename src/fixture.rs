//! Cluster lifecycle orchestration for integration tests.
//!
//! [`Cluster::bootstrap`] materializes a working directory, delegates node
//! provisioning to the external cluster manager, starts everything under the
//! process supervisor and blocks until the first node produces a block. The
//! returned guard tears the whole cluster down again, either through an
//! explicit [`Cluster::shutdown`] or from `Drop` when a test body panics.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::client::NodeClient;
use crate::config::{ClusterConfig, ConfigError};
use crate::ports;
use crate::supervisor::{
    self, ClusterBackend, ProgramBackend, SupervisorError, SupervisorProcess,
};
use crate::tailer::LogTailer;
use crate::waiters::{self, WaitError};

/// Minimum time an instrumented node must stay up before its coverage
/// profile is flushed on shutdown.
pub const COVERAGE_MIN_UPTIME: Duration = Duration::from_secs(15);

type PostInitHook =
    Box<dyn FnOnce(&ClusterConfig, &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send>;

#[derive(Debug, Error)]
pub enum FixtureError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Wait(#[from] WaitError),

    #[error("failed to prepare working directory: {0}")]
    WorkDir(std::io::Error),

    #[error("post-init hook failed: {0}")]
    PostInit(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("failed to collect coverage profile: {0}")]
    Coverage(std::io::Error),
}

/// Creates uniquely named working directories under one temporary root.
/// Dropping the factory removes the root along with everything the clusters
/// wrote into it.
pub struct WorkDirFactory {
    root: TempDir,
}

impl WorkDirFactory {
    pub fn new() -> Result<Self, FixtureError> {
        let root = TempDir::with_prefix("chainbed-").map_err(FixtureError::WorkDir)?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Create a fresh directory called `name`, appending a numeric suffix
    /// when that name is already taken.
    pub fn mktemp(&self, name: &str) -> Result<PathBuf, FixtureError> {
        let base = self.root.path();

        let mut candidate = base.join(name);
        let mut suffix = 0;

        while candidate.exists() {
            suffix += 1;
            candidate = base.join(format!("{name}-{suffix}"));
        }

        std::fs::create_dir(&candidate).map_err(FixtureError::WorkDir)?;

        Ok(candidate)
    }
}

/// Knobs for [`Cluster::bootstrap`]. The defaults match what CI expects:
/// log tailing on, coverage collection decided by the `GITHUB_ACTIONS`
/// environment variable.
pub struct FixtureOptions {
    quiet: bool,
    enable_cov: Option<bool>,
    cov_min_uptime: Duration,
    cov_output_dir: Option<PathBuf>,
    post_init: Option<PostInitHook>,
    backend: Box<dyn ClusterBackend>,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            quiet: false,
            enable_cov: None,
            cov_min_uptime: COVERAGE_MIN_UPTIME,
            cov_output_dir: None,
            post_init: None,
            backend: Box::new(ProgramBackend::default()),
        }
    }
}

impl FixtureOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip tailing node logs to stdout.
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Force coverage collection on or off instead of deriving it from the
    /// `GITHUB_ACTIONS` environment variable.
    pub fn coverage(mut self, enabled: bool) -> Self {
        self.enable_cov = Some(enabled);
        self
    }

    pub fn coverage_min_uptime(mut self, uptime: Duration) -> Self {
        self.cov_min_uptime = uptime;
        self
    }

    /// Directory the collected coverage profile is moved into. Defaults to
    /// the current working directory.
    pub fn coverage_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cov_output_dir = Some(dir.into());
        self
    }

    /// Hook invoked with the parsed topology and the working directory after
    /// cluster initialization, before any node starts.
    pub fn post_init<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&ClusterConfig, &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
            + Send
            + 'static,
    {
        self.post_init = Some(Box::new(hook));
        self
    }

    pub fn backend(mut self, backend: impl ClusterBackend + 'static) -> Self {
        self.backend = Box::new(backend);
        self
    }
}

/// Access to a running cluster, handed to test bodies for the lifetime of
/// the fixture.
#[derive(Debug)]
pub struct ClusterHandle {
    data: PathBuf,
    config: ClusterConfig,
}

impl ClusterHandle {
    /// Working directory holding node homes, logs and `tasks.ini`.
    pub fn data_dir(&self) -> &Path {
        &self.data
    }

    pub fn chain_id(&self) -> &str {
        &self.config.chain_id
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// RPC client for validator `idx`, or `None` past the end of the
    /// validator list.
    pub fn rpc_client(&self, idx: usize) -> Option<NodeClient> {
        let validator = self.config.validators.get(idx)?;

        Some(NodeClient::loopback(ports::rpc_port(validator.base_port)))
    }
}

#[derive(Debug)]
struct Coverage {
    started: Instant,
    min_uptime: Duration,
    output_dir: Option<PathBuf>,
}

/// A running cluster and the pieces needed to tear it down.
#[derive(Debug)]
pub struct Cluster {
    handle: ClusterHandle,
    supervisor: Option<SupervisorProcess>,
    tailer: Option<LogTailer>,
    coverage: Option<Coverage>,
}

impl Cluster {
    /// Provision and start a cluster described by the topology file at
    /// `config_path`, then block until its first node accepts RPC
    /// connections and has produced a block.
    pub fn bootstrap(
        config_path: impl AsRef<Path>,
        base_port: u16,
        workdir: &WorkDirFactory,
        options: FixtureOptions,
    ) -> Result<Self, FixtureError> {
        let config_path = config_path.as_ref();

        let enable_cov = options.enable_cov.unwrap_or_else(coverage_requested);

        let config = ClusterConfig::load(config_path)?;
        let rpc = ports::rpc_port(config.first_validator()?.base_port);

        let data = workdir.mktemp(&config.chain_id)?;
        info!(data = %data.display(), base_port, "init cluster");
        options.backend.init_cluster(&data, config_path, base_port)?;

        if let Some(hook) = options.post_init {
            hook(&config, &data).map_err(FixtureError::PostInit)?;
        }

        let coverage = if enable_cov {
            supervisor::enable_coverage(&data)?;

            Some(Coverage {
                started: Instant::now(),
                min_uptime: options.cov_min_uptime,
                output_dir: options.cov_output_dir,
            })
        } else {
            None
        };

        let supervisor = options.backend.start_cluster(&data)?;

        let mut cluster = Self {
            handle: ClusterHandle { data, config },
            supervisor: Some(supervisor),
            tailer: None,
            coverage,
        };

        if !options.quiet {
            cluster.tailer = Some(LogTailer::spawn(cluster.handle.data_dir()));
        }

        // the first node must be reachable and producing blocks before any
        // test can run against the cluster
        waiters::wait_for_port(rpc, waiters::DEFAULT_PORT_TIMEOUT)?;
        let client = NodeClient::loopback(rpc);
        waiters::wait_for_block(&client, 1, waiters::DEFAULT_BLOCK_TIMEOUT_SECS)?;

        Ok(cluster)
    }

    pub fn handle(&self) -> &ClusterHandle {
        &self.handle
    }

    /// Whether the supervisor process has exited on its own.
    pub fn supervisor_exited(&mut self) -> bool {
        match self.supervisor.as_mut() {
            Some(supervisor) => matches!(supervisor.try_wait(), Ok(Some(_))),
            None => true,
        }
    }

    /// Tear the cluster down: wait out the coverage minimum uptime, stop the
    /// supervisor, join the log tailer and collect the coverage profile.
    /// Returns the profile's destination path when coverage was enabled.
    pub fn shutdown(mut self) -> Result<Option<PathBuf>, FixtureError> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<Option<PathBuf>, FixtureError> {
        let Some(mut supervisor) = self.supervisor.take() else {
            return Ok(None);
        };

        if let Some(coverage) = &self.coverage {
            let uptime = coverage.started.elapsed();

            // an instrumented node flushes its profile only after a minimum
            // uptime, so stretch short-lived clusters out to it
            if uptime < coverage.min_uptime {
                thread::sleep(coverage.min_uptime - uptime);
            }
        }

        debug!(pid = supervisor.id(), "terminating supervisor");
        supervisor.terminate()?;
        supervisor.wait()?;

        if let Some(tailer) = self.tailer.take() {
            tailer.join();
        }

        if let Some(coverage) = self.coverage.take() {
            let profile = collect_coverage(self.handle.data_dir(), coverage.output_dir.as_deref())?;

            return Ok(Some(profile));
        }

        Ok(None)
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        if self.supervisor.is_none() {
            return;
        }

        warn!("cluster dropped without explicit shutdown, tearing down");

        if let Err(err) = self.teardown() {
            warn!(%err, "cluster teardown failed");
        }
    }
}

/// Run `body` against a freshly bootstrapped cluster, tearing the cluster
/// down afterwards. Teardown also happens when the body panics, through the
/// guard's `Drop`; teardown errors on the normal path are logged rather than
/// returned so they never mask a failure the body reported.
pub fn with_cluster<T>(
    config_path: impl AsRef<Path>,
    base_port: u16,
    workdir: &WorkDirFactory,
    options: FixtureOptions,
    body: impl FnOnce(&ClusterHandle) -> T,
) -> Result<T, FixtureError> {
    let cluster = Cluster::bootstrap(config_path, base_port, workdir, options)?;

    let value = body(cluster.handle());

    if let Err(err) = cluster.shutdown() {
        warn!(%err, "cluster teardown failed");
    }

    Ok(value)
}

fn coverage_requested() -> bool {
    std::env::var("GITHUB_ACTIONS")
        .map(|value| value == "true")
        .unwrap_or(false)
}

fn collect_coverage(data: &Path, output_dir: Option<&Path>) -> Result<PathBuf, FixtureError> {
    let source = data.join("coverage.txt");

    let name = format!("coverage.{}.txt", uuid::Uuid::new_v4());
    let destination = match output_dir {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    };

    // the working directory usually lives on another filesystem, where a
    // plain rename fails
    if std::fs::rename(&source, &destination).is_err() {
        std::fs::copy(&source, &destination).map_err(FixtureError::Coverage)?;
        std::fs::remove_file(&source).map_err(FixtureError::Coverage)?;
    }

    info!(profile = %destination.display(), "coverage profile collected");

    Ok(destination)
}
