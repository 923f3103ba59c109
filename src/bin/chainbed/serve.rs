use std::time::Duration;

use miette::{Context, IntoDiagnostic};
use tracing::{info, warn};

use chainbed::{Cluster, FixtureOptions, WorkDirFactory};

use crate::feedback::Feedback;

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Cluster topology file handed to the init program.
    #[arg(long)]
    config: std::path::PathBuf,

    /// First port of the first validator's port block.
    #[arg(long, default_value_t = 26650)]
    base_port: u16,

    /// Skip tailing node logs to stdout.
    #[arg(long)]
    quiet: bool,

    /// Force coverage collection on or off. Defaults to on when running
    /// under GitHub Actions.
    #[arg(long)]
    coverage: Option<bool>,
}

#[tokio::main]
pub async fn run(config: &super::Config, args: &Args) -> miette::Result<()> {
    let feedback = Feedback::default();

    let mut options = FixtureOptions::new()
        .quiet(args.quiet)
        .backend(config.programs.backend());

    if let Some(enabled) = args.coverage {
        options = options.coverage(enabled);
    }

    let pb = feedback.indeterminate_progress_bar();
    pb.set_message("bootstrapping cluster");
    pb.enable_steady_tick(Duration::from_millis(100));

    let config_path = args.config.clone();
    let base_port = args.base_port;

    let (workdir, mut cluster) = tokio::task::spawn_blocking(move || {
        let workdir = WorkDirFactory::new()?;
        let cluster = Cluster::bootstrap(&config_path, base_port, &workdir, options)?;

        Ok::<_, chainbed::FixtureError>((workdir, cluster))
    })
    .await
    .into_diagnostic()
    .context("joining bootstrap task")?
    .into_diagnostic()
    .context("bootstrapping cluster")?;

    pb.finish_and_clear();

    let handle = cluster.handle();
    for idx in 0..handle.config().validators.len() {
        if let Some(client) = handle.rpc_client(idx) {
            info!(node = idx, url = %client.base_url(), "rpc endpoint ready");
        }
    }

    let exit = crate::common::hook_exit_token();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if cluster.supervisor_exited() {
                    warn!("supervisor exited on its own");
                    break;
                }
            }
            _ = exit.cancelled() => {
                info!("shutting down cluster");
                break;
            }
        }
    }

    let profile = tokio::task::spawn_blocking(move || cluster.shutdown())
        .await
        .into_diagnostic()
        .context("joining shutdown task")?
        .into_diagnostic()
        .context("tearing down cluster")?;

    if let Some(profile) = profile {
        info!(profile = %profile.display(), "coverage profile collected");
    }

    drop(workdir);

    Ok(())
}
