use std::time::Duration;

use miette::{Context, IntoDiagnostic};
use tracing::info;

use chainbed::waiters;
use chainbed::NodeClient;

#[derive(Debug, clap::Args)]
pub struct Args {
    /// TCP port to wait for.
    #[arg(long)]
    port: u16,

    /// Host the port belongs to.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Give up after this many seconds.
    #[arg(long, default_value_t = 40)]
    timeout: u64,

    /// After the port opens, also wait until the node reports this block
    /// height.
    #[arg(long)]
    height: Option<u64>,
}

pub fn run(args: &Args) -> miette::Result<()> {
    waiters::wait_for_port_on(&args.host, args.port, Duration::from_secs(args.timeout))
        .into_diagnostic()
        .context("waiting for port")?;

    info!(host = %args.host, port = args.port, "port is accepting connections");

    if let Some(height) = args.height {
        let client = NodeClient::new(&args.host, args.port);

        waiters::wait_for_block(&client, height, args.timeout)
            .into_diagnostic()
            .context("waiting for block height")?;

        info!(height, "height reached");
    }

    Ok(())
}
