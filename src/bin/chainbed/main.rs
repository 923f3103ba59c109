use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use serde::Deserialize;

use chainbed::ProgramBackend;

mod common;
mod feedback;
mod serve;
mod wait;

#[derive(Debug, Subcommand)]
enum Command {
    Serve(serve::Args),
    Wait(wait::Args),
}

#[derive(Debug, Parser)]
#[clap(name = "Chainbed")]
#[clap(bin_name = "chainbed")]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    config: Option<std::path::PathBuf>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
pub struct ProgramsConfig {
    pub init: Option<String>,
    pub supervisor: Option<String>,
}

impl ProgramsConfig {
    pub fn backend(&self) -> ProgramBackend {
        let mut backend = ProgramBackend::new();

        if let Some(init) = &self.init {
            backend = backend.with_init_program(init);
        }

        if let Some(supervisor) = &self.supervisor {
            backend = backend.with_supervisor_program(supervisor);
        }

        backend
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub programs: ProgramsConfig,
    pub logging: common::LoggingConfig,
}

impl Config {
    pub fn new(explicit_file: &Option<std::path::PathBuf>) -> Result<Self, config::ConfigError> {
        let mut s = config::Config::builder();

        // a settings file in the working dir overrides the built-in defaults
        s = s.add_source(config::File::with_name("chainbed.toml").required(false));

        // if an explicit file was passed, then we load it as mandatory
        if let Some(explicit) = explicit_file.as_ref().and_then(|x| x.to_str()) {
            s = s.add_source(config::File::with_name(explicit).required(true));
        }

        // finally, we use env vars to make some last-step overrides
        s = s.add_source(config::Environment::with_prefix("CHAINBED").separator("_"));

        s.build()?.try_deserialize()
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();
    let config = Config::new(&args.config).into_diagnostic()?;

    common::setup_tracing(&config.logging)?;

    match args.command {
        Command::Serve(x) => serve::run(&config, &x)?,
        Command::Wait(x) => wait::run(&x)?,
    };

    Ok(())
}
