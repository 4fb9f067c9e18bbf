#![doc = include_str!("../README.md")]

mod agent;

use agent::command;
use agent::config::{CliArgs, Command, CoordinatorConfig};
use agent::telemetry::init_telemetry;
use clap::Parser;
use std::process::ExitCode;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();

    let providers = init_telemetry()?;
    let coordinator = CoordinatorConfig::try_from(args.coordinator)?;

    let code = match args.command {
        Command::Claim(claim) => command::claim(coordinator, claim).await,
        Command::Assign(assign) => command::assign(coordinator, assign).await,
        Command::Current(current) => Ok(command::current(current)),
        Command::Demo(demo) => command::demo(coordinator, demo).await,
    };

    providers.shutdown();
    Ok(ExitCode::from(code?))
}
