//! CLI for hits
//!
//! Runs concurrent host/device and peer-to-peer transfers on HIP devices and
//! prints the bandwidth each of them sustained.

use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{ArgMatches, CommandFactory, FromArgMatches};
use hits_engine::error::EXIT_FAILURE;
use hits_engine::numa::{NumaTopology, StaticTopology};
use hits_engine::{output as report_output, run_benchmark, EngineError};
use hits_gpu::mock::MockRuntime;
use hits_gpu::GpuRuntime;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod args;
mod output;

use args::Cli;

/// Devices exposed by `--simulate`
const SIMULATED_DEVICES: u32 = 8;

/// Simulated devices per NUMA node
const SIMULATED_DEVICES_PER_NODE: u32 = 4;

#[tokio::main]
async fn main() -> ExitCode {
    let matches = match Cli::command().try_get_matches() {
        Ok(matches) => matches,
        Err(e) => return usage_error(e),
    };
    let cli = match Cli::from_arg_matches(&matches) {
        Ok(cli) => cli,
        Err(e) => return usage_error(e),
    };

    init_tracing(cli.verbose);

    match run(cli, &matches).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            output::error(&format!("{:#}", e));
            ExitCode::from(exit_code(&e))
        }
    }
}

fn usage_error(e: clap::Error) -> ExitCode {
    if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
        e.exit();
    }
    let _ = e.print();
    ExitCode::from(EXIT_FAILURE)
}

/// Exit status for a failed run
fn exit_code(e: &anyhow::Error) -> u8 {
    e.chain()
        .find_map(|cause| cause.downcast_ref::<EngineError>())
        .map(EngineError::exit_code)
        .unwrap_or(EXIT_FAILURE)
}

async fn run(cli: Cli, matches: &ArgMatches) -> Result<()> {
    let config = cli.run_config(matches);
    config.validate()?;

    let (runtime, topology) = select_runtime(cli.simulate)?;

    let report = run_benchmark(config, runtime, topology, Box::new(io::stdout())).await?;

    println!();
    println!("Completed.");
    report_output::write_text(&report, io::stdout().lock())
        .context("Failed to print results")?;

    if let Some(path) = &cli.json {
        report_output::generate_json(&report, path)?;
        output::success(&format!("Results written to {}", path.display()));
    }

    Ok(())
}

fn select_runtime(simulate: bool) -> Result<(Arc<dyn GpuRuntime>, Arc<dyn NumaTopology>)> {
    if simulate {
        output::warning("Running against simulated devices, results are not hardware measurements");
        return Ok(simulated_runtime());
    }
    hardware_runtime()
}

fn simulated_runtime() -> (Arc<dyn GpuRuntime>, Arc<dyn NumaTopology>) {
    let runtime = MockRuntime::new(SIMULATED_DEVICES).with_full_peer_access();
    let topology = runtime
        .devices()
        .iter()
        .enumerate()
        .fold(StaticTopology::empty(), |topology, (i, device)| {
            topology.with_node(
                device.pci_domain_id,
                device.pci_bus_id,
                i as u32 / SIMULATED_DEVICES_PER_NODE,
            )
        });
    (Arc::new(runtime), Arc::new(topology))
}

#[cfg(feature = "hip")]
fn hardware_runtime() -> Result<(Arc<dyn GpuRuntime>, Arc<dyn NumaTopology>)> {
    use hits_engine::numa::SysfsTopology;
    use hits_gpu::hip::HipRuntime;

    let runtime = HipRuntime::new().map_err(EngineError::from)?;
    Ok((Arc::new(runtime), Arc::new(SysfsTopology::new())))
}

#[cfg(not(feature = "hip"))]
fn hardware_runtime() -> Result<(Arc<dyn GpuRuntime>, Arc<dyn NumaTopology>)> {
    anyhow::bail!("hits was built without HIP support; rebuild with `--features hip`")
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .init();
}
