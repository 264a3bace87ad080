//! hits transfer engine
//!
//! This library drives concurrent host↔device and device↔device copy streams
//! and measures their bandwidth, including buffer placement on the NUMA node
//! closest to each device.

pub mod allocator;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod numa;
pub mod orchestrator;
pub mod output;
pub mod report;

pub use config::{AllocPolicy, ChannelSpec, Direction, RunConfig};
pub use error::EngineError;
pub use orchestrator::Orchestrator;
pub use report::BenchmarkReport;

use std::io::Write;
use std::sync::Arc;

use hits_gpu::GpuRuntime;
use tokio::task::JoinError;
use tracing::{debug, info};

use crate::heartbeat::{Heartbeat, HEARTBEAT_INTERVAL};
use crate::numa::NumaTopology;

fn worker_failed(e: JoinError) -> EngineError {
    EngineError::Worker(e.to_string())
}

/// Run a whole benchmark: allocate, issue, drain, measure and release.
///
/// Runtime calls execute on the blocking pool while a heartbeat writes
/// progress markers to `progress`. Any failure is fatal and everything
/// acquired is released before it is returned.
pub async fn run_benchmark(
    config: RunConfig,
    runtime: Arc<dyn GpuRuntime>,
    topology: Arc<dyn NumaTopology>,
    progress: Box<dyn Write + Send>,
) -> Result<BenchmarkReport, EngineError> {
    info!(
        "Starting {} transfers on the {} runtime ({} iterations of {} bytes)",
        config.channels.len(),
        runtime.name(),
        config.iterations,
        config.transfer_size
    );

    // 1. Validate and allocate every channel
    let mut orchestrator = tokio::task::spawn_blocking(move || {
        let mut orchestrator = Orchestrator::new(runtime, config)?;
        orchestrator.allocate(topology.as_ref())?;
        Ok::<_, EngineError>(orchestrator)
    })
    .await
    .map_err(worker_failed)??;

    // 2. Start the heartbeat for the duration of the transfers
    let heartbeat = Heartbeat::spawn(HEARTBEAT_INTERVAL, progress);

    // 3. Issue all iterations and wait for every stream to drain
    let transfers = tokio::task::spawn_blocking(move || {
        let result = orchestrator.issue().and_then(|_| orchestrator.synchronize());
        (orchestrator, result)
    })
    .await;

    // 4. Stop the heartbeat whatever the outcome
    let beats = heartbeat.stop().await;
    debug!("Heartbeat emitted {} markers", beats);

    let (mut orchestrator, result) = transfers.map_err(worker_failed)?;
    result?;
    info!("All transfers completed");

    // 5. Measure, then release
    let report = orchestrator.report()?;
    orchestrator.teardown()?;
    Ok(report)
}
