//! Command-line arguments

use std::path::PathBuf;

use clap::{ArgAction, ArgMatches, Parser};
use hits_engine::config::{DEFAULT_ITERATIONS, DEFAULT_TRANSFER_SIZE};
use hits_engine::{AllocPolicy, ChannelSpec, RunConfig};
use hits_gpu::DeviceId;

#[derive(Parser, Debug)]
#[command(name = "hits")]
#[command(about = "hits - HIP transfer streams bandwidth benchmark")]
#[command(
    long_about = "Measures host/device and peer-to-peer bandwidth in an adjustable way. \
    Every requested transfer is bound to its own stream and all of them run concurrently. \
    Host buffers are allocated on the NUMA node closest to their device by default."
)]
#[command(version)]
pub struct Cli {
    /// Provide GPU id for Device to Host transfer
    #[arg(long, value_name = "ID", value_parser = parse_device_id, action = ArgAction::Append)]
    pub dtoh: Vec<DeviceId>,

    /// Provide GPU id for Host to Device transfer
    #[arg(long, value_name = "ID", value_parser = parse_device_id, action = ArgAction::Append)]
    pub htod: Vec<DeviceId>,

    /// Pair of GPUs for peer to peer transfer, destination first then source
    #[arg(long, value_name = "DST,SRC", value_parser = parse_peer_pair, action = ArgAction::Append)]
    pub dtod: Vec<(DeviceId, DeviceId)>,

    /// Number of iterations
    #[arg(long = "iter", value_name = "NB", default_value_t = DEFAULT_ITERATIONS)]
    pub iterations: u64,

    /// Transfer size in bytes
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_TRANSFER_SIZE)]
    pub size: u64,

    /// Do not make the transfer buffers NUMA aware
    #[arg(long)]
    pub disable_numa_affinity: bool,

    /// Use pageable allocations instead of pinned memory
    #[arg(long)]
    pub disable_pinned_memory: bool,

    /// Also write the results in JSON format
    #[arg(long, value_name = "PATH")]
    pub json: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Run against simulated devices
    #[arg(long, hide = true)]
    pub simulate: bool,
}

impl Cli {
    /// Build the run configuration, with channels in command-line order
    pub fn run_config(&self, matches: &ArgMatches) -> RunConfig {
        let mut config = RunConfig::new(ordered_channels(matches));
        config.iterations = self.iterations;
        config.transfer_size = self.size;
        config.policy = AllocPolicy {
            numa_aware: !self.disable_numa_affinity,
            pinned: !self.disable_pinned_memory,
        };
        config
    }
}

/// Transfers from every channel flag, sorted by where they appeared
pub fn ordered_channels(matches: &ArgMatches) -> Vec<ChannelSpec> {
    let mut channels: Vec<(usize, ChannelSpec)> = Vec::new();
    channels.extend(
        positioned::<DeviceId>(matches, "htod")
            .map(|(at, device)| (at, ChannelSpec::HostToDevice { device })),
    );
    channels.extend(
        positioned::<DeviceId>(matches, "dtoh")
            .map(|(at, device)| (at, ChannelSpec::DeviceToHost { device })),
    );
    channels.extend(
        positioned::<(DeviceId, DeviceId)>(matches, "dtod")
            .map(|(at, (dst, src))| (at, ChannelSpec::DeviceToDevice { dst, src })),
    );

    channels.sort_by_key(|(at, _)| *at);
    channels.into_iter().map(|(_, spec)| spec).collect()
}

fn positioned<'a, T>(matches: &'a ArgMatches, id: &str) -> impl Iterator<Item = (usize, T)> + 'a
where
    T: Clone + Send + Sync + 'static,
{
    let indices = matches.indices_of(id).into_iter().flatten();
    let values = matches.get_many::<T>(id).into_iter().flatten().cloned();
    indices.zip(values)
}

pub fn parse_device_id(arg: &str) -> Result<DeviceId, String> {
    arg.trim()
        .parse::<DeviceId>()
        .map_err(|_| format!("cannot parse the GPU id from '{}'", arg))
}

pub fn parse_peer_pair(arg: &str) -> Result<(DeviceId, DeviceId), String> {
    const USAGE: &str = "only a list of two GPU ids separated by a comma is accepted";

    let mut ids = arg.split(',');
    let dst = ids
        .next()
        .and_then(|id| id.trim().parse::<DeviceId>().ok())
        .ok_or_else(|| format!("cannot parse first GPU id from '{}': {}", arg, USAGE))?;
    let src = ids
        .next()
        .and_then(|id| id.trim().parse::<DeviceId>().ok())
        .ok_or_else(|| format!("cannot parse second GPU id from '{}': {}", arg, USAGE))?;

    if ids.next().is_some() {
        return Err(format!("'{}': {}", arg, USAGE));
    }
    Ok((dst, src))
}
