//! Transfer orchestration
//!
//! Owns every channel of a run and drives them through allocation, issuance,
//! synchronization and teardown. All runtime calls made here may block and
//! are expected to run off the async executor.

use std::sync::Arc;

use hits_gpu::GpuRuntime;
use tracing::{debug, error, info};

use crate::allocator::BufferAllocator;
use crate::channel::{Channel, ChannelState};
use crate::config::RunConfig;
use crate::error::{ChannelContext, EngineError};
use crate::numa::NumaTopology;
use crate::report::{BenchmarkReport, ChannelReport, Measurement};

pub struct Orchestrator {
    runtime: Arc<dyn GpuRuntime>,
    config: RunConfig,
    channels: Vec<Channel>,
}

impl Orchestrator {
    /// Validate `config` and lay out one channel per requested transfer
    pub fn new(runtime: Arc<dyn GpuRuntime>, config: RunConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let channels = config
            .channels
            .iter()
            .enumerate()
            .map(|(index, spec)| Channel::new(index, *spec))
            .collect();

        Ok(Self {
            runtime,
            config,
            channels,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    fn transfer_size(&self) -> Result<usize, EngineError> {
        usize::try_from(self.config.transfer_size).map_err(|_| {
            EngineError::Configuration(format!(
                "transfer size {} does not fit in memory",
                self.config.transfer_size
            ))
        })
    }

    /// Acquire resources for every channel in order.
    ///
    /// Device ids are checked against the runtime before anything is
    /// allocated. The first failure releases everything acquired so far.
    pub fn allocate(&mut self, topology: &dyn NumaTopology) -> Result<(), EngineError> {
        let size = self.transfer_size()?;
        let device_count = self.runtime.device_count()?;
        debug!("{} runtime reports {} devices", self.runtime.name(), device_count);

        for channel in &self.channels {
            if let Some(device) = channel.spec().devices().find(|&d| d >= device_count) {
                return Err(EngineError::Configuration(format!(
                    "transfer {}: device {} does not exist ({} devices available)",
                    channel.index(),
                    device,
                    device_count
                )));
            }
        }

        let allocator =
            BufferAllocator::new(self.runtime.as_ref(), topology, size, self.config.policy);
        let result = self
            .channels
            .iter_mut()
            .try_for_each(|channel| allocator.allocate(channel));

        if let Err(e) = result {
            if let Err(release) = self.teardown() {
                debug!("Teardown after failed allocation also failed: {}", release);
            }
            return Err(e);
        }

        info!(
            "Allocated {} transfers of {} bytes",
            self.channels.len(),
            size
        );
        Ok(())
    }

    /// Enqueue every iteration, round-robin across channels. Never waits on
    /// the device.
    pub fn issue(&mut self) -> Result<(), EngineError> {
        let size = self.transfer_size()?;
        let iterations = self.config.iterations;
        let runtime = self.runtime.as_ref();

        for iteration in 0..iterations {
            for channel in self.channels.iter_mut() {
                channel.issue(runtime, iteration, iterations, size)?;
            }
        }
        Ok(())
    }

    /// Wait for each channel's stream to drain, in order
    pub fn synchronize(&mut self) -> Result<(), EngineError> {
        let runtime = self.runtime.as_ref();
        for channel in self.channels.iter_mut() {
            channel.finalize(runtime)?;
        }
        Ok(())
    }

    /// Measure every finalized channel
    pub fn report(&self) -> Result<BenchmarkReport, EngineError> {
        let channels = self
            .channels
            .iter()
            .map(|channel| self.measure(channel).map(|m| ChannelReport::new(channel, m)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(BenchmarkReport::new(
            self.runtime.name(),
            &self.config,
            channels,
        ))
    }

    fn measure(&self, channel: &Channel) -> Result<Option<Measurement>, EngineError> {
        if channel.state() != ChannelState::Finalized {
            return Err(EngineError::InvalidState {
                channel: channel.index(),
                action: "report",
                state: channel.state(),
            });
        }
        let Some(res) = channel.resources() else {
            return Ok(None);
        };
        if !channel.is_started() {
            return Ok(None);
        }

        let elapsed_ms = self
            .runtime
            .elapsed_ms(res.device, res.start_mark, res.stop_mark)
            .on_channel(channel.index(), res.device)?;

        Ok(Some(Measurement::new(
            self.config.transfer_size,
            self.config.iterations,
            f64::from(elapsed_ms) / 1e3,
        )))
    }

    /// Release every channel. Keeps going after a failure and returns the
    /// first one.
    pub fn teardown(&mut self) -> Result<(), EngineError> {
        let runtime = self.runtime.as_ref();
        let mut first_error = None;
        for channel in self.channels.iter_mut() {
            if let Err(e) = channel.release(runtime) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            error!("Failed to release transfer resources: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelSpec;
    use crate::numa::StaticTopology;
    use hits_gpu::mock::MockRuntime;

    fn config(channels: Vec<ChannelSpec>, iterations: u64) -> RunConfig {
        let mut config = RunConfig::new(channels);
        config.iterations = iterations;
        config.transfer_size = 1 << 20;
        config
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let rt: Arc<dyn GpuRuntime> = Arc::new(MockRuntime::new(1));
        assert!(matches!(
            Orchestrator::new(rt, config(Vec::new(), 1)),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn test_unknown_device_fails_before_allocation() {
        let mock = Arc::new(MockRuntime::new(2));
        let mut orchestrator = Orchestrator::new(
            mock.clone(),
            config(
                vec![
                    ChannelSpec::HostToDevice { device: 0 },
                    ChannelSpec::DeviceToHost { device: 5 },
                ],
                1,
            ),
        )
        .unwrap();

        let err = orchestrator.allocate(&StaticTopology::empty()).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
        assert_eq!(err.exit_code(), 1);
        assert_eq!(mock.call_count("hipMalloc"), 0);
        assert_eq!(mock.call_count("hipStreamCreateWithFlags"), 0);
    }

    #[test]
    fn test_round_robin_issue_order() {
        let mock = Arc::new(MockRuntime::new(2));
        let mut orchestrator = Orchestrator::new(
            mock.clone(),
            config(
                vec![
                    ChannelSpec::HostToDevice { device: 0 },
                    ChannelSpec::DeviceToHost { device: 1 },
                ],
                2,
            ),
        )
        .unwrap();
        orchestrator.allocate(&StaticTopology::empty()).unwrap();
        orchestrator.issue().unwrap();

        let first = orchestrator.channels()[0].resources().unwrap();
        let second = orchestrator.channels()[1].resources().unwrap();
        assert_eq!(mock.stream_copies(first.stream), Some(2));
        assert_eq!(mock.stream_copies(second.stream), Some(2));

        // iteration 0 of both channels precedes iteration 1 of either
        let copies: Vec<_> = mock
            .calls()
            .into_iter()
            .filter(|c| *c == "hipMemcpyAsync" || *c == "hipEventRecord")
            .collect();
        assert_eq!(
            copies,
            vec![
                "hipEventRecord",
                "hipMemcpyAsync",
                "hipEventRecord",
                "hipMemcpyAsync",
                "hipMemcpyAsync",
                "hipEventRecord",
                "hipMemcpyAsync",
                "hipEventRecord",
            ]
        );
    }

    #[test]
    fn test_report_requires_finalized_channels() {
        let rt: Arc<dyn GpuRuntime> = Arc::new(MockRuntime::new(1));
        let mut orchestrator =
            Orchestrator::new(rt, config(vec![ChannelSpec::HostToDevice { device: 0 }], 2))
                .unwrap();
        orchestrator.allocate(&StaticTopology::empty()).unwrap();
        orchestrator.issue().unwrap();

        assert!(matches!(
            orchestrator.report(),
            Err(EngineError::InvalidState { .. })
        ));

        orchestrator.synchronize().unwrap();
        let report = orchestrator.report().unwrap();
        let measurement = report.channels[0].measurement.unwrap();
        assert_eq!(measurement.bytes_total, 2 << 20);
        assert!(measurement.elapsed_secs > 0.0);
    }

    #[test]
    fn test_drop_releases_everything() {
        let mock = Arc::new(MockRuntime::new(2).with_full_peer_access());
        {
            let mut orchestrator = Orchestrator::new(
                mock.clone(),
                config(
                    vec![
                        ChannelSpec::DeviceToDevice { dst: 1, src: 0 },
                        ChannelSpec::HostToDevice { device: 1 },
                    ],
                    3,
                ),
            )
            .unwrap();
            orchestrator.allocate(&StaticTopology::empty()).unwrap();
            orchestrator.issue().unwrap();
        }

        assert_eq!(mock.live_device_buffers(), 0);
        assert_eq!(mock.live_pinned_buffers(), 0);
        assert_eq!(mock.live_events(), 0);
        assert_eq!(mock.live_streams(), 0);
    }
}
