//! End-to-end runs against the mock runtime

use std::io;
use std::sync::Arc;

use hits_engine::channel::ChannelState;
use hits_engine::error::MemoryKind;
use hits_engine::numa::{NumaTopology, PlacementRequest, StaticTopology};
use hits_engine::{run_benchmark, ChannelSpec, EngineError, Orchestrator, RunConfig};
use hits_gpu::mock::MockRuntime;
use hits_gpu::GpuRuntime;

fn config(channels: Vec<ChannelSpec>, iterations: u64, size: u64) -> RunConfig {
    let mut config = RunConfig::new(channels);
    config.iterations = iterations;
    config.transfer_size = size;
    config
}

async fn run(
    mock: &Arc<MockRuntime>,
    topology: Arc<dyn NumaTopology>,
    config: RunConfig,
) -> Result<hits_engine::BenchmarkReport, EngineError> {
    let runtime: Arc<dyn GpuRuntime> = mock.clone();
    run_benchmark(config, runtime, topology, Box::new(io::sink())).await
}

fn assert_nothing_live(mock: &MockRuntime) {
    assert_eq!(mock.live_device_buffers(), 0);
    assert_eq!(mock.live_pinned_buffers(), 0);
    assert_eq!(mock.live_events(), 0);
    assert_eq!(mock.live_streams(), 0);
}

#[tokio::test]
async fn test_single_host_to_device_channel() {
    let mock = Arc::new(MockRuntime::new(1));
    let mut orchestrator = Orchestrator::new(
        mock.clone(),
        config(vec![ChannelSpec::HostToDevice { device: 0 }], 3, 1024),
    )
    .unwrap();

    orchestrator.allocate(&StaticTopology::empty()).unwrap();
    orchestrator.issue().unwrap();
    orchestrator.synchronize().unwrap();

    let channel = &orchestrator.channels()[0];
    assert_eq!(channel.state(), ChannelState::Finalized);
    assert!(channel.is_started());
    let res = channel.resources().unwrap();
    assert_eq!(mock.event_records(res.start_mark), Some(1));
    assert_eq!(mock.event_records(res.stop_mark), Some(1));
    assert_eq!(mock.stream_copies(res.stream), Some(3));

    let report = orchestrator.report().unwrap();
    assert_eq!(report.channels[0].measurement.unwrap().bytes_total, 3 * 1024);

    orchestrator.teardown().unwrap();
    assert_nothing_live(&mock);
}

#[tokio::test]
async fn test_run_benchmark_reports_every_channel() {
    let mock = Arc::new(
        MockRuntime::new(2)
            .with_full_peer_access()
            .with_bandwidth(10.0e9, 40.0e9),
    );
    let topology = Arc::new(StaticTopology::empty().with_node(0, 0x10, 0));
    let report = run(
        &mock,
        topology,
        config(
            vec![
                ChannelSpec::HostToDevice { device: 0 },
                ChannelSpec::DeviceToDevice { dst: 1, src: 0 },
            ],
            10,
            1 << 20,
        ),
    )
    .await
    .unwrap();

    assert_eq!(report.runtime, "mock");
    assert_eq!(report.channels.len(), 2);

    let direct = &report.channels[0];
    assert_eq!(direct.numa_node, Some(0));
    let bandwidth = direct.measurement.unwrap().bandwidth_bytes_per_sec;
    assert!((bandwidth - 10.0e9).abs() / 10.0e9 < 1e-3);

    let peer = &report.channels[1];
    assert_eq!(peer.secondary.map(|s| s.device), Some(0));
    let bandwidth = peer.measurement.unwrap().bandwidth_bytes_per_sec;
    assert!((bandwidth - 40.0e9).abs() / 40.0e9 < 1e-3);

    assert_nothing_live(&mock);
}

#[tokio::test]
async fn test_peer_channel_without_capability() {
    let mock = Arc::new(MockRuntime::new(2));
    let err = run(
        &mock,
        Arc::new(StaticTopology::empty()),
        config(vec![ChannelSpec::DeviceToDevice { dst: 1, src: 0 }], 3, 1024),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, EngineError::PeerAccessUnsupported { .. }));
    assert_eq!(err.exit_code(), 1);
    assert_eq!(mock.device_allocations(), 0);
    assert_nothing_live(&mock);
}

#[tokio::test]
async fn test_unresolved_numa_node_still_completes() {
    let mock = Arc::new(MockRuntime::new(1));
    let topology = Arc::new(StaticTopology::empty());
    let report = run(
        &mock,
        topology.clone(),
        config(vec![ChannelSpec::DeviceToHost { device: 0 }], 2, 4096),
    )
    .await
    .unwrap();

    assert_eq!(report.channels[0].numa_node, None);
    assert!(report.channels[0].measurement.is_some());
    assert!(!topology
        .requests()
        .iter()
        .any(|r| matches!(r, PlacementRequest::Prefer(_))));
}

#[tokio::test]
async fn test_failure_mid_allocation_releases_earlier_channels() {
    let mock = Arc::new(MockRuntime::new(2).fail_call_after("hipMalloc", 1, 2));
    let err = run(
        &mock,
        Arc::new(StaticTopology::empty()),
        config(
            vec![
                ChannelSpec::HostToDevice { device: 0 },
                ChannelSpec::DeviceToHost { device: 1 },
            ],
            5,
            1024,
        ),
    )
    .await
    .unwrap_err();

    let source = err.runtime_error().unwrap();
    assert_eq!(source.call, "hipMalloc");
    assert_eq!(err.exit_code(), 2);
    assert!(matches!(err, EngineError::ChannelCall { channel: 1, device: 1, .. }));
    assert_eq!(mock.call_count("hipMemcpyAsync"), 0);
    assert_nothing_live(&mock);
}

#[tokio::test]
async fn test_null_allocation_aborts() {
    let mock = Arc::new(MockRuntime::new(1).with_null_allocations());
    let err = run(
        &mock,
        Arc::new(StaticTopology::empty()),
        config(vec![ChannelSpec::HostToDevice { device: 0 }], 1, 1024),
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        EngineError::Allocation {
            memory: MemoryKind::PinnedHost,
            ..
        }
    ));
    assert_eq!(err.exit_code(), 134);
    assert_nothing_live(&mock);
}

#[tokio::test]
async fn test_copy_failure_during_issue() {
    let mock = Arc::new(MockRuntime::new(1).fail_call_after("hipMemcpyAsync", 2, 700));
    let err = run(
        &mock,
        Arc::new(StaticTopology::empty()),
        config(vec![ChannelSpec::HostToDevice { device: 0 }], 10, 1024),
    )
    .await
    .unwrap_err();

    match &err {
        EngineError::ChannelCall {
            channel,
            device,
            source,
        } => {
            assert_eq!((*channel, *device), (0, 0));
            assert_eq!(source.call, "hipMemcpyAsync");
            assert!(source.file.ends_with(".rs"));
        }
        other => panic!("unexpected error: {other}"),
    }
    // 700 keeps its low byte
    assert_eq!(err.exit_code(), (700 & 0xff) as u8);
    assert_eq!(mock.call_count("hipMemcpyAsync"), 3);
    assert_nothing_live(&mock);
}

#[tokio::test]
async fn test_zero_iterations_produce_no_measurement() {
    let mock = Arc::new(MockRuntime::new(1));
    let report = run(
        &mock,
        Arc::new(StaticTopology::empty()),
        config(vec![ChannelSpec::HostToDevice { device: 0 }], 0, 1024),
    )
    .await
    .unwrap();

    assert!(report.channels[0].measurement.is_none());
    assert_eq!(mock.call_count("hipMemcpyAsync"), 0);
    assert_eq!(mock.call_count("hipEventRecord"), 0);
    assert_nothing_live(&mock);
}

#[tokio::test]
async fn test_pageable_memory_without_numa() {
    let mock = Arc::new(MockRuntime::new(1));
    let topology = Arc::new(StaticTopology::empty().with_node(0, 0x10, 1));
    let mut config = config(vec![ChannelSpec::HostToDevice { device: 0 }], 4, 8192);
    config.policy.pinned = false;
    config.policy.numa_aware = false;

    let report = run(&mock, topology.clone(), config).await.unwrap();

    assert_eq!(report.channels[0].numa_node, None);
    assert!(topology.requests().is_empty());
    assert_eq!(mock.call_count("hipHostMalloc"), 0);
    assert_eq!(mock.call_count("hipMemcpyAsync"), 4);
}
