//! Engine error taxonomy
//!
//! Every variant is fatal for the run. Library code only returns these; the
//! binary decides how the process ends through [`EngineError::exit_code`].

use std::fmt;

use hits_gpu::{DeviceId, RuntimeError};
use thiserror::Error;

use crate::channel::ChannelState;

/// Exit status for configuration and capability failures
pub const EXIT_FAILURE: u8 = 1;

/// Exit status of a process killed by SIGABRT, used for allocation failures
pub const EXIT_ABORT: u8 = 134;

/// Kind of memory an allocation targeted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Device,
    PinnedHost,
    PageableHost,
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MemoryKind::Device => "device",
            MemoryKind::PinnedHost => "pinned host",
            MemoryKind::PageableHost => "pageable host",
        })
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed or incomplete run configuration
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The two devices of a peer channel cannot access each other
    #[error("transfer {channel}: P2P cannot be enabled between devices {device} and {peer}")]
    PeerAccessUnsupported {
        channel: usize,
        device: DeviceId,
        peer: DeviceId,
    },

    /// An allocation call succeeded but handed back no memory
    #[error("transfer {channel}: cannot allocate {bytes} bytes of {memory} memory")]
    Allocation {
        channel: usize,
        memory: MemoryKind,
        bytes: usize,
    },

    /// A runtime call made on behalf of a channel failed
    #[error("transfer {channel} (device {device}): {source}")]
    ChannelCall {
        channel: usize,
        device: DeviceId,
        #[source]
        source: RuntimeError,
    },

    /// A runtime call not tied to any channel failed
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// A channel was driven out of its lifecycle order
    #[error("transfer {channel}: cannot {action} while {state:?}")]
    InvalidState {
        channel: usize,
        action: &'static str,
        state: ChannelState,
    },

    /// The blocking worker running the orchestrator died
    #[error("orchestrator worker failed: {0}")]
    Worker(String),
}

impl EngineError {
    /// Process exit status for this failure
    pub fn exit_code(&self) -> u8 {
        match self {
            EngineError::Configuration(_) | EngineError::PeerAccessUnsupported { .. } => {
                EXIT_FAILURE
            }
            EngineError::Allocation { .. } => EXIT_ABORT,
            EngineError::ChannelCall { source, .. } | EngineError::Runtime(source) => {
                source.exit_status()
            }
            EngineError::InvalidState { .. } | EngineError::Worker(_) => EXIT_FAILURE,
        }
    }

    /// The underlying runtime failure, if any
    pub fn runtime_error(&self) -> Option<&RuntimeError> {
        match self {
            EngineError::ChannelCall { source, .. } | EngineError::Runtime(source) => Some(source),
            _ => None,
        }
    }
}

/// Attach channel context to runtime results
pub(crate) trait ChannelContext<T> {
    fn on_channel(self, channel: usize, device: DeviceId) -> Result<T, EngineError>;
}

impl<T> ChannelContext<T> for hits_gpu::Result<T> {
    fn on_channel(self, channel: usize, device: DeviceId) -> Result<T, EngineError> {
        self.map_err(|source| EngineError::ChannelCall {
            channel,
            device,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(EngineError::Configuration("x".into()).exit_code(), 1);
        assert_eq!(
            EngineError::PeerAccessUnsupported {
                channel: 0,
                device: 1,
                peer: 0
            }
            .exit_code(),
            1
        );
        assert_eq!(
            EngineError::Allocation {
                channel: 0,
                memory: MemoryKind::PageableHost,
                bytes: 1024
            }
            .exit_code(),
            134
        );

        let call = EngineError::ChannelCall {
            channel: 2,
            device: 1,
            source: RuntimeError::new("hipMemcpyAsync", 101, "invalid device ordinal"),
        };
        assert_eq!(call.exit_code(), 101);
        assert_eq!(call.runtime_error().map(|e| e.call), Some("hipMemcpyAsync"));
    }

    #[test]
    fn test_channel_context_names_channel_and_device() {
        let result: hits_gpu::Result<()> = Err(RuntimeError::new("hipMalloc", 2, "out of memory"));
        let err = result.on_channel(3, 1).unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("transfer 3 (device 1): hipMalloc failed"));
    }
}
