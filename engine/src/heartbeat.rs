//! Progress heartbeat

use std::io::Write;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Time between two progress markers
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

const MARKER: &[u8] = b".";

/// Background task printing a marker every interval until stopped.
///
/// The marker stream is informational only; a failing sink never affects the
/// run.
pub struct Heartbeat {
    token: CancellationToken,
    handle: JoinHandle<u64>,
}

impl Heartbeat {
    /// Start beating on the current tokio runtime
    pub fn spawn<W>(interval: Duration, mut sink: W) -> Self
    where
        W: Write + Send + 'static,
    {
        let token = CancellationToken::new();
        let stop = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;

            let mut beats = 0u64;
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        beats += 1;
                        if let Err(e) = sink.write_all(MARKER).and_then(|_| sink.flush()) {
                            debug!("Heartbeat write failed: {}", e);
                        }
                    }
                }
            }
            beats
        });

        Self { token, handle }
    }

    /// Completion signal observed by the task
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Signal completion and wait for the task, returning how many markers it
    /// emitted
    pub async fn stop(self) -> u64 {
        self.token.cancel();
        match self.handle.await {
            Ok(beats) => beats,
            Err(e) => {
                debug!("Heartbeat task ended abnormally: {}", e);
                0
            }
        }
    }
}
