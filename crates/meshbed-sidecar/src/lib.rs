//! # meshbed-sidecar
//!
//! The per-container network sidecar daemon.
//!
//! Events are read as JSON lines, routed to one [`Supervisor`] unit per
//! container and reported to a [`StatusSink`].

#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod event;
pub mod status;
pub mod supervisor;

use meshbed_common::MeshbedPaths;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;

pub use config::{RetryConfig, SidecarConfig};
pub use event::{Event, NetnsRef};
pub use status::{LogSink, Outcome, StatusReport, StatusSink};
pub use supervisor::{BackendFactory, NetnsFactory, Supervisor};

/// Feed events from `reader` to `supervisor` until end of input or `shutdown`.
///
/// Malformed lines are logged and skipped. Every unit is released before
/// returning.
///
/// # Errors
///
/// Returns an error if reading the input fails.
pub async fn serve<R>(
    reader: R,
    supervisor: &mut Supervisor,
    paths: &MeshbedPaths,
    shutdown: CancellationToken,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();

    let result = loop {
        let line = tokio::select! {
            () = shutdown.cancelled() => break Ok(()),
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };
        if line.trim().is_empty() {
            continue;
        }

        match Event::from_line(&line) {
            Ok(Event::Configure {
                container_id,
                netns,
                config,
            }) => {
                supervisor.configure(container_id, netns.resolve(paths), config);
            }
            Ok(Event::Release { container_id }) => supervisor.release(&container_id),
            Err(e) => tracing::warn!(error = %e, "Skipping malformed event"),
        }
    };

    supervisor.shutdown().await;
    result
}
