use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use relaydesk_protocol::{ClientEvent, RecordingComplete, RecordingControl, RecordingStatus};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::capture::{CaptureError, CaptureStream, CaptureTracks, DisplayCapture};
use crate::transport::Transport;

#[derive(Debug, thiserror::Error)]
pub(crate) enum RecordingError {
    #[error("A recording is already in progress")]
    AlreadyActive,
    #[error("No recording in progress")]
    NotActive,
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("Failed to save recording: {0:#}")]
    Save(anyhow::Error),
}

/// A finished local recording on disk.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RecordingArtifact {
    pub id: Uuid,
    pub duration: Duration,
    pub file_size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub blob_ref: PathBuf,
}

struct ActiveRecording {
    started: Instant,
    started_at: DateTime<Utc>,
    tracks: CaptureTracks,
    extension: &'static str,
    collector: JoinHandle<anyhow::Result<Spooled>>,
    /// Fires when the capture ends without a stop request.
    interrupted: oneshot::Receiver<()>,
}

/// Chunks written so far into a hidden file in the output dir.
#[derive(Default)]
struct Spooled {
    path: Option<PathBuf>,
    bytes: u64,
}

/// Records the viewer's own display. At most one capture is live at a time.
pub(crate) struct RecordingManager {
    capture: Box<dyn DisplayCapture>,
    output_dir: PathBuf,
    active: Option<ActiveRecording>,
    artifacts: Vec<RecordingArtifact>,
}

impl RecordingManager {
    pub(crate) fn new(capture: Box<dyn DisplayCapture>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            capture,
            output_dir: output_dir.into(),
            active: None,
            artifacts: Vec::new(),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Artifacts produced during this run, oldest first.
    pub(crate) fn artifacts(&self) -> &[RecordingArtifact] {
        &self.artifacts
    }

    pub(crate) async fn start_local(&mut self) -> Result<(), RecordingError> {
        if self.active.is_some() {
            return Err(RecordingError::AlreadyActive);
        }
        let CaptureStream {
            chunks: mut chunk_rx,
            tracks,
            extension,
        } = self.capture.request().await?;
        let (interrupted_tx, interrupted) = oneshot::channel();
        let collector = tokio::spawn(collect(
            chunk_rx,
            tracks.clone(),
            self.output_dir.clone(),
            interrupted_tx,
        ));
        self.active = Some(ActiveRecording {
            started: Instant::now(),
            started_at: Utc::now(),
            tracks,
            extension,
            collector,
            interrupted,
        });
        info!("Local recording started");
        Ok(())
    }

    /// Resolves once the active capture ends on its own, e.g. the display
    /// went away. Never resolves while idle.
    pub(crate) async fn interrupted(&mut self) {
        match self.active.as_mut() {
            // A dropped sender means the collector died, which ends the recording too
            Some(active) => {
                let _ = (&mut active.interrupted).await;
            }
            None => std::future::pending().await,
        }
    }

    /// Stop capturing, drain what was buffered and write the artifact.
    /// Returns `None` when nothing was captured.
    pub(crate) async fn stop_local(&mut self) -> Result<Option<RecordingArtifact>, RecordingError> {
        let active = self.active.take().ok_or(RecordingError::NotActive)?;
        active.tracks.stop();
        let duration = active.started.elapsed();
        let spooled = active
            .collector
            .await
            .context("Recording collector failed")
            .and_then(|r| r)
            .map_err(RecordingError::Save)?;

        let spool = match spooled.path {
            Some(path) if spooled.bytes > 0 => path,
            leftover => {
                if let Some(path) = leftover {
                    let _ = tokio::fs::remove_file(path).await;
                }
                warn!("Local recording stopped with no captured data");
                return Ok(None);
            }
        };

        let name = format!(
            "recording-{}.{}",
            active.started_at.format("%Y%m%d-%H%M%S"),
            active.extension
        );
        let path = unique_path(&self.output_dir, &name);
        tokio::fs::rename(&spool, &path)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
            .map_err(RecordingError::Save)?;
        let artifact = RecordingArtifact {
            id: Uuid::new_v4(),
            duration,
            file_size_bytes: spooled.bytes,
            created_at: Utc::now(),
            blob_ref: path,
        };
        info!(
            id = %artifact.id,
            path = %artifact.blob_ref.display(),
            bytes = artifact.file_size_bytes,
            secs = artifact.duration.as_secs_f64(),
            "Local recording saved"
        );
        self.artifacts.push(artifact.clone());
        Ok(Some(artifact))
    }
}

/// Drain the capture stream into a spool file, then report whether the
/// stream ended without a stop request.
async fn collect(
    mut chunk_rx: mpsc::Receiver<Vec<u8>>,
    tracks: CaptureTracks,
    dir: PathBuf,
    interrupted: oneshot::Sender<()>,
) -> anyhow::Result<Spooled> {
    let mut spooled = Spooled::default();
    let result = spool_chunks(&mut chunk_rx, &dir, &mut spooled).await;
    // Stops the producer if spooling failed early
    drop(chunk_rx);
    if result.is_err() || !tracks.is_stopped() {
        let _ = interrupted.send(());
    }
    match result {
        Ok(()) => Ok(spooled),
        Err(e) => {
            if let Some(path) = &spooled.path {
                let _ = tokio::fs::remove_file(path).await;
            }
            Err(e)
        }
    }
}

async fn spool_chunks(
    chunk_rx: &mut mpsc::Receiver<Vec<u8>>,
    dir: &Path,
    spooled: &mut Spooled,
) -> anyhow::Result<()> {
    let mut file: Option<tokio::fs::File> = None;
    while let Some(chunk) = chunk_rx.recv().await {
        if file.is_none() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            let path = dir.join(format!(".recording-{}.part", Uuid::new_v4()));
            let created = tokio::fs::File::create(&path)
                .await
                .with_context(|| format!("Failed to create {}", path.display()))?;
            spooled.path = Some(path);
            file = Some(created);
        }
        if let Some(f) = file.as_mut() {
            f.write_all(&chunk)
                .await
                .context("Failed to write recording chunk")?;
        }
        spooled.bytes += chunk.len() as u64;
    }
    if let Some(mut f) = file {
        f.flush().await.context("Failed to flush recording")?;
    }
    Ok(())
}

/// Returns a non-existing path in `dir`, appending `(N)` before the
/// extension on collision.
fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let stem = Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name);
    let ext = Path::new(name).extension().and_then(|e| e.to_str());
    for i in 1..=999 {
        let new_name = match ext {
            Some(e) => format!("{stem}({i}).{e}"),
            None => format!("{stem}({i})"),
        };
        let candidate = dir.join(new_name);
        if !candidate.exists() {
            return candidate;
        }
    }
    dir.join(format!("{}-{name}", Uuid::new_v4()))
}

/// Host-side recording as reported by the host.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum HostRecordingState {
    Idle,
    Requested,
    Recording { status: String, progress: Option<f64> },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum HostRecordingUpdate {
    Progress { status: String, progress: Option<f64> },
    Stopped,
    Failed(String),
}

/// Tracks a recording the host performs on its own screen.
pub(crate) struct HostRecording {
    transport: Arc<dyn Transport>,
    state: HostRecordingState,
}

impl HostRecording {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            state: HostRecordingState::Idle,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> &HostRecordingState {
        &self.state
    }

    pub(crate) fn start(&mut self, host_id: &str) -> Result<(), RecordingError> {
        if self.state != HostRecordingState::Idle {
            return Err(RecordingError::AlreadyActive);
        }
        self.transport.send(ClientEvent::StartRecording(RecordingControl {
            to: host_id.to_string(),
        }));
        self.state = HostRecordingState::Requested;
        Ok(())
    }

    pub(crate) fn stop(&mut self, host_id: &str) -> Result<(), RecordingError> {
        if self.state == HostRecordingState::Idle {
            return Err(RecordingError::NotActive);
        }
        self.transport.send(ClientEvent::StopRecording(RecordingControl {
            to: host_id.to_string(),
        }));
        Ok(())
    }

    pub(crate) fn on_status(&mut self, status: RecordingStatus) -> HostRecordingUpdate {
        if let Some(error) = status.error {
            self.state = HostRecordingState::Idle;
            return HostRecordingUpdate::Failed(error);
        }
        match status.status.as_str() {
            "error" => {
                self.state = HostRecordingState::Idle;
                HostRecordingUpdate::Failed("Host recording failed".to_string())
            }
            "stopped" | "idle" => {
                self.state = HostRecordingState::Idle;
                HostRecordingUpdate::Stopped
            }
            _ => {
                self.state = HostRecordingState::Recording {
                    status: status.status.clone(),
                    progress: status.progress,
                };
                HostRecordingUpdate::Progress {
                    status: status.status,
                    progress: status.progress,
                }
            }
        }
    }

    pub(crate) fn on_complete(&mut self, complete: &RecordingComplete) {
        info!(
            recording_id = %complete.recording_id,
            path = %complete.file_path,
            bytes = complete.file_size,
            "Host recording complete"
        );
        self.state = HostRecordingState::Idle;
    }

    /// Forget host-side state when the session ends.
    pub(crate) fn reset(&mut self) {
        self.state = HostRecordingState::Idle;
    }
}
