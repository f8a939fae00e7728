use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use image::ColorType;
use image::codecs::jpeg::JpegEncoder;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use x11rb::connection::Connection;
use x11rb::protocol::xproto::{self, ImageFormat};
use x11rb::rust_connection::RustConnection;

/// Encoded chunks buffered between the capture thread and the collector.
const CHUNK_BUFFER: usize = 32;

#[derive(Debug, thiserror::Error)]
pub(crate) enum CaptureError {
    #[error("display capture unavailable: {0}")]
    Unavailable(String),
    #[error("unsupported display: {0}")]
    Unsupported(String),
    #[error("failed to start capture thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Stop switch shared between a capture stream and its producer.
#[derive(Debug, Clone, Default)]
pub(crate) struct CaptureTracks {
    stopped: Arc<AtomicBool>,
}

impl CaptureTracks {
    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// A granted capture. Chunks end once the tracks are stopped and the
/// producer has flushed.
pub(crate) struct CaptureStream {
    pub chunks: mpsc::Receiver<Vec<u8>>,
    pub tracks: CaptureTracks,
    /// File extension of the concatenated chunks.
    pub extension: &'static str,
}

/// Source of local display frames. `request` is where the user grants (or
/// the system denies) access to the display.
#[async_trait]
pub(crate) trait DisplayCapture: Send {
    async fn request(&mut self) -> Result<CaptureStream, CaptureError>;
}

/// Captures the local X11 root window as a Motion-JPEG stream.
pub(crate) struct X11DisplayCapture {
    display: String,
    framerate: u32,
    jpeg_quality: u8,
}

impl X11DisplayCapture {
    pub(crate) fn new(display: &str, framerate: u32, jpeg_quality: u8) -> Self {
        Self {
            display: display.to_string(),
            framerate: framerate.max(1),
            jpeg_quality,
        }
    }
}

#[async_trait]
impl DisplayCapture for X11DisplayCapture {
    async fn request(&mut self) -> Result<CaptureStream, CaptureError> {
        let display = self.display.clone();
        let grabber = tokio::task::spawn_blocking(move || RootGrabber::connect(&display))
            .await
            .map_err(|e| CaptureError::Unavailable(e.to_string()))??;

        let (tx, chunks) = mpsc::channel(CHUNK_BUFFER);
        let tracks = CaptureTracks::default();
        let stop = tracks.clone();
        let interval = Duration::from_secs(1) / self.framerate;
        let quality = self.jpeg_quality;
        std::thread::Builder::new()
            .name("display-capture".to_string())
            .spawn(move || grabber.run(tx, stop, interval, quality))
            .map_err(CaptureError::Spawn)?;

        Ok(CaptureStream {
            chunks,
            tracks,
            extension: "mjpeg",
        })
    }
}

/// Plain `GetImage` grabs of the root window. No SHM: a viewer records at a
/// handful of frames per second, where the copy cost does not matter.
struct RootGrabber {
    conn: RustConnection,
    root: xproto::Window,
    width: u16,
    height: u16,
}

impl RootGrabber {
    fn connect(display: &str) -> Result<Self, CaptureError> {
        let (conn, screen_num) = RustConnection::connect(Some(display))
            .map_err(|e| CaptureError::Unavailable(format!("{display}: {e}")))?;
        let screen = &conn.setup().roots[screen_num];
        if !matches!(screen.root_depth, 24 | 32) {
            return Err(CaptureError::Unsupported(format!(
                "depth {} (need 24 or 32)",
                screen.root_depth
            )));
        }
        let (root, width, height) = (screen.root, screen.width_in_pixels, screen.height_in_pixels);
        let display_name = display;
        info!(display = display_name, width, height, "Display capture connected");
        Ok(Self {
            conn,
            root,
            width,
            height,
        })
    }

    fn grab(&self) -> anyhow::Result<Vec<u8>> {
        let reply = xproto::get_image(
            &self.conn,
            ImageFormat::Z_PIXMAP,
            self.root,
            0,
            0,
            self.width,
            self.height,
            !0,
        )?
        .reply()?;
        Ok(reply.data)
    }

    fn run(self, tx: mpsc::Sender<Vec<u8>>, stop: CaptureTracks, interval: Duration, quality: u8) {
        let mut frames = 0u64;
        while !stop.is_stopped() {
            let started = Instant::now();
            let chunk = self
                .grab()
                .and_then(|bgrx| encode_bgrx_jpeg(&bgrx, self.width.into(), self.height.into(), quality));
            match chunk {
                Ok(jpeg) => {
                    if tx.blocking_send(jpeg).is_err() {
                        break;
                    }
                    frames += 1;
                }
                Err(e) => {
                    warn!("Display capture failed: {e:#}");
                    break;
                }
            }
            if let Some(rest) = interval.checked_sub(started.elapsed()) {
                std::thread::sleep(rest);
            }
        }
        let _ = self.conn.flush();
        debug!(frames, "Display capture stopped");
    }
}

/// Encode an X11 depth-24/32 frame (BGRx, padding byte ignored) as JPEG.
fn encode_bgrx_jpeg(bgrx: &[u8], width: u32, height: u32, quality: u8) -> anyhow::Result<Vec<u8>> {
    let expected = width as usize * height as usize * 4;
    anyhow::ensure!(
        bgrx.len() >= expected,
        "short frame: {} bytes, expected {expected}",
        bgrx.len()
    );
    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
    for px in bgrx[..expected].chunks_exact(4) {
        rgb.extend_from_slice(&[px[2], px[1], px[0]]);
    }
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality).encode(&rgb, width, height, ColorType::Rgb8)?;
    Ok(out)
}
