use std::path::Path;

use anyhow::Context;
use image::imageops::FilterType;
use image::{ImageFormat, Rgba, RgbaImage};
use relaydesk_protocol::{EncodedFrame, FrameError, FrameFormat};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Decodes allowed to run at once. A frame arriving beyond this waits in a
/// single pending slot, replacing whatever was parked there.
pub(crate) const MAX_DECODES_IN_FLIGHT: usize = 4;

const BLANK: Rgba<u8> = Rgba([0, 0, 0, 255]);

#[derive(Debug, thiserror::Error)]
pub(crate) enum RenderError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("decode task failed: {0}")]
    Task(String),
}

/// Fixed-resolution RGBA surface the host's screen is painted onto.
pub(crate) struct Canvas {
    image: RgbaImage,
    painted: bool,
}

impl Canvas {
    fn new(width: u32, height: u32) -> Self {
        Self {
            image: RgbaImage::from_pixel(width, height, BLANK),
            painted: false,
        }
    }

    pub(crate) fn size(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    #[cfg(test)]
    pub(crate) fn image(&self) -> &RgbaImage {
        &self.image
    }

    /// True once a frame has been painted since the last clear.
    pub(crate) fn has_frame(&self) -> bool {
        self.painted
    }

    fn clear(&mut self) {
        for pixel in self.image.pixels_mut() {
            *pixel = BLANK;
        }
        self.painted = false;
    }
}

/// A finished decode, delivered back to the event loop.
#[derive(Debug)]
pub(crate) struct DecodedFrame {
    seq: u64,
    result: Result<RgbaImage, RenderError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubmitOutcome {
    Queued(u64),
    /// Parked until a decode slot frees up.
    Pending,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PaintOutcome {
    Painted(u64),
    /// Superseded by a newer frame or invalidated by a reset.
    Stale(u64),
    Failed(String),
}

pub(crate) struct FrameRenderer {
    canvas: Canvas,
    decoded_tx: mpsc::UnboundedSender<DecodedFrame>,
    next_seq: u64,
    painted_seq: u64,
    /// Completions with a sequence at or below this predate the last reset.
    discard_through: u64,
    in_flight: usize,
    /// Newest frame that arrived while the decoder was saturated.
    pending: Option<String>,
}

impl FrameRenderer {
    pub(crate) fn new(width: u32, height: u32) -> (Self, mpsc::UnboundedReceiver<DecodedFrame>) {
        let (decoded_tx, decoded_rx) = mpsc::unbounded_channel();
        let renderer = Self {
            canvas: Canvas::new(width, height),
            decoded_tx,
            next_seq: 0,
            painted_seq: 0,
            discard_through: 0,
            in_flight: 0,
            pending: None,
        };
        (renderer, decoded_rx)
    }

    pub(crate) fn canvas(&self) -> &Canvas {
        &self.canvas
    }

    /// Start decoding a `screen-data` payload on the blocking pool.
    pub(crate) fn submit(&mut self, image_data: String) -> SubmitOutcome {
        if self.in_flight >= MAX_DECODES_IN_FLIGHT {
            if self.pending.replace(image_data).is_some() {
                debug!(in_flight = self.in_flight, "Decoder busy, replacing pending frame");
            }
            return SubmitOutcome::Pending;
        }
        SubmitOutcome::Queued(self.spawn_decode(image_data))
    }

    fn spawn_decode(&mut self, image_data: String) -> u64 {
        self.next_seq += 1;
        self.in_flight += 1;
        let seq = self.next_seq;
        let (width, height) = self.canvas.size();
        let tx = self.decoded_tx.clone();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || decode_frame(&image_data, width, height))
                .await
                .unwrap_or_else(|e| Err(RenderError::Task(e.to_string())));
            // Receiver is gone only during shutdown
            let _ = tx.send(DecodedFrame { seq, result });
        });
        seq
    }

    /// Paint a completed decode, unless something newer already landed.
    pub(crate) fn paint(&mut self, frame: DecodedFrame) -> PaintOutcome {
        self.in_flight = self.in_flight.saturating_sub(1);
        if let Some(image_data) = self.pending.take() {
            self.spawn_decode(image_data);
        }
        if frame.seq <= self.painted_seq || frame.seq <= self.discard_through {
            debug!(seq = frame.seq, painted = self.painted_seq, "Discarding stale frame");
            return PaintOutcome::Stale(frame.seq);
        }
        match frame.result {
            Ok(image) => {
                self.canvas.image = image;
                self.canvas.painted = true;
                self.painted_seq = frame.seq;
                PaintOutcome::Painted(frame.seq)
            }
            Err(e) => {
                warn!(seq = frame.seq, "Dropping undecodable frame: {e}");
                PaintOutcome::Failed(e.to_string())
            }
        }
    }

    /// Blank the canvas and invalidate decodes still in flight.
    pub(crate) fn reset(&mut self) {
        self.discard_through = self.next_seq;
        self.pending = None;
        self.canvas.clear();
    }

    /// Save the current canvas as PNG.
    pub(crate) fn snapshot(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        self.canvas
            .image
            .save_with_format(path, ImageFormat::Png)
            .with_context(|| format!("Failed to write snapshot to {}", path.display()))?;
        Ok(())
    }
}

fn image_format(format: FrameFormat) -> ImageFormat {
    match format {
        FrameFormat::Jpeg => ImageFormat::Jpeg,
        FrameFormat::Png => ImageFormat::Png,
        FrameFormat::WebP => ImageFormat::WebP,
        FrameFormat::Bmp => ImageFormat::Bmp,
        FrameFormat::Gif => ImageFormat::Gif,
    }
}

/// Decode a frame payload and scale it to the canvas size.
fn decode_frame(image_data: &str, width: u32, height: u32) -> Result<RgbaImage, RenderError> {
    let frame = EncodedFrame::parse(image_data)?;
    let decoded = image::load_from_memory_with_format(&frame.bytes, image_format(frame.format))?;
    if decoded.width() == width && decoded.height() == height {
        return Ok(decoded.into_rgba8());
    }
    Ok(decoded.resize_exact(width, height, FilterType::Triangle).into_rgba8())
}
