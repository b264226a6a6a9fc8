//! Canvas compositing and screenshot export

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbaImage};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::ExportError;
use crate::frame::Frame;
use crate::trigger::{Selection, TriggerCursor, TriggerPlan};

const JPEG_QUALITY: u8 = 90;

/// RGBA surface the frames of one recording are pasted onto.
pub struct Canvas {
    image: RgbaImage,
}

impl Canvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image: RgbaImage::new(width, height),
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Resize to `width`×`height` if the size changed. Zero sizes are ignored.
    pub fn fit(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 || self.dimensions() == (width, height) {
            return;
        }
        debug!("Resizing canvas {:?} -> {}x{}", self.dimensions(), width, height);
        self.image = imageops::resize(&self.image, width, height, FilterType::Nearest);
    }

    /// Paste the frame's image at its `(x, y)`.
    ///
    /// Returns `Ok(false)` for frames that carry no image data.
    pub fn paste(&mut self, frame: &Frame) -> Result<bool, ExportError> {
        if frame.buffer.is_empty() {
            return Ok(false);
        }
        let bytes = frame.decoded_buffer()?;
        let tile = image::load_from_memory(&bytes)?.to_rgba8();
        imageops::replace(&mut self.image, &tile, frame.x, frame.y);
        Ok(true)
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }
}

/// A screenshot written to disk.
#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    pub file_name: String,
    pub path: PathBuf,
    pub prefix: Option<String>,
    pub session_url: String,
    pub frame_index: usize,
    pub frame_timestamp: Option<i64>,
}

/// Writes canvases as JPEG files named after the job prefix.
#[derive(Debug, Clone)]
pub struct Exporter {
    out_dir: PathBuf,
    prefix: Option<String>,
    session_url: String,
}

impl Exporter {
    pub fn new(out_dir: impl Into<PathBuf>, prefix: Option<String>, session_url: impl Into<String>) -> Self {
        Self {
            out_dir: out_dir.into(),
            prefix,
            session_url: session_url.into(),
        }
    }

    pub fn file_name(&self, frame_index: usize) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}_{}_screen.jpg", prefix, frame_index),
            None => format!("{}_screen.jpg", frame_index),
        }
    }

    pub fn export(&self, canvas: &Canvas, frame_index: usize, frame_timestamp: Option<i64>) -> Result<Artifact, ExportError> {
        fs::create_dir_all(&self.out_dir)?;
        let file_name = self.file_name(frame_index);
        let path = self.out_dir.join(&file_name);

        let rgb = DynamicImage::ImageRgba8(canvas.image().clone()).to_rgb8();
        let mut writer = BufWriter::new(File::create(&path)?);
        JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY).encode_image(&rgb)?;
        writer.flush()?;

        info!("📸 Saved {:?}", path);
        Ok(Artifact {
            file_name,
            path,
            prefix: self.prefix.clone(),
            session_url: self.session_url.clone(),
            frame_index,
            frame_timestamp,
        })
    }
}

/// A frame picked by the trigger plan.
#[derive(Debug, Clone, Serialize)]
pub struct SelectedFrame {
    pub frame_index: usize,
    pub timestamp: Option<i64>,
    pub selection: Selection,
}

#[derive(Debug, Default)]
pub struct RenderSummary {
    pub selected: Vec<SelectedFrame>,
    pub artifacts: Vec<Artifact>,
    /// Frames whose image could not be decoded or saved
    pub skipped: usize,
}

/// Walk the frames in order, compose them and export the ones the plan picks.
///
/// Without an exporter only the selection is computed.
pub fn render_selected(frames: &[Frame], plan: &TriggerPlan, exporter: Option<&Exporter>) -> RenderSummary {
    let mut summary = RenderSummary::default();
    let mut cursor = TriggerCursor::new(plan);
    let mut canvas: Option<Canvas> = None;

    for (index, frame) in frames.iter().enumerate() {
        let mut pasted = true;
        if exporter.is_some() {
            let canvas = canvas.get_or_insert_with(|| Canvas::new(frame.width, frame.height));
            canvas.fit(frame.width, frame.height);
            if let Err(e) = canvas.paste(frame) {
                warn!("Unable to decode the image of frame {}: {}", index, e);
                pasted = false;
            }
        }

        let Some(selection) = cursor.accept(frame) else {
            continue;
        };
        summary.selected.push(SelectedFrame {
            frame_index: index,
            timestamp: frame.timestamp,
            selection,
        });

        if let (Some(exporter), Some(canvas)) = (exporter, canvas.as_ref()) {
            if !pasted {
                summary.skipped += 1;
            } else {
                match exporter.export(canvas, index, frame.timestamp) {
                    Ok(artifact) => summary.artifacts.push(artifact),
                    Err(e) => {
                        error!("Unable to save the image of frame {}: {}", index, e);
                        summary.skipped += 1;
                    }
                }
            }
        }

        if cursor.is_done() {
            debug!("All triggers satisfied at frame {}", index);
            break;
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Opcode;
    use base64::Engine;
    use image::{ImageFormat, Rgba};
    use std::io::Cursor;

    fn png_base64(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba(color));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();
        base64::engine::general_purpose::STANDARD.encode(bytes).into_bytes()
    }

    fn frame(timestamp: i64, x: i64, buffer: Vec<u8>) -> Frame {
        Frame {
            elements: vec![Opcode::Img, Opcode::Blob, Opcode::End, Opcode::Sync],
            buffer,
            x,
            width: 8,
            height: 4,
            timestamp: Some(timestamp),
            ..Frame::default()
        }
    }

    #[test]
    fn test_paste_places_tile() {
        let mut canvas = Canvas::new(8, 4);
        let pasted = canvas.paste(&frame(0, 4, png_base64(2, 2, [255, 0, 0, 255]))).unwrap();
        assert!(pasted);
        assert_eq!(canvas.image().get_pixel(4, 0), &Rgba([255, 0, 0, 255]));
        assert_eq!(canvas.image().get_pixel(0, 0), &Rgba([0, 0, 0, 0]));
    }

    #[test]
    fn test_fit_resizes_and_ignores_zero() {
        let mut canvas = Canvas::new(8, 4);
        canvas.fit(0, 10);
        assert_eq!(canvas.dimensions(), (8, 4));
        canvas.fit(16, 8);
        assert_eq!(canvas.dimensions(), (16, 8));
    }

    #[test]
    fn test_file_names_follow_prefix() {
        let named = Exporter::new("out", Some("250120-abc".to_string()), "https://example.org/r");
        assert_eq!(named.file_name(3), "250120-abc_3_screen.jpg");
        let bare = Exporter::new("out", None, "https://example.org/r");
        assert_eq!(bare.file_name(0), "0_screen.jpg");
    }

    #[test]
    fn test_render_exports_all_without_triggers() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = Exporter::new(dir.path(), Some("job".to_string()), "memory");
        let frames = vec![
            frame(1, 0, png_base64(2, 2, [0, 255, 0, 255])),
            frame(2, 2, png_base64(2, 2, [0, 0, 255, 255])),
        ];

        let summary = render_selected(&frames, &TriggerPlan::ExportAll, Some(&exporter));
        assert_eq!(summary.selected.len(), 2);
        assert_eq!(summary.artifacts.len(), 2);
        assert!(dir.path().join("job_0_screen.jpg").exists());
        assert!(dir.path().join("job_1_screen.jpg").exists());
        let saved = image::open(dir.path().join("job_1_screen.jpg")).unwrap();
        assert_eq!((saved.width(), saved.height()), (8, 4));
    }

    #[test]
    fn test_undecodable_frame_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = Exporter::new(dir.path(), None, "memory");
        let frames = vec![frame(1, 0, b"bm90IGFuIGltYWdl".to_vec())];

        let summary = render_selected(&frames, &TriggerPlan::ExportAll, Some(&exporter));
        assert_eq!(summary.selected.len(), 1);
        assert!(summary.artifacts.is_empty());
        assert_eq!(summary.skipped, 1);
    }

    #[test]
    fn test_selection_without_exporter() {
        let frames: Vec<Frame> = (0..=10).map(|i| frame(i * 10, 0, Vec::new())).collect();
        let plan = crate::trigger::plan(&crate::trigger::frame_timestamps(&frames), &[4, 50, 99]);
        let summary = render_selected(&frames, &plan, None);
        let indices: Vec<usize> = summary.selected.iter().map(|s| s.frame_index).collect();
        assert_eq!(indices, vec![1, 5, 10]);
        assert!(summary.artifacts.is_empty());
    }
}
