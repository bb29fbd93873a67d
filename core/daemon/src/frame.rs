//! Latest-frame buffer.
//!
//! Uploads are decoded before the state guard is taken so a bad payload can
//! never replace the stored frame.

use axum::body::Bytes;
use image::{GenericImageView, ImageFormat};

use crate::error::DaemonError;

/// A frame that passed the codec check but is not yet stored.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub bytes: Bytes,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub seq: u64,
    pub bytes: Bytes,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub received_at: String,
}

impl Frame {
    pub fn content_type(&self) -> &'static str {
        self.format.to_mime_type()
    }
}

pub fn decode_frame(bytes: Bytes, max_bytes: usize) -> Result<DecodedFrame, DaemonError> {
    if bytes.is_empty() {
        return Err(DaemonError::InvalidFrame("frame body was empty".to_string()));
    }
    if bytes.len() > max_bytes {
        return Err(DaemonError::InvalidFrame(format!(
            "frame of {} bytes exceeds limit of {} bytes",
            bytes.len(),
            max_bytes
        )));
    }

    let format = image::guess_format(&bytes)
        .map_err(|err| DaemonError::InvalidFrame(format!("unrecognized image format: {}", err)))?;
    let image = image::load_from_memory_with_format(&bytes, format)
        .map_err(|err| DaemonError::InvalidFrame(format!("failed to decode image: {}", err)))?;
    let (width, height) = image.dimensions();

    Ok(DecodedFrame {
        bytes,
        format,
        width,
        height,
    })
}

#[derive(Debug, Default)]
pub struct FrameStore {
    latest: Option<Frame>,
    next_seq: u64,
}

impl FrameStore {
    /// Replaces the latest frame. Only called with already-decoded input.
    pub fn store(&mut self, decoded: DecodedFrame, received_at: String) -> &Frame {
        self.next_seq += 1;
        self.latest.insert(Frame {
            seq: self.next_seq,
            bytes: decoded.bytes,
            format: decoded.format,
            width: decoded.width,
            height: decoded.height,
            received_at,
        })
    }

    pub fn latest(&self) -> Option<&Frame> {
        self.latest.as_ref()
    }
}
