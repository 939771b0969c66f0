//! Upload validation, decoding and JPEG encoding
//!
//! Everything here is a pure function over byte buffers except
//! [`load_image`] and [`save_image`], which the CLI uses for files on disk.
//! Validation and decoding are separate checks: a payload can carry an
//! accepted extension and still fail to decode.

use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, ImageReader, Rgb, RgbImage};
use ndarray::ArrayView3;
use retina_common::{BlendedImage, DecodedImage, ScreeningError};
use std::collections::BTreeSet;
use std::fs;
use std::io::Cursor;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Errors that can occur during image I/O operations
#[derive(Error, Debug)]
pub enum ImageIoError {
    #[error("Failed to read image file: {0}")]
    ReadError(String),

    #[error("Failed to decode image: {0}")]
    DecodeError(String),

    #[error("Failed to encode image: {0}")]
    EncodeError(String),

    #[error("Failed to write image file: {0}")]
    WriteError(String),

    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("Upload of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
}

impl From<ImageIoError> for ScreeningError {
    fn from(err: ImageIoError) -> Self {
        match err {
            ImageIoError::UnsupportedFormat(_) | ImageIoError::TooLarge { .. } => {
                ScreeningError::Validation(err.to_string())
            }
            ImageIoError::DecodeError(_) => ScreeningError::Decode(err.to_string()),
            ImageIoError::EncodeError(_) => ScreeningError::Encode(err.to_string()),
            ImageIoError::ReadError(_) | ImageIoError::WriteError(_) => {
                ScreeningError::IoError(std::io::Error::other(err.to_string()))
            }
        }
    }
}

/// Lowercase extension of an upload's filename
#[must_use]
pub fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
}

/// Extension check alone, without looking at the payload
#[must_use]
pub fn has_allowed_extension(filename: &str, allowed: &BTreeSet<String>) -> bool {
    extension_of(filename).is_some_and(|ext| allowed.contains(&ext))
}

/// True only if the extension is accepted AND the bytes parse as an image
///
/// Reads the header only; a payload truncated after the header passes here
/// and fails later in [`decode`].
#[must_use]
pub fn validate(bytes: &[u8], filename: &str, allowed: &BTreeSet<String>) -> bool {
    if !has_allowed_extension(filename, allowed) {
        return false;
    }
    let reader = match ImageReader::new(Cursor::new(bytes)).with_guessed_format() {
        Ok(reader) if reader.format().is_some() => reader,
        _ => return false,
    };
    reader.into_dimensions().is_ok()
}

/// Reject uploads above `limit` bytes
///
/// # Errors
/// `ImageIoError::TooLarge`
pub fn check_size(bytes: &[u8], limit: usize) -> Result<(), ImageIoError> {
    if bytes.len() > limit {
        return Err(ImageIoError::TooLarge {
            size: bytes.len(),
            limit,
        });
    }
    Ok(())
}

/// Decode to 3-channel RGB; alpha is dropped and grayscale expanded
///
/// # Errors
/// `ImageIoError::DecodeError` if the bytes are not a supported image
pub fn decode(bytes: &[u8]) -> Result<DecodedImage, ImageIoError> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| ImageIoError::DecodeError(e.to_string()))?;
    let rgb = img.to_rgb8();
    if rgb.width() == 0 || rgb.height() == 0 {
        return Err(ImageIoError::DecodeError("image has no pixels".into()));
    }
    debug!("Decoded {}x{} {:?} image", rgb.width(), rgb.height(), img.color());
    Ok(DecodedImage::new(rgb))
}

/// Encode a blended heatmap as JPEG
///
/// # Errors
/// `ImageIoError::EncodeError` if the image is empty or the encoder fails
pub fn encode(image: &BlendedImage, quality: u8) -> Result<Vec<u8>, ImageIoError> {
    encode_jpeg(image.as_rgb(), quality)
}

/// Encode any RGB image as JPEG
///
/// # Errors
/// `ImageIoError::EncodeError` if the image is empty or the encoder fails
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, ImageIoError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(ImageIoError::EncodeError(format!(
            "cannot encode a {}x{} image",
            image.width(),
            image.height()
        )));
    }

    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|e| ImageIoError::EncodeError(e.to_string()))?;
    Ok(buffer)
}

/// Encode a raw (H, W, C) byte array; only C = 3 (RGB) is accepted
///
/// # Errors
/// `ImageIoError::EncodeError` on a wrong channel count or an empty array
pub fn encode_array(array: ArrayView3<u8>, quality: u8) -> Result<Vec<u8>, ImageIoError> {
    let (height, width, channels) = array.dim();
    if channels != 3 {
        return Err(ImageIoError::EncodeError(format!(
            "expected 3 channels, got {channels}"
        )));
    }
    let (w, h) = match (u32::try_from(width), u32::try_from(height)) {
        (Ok(w), Ok(h)) => (w, h),
        _ => {
            return Err(ImageIoError::EncodeError(format!(
                "{width}x{height} exceeds encoder limits"
            )))
        }
    };
    let image = RgbImage::from_fn(w, h, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb([array[[y, x, 0]], array[[y, x, 1]], array[[y, x, 2]]])
    });
    encode_jpeg(&image, quality)
}

/// Read and decode an image file
///
/// # Errors
/// Returns error if the file cannot be read or decoded
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<DecodedImage, ImageIoError> {
    let path = path.as_ref();
    let bytes = fs::read(path)
        .map_err(|e| ImageIoError::ReadError(format!("{}: {e}", path.display())))?;
    decode(&bytes)
}

/// Save an RGB image, JPEG or PNG by extension
///
/// # Errors
/// Returns error on an unsupported extension, encoder or write failure
pub fn save_image<P: AsRef<Path>>(image: &RgbImage, path: P, quality: u8) -> Result<(), ImageIoError> {
    let path = path.as_ref();
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    match extension.as_str() {
        "jpg" | "jpeg" => {
            let bytes = encode_jpeg(image, quality)?;
            fs::write(path, bytes)
                .map_err(|e| ImageIoError::WriteError(format!("{}: {e}", path.display())))
        }
        "png" => image
            .save_with_format(path, ImageFormat::Png)
            .map_err(|e| ImageIoError::WriteError(format!("{}: {e}", path.display()))),
        other => Err(ImageIoError::UnsupportedFormat(other.to_string())),
    }
}
