//! Fundus image preprocessing for the severity classifier
//!
//! Turns a decoded upload into the model's normalized CHW tensor, and into the
//! plain resized image the explanation is later drawn on.
//!
//! # Pipeline (fixed order)
//! 1. Resize to `input_size x input_size` with linear (triangle) filtering;
//!    aspect ratio is not preserved
//! 2. CLAHE on the L* channel in L*a*b* space, a*/b* untouched
//! 3. Scale to [0, 1], then `(x - mean_c) / std_c` per channel
//! 4. HWC -> CHW
//!
//! # Example
//! ```no_run
//! use retina_common::{DecodedImage, ScreeningConfig};
//! use retina_preprocessing::Preprocessor;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let preprocessor = Preprocessor::new(&ScreeningConfig::default());
//! let decoded = DecodedImage::new(image::open("fundus.jpg")?.to_rgb8());
//!
//! let tensor = preprocessor.preprocess(&decoded)?;
//! assert_eq!(tensor.shape(), (3, 224, 224));
//! # Ok(())
//! # }
//! ```

pub mod clahe;
pub mod lab;

use image::imageops::FilterType;
use image::{GrayImage, Luma, RgbImage};
use ndarray::Array3;
use retina_common::{DecodedImage, ModelTensor, ScreeningConfig, ScreeningError, VisualizationImage};
use thiserror::Error;
use tracing::debug;

pub use clahe::Clahe;
pub use lab::Lab;

/// Errors that can occur during preprocessing
#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("Image has no pixels ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },

    #[error("Invalid tensor: {0}")]
    InvalidTensor(String),
}

impl From<PreprocessError> for ScreeningError {
    fn from(err: PreprocessError) -> Self {
        match err {
            PreprocessError::EmptyImage { .. } => ScreeningError::Validation(err.to_string()),
            PreprocessError::InvalidTensor(_) => ScreeningError::Inference(err.to_string()),
        }
    }
}

/// Deterministic resize / enhance / normalize pipeline
#[derive(Debug, Clone)]
pub struct Preprocessor {
    input_size: u32,
    clahe: Clahe,
    mean: [f32; 3],
    std: [f32; 3],
}

impl Preprocessor {
    /// Build from the process configuration
    #[must_use]
    pub fn new(config: &ScreeningConfig) -> Self {
        Self {
            input_size: config.input_size,
            clahe: Clahe::new(config.clahe_clip_limit, config.clahe_tile_grid),
            mean: config.normalize_mean,
            std: config.normalize_std,
        }
    }

    #[must_use]
    pub fn input_size(&self) -> u32 {
        self.input_size
    }

    /// Full pipeline: resize, CLAHE, normalize, transpose to (3, H, W)
    ///
    /// # Errors
    /// Returns error if the image has no pixels
    pub fn preprocess(&self, image: &DecodedImage) -> Result<ModelTensor, PreprocessError> {
        let resized = self.resize(image)?;
        let enhanced = self.enhance(&resized);
        let tensor = self.normalize(&enhanced);

        debug!(
            "Preprocessed {}x{} image into tensor {:?}",
            image.dimensions().0,
            image.dimensions().1,
            tensor.shape()
        );

        ModelTensor::new(tensor).map_err(|e| PreprocessError::InvalidTensor(e.to_string()))
    }

    /// Resize only, for overlay rendering
    ///
    /// # Errors
    /// Returns error if the image has no pixels
    pub fn visualize(&self, image: &DecodedImage) -> Result<VisualizationImage, PreprocessError> {
        Ok(VisualizationImage::new(self.resize(image)?))
    }

    fn resize(&self, image: &DecodedImage) -> Result<RgbImage, PreprocessError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(PreprocessError::EmptyImage { width, height });
        }

        let size = self.input_size;
        if width == size && height == size {
            return Ok(image.as_rgb().clone());
        }

        Ok(image::imageops::resize(
            image.as_rgb(),
            size,
            size,
            FilterType::Triangle,
        ))
    }

    /// CLAHE on lightness; chroma channels pass through unchanged
    #[must_use]
    pub fn enhance(&self, image: &RgbImage) -> RgbImage {
        let (width, height) = image.dimensions();
        let lab: Vec<Lab> = image.pixels().map(|p| lab::rgb_to_lab(*p)).collect();

        let lightness = GrayImage::from_fn(width, height, |x, y| {
            Luma([lab::lightness_to_u8(lab[(y * width + x) as usize].l)])
        });
        let equalized = self.clahe.apply(&lightness);

        RgbImage::from_fn(width, height, |x, y| {
            let original = lab[(y * width + x) as usize];
            let l = lab::u8_to_lightness(equalized.get_pixel(x, y)[0]);
            lab::lab_to_rgb(lab::with_lightness(original, l))
        })
    }

    /// Scale to [0, 1], standardize per channel and lay out as CHW
    #[must_use]
    pub fn normalize(&self, image: &RgbImage) -> Array3<f32> {
        let (width, height) = image.dimensions();
        let mut array = Array3::<f32>::zeros((3, height as usize, width as usize));

        for (y, row) in image.enumerate_rows() {
            for (x, _, pixel) in row {
                for c in 0..3 {
                    let v = f32::from(pixel[c]) / 255.0;
                    array[[c, y as usize, x as usize]] = (v - self.mean[c]) / self.std[c];
                }
            }
        }

        array
    }
}
