//! Feature extractors ending at the explanation target layer
//!
//! A backbone maps the normalized (3, H, W) input to the output of the last
//! spatial block before global pooling, (C, H', W'). Everything after that
//! block lives in [`crate::head::LinearHead`], which is what makes the
//! gradient at the target layer computable without a general autodiff engine.

use ndarray::{Array1, Array3, Array4, Axis};
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::onnx_utils::create_session;
use crate::ClassifierError;

/// Frozen feature extractor shared read-only across requests
pub trait Backbone: Send + Sync {
    /// Short identifier for logs
    fn name(&self) -> &str;

    /// Name of the layer whose output is returned by [`Backbone::extract`]
    fn target_layer(&self) -> &str;

    /// Channel count of the target layer, if known before the first pass
    fn out_channels(&self) -> Option<usize>;

    /// Run the backbone on one (3, H, W) input
    fn extract(&self, input: &Array3<f32>) -> Result<Array3<f32>, ClassifierError>;
}

/// One 2-D convolution followed by ReLU
#[derive(Debug, Clone)]
pub struct ConvLayer {
    /// (out_channels, in_channels, kernel, kernel)
    pub weight: Array4<f32>,
    pub bias: Array1<f32>,
    pub stride: usize,
    pub padding: usize,
}

impl ConvLayer {
    /// # Errors
    /// Returns error if the kernel is not square, the bias length does not
    /// match the output channels or the stride is zero
    pub fn new(
        weight: Array4<f32>,
        bias: Array1<f32>,
        stride: usize,
        padding: usize,
    ) -> Result<Self, ClassifierError> {
        let (out_c, _, kh, kw) = weight.dim();
        if kh != kw || kh == 0 {
            return Err(ClassifierError::InvalidWeights(format!(
                "kernel must be square and non-empty, got {kh}x{kw}"
            )));
        }
        if bias.len() != out_c {
            return Err(ClassifierError::InvalidWeights(format!(
                "bias has {} entries for {} output channels",
                bias.len(),
                out_c
            )));
        }
        if stride == 0 {
            return Err(ClassifierError::InvalidWeights("stride must be positive".into()));
        }
        Ok(Self {
            weight,
            bias,
            stride,
            padding,
        })
    }

    #[must_use]
    pub fn in_channels(&self) -> usize {
        self.weight.dim().1
    }

    #[must_use]
    pub fn out_channels(&self) -> usize {
        self.weight.dim().0
    }

    fn output_size(&self, size: usize) -> Option<usize> {
        let kernel = self.weight.dim().2;
        (size + 2 * self.padding)
            .checked_sub(kernel)
            .map(|span| span / self.stride + 1)
    }

    /// Convolve + ReLU
    fn forward(&self, input: &Array3<f32>) -> Result<Array3<f32>, ClassifierError> {
        let (in_c, in_h, in_w) = input.dim();
        if in_c != self.in_channels() {
            return Err(ClassifierError::Inference(format!(
                "layer expects {} input channels, got {}",
                self.in_channels(),
                in_c
            )));
        }
        let (out_h, out_w) = match (self.output_size(in_h), self.output_size(in_w)) {
            (Some(h), Some(w)) => (h, w),
            _ => {
                return Err(ClassifierError::Inference(format!(
                    "{in_h}x{in_w} input is smaller than the kernel"
                )))
            }
        };

        let kernel = self.weight.dim().2;
        let pad = self.padding as isize;
        let mut output = Array3::<f32>::zeros((self.out_channels(), out_h, out_w));

        for (o, mut plane) in output.axis_iter_mut(Axis(0)).enumerate() {
            let filters = self.weight.index_axis(Axis(0), o);
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let mut acc = self.bias[o];
                    let y0 = (oy * self.stride) as isize - pad;
                    let x0 = (ox * self.stride) as isize - pad;
                    for ky in 0..kernel {
                        let iy = y0 + ky as isize;
                        if iy < 0 || iy >= in_h as isize {
                            continue;
                        }
                        for kx in 0..kernel {
                            let ix = x0 + kx as isize;
                            if ix < 0 || ix >= in_w as isize {
                                continue;
                            }
                            for c in 0..in_c {
                                acc += filters[[c, ky, kx]] * input[[c, iy as usize, ix as usize]];
                            }
                        }
                    }
                    plane[[oy, ox]] = acc.max(0.0);
                }
            }
        }

        Ok(output)
    }
}

/// Serialized form of one convolution layer (row-major weights)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvLayerSpec {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub stride: usize,
    #[serde(default)]
    pub padding: usize,
    pub weight: Vec<f32>,
    pub bias: Vec<f32>,
}

/// Serialized native backbone
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvBackboneSpec {
    pub target_layer: String,
    pub layers: Vec<ConvLayerSpec>,
}

/// Native stack of strided convolutions (ndarray, CPU)
///
/// Used where no ONNX export is deployed, and in tests.
#[derive(Debug, Clone)]
pub struct ConvBackbone {
    target_layer: String,
    layers: Vec<ConvLayer>,
}

impl ConvBackbone {
    /// # Errors
    /// Returns error if the stack is empty or adjacent layers disagree on channels
    pub fn new(target_layer: impl Into<String>, layers: Vec<ConvLayer>) -> Result<Self, ClassifierError> {
        let first = layers
            .first()
            .ok_or_else(|| ClassifierError::InvalidWeights("backbone has no layers".into()))?;
        if first.in_channels() != 3 {
            return Err(ClassifierError::InvalidWeights(format!(
                "first layer must take 3 channels, takes {}",
                first.in_channels()
            )));
        }
        for (i, pair) in layers.windows(2).enumerate() {
            if pair[0].out_channels() != pair[1].in_channels() {
                return Err(ClassifierError::InvalidWeights(format!(
                    "layer {} emits {} channels but layer {} takes {}",
                    i,
                    pair[0].out_channels(),
                    i + 1,
                    pair[1].in_channels()
                )));
            }
        }
        Ok(Self {
            target_layer: target_layer.into(),
            layers,
        })
    }

    /// Build from the serialized form
    ///
    /// # Errors
    /// Returns error if any weight buffer does not match its declared shape
    pub fn from_spec(spec: ConvBackboneSpec) -> Result<Self, ClassifierError> {
        let layers = spec
            .layers
            .into_iter()
            .enumerate()
            .map(|(i, layer)| {
                let shape = (layer.out_channels, layer.in_channels, layer.kernel, layer.kernel);
                let weight = Array4::from_shape_vec(shape, layer.weight).map_err(|e| {
                    ClassifierError::InvalidWeights(format!("layer {i} weight: {e}"))
                })?;
                ConvLayer::new(weight, Array1::from(layer.bias), layer.stride, layer.padding)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(spec.target_layer, layers)
    }

    /// Load weights from a JSON file
    ///
    /// # Errors
    /// Returns error if the file is missing, unparsable or inconsistent
    pub fn from_json_file(path: &Path) -> Result<Self, ClassifierError> {
        info!("Loading native backbone weights from {}", path.display());
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ClassifierError::ModelLoad(format!("failed to read {}: {e}", path.display()))
        })?;
        let spec: ConvBackboneSpec = serde_json::from_str(&contents)
            .map_err(|e| ClassifierError::InvalidWeights(format!("{}: {e}", path.display())))?;
        Self::from_spec(spec)
    }

    #[must_use]
    pub fn layers(&self) -> &[ConvLayer] {
        &self.layers
    }
}

impl Backbone for ConvBackbone {
    fn name(&self) -> &str {
        "native-conv"
    }

    fn target_layer(&self) -> &str {
        &self.target_layer
    }

    fn out_channels(&self) -> Option<usize> {
        self.layers.last().map(ConvLayer::out_channels)
    }

    fn extract(&self, input: &Array3<f32>) -> Result<Array3<f32>, ClassifierError> {
        let mut features = input.to_owned();
        for layer in &self.layers {
            features = layer.forward(&features)?;
        }
        Ok(features)
    }
}

/// Backbone exported to ONNX, truncated at the target layer
///
/// The graph takes (1, 3, H, W) and its first output is the (1, C, H', W')
/// feature map. `Session::run` needs `&mut self`, hence the mutex.
pub struct OnnxBackbone {
    session: Mutex<Session>,
    target_layer: String,
}

impl OnnxBackbone {
    /// Load an ONNX export
    ///
    /// # Errors
    /// Returns error if the model is missing or ONNX Runtime rejects it
    pub fn new(
        model_path: &Path,
        target_layer: impl Into<String>,
        threads: Option<usize>,
    ) -> Result<Self, ClassifierError> {
        info!("Loading ONNX backbone from {}", model_path.display());
        let session = create_session(model_path, threads)?;
        Ok(Self {
            session: Mutex::new(session),
            target_layer: target_layer.into(),
        })
    }
}

impl Backbone for OnnxBackbone {
    fn name(&self) -> &str {
        "onnx"
    }

    fn target_layer(&self) -> &str {
        &self.target_layer
    }

    fn out_channels(&self) -> Option<usize> {
        None
    }

    fn extract(&self, input: &Array3<f32>) -> Result<Array3<f32>, ClassifierError> {
        let contiguous = input.as_standard_layout();
        let input_tensor = TensorRef::from_array_view(contiguous.view().insert_axis(Axis(0)))?;

        let mut session = self.session.lock().map_err(|e| {
            ClassifierError::Inference(format!("Failed to lock session mutex: {e}"))
        })?;
        let outputs = session.run(ort::inputs![input_tensor])?;

        let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;
        debug!("ONNX backbone output shape: {:?}", shape);

        let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
        if dims.len() != 4 || dims[0] != 1 {
            return Err(ClassifierError::Inference(format!(
                "expected (1, C, H, W) feature map, got {dims:?}"
            )));
        }

        Array3::from_shape_vec((dims[1], dims[2], dims[3]), data.to_vec())
            .map_err(|e| ClassifierError::Inference(format!("feature map layout: {e}")))
    }
}
