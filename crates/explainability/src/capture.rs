//! Per-invocation activation and gradient capture

use retina_classifier::{ActivationMap, GradientMap};
use tracing::debug;

use crate::HookError;

/// Owns the activation and gradient captured for one explanation
///
/// Created per invocation and dropped with it; never shared between requests.
#[derive(Debug, Default)]
pub struct CaptureContext {
    layer: Option<String>,
    activation: Option<ActivationMap>,
    gradient: Option<GradientMap>,
}

impl CaptureContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wire the context to `layer` for the next forward/backward pair
    ///
    /// # Errors
    /// `HookError::StillArmed` if a previous pair has not been released
    pub fn arm(&mut self, layer: &str) -> Result<(), HookError> {
        if let Some(current) = &self.layer {
            return Err(HookError::StillArmed(current.clone()));
        }
        debug!("Capture armed on {}", layer);
        self.layer = Some(layer.to_string());
        Ok(())
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.layer.is_some()
    }

    /// Record the target-layer output of a forward pass
    ///
    /// # Errors
    /// Returns error if the context is not armed, the layer differs, or an
    /// activation was already recorded
    pub fn record_activation(&mut self, activation: ActivationMap) -> Result<(), HookError> {
        let layer = self.layer.as_deref().ok_or(HookError::NotArmed)?;
        if activation.layer() != layer {
            return Err(HookError::LayerMismatch {
                armed: layer.to_string(),
                captured: activation.layer().to_string(),
            });
        }
        if self.activation.is_some() {
            return Err(HookError::AlreadyCaptured("activation"));
        }
        self.activation = Some(activation);
        Ok(())
    }

    /// Drop any gradient from an earlier backward pass
    pub fn zero_gradients(&mut self) {
        self.gradient = None;
    }

    /// Record the gradient flowing into the target layer
    ///
    /// # Errors
    /// Returns error if no activation was captured or the gradient belongs to
    /// a different forward pass
    pub fn record_gradient(&mut self, gradient: GradientMap) -> Result<(), HookError> {
        let activation = self.activation()?;
        if activation.pass() != gradient.pass() {
            return Err(HookError::PassMismatch {
                activation: activation.pass().get(),
                gradient: gradient.pass().get(),
            });
        }
        if activation.data().dim() != gradient.data().dim() {
            return Err(HookError::ShapeMismatch {
                activation: activation.data().dim(),
                gradient: gradient.data().dim(),
            });
        }
        self.gradient = Some(gradient);
        Ok(())
    }

    /// # Errors
    /// `HookError::NotCaptured` before a forward pass was recorded
    pub fn activation(&self) -> Result<&ActivationMap, HookError> {
        self.activation
            .as_ref()
            .ok_or(HookError::NotCaptured("activation"))
    }

    /// # Errors
    /// `HookError::NotCaptured` before a backward pass was recorded
    pub fn gradient(&self) -> Result<&GradientMap, HookError> {
        self.gradient
            .as_ref()
            .ok_or(HookError::NotCaptured("gradient"))
    }

    /// Unwire and hand back the captured pair
    ///
    /// # Errors
    /// Returns error if either capture is missing; the context is released
    /// either way
    pub fn release(&mut self) -> Result<(ActivationMap, GradientMap), HookError> {
        self.layer = None;
        let activation = self.activation.take();
        let gradient = self.gradient.take();
        match (activation, gradient) {
            (Some(a), Some(g)) => Ok((a, g)),
            (None, _) => Err(HookError::NotCaptured("activation")),
            (Some(_), None) => Err(HookError::NotCaptured("gradient")),
        }
    }
}
