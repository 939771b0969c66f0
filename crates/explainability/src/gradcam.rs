//! Grad-CAM engine as a typestate machine
//!
//! `Idle -> Hooked -> Forwarded -> Backpropagated -> Computed`. Each state is a
//! distinct type, so calling a step out of order does not compile, and every
//! step consumes the engine, so an instance cannot be reused for a second
//! request. The engine borrows the shared classifier read-only and owns its
//! [`CaptureContext`].

use ndarray::Array1;
use retina_classifier::{ClassifierError, SeverityClassifier};
use retina_common::ModelTensor;
use tracing::debug;

use crate::capture::CaptureContext;
use crate::saliency::{grad_cam, SaliencyMap};
use crate::ExplainError;

pub struct Idle;

pub struct Hooked;

pub struct Forwarded {
    logits: Array1<f32>,
    target_class: usize,
}

pub struct Backpropagated {
    logits: Array1<f32>,
    target_class: usize,
}

/// Final state: the saliency map for one class on one input
#[derive(Debug, Clone)]
pub struct Computed {
    pub target_class: usize,
    pub predicted_class: usize,
    pub logits: Array1<f32>,
    pub saliency: SaliencyMap,
}

pub struct GradCam<'m, S> {
    classifier: &'m SeverityClassifier,
    capture: CaptureContext,
    state: S,
}

impl<'m> GradCam<'m, Idle> {
    #[must_use]
    pub fn new(classifier: &'m SeverityClassifier) -> Self {
        Self {
            classifier,
            capture: CaptureContext::new(),
            state: Idle,
        }
    }

    /// Arm capture on the classifier's target layer
    ///
    /// # Errors
    /// `HookError::StillArmed` if the context still holds a previous pair
    pub fn hook(mut self) -> Result<GradCam<'m, Hooked>, ExplainError> {
        self.capture.arm(self.classifier.target_layer())?;
        Ok(GradCam {
            classifier: self.classifier,
            capture: self.capture,
            state: Hooked,
        })
    }
}

impl<'m> GradCam<'m, Hooked> {
    /// Run one forward pass; `target_class` defaults to the predicted class
    ///
    /// # Errors
    /// Returns error on inference failure or an out-of-range target class
    pub fn forward(
        mut self,
        tensor: &ModelTensor,
        target_class: Option<usize>,
    ) -> Result<GradCam<'m, Forwarded>, ExplainError> {
        let pass = self.classifier.forward(tensor)?;
        let num_classes = self.classifier.num_classes();
        let target_class = match target_class {
            Some(class) if class < num_classes => class,
            Some(class) => {
                return Err(ClassifierError::InvalidTargetClass { class, num_classes }.into())
            }
            None => pass.argmax(),
        };

        debug!(
            "Grad-CAM forward pass {} targeting class {}",
            pass.activation.pass().get(),
            target_class
        );
        self.capture.record_activation(pass.activation)?;

        Ok(GradCam {
            classifier: self.classifier,
            capture: self.capture,
            state: Forwarded {
                logits: pass.logits,
                target_class,
            },
        })
    }
}

impl<'m> GradCam<'m, Forwarded> {
    #[must_use]
    pub fn target_class(&self) -> usize {
        self.state.target_class
    }

    #[must_use]
    pub fn logits(&self) -> &Array1<f32> {
        &self.state.logits
    }

    /// Zero gradients, then backpropagate the target class score alone
    ///
    /// # Errors
    /// Returns error if the captured pair is inconsistent
    pub fn backward(mut self) -> Result<GradCam<'m, Backpropagated>, ExplainError> {
        self.capture.zero_gradients();
        let gradient = self
            .classifier
            .backward(self.capture.activation()?, self.state.target_class)?;
        self.capture.record_gradient(gradient)?;

        Ok(GradCam {
            classifier: self.classifier,
            capture: self.capture,
            state: Backpropagated {
                logits: self.state.logits,
                target_class: self.state.target_class,
            },
        })
    }
}

impl<'m> GradCam<'m, Backpropagated> {
    /// Release the capture and reduce it to a saliency map
    ///
    /// # Errors
    /// Returns error if a capture is missing or mismatched
    pub fn compute(mut self) -> Result<Computed, ExplainError> {
        let (activation, gradient) = self.capture.release()?;
        let saliency = grad_cam(activation.data().view(), gradient.data().view())?;
        let predicted_class = argmax(&self.state.logits);

        Ok(Computed {
            target_class: self.state.target_class,
            predicted_class,
            logits: self.state.logits,
            saliency,
        })
    }
}

fn argmax(values: &Array1<f32>) -> usize {
    values
        .indexed_iter()
        .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        .0
}
