use ndarray::{Array3, ArrayView3};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("ONNX runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[error("Invalid model input: {0}")]
    InvalidInput(String),
    #[error("Invalid model output: {0}")]
    InvalidOutput(String),
    #[error("Tensor shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("Session mutex poisoned: {0}")]
    SessionPoisoned(String),
    #[error("Invalid model configuration: {0}")]
    Config(String),
}

/// Output of a single segmentation call.
///
/// Both arrays are HWC with values in `[0, 1]` and share height and width.
/// `input` is the image the mask was computed from, which may be a resized
/// version of what the caller passed in.
#[derive(Debug, Clone)]
pub struct Segmentation {
    pub mask: Array3<f32>,
    pub input: Array3<f32>,
}

pub trait ModelService: Send + Sync + 'static {
    /// `image` is an RGB frame, HWC, normalized to `[0, 1]`.
    fn segment(&self, image: ArrayView3<'_, f32>) -> Result<Segmentation, ModelError>;
}
