mod model_service;
mod ort_service;

pub mod config;
pub mod preprocess;

pub use model_service::{ModelError, ModelService, Segmentation};
pub use ort_service::OrtModelService;
