use serde::Deserialize;
use std::path::PathBuf;

pub trait Validatable {
    fn get_path(&self) -> PathBuf;

    fn validate(&self) -> Result<(), String>;
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    pub weights_path: PathBuf,
    #[serde(default = "default_model_instances")]
    pub num_instances: usize,
    #[serde(default = "default_input_size")]
    pub input_width: u32,
    #[serde(default = "default_input_size")]
    pub input_height: u32,
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
}

fn default_model_instances() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_input_size() -> u32 {
    512
}

fn default_intra_threads() -> usize {
    1
}

impl Validatable for ModelConfig {
    fn get_path(&self) -> PathBuf {
        self.weights_path.clone()
    }

    fn validate(&self) -> Result<(), String> {
        if !self.get_path().is_file() {
            return Err(format!("Model weights not found: {:?}", self.get_path()));
        }
        if self.num_instances == 0 {
            return Err("num_instances must be at least 1".into());
        }
        if self.input_width == 0 || self.input_height == 0 {
            return Err(format!(
                "Invalid model input size {}x{}",
                self.input_width, self.input_height
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_for(path: PathBuf) -> ModelConfig {
        ModelConfig {
            weights_path: path,
            num_instances: 2,
            input_width: 256,
            input_height: 256,
            intra_threads: 1,
        }
    }

    #[test]
    fn test_validate_missing_weights() {
        let config = config_for(PathBuf::from("./does/not/exist.onnx"));
        let err = config.validate().unwrap_err();
        assert!(err.contains("Model weights not found"));
    }

    #[test]
    fn test_validate_existing_weights() {
        let weights = tempfile::NamedTempFile::new().unwrap();
        let config = config_for(weights.path().to_path_buf());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_instances() {
        let weights = tempfile::NamedTempFile::new().unwrap();
        let mut config = config_for(weights.path().to_path_buf());
        config.num_instances = 0;
        assert!(config.validate().is_err());
    }
}
