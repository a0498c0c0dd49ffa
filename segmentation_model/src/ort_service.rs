use crate::{
    config::{ModelConfig, Validatable},
    model_service::{ModelError, ModelService, Segmentation},
    preprocess::{decode_mask, resize_hwc, to_input_tensor},
};
use ndarray::{Array, ArrayView3, Ix4};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

#[derive(Clone)]
pub struct OrtModelService {
    sessions: Arc<Vec<Arc<Mutex<Session>>>>,
    counter: Arc<AtomicUsize>,
    output_name: String,
    input_width: u32,
    input_height: u32,
}

impl OrtModelService {
    pub fn new(model_config: &ModelConfig) -> Result<Self, ModelError> {
        model_config.validate().map_err(ModelError::Config)?;

        let num_instances = model_config.num_instances;
        let sessions = (0..num_instances)
            .map(|_| {
                let session = Session::builder()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .with_intra_threads(model_config.intra_threads)?
                    .commit_from_file(model_config.get_path())?;
                Ok(session)
            })
            .collect::<Result<Vec<_>, ort::Error>>()?;

        let output_name = sessions
            .first()
            .and_then(|session| session.outputs.first())
            .map(|output| output.name.clone())
            .ok_or_else(|| ModelError::InvalidOutput("model declares no outputs".into()))?;

        tracing::info!(
            "Created {} ONNX sessions from {:?}, reading output `{}`",
            num_instances,
            model_config.get_path(),
            output_name
        );

        Ok(Self {
            sessions: Arc::new(
                sessions
                    .into_iter()
                    .map(|session| Arc::new(Mutex::new(session)))
                    .collect(),
            ),
            counter: Arc::new(AtomicUsize::new(0)),
            output_name,
            input_width: model_config.input_width,
            input_height: model_config.input_height,
        })
    }

    pub fn run_inference(&self, input: &Array<f32, Ix4>) -> Result<ndarray::ArrayD<f32>, ModelError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let mut session = self.sessions[index]
            .lock()
            .map_err(|e| ModelError::SessionPoisoned(e.to_string()))?;

        tracing::debug!("Handling frame with session {}", index);
        let owned_buffer;
        let input_view = if input.view().is_standard_layout() {
            input.view()
        } else {
            owned_buffer = input.as_standard_layout().into_owned();
            owned_buffer.view()
        };

        let tensor_ref = TensorRef::from_array_view(input_view)?;
        let outputs = session.run(ort::inputs![tensor_ref])?;

        let (shape, data) = outputs[self.output_name.as_str()].try_extract_tensor::<f32>()?;
        let array = ndarray::ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec())?;

        Ok(array)
    }
}

impl ModelService for OrtModelService {
    fn segment(&self, image: ArrayView3<'_, f32>) -> Result<Segmentation, ModelError> {
        let (input, echoed) = to_input_tensor(image, self.input_width, self.input_height)?;
        let output = self.run_inference(&input)?;
        let mut mask = decode_mask(output)?;

        let (height, width, _) = echoed.dim();
        if mask.dim().0 != height || mask.dim().1 != width {
            mask = resize_hwc(mask.view(), width as u32, height as u32)?;
        }

        Ok(Segmentation {
            mask,
            input: echoed,
        })
    }
}
