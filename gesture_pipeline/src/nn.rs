//! Inference engine.
//!
//! The engine owns the model lifecycle: it starts out unready, becomes ready after one
//! successful asynchronous load and hands out raw predictions afterwards. Model calls run on
//! tokio's blocking pool so the tick loop's executor threads never run the model.
use std::{
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock},
};

use common::ModelConfig;
use futures::future::{BoxFuture, FutureExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tract_onnx::prelude::*;

use crate::{
    decision::LabelTable,
    error::{InferenceError, ModelLoadError, PipelineError},
    ledger::{BufferLedger, Tracked},
    utils::resolve_model_location,
};

type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Outputs of one model call, in the model's fixed output order.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOutputs {
    pub class_probs: Vec<f32>,
    pub bbox: Vec<f32>,
}

/// A loaded classifier with a box regression head.
pub trait GestureModel: Send + Sync {
    fn predict(&self, input: &Tensor) -> anyhow::Result<ModelOutputs>;

    /// Length of the class probability output, if the model knows it.
    fn num_classes(&self) -> Option<usize> {
        None
    }
}

/// Produces a model, usually from an asset on disk.
pub trait ModelLoader: Send + Sync {
    fn load(&self) -> BoxFuture<'_, Result<Arc<dyn GestureModel>, ModelLoadError>>;
}

/// ONNX model executed with tract.
pub struct OnnxModel {
    model: NnModel,
    num_classes: Option<usize>,
}

impl OnnxModel {
    /// Parse, optimize and prepare the model for a fixed `f32` input shape.
    pub fn from_path(path: &Path, input_shape: [usize; 4]) -> Result<Self, ModelLoadError> {
        let parse_err = |err: anyhow::Error| ModelLoadError::Parse {
            path: path.to_owned(),
            reason: format!("{err:#}"),
        };

        let [n, h, w, c] = input_shape;
        let input_fact = InferenceFact::dt_shape(f32::datum_type(), tvec!(n, h, w, c));
        let model = tract_onnx::onnx()
            .model_for_path(path)
            .and_then(|model| model.with_input_fact(0, input_fact))
            .and_then(|model| model.into_optimized())
            .and_then(|model| model.into_runnable())
            .map_err(parse_err)?;

        let num_outputs = model.model().outputs.len();
        if num_outputs < 2 {
            return Err(ModelLoadError::Parse {
                path: path.to_owned(),
                reason: format!("expected class and box outputs, model has {num_outputs}"),
            });
        }

        let num_classes = model
            .model()
            .output_fact(0)
            .ok()
            .and_then(|fact| fact.shape.as_concrete().map(|dims| dims.iter().product()));

        Ok(Self { model, num_classes })
    }
}

impl GestureModel for OnnxModel {
    fn predict(&self, input: &Tensor) -> anyhow::Result<ModelOutputs> {
        let raw_nn_out = self.model.run(tvec!(input.clone().into()))?;
        if raw_nn_out.len() < 2 {
            anyhow::bail!("model returned {} outputs, expected 2", raw_nn_out.len());
        }

        Ok(ModelOutputs {
            class_probs: raw_nn_out[0].as_slice::<f32>()?.to_vec(),
            bbox: raw_nn_out[1].as_slice::<f32>()?.to_vec(),
        })
    }

    fn num_classes(&self) -> Option<usize> {
        self.num_classes
    }
}

/// Loads the configured ONNX asset, downloading it first if it is a URL.
pub struct OnnxModelLoader {
    location: String,
    input_shape: [usize; 4],
}

impl OnnxModelLoader {
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            location: config.location.clone(),
            input_shape: [
                1,
                config.input_height as usize,
                config.input_width as usize,
                3,
            ],
        }
    }
}

impl ModelLoader for OnnxModelLoader {
    fn load(&self) -> BoxFuture<'_, Result<Arc<dyn GestureModel>, ModelLoadError>> {
        async move {
            let path: PathBuf = resolve_model_location(&self.location).await?;
            let input_shape = self.input_shape;
            log::info!("Loading model {}", path.display());

            let model = tokio::task::spawn_blocking(move || OnnxModel::from_path(&path, input_shape))
                .await
                .map_err(|err| ModelLoadError::Join(err.to_string()))??;

            Ok(Arc::new(model) as Arc<dyn GestureModel>)
        }
        .boxed()
    }
}

/// Output buffers of one model call. Both are released when this is dropped.
#[derive(Debug)]
pub struct RawPrediction {
    class_probs: Tracked<Vec<f32>>,
    bbox: Tracked<[f32; 4]>,
}

impl RawPrediction {
    pub fn new(class_probs: Vec<f32>, bbox: [f32; 4], ledger: &BufferLedger) -> Self {
        Self {
            class_probs: ledger.track(class_probs),
            bbox: ledger.track(bbox),
        }
    }

    fn from_outputs(outputs: ModelOutputs, ledger: &BufferLedger) -> Result<Self, InferenceError> {
        if outputs.class_probs.is_empty() {
            return Err(InferenceError::MalformedOutput(
                "class probability vector is empty".into(),
            ));
        }
        let bbox: [f32; 4] = outputs.bbox.as_slice().try_into().map_err(|_| {
            InferenceError::MalformedOutput(format!(
                "box vector has {} elements, expected 4",
                outputs.bbox.len()
            ))
        })?;

        Ok(Self::new(outputs.class_probs, bbox, ledger))
    }

    pub fn class_probs(&self) -> &[f32] {
        &self.class_probs
    }

    /// Box as `[x, y, width, height]` in the model's reference frame.
    pub fn bbox(&self) -> [f32; 4] {
        *self.bbox
    }

    pub fn release(self) {
        drop(self)
    }
}

enum EngineState {
    Unready,
    Ready(Arc<dyn GestureModel>),
}

pub struct InferenceEngine {
    loader: Box<dyn ModelLoader>,
    state: RwLock<EngineState>,
    load_lock: tokio::sync::Mutex<()>,
    ledger: BufferLedger,
}

impl InferenceEngine {
    pub fn new(loader: impl ModelLoader + 'static, ledger: BufferLedger) -> Self {
        Self {
            loader: Box::new(loader),
            state: RwLock::new(EngineState::Unready),
            load_lock: tokio::sync::Mutex::new(()),
            ledger,
        }
    }

    pub fn ledger(&self) -> &BufferLedger {
        &self.ledger
    }

    pub fn is_ready(&self) -> bool {
        self.model().is_some()
    }

    /// Class count reported by the loaded model.
    pub fn num_classes(&self) -> Option<usize> {
        self.model().and_then(|model| model.num_classes())
    }

    fn model(&self) -> Option<Arc<dyn GestureModel>> {
        match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            EngineState::Ready(model) => Some(Arc::clone(model)),
            EngineState::Unready => None,
        }
    }

    fn set_state(&self, state: EngineState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Load the model. Once loaded, further calls return immediately.
    ///
    /// On failure the engine stays unready.
    pub async fn load(&self) -> Result<(), ModelLoadError> {
        let _guard = self.load_lock.lock().await;
        if self.is_ready() {
            return Ok(());
        }

        match self.loader.load().await {
            Ok(model) => {
                log::info!("Model loaded");
                self.set_state(EngineState::Ready(model));
                Ok(())
            }
            Err(err) => {
                self.set_state(EngineState::Unready);
                Err(err)
            }
        }
    }

    /// Run the model on `input`.
    ///
    /// The input is released as soon as the model call returns. The output buffers belong to
    /// the caller.
    pub async fn infer(&self, input: Tracked<Tensor>) -> Result<RawPrediction, InferenceError> {
        let model = self.model().ok_or(InferenceError::NotReady)?;
        let ledger = self.ledger.clone();

        tokio::task::spawn_blocking(move || {
            let outputs = model.predict(&input);
            input.release();

            let outputs = outputs.map_err(|err| InferenceError::Execution(format!("{err:#}")))?;
            RawPrediction::from_outputs(outputs, &ledger)
        })
        .await
        .map_err(|err| InferenceError::Join(err.to_string()))?
    }
}

/// Load the model in the background while the capture loop already runs.
///
/// A failed load is logged and leaves the pipeline running without predictions. A model whose
/// class count disagrees with the label table cancels the pipeline. Cancelling `cancel` abandons
/// a load still in progress.
pub fn spawn_model_load(
    engine: Arc<InferenceEngine>,
    labels: LabelTable,
    cancel: CancellationToken,
) -> JoinHandle<Result<(), PipelineError>> {
    tokio::spawn(async move {
        let loaded = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::info!("Teardown before the model finished loading");
                return Ok(());
            }
            loaded = engine.load() => loaded,
        };
        if let Err(err) = loaded {
            log::error!("Failed to load model, continuing without predictions: {err}");
            return Ok(());
        }

        if let Some(classes) = engine.num_classes() {
            if let Err(err) = labels.verify_class_count(classes) {
                log::error!("{err}");
                cancel.cancel();
                return Err(err);
            }
        }

        Ok(())
    })
}
