//! The local neural engine behind the offline backend. The engine is an
//! opaque capability: the rest of the crate only sees [`InferenceEngine`],
//! and tests substitute their own implementation.

use ndarray::{Array2, Array3};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;
use tracing::info;

use crate::config::{Device, OfflineTranslatorConfig};
use crate::error::StartupError;

/// Blocking translation over a loaded model/tokenizer pair. Calls may
/// occupy the calling thread for the full inference duration; the offline
/// backend runs them on the blocking pool under a concurrency slot.
pub trait InferenceEngine: Send + Sync {
    fn model_name(&self) -> &str;

    fn translate_batch(&self, texts: &[String]) -> anyhow::Result<Vec<String>>;
}

/// Marian-style encoder/decoder pair exported to ONNX, with greedy
/// decoding. Session access is serialized internally, so a
/// `max_concurrency` above 1 overlaps tokenization only.
pub struct OnnxEngine {
    name: String,
    encoder: Mutex<Session>,
    decoder: Mutex<Session>,
    source_tokenizer: Tokenizer,
    target_tokenizer: Tokenizer,
    decoder_start_token_id: u32,
    eos_token_id: u32,
    max_decoding_length: usize,
}

impl OnnxEngine {
    pub fn load(config: &OfflineTranslatorConfig) -> Result<Self, StartupError> {
        let encoder_path = config.model_dir.join("encoder.onnx");
        let decoder_path = config.model_dir.join("decoder.onnx");
        for path in [
            &config.model_dir,
            &encoder_path,
            &decoder_path,
            &config.source_tokenizer_path,
            &config.target_tokenizer_path,
        ] {
            if !path.exists() {
                return Err(StartupError::ModelLoad {
                    path: path.clone(),
                    cause: "file not found".into(),
                });
            }
        }

        match config.device {
            Device::Cpu => {}
            #[cfg(feature = "cuda")]
            Device::Cuda => {}
            #[cfg(not(feature = "cuda"))]
            Device::Cuda => {
                return Err(StartupError::DeviceUnavailable(
                    "cuda requested but tlserver was built without the cuda feature".into(),
                ));
            }
        }

        info!("loading offline model from {}", config.model_dir.display());
        let encoder = Self::build_session(&encoder_path, config)?;
        let decoder = Self::build_session(&decoder_path, config)?;

        let source_tokenizer = Self::load_tokenizer(&config.source_tokenizer_path)?;
        let target_tokenizer = Self::load_tokenizer(&config.target_tokenizer_path)?;

        info!("offline model loaded ({:?})", config.device);

        Ok(Self {
            name: config.name.clone(),
            encoder: Mutex::new(encoder),
            decoder: Mutex::new(decoder),
            source_tokenizer,
            target_tokenizer,
            decoder_start_token_id: config.decoder_start_token_id,
            eos_token_id: config.eos_token_id,
            max_decoding_length: config.max_decoding_length,
        })
    }

    fn build_session(
        path: &Path,
        config: &OfflineTranslatorConfig,
    ) -> Result<Session, StartupError> {
        let mut builder = Session::builder()
            .and_then(|b| {
                b.with_optimization_level(GraphOptimizationLevel::Level3)
                    .map_err(ort::Error::from)
            })
            .and_then(|b| {
                b.with_intra_threads(config.intra_threads)
                    .map_err(ort::Error::from)
            })
            .map_err(|e| StartupError::ModelLoad {
                path: path.to_path_buf(),
                cause: e.to_string(),
            })?;

        #[cfg(feature = "cuda")]
        let mut builder = if config.device == Device::Cuda {
            use ort::ep::CUDA;
            builder
                .with_execution_providers([CUDA::default()
                    .build()
                    .error_on_failure()])
                .map_err(|e| StartupError::DeviceUnavailable(e.to_string()))?
        } else {
            builder
        };

        builder
            .commit_from_file(path)
            .map_err(|e| StartupError::ModelLoad {
                path: path.to_path_buf(),
                cause: e.to_string(),
            })
    }

    fn load_tokenizer(path: &PathBuf) -> Result<Tokenizer, StartupError> {
        Tokenizer::from_file(path).map_err(|e| StartupError::ModelLoad {
            path: path.clone(),
            cause: format!("tokenizer: {e}"),
        })
    }

    fn translate_one(&self, text: &str) -> anyhow::Result<String> {
        let encoding = self
            .source_tokenizer
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("tokenize: {e}"))?;
        let source_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        let source_len = source_ids.len();
        if source_len == 0 {
            return Ok(String::new());
        }

        let input_ids = Array2::from_shape_vec((1, source_len), source_ids)?;
        let attention_mask = Array2::from_elem((1, source_len), 1i64);

        // Encoder pass; hidden states are copied out so the session lock is
        // not held across the decode loop.
        let (hidden, hidden_dim) = {
            let mut encoder = self.encoder.lock();
            let outputs = encoder.run(ort::inputs![
                "input_ids" => Tensor::from_array(input_ids)?,
                "attention_mask" => Tensor::from_array(attention_mask.clone())?,
            ])?;
            let (shape, data) = outputs
                .get("last_hidden_state")
                .ok_or_else(|| anyhow::anyhow!("encoder output 'last_hidden_state' missing"))?
                .try_extract_tensor::<f32>()?;
            let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
            if dims.len() != 3 {
                anyhow::bail!("unexpected encoder output shape: {:?}", dims);
            }
            (data.to_vec(), dims[2])
        };

        let mut generated: Vec<i64> = vec![self.decoder_start_token_id as i64];
        for _ in 0..self.max_decoding_length {
            let decoder_ids =
                Array2::from_shape_vec((1, generated.len()), generated.clone())?;
            let hidden_states =
                Array3::from_shape_vec((1, source_len, hidden_dim), hidden.clone())?;

            let next_id = {
                let mut decoder = self.decoder.lock();
                let outputs = decoder.run(ort::inputs![
                    "input_ids" => Tensor::from_array(decoder_ids)?,
                    "encoder_hidden_states" => Tensor::from_array(hidden_states)?,
                    "encoder_attention_mask" => Tensor::from_array(attention_mask.clone())?,
                ])?;
                let (shape, logits) = outputs
                    .get("logits")
                    .ok_or_else(|| anyhow::anyhow!("decoder output 'logits' missing"))?
                    .try_extract_tensor::<f32>()?;
                let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
                if dims.len() != 3 {
                    anyhow::bail!("unexpected decoder output shape: {:?}", dims);
                }
                let vocab = dims[2];
                let last = &logits[(dims[1] - 1) * vocab..dims[1] * vocab];
                last.iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map(|(i, _)| i as i64)
                    .unwrap_or(self.eos_token_id as i64)
            };

            if next_id == self.eos_token_id as i64 {
                break;
            }
            generated.push(next_id);
        }

        let output_ids: Vec<u32> = generated[1..].iter().map(|&id| id as u32).collect();
        self.target_tokenizer
            .decode(&output_ids, true)
            .map_err(|e| anyhow::anyhow!("detokenize: {e}"))
    }
}

impl InferenceEngine for OnnxEngine {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn translate_batch(&self, texts: &[String]) -> anyhow::Result<Vec<String>> {
        texts.iter().map(|t| self.translate_one(t)).collect()
    }
}
