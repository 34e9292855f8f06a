//! Offline backend: owns the loaded model/tokenizer pair and is the only
//! component that touches it. All calls arrive through the scheduler, so
//! at most `max_concurrency` inferences run at once.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

use super::engine::{InferenceEngine, OnnxEngine};
use super::Translator;
use crate::config::OfflineTranslatorConfig;
use crate::error::{StartupError, TranslateError};
use crate::plugins;

pub struct OfflineTranslator {
    name: String,
    engine: Arc<dyn InferenceEngine>,
    supported_languages: HashMap<String, String>,
    paused: AtomicBool,
}

impl OfflineTranslator {
    /// Load the engine eagerly; a missing model is a startup failure, never
    /// a per-request one.
    pub fn load(config: &OfflineTranslatorConfig) -> Result<Self, StartupError> {
        let engine = Arc::new(OnnxEngine::load(config)?);
        Ok(Self::with_engine(config, engine))
    }

    pub fn with_engine(
        config: &OfflineTranslatorConfig,
        engine: Arc<dyn InferenceEngine>,
    ) -> Self {
        info!(
            "initialized offline translator '{}' (model '{}')",
            config.name,
            engine.model_name()
        );
        Self {
            name: config.name.clone(),
            engine,
            supported_languages: config.supported_languages.clone(),
            paused: AtomicBool::new(false),
        }
    }

    /// Blocking engine call moved onto the blocking pool. The future may be
    /// abandoned by the caller; the underlying inference still runs to
    /// completion there.
    ///
    /// A crashed inference task means the engine can no longer be trusted
    /// and surfaces as `BackendUnavailable`; an ordinary inference error
    /// (bad input, shape mismatch) only fails this request.
    async fn run_engine(&self, texts: Vec<String>) -> Result<Vec<String>, TranslateError> {
        let engine = Arc::clone(&self.engine);
        let name = self.name.clone();
        tokio::task::spawn_blocking(move || engine.translate_batch(&texts))
            .await
            .map_err(|e| TranslateError::BackendUnavailable {
                backend: name.clone(),
                cause: format!("inference task crashed: {e}"),
            })?
            .map_err(|e| TranslateError::Backend {
                backend: name,
                cause: e.to_string(),
            })
    }
}

#[async_trait]
impl Translator for OfflineTranslator {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_ready(&self) -> bool {
        !self.paused.load(Ordering::Relaxed)
    }

    async fn translate(&self, text: &str) -> Result<String, TranslateError> {
        if self.paused.load(Ordering::Relaxed) {
            return Ok("Translation is paused at the moment".to_string());
        }
        let input = plugins::process_input_text(text, None);
        let mut results = self.run_engine(vec![input]).await?;
        let output = plugins::process_output_text(&results.remove(0));
        info!("{:?}   ->   {:?}", text, output);
        Ok(output)
    }

    async fn translate_batch(&self, texts: &[String]) -> Result<Vec<String>, TranslateError> {
        if self.paused.load(Ordering::Relaxed) {
            return Ok(vec!["Translation is paused at the moment".to_string()]);
        }
        let inputs: Vec<String> = texts
            .iter()
            .map(|t| plugins::process_input_text(t, None))
            .collect();
        let results = self.run_engine(inputs).await?;
        let outputs: Vec<String> = results
            .iter()
            .map(|t| plugins::process_output_text(t))
            .collect();
        for (original, translated) in texts.iter().zip(&outputs) {
            info!("{:?}   ->   {:?}", original, translated);
        }
        Ok(outputs)
    }

    fn supports_language(&self, language: &str) -> bool {
        self.supported_languages.contains_key(language)
    }

    // The offline model is a fixed language direction.
    fn change_input_language(&self, _language: &str) -> String {
        "sorry, this translator can't change languages".to_string()
    }

    fn change_output_language(&self, _language: &str) -> String {
        "sorry, this translator can't change languages".to_string()
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }
}
