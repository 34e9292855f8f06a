//! Backend registry and router: resolves each request to a configured
//! backend and exposes the scheduled call surface to the boundary layer.
//! Holds only immutable references after startup.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, instrument};

use crate::error::TranslateError;
use crate::scheduler::Scheduler;
use crate::translator::{Backend, TranslationRequest, TranslationResult, Translator};

/// One backend plus its admission control. No component invokes the
/// backend except through [`ScheduledBackend::translate_one`] /
/// [`ScheduledBackend::translate_many`].
pub struct ScheduledBackend {
    backend: Arc<Backend>,
    scheduler: Scheduler,
    /// Cleared when the backend fails fatally mid-flight; requests then
    /// fail fast instead of retrying a dead engine.
    healthy: AtomicBool,
}

impl ScheduledBackend {
    pub fn new(backend: Backend, scheduler: Scheduler) -> Self {
        Self {
            backend: Arc::new(backend),
            scheduler,
            healthy: AtomicBool::new(true),
        }
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    pub fn is_ready(&self) -> bool {
        self.healthy.load(Ordering::Relaxed) && self.backend.is_ready()
    }

    pub fn pause(&self) {
        self.backend.pause()
    }

    pub fn resume(&self) {
        self.backend.resume()
    }

    pub fn change_input_language(&self, language: &str) -> String {
        self.backend.change_input_language(language)
    }

    pub fn change_output_language(&self, language: &str) -> String {
        self.backend.change_output_language(language)
    }

    pub fn supports_language(&self, language: &str) -> bool {
        self.backend.supports_language(language)
    }

    fn check_health(&self) -> Result<(), TranslateError> {
        if self.healthy.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(TranslateError::BackendUnavailable {
                backend: self.name().to_string(),
                cause: "backend marked out of service after a fatal failure".to_string(),
            })
        }
    }

    fn note_outcome<T>(&self, result: &Result<T, TranslateError>) {
        if let Err(TranslateError::BackendUnavailable { backend, cause }) = result {
            error!("marking backend '{}' out of service: {}", backend, cause);
            self.healthy.store(false, Ordering::Relaxed);
        }
    }

    pub async fn translate_one(
        &self,
        text: String,
        deadline: Option<Duration>,
    ) -> Result<String, TranslateError> {
        self.check_health()?;
        let backend = Arc::clone(&self.backend);
        let result = self
            .scheduler
            .run(deadline, async move { backend.translate(&text).await })
            .await;
        self.note_outcome(&result);
        result
    }

    pub async fn translate_many(
        &self,
        texts: Vec<String>,
        deadline: Option<Duration>,
    ) -> Result<Vec<String>, TranslateError> {
        self.check_health()?;
        let backend = Arc::clone(&self.backend);
        let result = self
            .scheduler
            .run(deadline, async move { backend.translate_batch(&texts).await })
            .await;
        self.note_outcome(&result);
        result
    }
}

pub struct BackendRegistry {
    backends: HashMap<String, Arc<ScheduledBackend>>,
    ports: HashMap<u16, String>,
    default_backend: String,
    default_deadline: Duration,
}

impl BackendRegistry {
    /// `entries` come from the startup checker, fully validated; the first
    /// one is the deployment default.
    pub fn new(entries: Vec<(u16, ScheduledBackend)>, default_deadline: Duration) -> Self {
        let mut backends = HashMap::new();
        let mut ports = HashMap::new();
        let mut default_backend = String::new();
        for (port, backend) in entries {
            if default_backend.is_empty() {
                default_backend = backend.name().to_string();
            }
            ports.insert(port, backend.name().to_string());
            backends.insert(backend.name().to_string(), Arc::new(backend));
        }
        Self {
            backends,
            ports,
            default_backend,
            default_deadline,
        }
    }

    pub fn resolve(&self, hint: Option<&str>) -> Result<&Arc<ScheduledBackend>, TranslateError> {
        let name = hint.unwrap_or(&self.default_backend);
        self.backends
            .get(name)
            .ok_or_else(|| TranslateError::InvalidBackendSelection(name.to_string()))
    }

    /// Legacy Sugoi clients address translators by listener port.
    pub fn resolve_port(&self, port: u16) -> Option<&Arc<ScheduledBackend>> {
        self.ports.get(&port).and_then(|name| self.backends.get(name))
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.ports.keys().copied()
    }

    pub fn backends(&self) -> impl Iterator<Item = &Arc<ScheduledBackend>> {
        self.backends.values()
    }

    /// Full routed translation: validate, resolve, schedule, time.
    #[instrument(skip(self, request), fields(backend = request.backend.as_deref()))]
    pub async fn translate(
        &self,
        request: &TranslationRequest,
    ) -> Result<TranslationResult, TranslateError> {
        if request.text.trim().is_empty() {
            return Err(TranslateError::InvalidInput("empty source text".into()));
        }
        let backend = self.resolve(request.backend.as_deref())?;

        for lang in [&request.source_lang, &request.target_lang].into_iter().flatten() {
            if !backend.supports_language(lang) {
                return Err(TranslateError::InvalidInput(format!(
                    "language '{lang}' not supported by '{}'",
                    backend.name()
                )));
            }
        }

        let deadline = request
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_deadline);

        let started = Instant::now();
        let translated_text = backend
            .translate_one(request.text.clone(), Some(deadline))
            .await?;

        Ok(TranslationResult {
            translated_text,
            backend: backend.name().to_string(),
            latency: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translator::offline::tests::{test_config, MockEngine};
    use crate::translator::offline::OfflineTranslator;

    fn registry() -> BackendRegistry {
        let config = test_config("sugoi");
        let engine = Arc::new(MockEngine::new(Duration::ZERO));
        let backend = Backend::Offline(OfflineTranslator::with_engine(&config, engine));
        let scheduled = ScheduledBackend::new(backend, Scheduler::new("sugoi", &config.scheduler));
        BackendRegistry::new(vec![(14366, scheduled)], Duration::from_secs(30))
    }

    #[tokio::test]
    async fn routes_to_default_backend() {
        let registry = registry();
        let request = TranslationRequest::new("こんにちは");
        let result = registry.translate(&request).await.unwrap();
        assert_eq!(result.translated_text, "translated: こんにちは");
        assert_eq!(result.backend, "sugoi");
    }

    #[tokio::test]
    async fn rejects_unknown_backend_hint() {
        let registry = registry();
        let mut request = TranslationRequest::new("text");
        request.backend = Some("deepl".to_string());
        let err = registry.translate(&request).await.unwrap_err();
        assert!(matches!(err, TranslateError::InvalidBackendSelection(name) if name == "deepl"));
    }

    #[tokio::test]
    async fn rejects_empty_text() {
        let registry = registry();
        let err = registry
            .translate(&TranslationRequest::new("   "))
            .await
            .unwrap_err();
        assert!(matches!(err, TranslateError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn rejects_unsupported_language_pair() {
        let registry = registry();
        let mut request = TranslationRequest::new("bonjour");
        request.target_lang = Some("French".to_string());
        let err = registry.translate(&request).await.unwrap_err();
        assert!(matches!(err, TranslateError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn resolves_legacy_port() {
        let registry = registry();
        assert!(registry.resolve_port(14366).is_some());
        assert!(registry.resolve_port(9999).is_none());
    }

    fn registry_with_engine(
        engine: Arc<dyn crate::translator::engine::InferenceEngine>,
    ) -> BackendRegistry {
        let config = test_config("sugoi");
        let backend = Backend::Offline(OfflineTranslator::with_engine(&config, engine));
        let scheduled = ScheduledBackend::new(backend, Scheduler::new("sugoi", &config.scheduler));
        BackendRegistry::new(vec![(14366, scheduled)], Duration::from_secs(30))
    }

    #[tokio::test]
    async fn per_request_engine_error_leaves_backend_in_service() {
        struct RejectingEngine;
        impl crate::translator::engine::InferenceEngine for RejectingEngine {
            fn model_name(&self) -> &str {
                "rejecting"
            }
            fn translate_batch(&self, _texts: &[String]) -> anyhow::Result<Vec<String>> {
                anyhow::bail!("malformed input")
            }
        }

        let registry = registry_with_engine(Arc::new(RejectingEngine));
        let err = registry
            .translate(&TranslationRequest::new("text"))
            .await
            .unwrap_err();
        assert!(matches!(err, TranslateError::Backend { .. }), "{err}");

        // One bad input does not take the backend down.
        assert!(registry.resolve(None).unwrap().is_ready());
    }

    #[tokio::test]
    async fn crashed_engine_marks_backend_out_of_service() {
        struct PanickingEngine;
        impl crate::translator::engine::InferenceEngine for PanickingEngine {
            fn model_name(&self) -> &str {
                "panicking"
            }
            fn translate_batch(&self, _texts: &[String]) -> anyhow::Result<Vec<String>> {
                panic!("engine crashed")
            }
        }

        let registry = registry_with_engine(Arc::new(PanickingEngine));
        let err = registry
            .translate(&TranslationRequest::new("text"))
            .await
            .unwrap_err();
        assert!(matches!(err, TranslateError::BackendUnavailable { .. }), "{err}");

        // Subsequent requests fail fast without reaching the engine.
        let backend = registry.resolve(None).unwrap();
        assert!(!backend.is_ready());
        let err = registry
            .translate(&TranslationRequest::new("text"))
            .await
            .unwrap_err();
        assert!(matches!(err, TranslateError::BackendUnavailable { .. }), "{err}");
    }
}
