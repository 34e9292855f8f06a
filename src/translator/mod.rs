//! The uniform translation contract every backend satisfies, plus the
//! exhaustive backend sum type the router dispatches over.

pub mod engine;
pub mod llm;
pub mod offline;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::TranslateError;

/// One inbound translation, already parsed from wire format by the
/// boundary layer. Immutable once constructed.
#[derive(Debug, Clone, Deserialize)]
pub struct TranslationRequest {
    pub text: String,
    #[serde(default)]
    pub source_lang: Option<String>,
    #[serde(default)]
    pub target_lang: Option<String>,
    /// Which configured translator should handle this, when the caller
    /// wants something other than the deployment default.
    #[serde(default)]
    pub backend: Option<String>,
    /// Overrides the scheduler's default overall deadline.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl TranslationRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source_lang: None,
            target_lang: None,
            backend: None,
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TranslationResult {
    pub translated_text: String,
    pub backend: String,
    #[serde(serialize_with = "serialize_millis")]
    pub latency: Duration,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Contract every translation backend satisfies. Backends are stateless
/// from the caller's perspective; any internal state (loaded model,
/// conversation context) persists across calls without affecting the
/// result contract.
#[async_trait]
pub trait Translator: Send + Sync {
    fn name(&self) -> &str;

    fn is_ready(&self) -> bool;

    /// Translate one message. The text has not yet been through input
    /// plugins; each backend applies its own.
    async fn translate(&self, text: &str) -> Result<String, TranslateError>;

    async fn translate_batch(&self, texts: &[String]) -> Result<Vec<String>, TranslateError>;

    fn supports_language(&self, language: &str) -> bool;

    /// Runtime language switching, a Sugoi wire-protocol command. Returns
    /// the user-facing acknowledgement string the legacy clients expect.
    fn change_input_language(&self, language: &str) -> String;

    fn change_output_language(&self, language: &str) -> String;

    fn pause(&self);

    fn resume(&self);
}

/// Closed set of backend kinds; selection by config string maps onto this
/// rather than open-ended dynamic dispatch.
pub enum Backend {
    Offline(offline::OfflineTranslator),
    Llm(llm::LlmTranslator),
}

impl Backend {
    fn as_translator(&self) -> &dyn Translator {
        match self {
            Backend::Offline(t) => t,
            Backend::Llm(t) => t,
        }
    }
}

#[async_trait]
impl Translator for Backend {
    fn name(&self) -> &str {
        self.as_translator().name()
    }

    fn is_ready(&self) -> bool {
        self.as_translator().is_ready()
    }

    async fn translate(&self, text: &str) -> Result<String, TranslateError> {
        match self {
            Backend::Offline(t) => t.translate(text).await,
            Backend::Llm(t) => t.translate(text).await,
        }
    }

    async fn translate_batch(&self, texts: &[String]) -> Result<Vec<String>, TranslateError> {
        match self {
            Backend::Offline(t) => t.translate_batch(texts).await,
            Backend::Llm(t) => t.translate_batch(texts).await,
        }
    }

    fn supports_language(&self, language: &str) -> bool {
        self.as_translator().supports_language(language)
    }

    fn change_input_language(&self, language: &str) -> String {
        self.as_translator().change_input_language(language)
    }

    fn change_output_language(&self, language: &str) -> String {
        self.as_translator().change_output_language(language)
    }

    fn pause(&self) {
        self.as_translator().pause()
    }

    fn resume(&self) {
        self.as_translator().resume()
    }
}

/// Shared runtime language-pair state. The static backend config is never
/// mutated after startup; the active pair lives here instead.
pub(crate) struct LanguagePair {
    pub input: parking_lot::RwLock<String>,
    pub output: parking_lot::RwLock<String>,
}

impl LanguagePair {
    pub fn new(input: &str, output: &str) -> Self {
        Self {
            input: parking_lot::RwLock::new(input.to_string()),
            output: parking_lot::RwLock::new(output.to_string()),
        }
    }
}
