//! Remote LLM backend speaking the OpenAI-compatible chat completions
//! protocol. Stateless per request from the caller's perspective; keeps a
//! rolling conversation context internally for translation consistency.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{LanguagePair, Translator};
use crate::config::LlmTranslatorConfig;
use crate::error::{StartupError, TranslateError};
use crate::plugins::{self, Glossary};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    top_p: f32,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// One attempt's outcome, before retry policy is applied.
enum CallError {
    Timeout,
    Transient(String),
    Fatal(String),
}

pub struct LlmTranslator {
    config: LlmTranslatorConfig,
    client: reqwest::Client,
    languages: LanguagePair,
    /// Recent user/assistant turns, trimmed to `context_lines`.
    context: Mutex<VecDeque<ChatMessage>>,
    glossary: Option<Glossary>,
    paused: AtomicBool,
}

impl LlmTranslator {
    pub fn new(config: &LlmTranslatorConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .expect("http client");

        let glossary = config
            .dictionary_path
            .as_deref()
            .map(Glossary::load)
            .filter(|g| !g.is_empty());

        info!(
            "initialized LLM translator '{}': model={}, api_server={}",
            config.name, config.model_name, config.api_server
        );

        Self {
            languages: LanguagePair::new(&config.input_language, &config.output_language),
            context: Mutex::new(VecDeque::new()),
            glossary,
            paused: AtomicBool::new(false),
            client,
            config: config.clone(),
        }
    }

    /// Lightweight reachability/auth probe run before the service accepts
    /// traffic. A dead endpoint, or a remote endpoint rejecting the key,
    /// refuses process start.
    pub async fn check_endpoint(&self) -> Result<(), StartupError> {
        let url = format!("{}/models", self.config.api_server.trim_end_matches('/'));
        let mut request = self.client.get(&url);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StartupError::EndpointUnreachable {
                endpoint: self.config.api_server.clone(),
                cause: e.to_string(),
            })?;

        match response.status() {
            // Local servers answer /models inconsistently; only a remote
            // endpoint rejecting the key refuses start.
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN if !self.config.is_local => {
                Err(StartupError::EndpointUnreachable {
                    endpoint: self.config.api_server.clone(),
                    cause: format!("authentication rejected ({})", response.status()),
                })
            }
            _ => Ok(()),
        }
    }

    /// System prompt with the active language pair substituted in.
    fn system_prompt(&self) -> String {
        self.config
            .system_prompt
            .replace("{input_language}", &self.languages.input.read())
            .replace("{output_language}", &self.languages.output.read())
    }

    fn build_messages(&self, user_text: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::new();
        messages.push(ChatMessage {
            role: "system".to_string(),
            content: self.system_prompt(),
        });
        messages.extend(self.context.lock().iter().cloned());
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: user_text.to_string(),
        });
        messages
    }

    fn record_turn(&self, user_text: &str, assistant_text: &str) {
        let mut context = self.context.lock();
        context.push_back(ChatMessage {
            role: "user".to_string(),
            content: user_text.to_string(),
        });
        context.push_back(ChatMessage {
            role: "assistant".to_string(),
            content: assistant_text.to_string(),
        });
        while context.len() > self.config.context_lines {
            context.pop_front();
        }
    }

    async fn execute(&self, messages: &[ChatMessage]) -> Result<String, CallError> {
        let url = format!(
            "{}/chat/completions",
            self.config.api_server.trim_end_matches('/')
        );
        let payload = ChatCompletionRequest {
            model: &self.config.model_name,
            messages,
            temperature: self.config.temperature,
            top_p: self.config.top_p,
        };

        let mut request = self.client.post(&url).json(&payload);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                CallError::Timeout
            } else {
                CallError::Transient(format!("network error: {e}"))
            }
        })?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(CallError::Transient(format!("server error {status}")));
        }
        if !status.is_success() {
            return Err(CallError::Fatal(format!("request rejected ({status})")));
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| CallError::Fatal(format!("malformed response: {e}")))?;

        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| CallError::Fatal("response contained no choices".to_string()))
    }

    /// Retry transient failures with exponential backoff; fatal failures
    /// (auth, malformed request) propagate immediately.
    async fn execute_with_retry(
        &self,
        messages: &[ChatMessage],
    ) -> Result<String, TranslateError> {
        let attempts = self.config.max_retries.max(1);
        let mut backoff = Duration::from_millis(self.config.initial_backoff_ms);
        let mut last_error = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                warn!(
                    "LLM request failed, retrying in {:?} (attempt {}/{})",
                    backoff, attempt, attempts
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }

            match self.execute(messages).await {
                Ok(text) => return Ok(text),
                Err(e @ (CallError::Timeout | CallError::Transient(_))) => last_error = Some(e),
                Err(CallError::Fatal(cause)) => {
                    return Err(TranslateError::Backend {
                        backend: self.config.name.clone(),
                        cause,
                    });
                }
            }
        }

        Err(match last_error {
            Some(CallError::Timeout) => TranslateError::BackendTimeout(self.config.name.clone()),
            Some(CallError::Transient(cause)) => TranslateError::Backend {
                backend: self.config.name.clone(),
                cause,
            },
            _ => TranslateError::Backend {
                backend: self.config.name.clone(),
                cause: "no attempts executed".to_string(),
            },
        })
    }

    async fn translate_inner(&self, text: &str) -> Result<String, TranslateError> {
        let input = plugins::process_input_text(text, self.glossary.as_ref());
        let messages = self.build_messages(&input);
        debug!("messages: {:?}", messages);

        let result = self.execute_with_retry(&messages).await?;
        self.record_turn(&input, &result);
        Ok(plugins::process_output_text(&result))
    }

    fn change_language(&self, slot: &parking_lot::RwLock<String>, language: &str) -> String {
        if !self.supports_language(language) {
            return "sorry, translator doesn't have this language".to_string();
        }
        *slot.write() = language.to_string();
        // The system prompt is rebuilt per call, so stale context is the
        // only thing to clear.
        self.context.lock().clear();
        format!("language changed to {language}")
    }
}

#[async_trait]
impl Translator for LlmTranslator {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn is_ready(&self) -> bool {
        !self.paused.load(Ordering::Relaxed)
    }

    async fn translate(&self, text: &str) -> Result<String, TranslateError> {
        if self.paused.load(Ordering::Relaxed) {
            return Ok("Translation is paused at the moment".to_string());
        }
        let result = self.translate_inner(text).await?;
        info!("{:?}   ->   {:?}", text, result);
        Ok(result)
    }

    async fn translate_batch(&self, texts: &[String]) -> Result<Vec<String>, TranslateError> {
        if self.paused.load(Ordering::Relaxed) {
            return Ok(vec!["Translation is paused at the moment".to_string()]);
        }
        let mut translations = Vec::with_capacity(texts.len());
        for text in texts {
            let translated = self.translate_inner(text).await?;
            info!("{:?}   ->   {:?}", text, translated);
            translations.push(translated);
        }
        Ok(translations)
    }

    fn supports_language(&self, language: &str) -> bool {
        self.config.supported_languages.contains_key(language)
    }

    fn change_input_language(&self, language: &str) -> String {
        let reply = self.change_language(&self.languages.input, language);
        reply.replace("language changed", "input language changed")
    }

    fn change_output_language(&self, language: &str) -> String {
        let reply = self.change_language(&self.languages.output, language);
        reply.replace("language changed", "output language changed")
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }
}
