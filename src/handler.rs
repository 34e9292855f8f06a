//! Legacy Sugoi wire protocol: one listener port per translator, commands
//! POSTed to `/` as `{"message": <command>, "content": ...}`, responses as
//! bare JSON values.

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use crate::error::TranslateError;
use crate::registry::ScheduledBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Command {
    #[serde(rename = "close server")]
    Close,
    #[serde(rename = "check if server is ready")]
    Ready,
    #[serde(rename = "translate sentences")]
    TranslateSentences,
    #[serde(rename = "translate batch")]
    TranslateBatch,
    #[serde(rename = "change input language")]
    ChangeInput,
    #[serde(rename = "change output language")]
    ChangeOutput,
    #[serde(rename = "pause")]
    Pause,
    #[serde(rename = "resume")]
    Resume,
}

#[derive(Debug, Deserialize)]
pub struct CommandPayload {
    pub message: Command,
    #[serde(default)]
    pub content: Value,
}

impl CommandPayload {
    /// Some legacy clients send a list to "translate sentences"; that has
    /// always meant a batch.
    pub fn normalized(mut self) -> Self {
        if self.message == Command::TranslateSentences && self.content.is_array() {
            debug!("legacy support: single-sentence translate converted to batch");
            self.message = Command::TranslateBatch;
        }
        self
    }

    fn content_str(&self) -> Result<&str, TranslateError> {
        self.content
            .as_str()
            .ok_or_else(|| TranslateError::InvalidInput("expected a string content".into()))
    }

    fn content_list(&self) -> Result<Vec<String>, TranslateError> {
        let items = self
            .content
            .as_array()
            .ok_or_else(|| TranslateError::InvalidInput("expected a list content".into()))?;
        items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| TranslateError::InvalidInput("expected string items".into()))
            })
            .collect()
    }
}

/// Execute one legacy command against the backend bound to this port.
pub async fn receive_command(
    backend: &Arc<ScheduledBackend>,
    payload: CommandPayload,
    deadline: Duration,
) -> Result<Value, TranslateError> {
    let span = info_span!("command", uid = %Uuid::new_v4(), backend = backend.name());
    async move {
        let started = Instant::now();
        let payload = payload.normalized();
        info!("received command {:?}", payload.message);

        let response = match payload.message {
            Command::Close => {
                // Stopping a single listener is not supported; ignored for
                // compatibility with clients that always send it.
                debug!("die command ignored");
                Value::Null
            }
            Command::Ready => json!(backend.is_ready()),
            Command::TranslateSentences => {
                let text = payload.content_str()?;
                let translated = backend
                    .translate_one(text.to_string(), Some(deadline))
                    .await?;
                json!(translated)
            }
            Command::TranslateBatch => {
                let texts = payload.content_list()?;
                let translated = backend.translate_many(texts, Some(deadline)).await?;
                json!(translated)
            }
            Command::ChangeInput => {
                json!(backend.change_input_language(payload.content_str()?))
            }
            Command::ChangeOutput => {
                json!(backend.change_output_language(payload.content_str()?))
            }
            Command::Pause => {
                backend.pause();
                Value::Null
            }
            Command::Resume => {
                backend.resume();
                Value::Null
            }
        };

        info!("command handled in {:.3}s", started.elapsed().as_secs_f64());
        Ok(response)
    }
    .instrument(span)
    .await
}
