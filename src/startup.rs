//! Startup validation. Every configured backend is built and checked
//! before any listener binds; all failures are aggregated into a single
//! report so operators see the full picture in one crash, and partial
//! startup (serving with a broken backend) never happens.

use std::time::Duration;
use tracing::{error, info};

use crate::config::{AppConfig, TranslatorConfig};
use crate::error::StartupError;
use crate::registry::{BackendRegistry, ScheduledBackend};
use crate::scheduler::Scheduler;
use crate::translator::llm::LlmTranslator;
use crate::translator::offline::OfflineTranslator;
use crate::translator::Backend;

/// Build and validate every enabled backend. `Err` carries every problem
/// found, not just the first.
pub async fn build_registry(config: &AppConfig) -> Result<BackendRegistry, Vec<StartupError>> {
    if let Err(e) = config.validate() {
        return Err(vec![e]);
    }

    let mut entries = Vec::new();
    let mut errors = Vec::new();

    for translator in config.translators.iter().filter(|t| t.enabled()) {
        match translator {
            TranslatorConfig::Offline(offline_config) => {
                match OfflineTranslator::load(offline_config) {
                    Ok(translator) => {
                        let scheduler =
                            Scheduler::new(&offline_config.name, &offline_config.scheduler);
                        entries.push((
                            offline_config.port,
                            ScheduledBackend::new(Backend::Offline(translator), scheduler),
                        ));
                    }
                    Err(e) => errors.push(e),
                }
            }
            TranslatorConfig::Llm(llm_config) => {
                let translator = LlmTranslator::new(llm_config);
                match translator.check_endpoint().await {
                    Ok(()) => {
                        let scheduler = Scheduler::new(&llm_config.name, &llm_config.scheduler);
                        entries.push((
                            llm_config.port,
                            ScheduledBackend::new(Backend::Llm(translator), scheduler),
                        ));
                    }
                    Err(e) => errors.push(e),
                }
            }
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    info!("startup validation passed for {} backend(s)", entries.len());
    Ok(BackendRegistry::new(
        entries,
        Duration::from_millis(config.request_timeout_ms),
    ))
}

/// Log the aggregated startup report. The caller exits non-zero afterwards.
pub fn log_report(errors: &[StartupError]) {
    error!("startup validation failed with {} error(s):", errors.len());
    for (i, e) in errors.iter().enumerate() {
        error!("  {}. {}", i + 1, e);
    }
    error!("refusing to start; fix the configuration and restart");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OfflineTranslatorConfig, SchedulerConfig};
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn offline_config(name: &str, port: u16, model_dir: &str) -> TranslatorConfig {
        TranslatorConfig::Offline(OfflineTranslatorConfig {
            enabled: true,
            name: name.to_string(),
            port,
            input_language: "Japanese".to_string(),
            output_language: "English".to_string(),
            supported_languages: HashMap::new(),
            model_dir: PathBuf::from(model_dir),
            source_tokenizer_path: PathBuf::from("/nonexistent/source.json"),
            target_tokenizer_path: PathBuf::from("/nonexistent/target.json"),
            device: crate::config::Device::Cpu,
            intra_threads: 1,
            max_decoding_length: 32,
            decoder_start_token_id: 0,
            eos_token_id: 0,
            scheduler: SchedulerConfig {
                max_concurrency: 1,
                queue_capacity: 4,
                max_queue_wait_ms: 1_000,
            },
        })
    }

    fn app_config(translators: Vec<TranslatorConfig>) -> AppConfig {
        AppConfig {
            debug: false,
            root_port: 14365,
            host: "127.0.0.1".to_string(),
            request_timeout_ms: 30_000,
            translators,
        }
    }

    #[tokio::test]
    async fn nonexistent_model_path_reports_model_load_error() {
        let config = app_config(vec![offline_config("sugoi", 14366, "/nonexistent/models")]);
        let errors = build_registry(&config).await.err().expect("startup should fail");
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], StartupError::ModelLoad { .. }), "{}", errors[0]);
    }

    #[tokio::test]
    async fn all_failures_are_aggregated() {
        let config = app_config(vec![
            offline_config("a", 14366, "/nonexistent/a"),
            offline_config("b", 14367, "/nonexistent/b"),
        ]);
        let errors = build_registry(&config).await.err().expect("startup should fail");
        assert_eq!(errors.len(), 2);
    }

    #[tokio::test]
    async fn empty_translator_list_is_config_invalid() {
        let config = app_config(vec![]);
        let errors = build_registry(&config).await.err().expect("startup should fail");
        assert!(matches!(errors[0], StartupError::ConfigInvalid(_)));
    }
}
