use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::StartupError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub debug: bool,
    /// Port for the unified API (`/api/translate`, `/api/health`). Legacy
    /// clients talk to the per-translator ports instead.
    pub root_port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Overall per-request deadline, overridable per request.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub translators: Vec<TranslatorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum TranslatorConfig {
    Offline(OfflineTranslatorConfig),
    #[serde(rename = "LLM")]
    Llm(LlmTranslatorConfig),
}

/// Admission-control settings shared by every backend kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_queue_wait_ms")]
    pub max_queue_wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineTranslatorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub name: String,
    pub port: u16,
    #[serde(default = "default_input_language")]
    pub input_language: String,
    #[serde(default = "default_output_language")]
    pub output_language: String,
    #[serde(default = "default_offline_languages")]
    pub supported_languages: HashMap<String, String>,

    /// Directory holding `encoder.onnx` and `decoder.onnx`.
    pub model_dir: PathBuf,
    pub source_tokenizer_path: PathBuf,
    pub target_tokenizer_path: PathBuf,
    #[serde(default = "default_device")]
    pub device: Device,
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
    #[serde(default = "default_max_decoding_length")]
    pub max_decoding_length: usize,
    #[serde(default)]
    pub decoder_start_token_id: u32,
    #[serde(default)]
    pub eos_token_id: u32,

    #[serde(flatten)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmTranslatorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub name: String,
    pub port: u16,
    #[serde(default = "default_input_language")]
    pub input_language: String,
    #[serde(default = "default_output_language")]
    pub output_language: String,
    #[serde(default = "default_llm_languages")]
    pub supported_languages: HashMap<String, String>,

    pub model_name: String,
    pub api_server: String,
    #[serde(default)]
    pub api_key: String,
    /// Local OpenAI-compatible servers are probed without strict auth.
    #[serde(default = "default_true")]
    pub is_local: bool,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Rolling conversation context kept between calls, in messages.
    #[serde(default = "default_context_lines")]
    pub context_lines: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    /// Optional glossary applied to input text before prompting.
    #[serde(default)]
    pub dictionary_path: Option<PathBuf>,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(flatten)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Cuda,
}

impl TranslatorConfig {
    pub fn enabled(&self) -> bool {
        match self {
            TranslatorConfig::Offline(c) => c.enabled,
            TranslatorConfig::Llm(c) => c.enabled,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            TranslatorConfig::Offline(c) => &c.name,
            TranslatorConfig::Llm(c) => &c.name,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            TranslatorConfig::Offline(c) => c.port,
            TranslatorConfig::Llm(c) => c.port,
        }
    }

    pub fn scheduler(&self) -> &SchedulerConfig {
        match self {
            TranslatorConfig::Offline(c) => &c.scheduler,
            TranslatorConfig::Llm(c) => &c.scheduler,
        }
    }
}

impl AppConfig {
    /// Load from a file, dispatching on extension. TOML is the documented
    /// format; YAML and JSON are accepted for compatibility.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();

        let config: AppConfig = match ext.as_str() {
            "json" | "jsonld" => serde_json::from_str(&content)
                .with_context(|| format!("parsing {} as JSON", path.display()))?,
            "yaml" | "yml" => serde_yaml::from_str(&content)
                .with_context(|| format!("parsing {} as YAML", path.display()))?,
            _ => toml::from_str(&content)
                .with_context(|| format!("parsing {} as TOML", path.display()))?,
        };

        Ok(config)
    }

    /// Structural invariants that do not require touching the filesystem or
    /// the network. Deeper checks live in the startup validator.
    pub fn validate(&self) -> std::result::Result<(), StartupError> {
        let enabled: Vec<_> = self.translators.iter().filter(|t| t.enabled()).collect();
        if enabled.is_empty() {
            return Err(StartupError::ConfigInvalid(
                "no enabled translators configured".into(),
            ));
        }

        let mut ports = HashSet::new();
        ports.insert(self.root_port);
        let mut names = HashSet::new();
        for t in &enabled {
            if !ports.insert(t.port()) {
                return Err(StartupError::ConfigInvalid(format!(
                    "duplicate translator port {}",
                    t.port()
                )));
            }
            if !names.insert(t.name().to_string()) {
                return Err(StartupError::ConfigInvalid(format!(
                    "duplicate translator name '{}'",
                    t.name()
                )));
            }
            let sched = t.scheduler();
            if sched.max_concurrency == 0 {
                return Err(StartupError::ConfigInvalid(format!(
                    "translator '{}': max_concurrency must be at least 1",
                    t.name()
                )));
            }
        }

        Ok(())
    }
}

/// Candidate config locations, first hit wins.
pub fn find_config_path() -> Option<PathBuf> {
    let mut candidates: Vec<(&str, PathBuf)> = Vec::new();
    if let Ok(env) = std::env::var("TLSERVER_CONFIG_PATH") {
        candidates.push(("env TLSERVER_CONFIG_PATH", PathBuf::from(env)));
    }
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        candidates.push(("xdg config home", Path::new(&xdg).join("tlserver/config.toml")));
    }
    if let Ok(appdata) = std::env::var("APPDATA") {
        candidates.push(("appdata", Path::new(&appdata).join("tlserver/config.toml")));
    }
    candidates.push(("cwd", PathBuf::from("config.toml")));

    for (label, path) in candidates {
        tracing::debug!("resolving {} -> {}", label, path.display());
        if path.is_file() {
            return Some(path);
        }
    }
    None
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_input_language() -> String {
    "Japanese".to_string()
}

fn default_output_language() -> String {
    "English".to_string()
}

fn default_offline_languages() -> HashMap<String, String> {
    HashMap::from([
        ("English".to_string(), "English".to_string()),
        ("Japanese".to_string(), "Japanese".to_string()),
    ])
}

fn default_llm_languages() -> HashMap<String, String> {
    HashMap::from([
        ("English".to_string(), "English".to_string()),
        ("Japanese".to_string(), "Japanese".to_string()),
        ("Chinese".to_string(), "Simplified Chinese".to_string()),
        ("Korean".to_string(), "Korean".to_string()),
        ("Spanish".to_string(), "Spanish".to_string()),
        ("Portuguese".to_string(), "Brazilian Portuguese".to_string()),
        ("Vietnamese".to_string(), "Vietnamese".to_string()),
        ("Indonesian".to_string(), "Indonesian".to_string()),
        ("Arabic".to_string(), "Arabic".to_string()),
        ("German".to_string(), "German".to_string()),
    ])
}

fn default_device() -> Device {
    Device::Cpu
}

fn default_intra_threads() -> usize {
    4
}

fn default_max_decoding_length() -> usize {
    256
}

fn default_system_prompt() -> String {
    "You are a professional translator whose primary goal is to \
     precisely translate {input_language} to {output_language}. \
     You can speak colloquially if it makes the translation more accurate. \
     Only respond in {output_language}. \
     If you are unsure of a {input_language} sentence, still always try your best \
     estimate to respond with a complete {output_language} translation."
        .to_string()
}

fn default_context_lines() -> usize {
    50
}

fn default_temperature() -> f32 {
    0.4
}

fn default_top_p() -> f32 {
    0.95
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    2
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_request_timeout_ms() -> u64 {
    120_000
}

fn default_max_concurrency() -> usize {
    1
}

fn default_queue_capacity() -> usize {
    32
}

fn default_max_queue_wait_ms() -> u64 {
    10_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
root_port = 14365

[[translators]]
kind = "Offline"
name = "sugoi"
port = 14366
model_dir = "./assets/models/translate"
source_tokenizer_path = "./assets/models/tokenise/source.json"
target_tokenizer_path = "./assets/models/tokenise/target.json"
max_concurrency = 1

[[translators]]
kind = "LLM"
name = "llm"
port = 14368
model_name = "lm_studio/sugoi14b"
api_server = "http://127.0.0.1:1234/v1"
max_concurrency = 8
"#;

    #[test]
    fn parses_toml_config() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.root_port, 14365);
        assert_eq!(config.translators.len(), 2);
        assert!(config.validate().is_ok());

        match &config.translators[0] {
            TranslatorConfig::Offline(c) => {
                assert_eq!(c.name, "sugoi");
                assert_eq!(c.scheduler.max_concurrency, 1);
                assert_eq!(c.device, Device::Cpu);
                assert_eq!(c.input_language, "Japanese");
            }
            other => panic!("expected offline translator, got {:?}", other),
        }
        match &config.translators[1] {
            TranslatorConfig::Llm(c) => {
                assert_eq!(c.scheduler.max_concurrency, 8);
                assert_eq!(c.max_retries, 2);
                assert!(c.system_prompt.contains("{output_language}"));
            }
            other => panic!("expected llm translator, got {:?}", other),
        }
    }

    #[test]
    fn rejects_duplicate_ports() {
        let mut config: AppConfig = toml::from_str(SAMPLE).unwrap();
        match &mut config.translators[1] {
            TranslatorConfig::Llm(c) => c.port = 14366,
            _ => unreachable!(),
        }
        let err = config.validate().unwrap_err();
        assert!(matches!(err, StartupError::ConfigInvalid(_)), "{err}");
    }

    #[test]
    fn rejects_zero_concurrency() {
        let mut config: AppConfig = toml::from_str(SAMPLE).unwrap();
        match &mut config.translators[0] {
            TranslatorConfig::Offline(c) => c.scheduler.max_concurrency = 0,
            _ => unreachable!(),
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_translator_list() {
        let config = AppConfig {
            debug: false,
            root_port: 14365,
            host: default_host(),
            request_timeout_ms: default_request_timeout_ms(),
            translators: vec![],
        };
        assert!(config.validate().is_err());
    }
}
