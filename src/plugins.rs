//! Text processing applied around every backend call: glossary term
//! substitution on input, whitespace cleanup on output.

use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Glossary loaded from a `dictionary.json` file, mapping source-language
/// terms to fixed target-language renderings.
#[derive(Debug, Default, Clone)]
pub struct Glossary {
    terms: HashMap<String, String>,
}

impl Glossary {
    /// A missing or malformed file is not fatal; translations simply run
    /// without glossary substitution.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<HashMap<String, String>>(&content) {
                Ok(terms) => {
                    tracing::info!("{} terms loaded from {}", terms.len(), path.display());
                    Self { terms }
                }
                Err(e) => {
                    warn!("{} failed to parse: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                warn!("{} failed to load: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn apply(&self, text: &str) -> String {
        let mut result = text.to_string();
        for (term, replacement) in &self.terms {
            result = result.replace(term, replacement);
        }
        result
    }
}

pub fn process_input_text(text: &str, glossary: Option<&Glossary>) -> String {
    debug!("original text: {:?}", text);
    let processed = match glossary {
        Some(g) if !g.is_empty() => g.apply(text),
        _ => text.to_string(),
    };
    debug!("processed text: {:?}", processed);
    processed
}

pub fn process_output_text(text: &str) -> String {
    collapse_whitespace(text.trim())
}

fn collapse_whitespace(text: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"[ \t]{2,}").expect("static regex"));
    re.replace_all(text, " ").into_owned()
}
