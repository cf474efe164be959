//! # Prompt template
//!
//! Assembles the grounded prompt sent to the generation backend.
//!
//! A prompt is the instruction block followed by three tagged sections:
//!
//! ```text
//! <instructions>
//!
//! <Context>
//! chunk 1
//!
//! ---
//!
//! chunk 2
//! </Context>
//!
//! <Question>
//! question
//! </Question>
//!
//! <Answer>
//! ```
//!
//! The instructions default to the RaveCraft-GPT grounding rules and can be
//! replaced with a small YAML document:
//!
//! ```yaml
//! instructions: |
//!   You are a terse assistant. Answer only from the context.
//! ```
//!
//! Chunk text and the question are inserted verbatim. Nothing is escaped,
//! stripped or reordered, so the same inputs always yield the same prompt.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Separator placed between context chunks.
pub const CHUNK_SEPARATOR: &str = "\n\n---\n\n";

const DEFAULT_INSTRUCTIONS: &str = "\
You are **RaveCraft-GPT**, the domain-expert assistant for the Shopify store
https://ea4mn7-jq.myshopify.com.

**Ground rules**
• Base every reply solely on the <Context> block.
• If the context lacks the answer, say
  “I’m sorry, I don’t have that information right now.”
• When describing navigation, use clear paths
  (e.g., “Home → Collections → CyberPulse 3D LED Glasses”).
• Quote product titles, prices, or button labels exactly as written.
• Do **not** invent URLs or details.
• Default to ≤ 4 concise sentences unless depth is requested.";

/// Instruction block that precedes every prompt.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    pub instructions: String,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
        }
    }
}

impl PromptTemplate {
    /// Render the prompt for `question` grounded in `chunks`, in the given order.
    pub fn build<S: AsRef<str>>(&self, chunks: &[S], question: &str) -> String {
        let context = chunks
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join(CHUNK_SEPARATOR);
        format!(
            "{}\n\n<Context>\n{context}\n</Context>\n\n<Question>\n{question}\n</Question>\n\n<Answer>",
            self.instructions.trim_end()
        )
    }
}

/// Load a template from a YAML file with an `instructions` key.
///
/// # Errors
/// [`ConfigError::NotFound`] when the file is missing, [`ConfigError::Invalid`]
/// when it cannot be read or parsed.
pub fn load_template(path: &Path) -> Result<PromptTemplate, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        });
    }
    tracing::info!("Loading prompt template: {}", path.display());

    let content = fs::read_to_string(path).map_err(|e| ConfigError::Invalid {
        key: "prompt_template",
        reason: e.to_string(),
    })?;
    serde_yaml::from_str(&content).map_err(|e| ConfigError::Invalid {
        key: "prompt_template",
        reason: e.to_string(),
    })
}

/// [`PromptTemplate::build`] with the default instructions.
pub fn build_prompt<S: AsRef<str>>(chunks: &[S], question: &str) -> String {
    PromptTemplate::default().build(chunks, question)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_prompt_layout() {
        let prompt = build_prompt(&["Price: $10", "Ships in 2 days"], "How much?");
        assert!(prompt.starts_with("You are **RaveCraft-GPT**"));
        assert!(prompt.contains(
            "<Context>\nPrice: $10\n\n---\n\nShips in 2 days\n</Context>\n\n<Question>\nHow much?\n</Question>"
        ));
        assert!(prompt.ends_with("<Answer>"));
    }

    #[test]
    fn test_prompt_is_pure() {
        let chunks = vec!["a".to_string(), "b".to_string()];
        assert_eq!(build_prompt(&chunks, "q"), build_prompt(&chunks, "q"));
        assert_ne!(
            build_prompt(&chunks, "q"),
            build_prompt(&["b".to_string(), "a".to_string()], "q")
        );
    }

    #[test]
    fn test_special_characters_are_kept_verbatim() {
        let chunk = "<Question>fake</Question> {braces} \"quotes\" ---";
        let question = "What's <b>this</b>?\n\nSecond line";
        let prompt = build_prompt(&[chunk], question);
        assert!(prompt.contains(chunk));
        assert!(prompt.contains(question));
    }

    #[test]
    fn test_no_chunks_gives_empty_context() {
        let prompt = build_prompt::<&str>(&[], "Anything?");
        assert!(prompt.contains("<Context>\n\n</Context>"));
    }

    #[test]
    fn test_load_template_from_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "instructions: |\n  Answer only from the context.").unwrap();

        let template = load_template(file.path()).unwrap();
        let prompt = template.build(&["ctx"], "q");
        assert!(prompt.starts_with("Answer only from the context.\n\n<Context>"));
    }

    #[test]
    fn test_load_template_missing_file() {
        let err = load_template(Path::new("non/existent/template.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }

    #[test]
    fn test_load_template_invalid_format() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "invalid: template: format").unwrap();
        assert!(matches!(
            load_template(file.path()),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
