//! Prompt templates per model family.
//!
//! Each family wraps the user input (and, where the family has one, a system
//! message) in its own control tokens. The set of families is closed; new
//! ones are added as a variant here plus an entry in [`REGISTRY`].

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// End-of-turn marker used as the default stop sequence for requests that
/// are not bound to a particular family.
pub const DEFAULT_END_MARKER: &str = "<|end|>";

const LLAMA3_DEFAULT_SYSTEM_PROMPT: &str = "You are Llama-3-instruct. AI agent";

/// A supported model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ModelFamily {
    /// No template: the input is sent verbatim.
    Generic,
    /// Microsoft Phi-3 mini instruct.
    Phi3Mini,
    /// Meta Llama 3 instruct.
    Llama3Instruct,
}

/// Identifier → family lookup table. Keys are normalized (lowercase, `-`
/// separators).
const REGISTRY: &[(&str, ModelFamily)] = &[
    ("generic", ModelFamily::Generic),
    ("raw", ModelFamily::Generic),
    ("phi-3-mini", ModelFamily::Phi3Mini),
    ("phi-3", ModelFamily::Phi3Mini),
    ("phi3", ModelFamily::Phi3Mini),
    ("phi3-mini", ModelFamily::Phi3Mini),
    ("llama-3-instruct", ModelFamily::Llama3Instruct),
    ("llama-3", ModelFamily::Llama3Instruct),
    ("llama3", ModelFamily::Llama3Instruct),
    ("llama3-instruct", ModelFamily::Llama3Instruct),
];

impl ModelFamily {
    /// All families, in registry order.
    pub const ALL: [ModelFamily; 3] = [
        ModelFamily::Generic,
        ModelFamily::Phi3Mini,
        ModelFamily::Llama3Instruct,
    ];

    /// Canonical identifier.
    pub fn id(self) -> &'static str {
        match self {
            ModelFamily::Generic => "generic",
            ModelFamily::Phi3Mini => "phi-3-mini",
            ModelFamily::Llama3Instruct => "llama-3-instruct",
        }
    }

    /// Look up a family by identifier or alias (case-insensitive, `_` and
    /// spaces are treated as `-`).
    pub fn lookup(identifier: &str) -> Option<Self> {
        let key: String = identifier
            .trim()
            .chars()
            .map(|c| match c {
                '_' | ' ' => '-',
                c => c.to_ascii_lowercase(),
            })
            .collect();

        REGISTRY
            .iter()
            .find(|(id, _)| *id == key)
            .map(|(_, family)| *family)
    }

    /// Guess the family from a model file name, e.g.
    /// `Phi-3-mini-4k-instruct-fp16.gguf`.
    pub fn infer_from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_lowercase();

        if name.contains("phi-3") || name.contains("phi3") {
            Some(ModelFamily::Phi3Mini)
        } else if name.contains("llama-3") || name.contains("llama3") {
            Some(ModelFamily::Llama3Instruct)
        } else {
            None
        }
    }

    /// System prompt substituted when the request carries none. `None` for
    /// families without a system turn.
    pub fn default_system_prompt(self) -> Option<&'static str> {
        match self {
            ModelFamily::Llama3Instruct => Some(LLAMA3_DEFAULT_SYSTEM_PROMPT),
            ModelFamily::Generic | ModelFamily::Phi3Mini => None,
        }
    }

    /// Whether the template has a system turn at all.
    pub fn supports_system_prompt(self) -> bool {
        matches!(self, ModelFamily::Llama3Instruct)
    }

    /// Marker the model emits at the end of its turn.
    pub fn end_marker(self) -> &'static str {
        match self {
            ModelFamily::Generic | ModelFamily::Phi3Mini => DEFAULT_END_MARKER,
            ModelFamily::Llama3Instruct => "<|eot_id|>",
        }
    }

    /// Format the full prompt for this family.
    pub fn get_prompt(self, user_input: &str, system_prompt: Option<&str>) -> String {
        match self {
            ModelFamily::Generic => user_input.to_string(),
            ModelFamily::Phi3Mini => format!("<|user|>\n{user_input}<|end|>\n<|assistant|>"),
            ModelFamily::Llama3Instruct => {
                let system = system_prompt.unwrap_or(LLAMA3_DEFAULT_SYSTEM_PROMPT);
                format!(
                    "<|begin_of_text|><|start_header_id|>system<|end_header_id|>\n\n\
                     {system}<|eot_id|><|start_header_id|>user<|end_header_id|>\n\n\
                     {user_input}<|eot_id|><|start_header_id|>assistant<|end_header_id|>\n\n"
                )
            }
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Unknown model family identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown model family: {0:?}")]
pub struct UnknownFamily(pub String);

impl FromStr for ModelFamily {
    type Err = UnknownFamily;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelFamily::lookup(s).ok_or_else(|| UnknownFamily(s.to_string()))
    }
}

impl TryFrom<String> for ModelFamily {
    type Error = UnknownFamily;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ModelFamily> for String {
    fn from(family: ModelFamily) -> Self {
        family.id().to_string()
    }
}
