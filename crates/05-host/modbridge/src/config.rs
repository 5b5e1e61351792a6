use std::env;
use std::fmt;
use std::str::FromStr;

use buffers::MemoryConfig;
use module_abi::ModuleImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::callbacks::CallbackTable;

/// The two ways a native module can be embedded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmbeddingKind {
    /// The module runs on the host's threads; synchronous calls are possible.
    InProcess,
    /// The module runs on a dedicated main worker; every call is asynchronous.
    Workers,
}

/// Rejected embedding name.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("unknown embedding `{0}` (expected `in-process` or `workers`)")]
pub struct ParseEmbeddingError(String);

impl EmbeddingKind {
    /// Environment variable consulted when the config does not name an embedding.
    pub const ENV_VAR: &'static str = "MODBRIDGE_EMBEDDING";

    pub fn as_str(self) -> &'static str {
        match self {
            EmbeddingKind::InProcess => "in-process",
            EmbeddingKind::Workers => "workers",
        }
    }

    /// Resolves the embedding: `explicit`, then [`EmbeddingKind::ENV_VAR`], then workers.
    pub fn detect(explicit: Option<EmbeddingKind>) -> EmbeddingKind {
        if let Some(kind) = explicit {
            return kind;
        }
        match env::var(Self::ENV_VAR) {
            Ok(value) => value.parse().unwrap_or_else(|err| {
                tracing::warn!("{}: {err}; using workers", Self::ENV_VAR);
                EmbeddingKind::Workers
            }),
            Err(_) => EmbeddingKind::Workers,
        }
    }
}

impl FromStr for EmbeddingKind {
    type Err = ParseEmbeddingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in-process" | "inprocess" => Ok(EmbeddingKind::InProcess),
            "workers" | "multi-worker" => Ok(EmbeddingKind::Workers),
            _ => Err(ParseEmbeddingError(s.to_owned())),
        }
    }
}

impl fmt::Display for EmbeddingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Presentation options. Accepted and reported, never acted upon here.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiFlags {
    /// Inject the default stylesheet and loading indicator.
    pub default_styles: bool,
    /// Identifier of the surface to render into.
    pub canvas: Option<String>,
}

/// Everything `initialize` needs.
#[derive(Clone, Debug)]
pub struct HostConfig {
    pub module: ModuleImage,
    /// `None` defers to [`EmbeddingKind::detect`].
    pub embedding: Option<EmbeddingKind>,
    pub memory: MemoryConfig,
    pub ui: UiFlags,
    /// Callbacks registered before initialization.
    pub callbacks: CallbackTable,
}

impl HostConfig {
    pub fn new(module: ModuleImage) -> Self {
        Self {
            module,
            embedding: None,
            memory: MemoryConfig::default(),
            ui: UiFlags::default(),
            callbacks: CallbackTable::new(),
        }
    }

    pub fn with_embedding(mut self, embedding: EmbeddingKind) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_memory(mut self, memory: MemoryConfig) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_ui(mut self, ui: UiFlags) -> Self {
        self.ui = ui;
        self
    }

    pub fn with_callbacks(mut self, callbacks: CallbackTable) -> Self {
        self.callbacks = callbacks;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_names_parse_leniently() {
        assert_eq!("in-process".parse(), Ok(EmbeddingKind::InProcess));
        assert_eq!(" Workers ".parse(), Ok(EmbeddingKind::Workers));
        assert!("threads".parse::<EmbeddingKind>().is_err());
        assert_eq!(EmbeddingKind::InProcess.to_string(), "in-process");
    }

    #[test]
    fn explicit_choice_wins_over_the_environment() {
        assert_eq!(
            EmbeddingKind::detect(Some(EmbeddingKind::InProcess)),
            EmbeddingKind::InProcess
        );
    }
}
