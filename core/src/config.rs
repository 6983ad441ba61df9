//! Engine-wide settings.

use serde::{Deserialize, Serialize};

/// Tunables for formula evaluation.
///
/// Every field has a default so a partial JSON document (or none at all) is
/// enough to configure the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum nesting of formula-through-formula evaluation
    pub max_depth: usize,
    /// Translate `#id.name` tokens before evaluating a formula
    pub legacy_syntax: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: 64,
            legacy_syntax: true,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON configuration document.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_document_keeps_defaults() {
        let config = EngineConfig::from_json(r#"{ "max_depth": 8 }"#).unwrap();
        assert_eq!(config.max_depth, 8);
        assert!(config.legacy_syntax);
    }

    #[test]
    fn test_empty_document() {
        assert_eq!(EngineConfig::from_json("{}").unwrap(), EngineConfig::default());
    }
}
