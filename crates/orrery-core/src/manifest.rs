//! Unit manifests
//!
//! A deployment unit declares its components in a manifest, either TOML:
//!
//! ```toml
//! [[component]]
//! name = "clock"
//! provides = "time.Clock"
//!
//! [[component]]
//! name = "scheduler"
//! [[component.reference]]
//! name = "clock"
//! interface = "time.Clock"
//! ```
//!
//! or the equivalent JSON (`{"component": [...]}`). Entries are validated
//! individually: one invalid component never hides the rest of the unit.

use crate::description::{Description, DescriptionDocument, InvalidDescription};
use crate::errors::{CoreError, Result};
use serde::{Deserialize, Serialize};

/// Serialization format of a manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    /// TOML document
    Toml,
    /// JSON document
    Json,
}

impl ManifestFormat {
    /// Guess the format from a file extension
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "toml" => Some(ManifestFormat::Toml),
            "json" => Some(ManifestFormat::Json),
            _ => None,
        }
    }
}

/// Parsed, not yet validated, unit manifest
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnitManifest {
    /// Component documents in declaration order
    #[serde(default, rename = "component")]
    pub components: Vec<DescriptionDocument>,
}

/// Result of validating every component of a manifest
#[derive(Debug, Clone, Default)]
pub struct ParsedUnit {
    /// Components that passed validation
    pub descriptions: Vec<Description>,
    /// Components that were rejected
    pub invalid: Vec<InvalidDescription>,
}

impl UnitManifest {
    /// Parse a manifest in the given format
    pub fn parse(source: &str, format: ManifestFormat) -> Result<Self> {
        match format {
            ManifestFormat::Toml => Self::from_toml_str(source),
            ManifestFormat::Json => Self::from_json_str(source),
        }
    }

    /// Parse a TOML manifest
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|e| CoreError::manifest(format!("invalid TOML: {e}")))
    }

    /// Parse a JSON manifest
    pub fn from_json_str(source: &str) -> Result<Self> {
        serde_json::from_str(source).map_err(|e| CoreError::manifest(format!("invalid JSON: {e}")))
    }

    /// Validate every component
    pub fn validate(self) -> ParsedUnit {
        let mut parsed = ParsedUnit::default();
        for doc in self.components {
            match Description::try_from(doc) {
                Ok(description) => parsed.descriptions.push(description),
                Err(invalid) => {
                    tracing::debug!(component = %invalid.component, reason = %invalid.reason, "manifest entry rejected");
                    parsed.invalid.push(invalid);
                }
            }
        }
        parsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::{Activation, InvalidReason};

    const MANIFEST: &str = r#"
        [[component]]
        name = "clock"
        provides = "time.Clock"

        [[component]]
        name = "broken"
        factory = "f"
        immediate = true

        [[component]]
        name = "scheduler"
        [[component.reference]]
        name = "clock"
        interface = "time.Clock"
    "#;

    #[test]
    fn test_partial_invalidity() {
        let parsed = UnitManifest::from_toml_str(MANIFEST).unwrap().validate();
        let names: Vec<&str> = parsed.descriptions.iter().map(|d| d.name()).collect();
        assert_eq!(names, vec!["clock", "scheduler"]);
        assert_eq!(parsed.invalid.len(), 1);
        assert_eq!(parsed.invalid[0].component, "broken");
        assert_eq!(parsed.invalid[0].reason, InvalidReason::ImmediateFactory);
        assert_eq!(parsed.descriptions[0].activation(), &Activation::Delayed);
        assert_eq!(parsed.descriptions[1].activation(), &Activation::Immediate);
    }

    #[test]
    fn test_json_manifest() {
        let source = r#"{"component": [{"name": "a", "provides": "x", "scope": "bundle"}]}"#;
        let parsed = UnitManifest::parse(source, ManifestFormat::Json).unwrap().validate();
        assert_eq!(parsed.descriptions.len(), 1);
        assert!(parsed.invalid.is_empty());
    }

    #[test]
    fn test_syntax_errors_surface() {
        let err = UnitManifest::from_toml_str("[[component]]\nname = ").unwrap_err();
        assert!(err.to_string().contains("invalid TOML"));
        assert_eq!(ManifestFormat::from_extension("JSON"), Some(ManifestFormat::Json));
    }
}
