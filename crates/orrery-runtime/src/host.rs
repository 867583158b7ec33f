//! Deployment units
//!
//! The hosting module system is an external collaborator. The engine only
//! needs a unit's id and its declared components; [`StaticUnit`] and
//! [`ManifestUnit`] cover programmatic and manifest-driven hosts.

use orrery_core::{
    CoreError, Description, ManifestFormat, ParsedUnit, UnitId, UnitManifest,
};
use std::path::Path;

/// A deployable unit declaring components
pub trait DeploymentUnit: Send + Sync {
    /// Unit identity
    fn id(&self) -> UnitId;

    /// Declared components, split into valid and rejected ones
    fn descriptions(&self) -> orrery_core::Result<ParsedUnit>;
}

/// Unit whose descriptions are built in code
#[derive(Debug, Clone)]
pub struct StaticUnit {
    id: UnitId,
    descriptions: Vec<Description>,
}

impl StaticUnit {
    /// New unit with no components
    pub fn new(id: impl Into<UnitId>) -> Self {
        Self {
            id: id.into(),
            descriptions: Vec::new(),
        }
    }

    /// Add a component
    pub fn with(mut self, description: Description) -> Self {
        self.descriptions.push(description);
        self
    }
}

impl DeploymentUnit for StaticUnit {
    fn id(&self) -> UnitId {
        self.id.clone()
    }

    fn descriptions(&self) -> orrery_core::Result<ParsedUnit> {
        Ok(ParsedUnit {
            descriptions: self.descriptions.clone(),
            invalid: Vec::new(),
        })
    }
}

/// Unit backed by a TOML or JSON manifest
#[derive(Debug, Clone)]
pub struct ManifestUnit {
    id: UnitId,
    manifest: UnitManifest,
}

impl ManifestUnit {
    /// Parse manifest text
    pub fn from_str(
        id: impl Into<UnitId>,
        source: &str,
        format: ManifestFormat,
    ) -> orrery_core::Result<Self> {
        Ok(Self {
            id: id.into(),
            manifest: UnitManifest::parse(source, format)?,
        })
    }

    /// Read a manifest file; the format follows the extension
    pub fn from_path(id: impl Into<UnitId>, path: &Path) -> orrery_core::Result<Self> {
        let format = path
            .extension()
            .and_then(|extension| extension.to_str())
            .and_then(ManifestFormat::from_extension)
            .ok_or_else(|| {
                CoreError::manifest(format!("unknown manifest format: {}", path.display()))
            })?;
        let source = std::fs::read_to_string(path).map_err(|e| {
            CoreError::manifest(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_str(id, &source, format)
    }

    /// The parsed manifest
    pub fn manifest(&self) -> &UnitManifest {
        &self.manifest
    }
}

impl DeploymentUnit for ManifestUnit {
    fn id(&self) -> UnitId {
        self.id.clone()
    }

    fn descriptions(&self) -> orrery_core::Result<ParsedUnit> {
        Ok(self.manifest.clone().validate())
    }
}
