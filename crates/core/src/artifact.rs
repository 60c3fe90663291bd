//! Opaque references to externally stored artifacts.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Reference to an artifact held by a blob store (input CSV, expected output,
/// generated script, produced result).
///
/// The scheduler never looks inside; it only carries the reference around.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    pub fn new(reference: impl Into<String>) -> CoreResult<Self> {
        let reference = reference.into();
        if reference.trim().is_empty() {
            return Err(CoreError::invalid_artifact_ref("reference must not be empty"));
        }
        Ok(Self(reference))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl core::str::FromStr for ArtifactRef {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}
