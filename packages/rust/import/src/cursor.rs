//! The persisted state of an interrupted import.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use datalib_shared::{CURSOR_VERSION, DatalibError, ImportId, Result};

/// Where an import is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStage {
    Initial,
    TopologicalSort,
    FrontloadAssets,
    ImportEntities,
    Finished,
}

impl ImportStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::TopologicalSort => "topological_sort",
            Self::FrontloadAssets => "frontload_assets",
            Self::ImportEntities => "import_entities",
            Self::Finished => "finished",
        }
    }
}

impl std::fmt::Display for ImportStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resumable snapshot of a `StreamImporter`.
///
/// `entities` is the entity source's own cursor, positioned after the last
/// entity whose work in the current stage is complete. `position` counts
/// those entities.
///
/// Downloads still running when the cursor is taken are not recorded. Their
/// entities lie past `entities`, so a resumed import scans them again and
/// fetches only the files not yet on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "C: DeserializeOwned", serialize = "C: Serialize"))]
pub struct ImportCursor<C> {
    pub version: u32,
    pub import_id: ImportId,
    pub stage: ImportStage,
    pub position: u64,
    #[serde(default)]
    pub entities: Option<C>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_site_url: Option<String>,
}

impl<C> ImportCursor<C>
where
    C: Serialize + DeserializeOwned,
{
    /// Write the cursor as JSON, replacing `path` atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| DatalibError::cursor(format!("failed to serialize cursor: {e}")))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| DatalibError::io(parent, e))?;
        }

        let mut partial = PathBuf::from(path);
        partial.as_mut_os_string().push(".partial");
        std::fs::write(&partial, json).map_err(|e| DatalibError::io(&partial, e))?;
        std::fs::rename(&partial, path).map_err(|e| DatalibError::io(path, e))?;
        debug!(path = %path.display(), stage = %self.stage, position = self.position, "saved import cursor");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| DatalibError::io(path, e))?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let version = serde_json::from_str::<VersionProbe>(json)
            .map_err(|e| DatalibError::cursor(format!("invalid import cursor: {e}")))?
            .version;
        if version != CURSOR_VERSION {
            return Err(DatalibError::validation(format!(
                "unsupported cursor version {version} (expected {CURSOR_VERSION})"
            )));
        }
        serde_json::from_str(json).map_err(|e| DatalibError::cursor(format!("invalid import cursor: {e}")))
    }
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}
