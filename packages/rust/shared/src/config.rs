//! Import configuration for datalib.
//!
//! User config lives at `~/.datalib/datalib.toml`. Callers may also load a
//! per-import file with [`load_config_from`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{DatalibError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "datalib.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".datalib";

// ---------------------------------------------------------------------------
// Config structs (matching datalib.toml schema)
// ---------------------------------------------------------------------------

/// Top-level import config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Source and destination sites.
    #[serde(default)]
    pub site: SiteConfig,

    /// Where downloaded assets land.
    #[serde(default)]
    pub uploads: UploadsConfig,

    /// Attachment downloader limits.
    #[serde(default)]
    pub downloads: DownloadsConfig,

    /// Entity reader settings.
    #[serde(default)]
    pub reader: ReaderConfig,

    /// Markdown tree settings.
    #[serde(default)]
    pub markdown: MarkdownConfig,
}

/// `[site]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteConfig {
    /// URL of the site the export came from. Learned from the export's
    /// `home` option when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,

    /// URL of the destination site.
    #[serde(default)]
    pub new_url: String,
}

/// `[uploads]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadsConfig {
    /// Directory downloaded assets are written to.
    #[serde(default = "default_uploads_path")]
    pub path: String,

    /// Public URL of the uploads directory. Defaults to
    /// `<new_url>/wp-content/uploads`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            path: default_uploads_path(),
            url: None,
        }
    }
}

fn default_uploads_path() -> String {
    "wp-content/uploads".into()
}

/// `[downloads]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadsConfig {
    /// Maximum number of concurrent HTTP requests.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Maximum redirects followed per request.
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
}

impl Default for DownloadsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            timeout_secs: default_timeout_secs(),
            max_redirects: default_max_redirects(),
        }
    }
}

fn default_max_concurrent() -> usize {
    10
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_redirects() -> usize {
    5
}

/// `[reader]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Bytes read from the export file per chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
        }
    }
}

fn default_chunk_size() -> usize {
    64 * 1024
}

/// `[markdown]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarkdownConfig {
    /// URL prefix used by Markdown files to reference local assets
    /// (e.g. `@site`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_assets_prefix: Option<String>,

    /// Directory the local asset prefix points to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_assets_root: Option<String>,
}

// ---------------------------------------------------------------------------
// Downloader config (runtime, derived from the config file)
// ---------------------------------------------------------------------------

/// Runtime attachment downloader configuration.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Maximum number of requests in flight at once.
    pub max_concurrent: usize,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Maximum redirects followed per request.
    pub max_redirects: usize,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self::from(&ImportConfig::default())
    }
}

impl From<&ImportConfig> for DownloaderConfig {
    fn from(config: &ImportConfig) -> Self {
        Self {
            max_concurrent: config.downloads.max_concurrent.max(1),
            timeout: Duration::from_secs(config.downloads.timeout_secs),
            max_redirects: config.downloads.max_redirects,
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.datalib/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| DatalibError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.datalib/datalib.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the import config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<ImportConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(ImportConfig::default());
    }

    load_config_from(&path)
}

/// Load the import config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<ImportConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| DatalibError::io(path, e))?;

    let config: ImportConfig = toml::from_str(&content).map_err(|e| {
        DatalibError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Check that the configured URLs parse and the destination site is set.
pub fn validate_config(config: &ImportConfig) -> Result<()> {
    if config.site.new_url.is_empty() {
        return Err(DatalibError::config("[site] new_url must be set"));
    }
    let urls = [
        Some(config.site.new_url.as_str()),
        config.site.source_url.as_deref(),
        config.uploads.url.as_deref(),
    ];
    for raw in urls.into_iter().flatten() {
        Url::parse(raw).map_err(|e| DatalibError::config(format!("invalid URL {raw:?}: {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = ImportConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("max_concurrent = 10"));
        assert!(toml_str.contains("chunk_size"));
    }

    #[test]
    fn config_with_sites() {
        let toml_str = r#"
[site]
source_url = "https://old.example.com/blog"
new_url = "https://new.example.com"

[uploads]
path = "/var/www/uploads"

[downloads]
max_concurrent = 4
"#;
        let config: ImportConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.site.source_url.as_deref(), Some("https://old.example.com/blog"));
        assert_eq!(config.uploads.path, "/var/www/uploads");
        assert_eq!(config.downloads.max_concurrent, 4);
        assert_eq!(config.downloads.timeout_secs, 30);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn validation_rejects_missing_destination() {
        let config = ImportConfig::default();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("new_url"));
    }

    #[test]
    fn validation_rejects_bad_url() {
        let mut config = ImportConfig::default();
        config.site.new_url = "not a url".into();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn downloader_config_from_import_config() {
        let mut config = ImportConfig::default();
        config.downloads.max_concurrent = 0;
        let dl = DownloaderConfig::from(&config);
        assert_eq!(dl.max_concurrent, 1);
        assert_eq!(dl.timeout, Duration::from_secs(30));
        assert_eq!(dl.max_redirects, 5);
    }

    #[test]
    fn load_from_file() {
        let dir = std::env::temp_dir().join(format!("datalib-config-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("datalib.toml");
        std::fs::write(&path, "[site]\nnew_url = \"https://new.example.com\"\n").unwrap();

        let config = load_config_from(&path).unwrap();
        assert_eq!(config.site.new_url, "https://new.example.com");
        assert_eq!(config.reader.chunk_size, 64 * 1024);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
