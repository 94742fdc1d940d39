//! Runtime options for an import run.

use std::path::PathBuf;

use url::Url;

use datalib_shared::{DatalibError, DownloaderConfig, ImportConfig, Result, validate_config};

/// Which `<img src>` URLs count as assets to download.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AssetScope {
    /// Only images hosted under the source site URL.
    #[default]
    SourceSite,
    /// Every image, wherever it is hosted.
    Any,
}

/// Maps a URL prefix used in Markdown (e.g. `@site`) to a local directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAssets {
    pub prefix: String,
    pub root: PathBuf,
}

impl LocalAssets {
    /// The `file://` URL `raw` refers to, if it uses the prefix.
    pub fn resolve(&self, raw: &str) -> Option<Url> {
        let rest = raw.strip_prefix(self.prefix.as_str())?;
        let path = self.root.join(rest.trim_start_matches('/'));
        Url::from_file_path(path).ok()
    }
}

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub new_site_url: Url,
    /// Learned from the export's `home` option when unset.
    pub source_site_url: Option<Url>,
    /// Directory assets are downloaded to.
    pub uploads_path: PathBuf,
    /// Public URL of `uploads_path` on the new site.
    pub uploads_url: Url,
    pub asset_scope: AssetScope,
    pub local_assets: Option<LocalAssets>,
    pub downloader: DownloaderConfig,
}

impl ImportOptions {
    /// Options with uploads served from `<new_site_url>/wp-content/uploads`.
    pub fn new(new_site_url: Url, uploads_path: impl Into<PathBuf>) -> Self {
        let mut uploads_url = new_site_url.clone();
        uploads_url.set_path(&format!("{}/wp-content/uploads", new_site_url.path().trim_end_matches('/')));
        uploads_url.set_query(None);
        uploads_url.set_fragment(None);
        Self {
            new_site_url,
            source_site_url: None,
            uploads_path: uploads_path.into(),
            uploads_url,
            asset_scope: AssetScope::SourceSite,
            local_assets: None,
            downloader: DownloaderConfig::default(),
        }
    }

    /// Build options from a loaded config file.
    ///
    /// Configuring a Markdown asset prefix switches the asset scope to
    /// [`AssetScope::Any`], since Markdown trees reference local files.
    pub fn from_config(config: &ImportConfig) -> Result<Self> {
        validate_config(config)?;
        let mut options = Self::new(parse_url(&config.site.new_url)?, &config.uploads.path);
        if let Some(url) = &config.uploads.url {
            options.uploads_url = parse_url(url)?;
        }
        options.source_site_url = config.site.source_url.as_deref().map(parse_url).transpose()?;
        if let (Some(prefix), Some(root)) = (
            &config.markdown.local_assets_prefix,
            &config.markdown.local_assets_root,
        ) {
            options.local_assets = Some(LocalAssets {
                prefix: prefix.clone(),
                root: PathBuf::from(root),
            });
            options.asset_scope = AssetScope::Any;
        }
        options.downloader = DownloaderConfig::from(config);
        Ok(options)
    }

    pub fn with_source_site_url(mut self, url: Url) -> Self {
        self.source_site_url = Some(url);
        self
    }

    pub fn with_uploads_url(mut self, url: Url) -> Self {
        self.uploads_url = url;
        self
    }

    pub fn with_asset_scope(mut self, scope: AssetScope) -> Self {
        self.asset_scope = scope;
        self
    }

    pub fn with_local_assets(mut self, prefix: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        self.local_assets = Some(LocalAssets {
            prefix: prefix.into(),
            root: root.into(),
        });
        self
    }

    pub fn with_max_concurrent_downloads(mut self, max: usize) -> Self {
        self.downloader.max_concurrent = max.max(1);
        self
    }

    /// Public URL of an uploaded file.
    pub(crate) fn upload_url(&self, filename: &str) -> Url {
        let mut url = self.uploads_url.clone();
        url.set_path(&format!("{}/{filename}", self.uploads_url.path().trim_end_matches('/')));
        url
    }
}

fn parse_url(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| DatalibError::config(format!("invalid URL {raw:?}: {e}")))
}
