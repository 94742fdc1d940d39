//! WXR files as an [`EntitySource`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use datalib_shared::{DatalibError, Entity, EntitySource, Result};
use datalib_stream::{ByteStream, FileByteStream, GzipFileStream, SeekableStream, StreamChain};

use crate::reader::{EntityReader, ReadError, ReaderCursor};
use crate::rewrite::WxrRewriteStream;

/// Checkpoint of a [`WxrEntitySource`].
///
/// Without a URL rewrite the reader sees the file's own bytes, so resuming
/// seeks the file to the reader's offset. With a rewrite the reader sees
/// rewritten bytes; the cursor then carries the chain's checkpoint and the
/// bytes already handed to the reader past its offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WxrCursor {
    pub reader: ReaderCursor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<u8>,
}

/// Reads entities from a `.xml` or `.xml.gz` export on disk, one chunk at a
/// time, through a [`StreamChain`] of file, decompression and optional
/// URL-rewrite stages.
pub struct WxrEntitySource {
    path: PathBuf,
    chunk_size: usize,
    rewrite: Option<(Url, Url)>,
    chain: StreamChain,
    reader: EntityReader,
    /// Rewritten bytes a cursor may still point into, starting at reader
    /// offset `window_start`.
    window: Vec<u8>,
    window_start: u64,
}

impl WxrEntitySource {
    pub fn open(path: impl Into<PathBuf>, chunk_size: usize) -> Result<Self> {
        let path = path.into();
        let chain = build_chain(&path, chunk_size, 0, None)?;
        debug!(path = %path.display(), chunk_size, "opened WXR export");
        Ok(Self {
            path,
            chunk_size,
            rewrite: None,
            chain,
            reader: EntityReader::new(),
            window: Vec::new(),
            window_start: 0,
        })
    }

    /// Migrate URLs under `from` to `to` in content nodes before entities
    /// are read. Restarts the source from the beginning of the file.
    pub fn with_url_rewrite(mut self, from: Url, to: Url) -> Result<Self> {
        let rewrite = (from, to);
        self.chain = build_chain(&self.path, self.chunk_size, 0, Some(&rewrite))?;
        self.rewrite = Some(rewrite);
        self.reader = EntityReader::new();
        self.window.clear();
        self.window_start = 0;
        Ok(self)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn reader(&self) -> &EntityReader {
        &self.reader
    }

    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.chain.stage_names()
    }

    fn feed(&mut self) -> Result<()> {
        if self.chain.next_bytes() {
            let bytes = self.chain.bytes();
            self.reader.append_bytes(bytes);
            if self.rewrite.is_some() {
                self.window.extend_from_slice(bytes);
            }
            return Ok(());
        }
        if let Some(err) = self.chain.error() {
            return Err(err);
        }
        self.reader.input_finished();
        Ok(())
    }

    /// Forget window bytes no cursor can point into anymore.
    fn trim_window(&mut self) {
        if self.rewrite.is_none() {
            return;
        }
        let offset = self.reader.byte_offset();
        let consumed = offset
            .saturating_sub(self.window_start)
            .min(self.window.len() as u64);
        self.window.drain(..consumed as usize);
        self.window_start += consumed;
    }
}

fn build_chain(
    path: &Path,
    chunk_size: usize,
    offset: u64,
    rewrite: Option<&(Url, Url)>,
) -> Result<StreamChain> {
    let gzipped = path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("gz"));
    let mut chain = StreamChain::new();
    if gzipped {
        let mut stage = GzipFileStream::open(path, chunk_size)?;
        if offset > 0 {
            stage.seek(offset)?;
        }
        chain.push_stage("gzip", Box::new(stage));
    } else {
        let mut stage = FileByteStream::open(path, chunk_size)?;
        stage.seek(offset)?;
        chain.push_stage("file", Box::new(stage));
    }
    if let Some((from, to)) = rewrite {
        chain.push_stage("rewrite", Box::new(WxrRewriteStream::new(from.clone(), to.clone())));
    }
    Ok(chain)
}

impl EntitySource for WxrEntitySource {
    type Cursor = WxrCursor;

    fn next_entity(&mut self) -> Result<Option<Entity>> {
        loop {
            match self.reader.try_next_entity().map(|entity| entity.cloned()) {
                Ok(entity) => {
                    self.trim_window();
                    return Ok(entity);
                }
                Err(ReadError::IncompleteInput) => self.feed()?,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn pause(&self) -> Result<WxrCursor> {
        let reader = self.reader.pause();
        if self.rewrite.is_none() {
            return Ok(WxrCursor {
                reader,
                chain: None,
                pending: Vec::new(),
            });
        }
        let from = reader.byte_offset().saturating_sub(self.window_start) as usize;
        let pending = self.window.get(from..).unwrap_or_default().to_vec();
        Ok(WxrCursor {
            reader,
            chain: Some(self.chain.pause()?),
            pending,
        })
    }

    fn resume(&mut self, cursor: &WxrCursor) -> Result<()> {
        let offset = cursor.reader.byte_offset();
        let mut reader = EntityReader::new();
        reader.resume(&cursor.reader);

        match (&self.rewrite, &cursor.chain) {
            (None, None) => {
                self.chain = build_chain(&self.path, self.chunk_size, offset, None)?;
            }
            (Some(rewrite), Some(paused)) => {
                let mut chain = build_chain(&self.path, self.chunk_size, 0, Some(rewrite))?;
                chain.resume(paused)?;
                reader.append_bytes(&cursor.pending);
                self.chain = chain;
                self.window = cursor.pending.clone();
                self.window_start = offset;
            }
            _ => {
                return Err(DatalibError::validation(
                    "WXR cursor was saved with a different URL rewrite setting",
                ));
            }
        }
        self.reader = reader;
        debug!(path = %self.path.display(), offset, "resumed WXR export");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::GzEncoder;
    use uuid::Uuid;

    use super::*;

    fn fixture() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../../fixtures/wxr/simple.xml")
    }

    fn drain(source: &mut impl EntitySource) -> Vec<Entity> {
        let mut entities = Vec::new();
        while let Some(entity) = source.next_entity().unwrap() {
            entities.push(entity);
        }
        entities
    }

    fn expected() -> Vec<Entity> {
        let xml = std::fs::read_to_string(fixture()).unwrap();
        let mut reader = EntityReader::from_str(&xml);
        let mut entities = Vec::new();
        while let Ok(Some(entity)) = reader.try_next_entity() {
            entities.push(entity.clone());
        }
        entities
    }

    fn rewriting(chunk_size: usize) -> WxrEntitySource {
        WxrEntitySource::open(fixture(), chunk_size)
            .unwrap()
            .with_url_rewrite(
                Url::parse("https://playground.internal/path").unwrap(),
                Url::parse("https://playground.wordpress.net/new-path").unwrap(),
            )
            .unwrap()
    }

    #[test]
    fn reads_a_file_in_small_chunks() {
        let mut source = WxrEntitySource::open(fixture(), 16).unwrap();
        assert_eq!(source.stage_names().collect::<Vec<_>>(), vec!["file"]);
        assert_eq!(drain(&mut source), expected());
        assert_eq!(source.reader().last_post_id(), Some("10"));
    }

    #[test]
    fn reads_gzipped_exports() {
        let dir = std::env::temp_dir().join(format!("datalib-wxr-gz-{}", Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("export.xml.gz");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&std::fs::read(fixture()).unwrap()).unwrap();
        std::fs::write(&path, encoder.finish().unwrap()).unwrap();

        let mut source = WxrEntitySource::open(&path, 50).unwrap();
        assert_eq!(source.stage_names().collect::<Vec<_>>(), vec!["gzip"]);
        assert_eq!(drain(&mut source), expected());

        let mut first = WxrEntitySource::open(&path, 50).unwrap();
        for _ in 0..3 {
            first.next_entity().unwrap().unwrap();
        }
        let cursor = first.pause().unwrap();
        let mut resumed = WxrEntitySource::open(&path, 50).unwrap();
        resumed.resume(&cursor).unwrap();
        assert_eq!(drain(&mut resumed), expected()[3..].to_vec());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn resumes_from_a_saved_cursor() {
        let all = expected();
        let mut source = WxrEntitySource::open(fixture(), 32).unwrap();
        for _ in 0..5 {
            source.next_entity().unwrap().unwrap();
        }
        let json = serde_json::to_string(&source.pause().unwrap()).unwrap();

        let cursor: WxrCursor = serde_json::from_str(&json).unwrap();
        assert!(cursor.chain.is_none());
        let mut resumed = WxrEntitySource::open(fixture(), 32).unwrap();
        resumed.resume(&cursor).unwrap();
        assert_eq!(drain(&mut resumed), all[5..].to_vec());
    }

    #[test]
    fn rewrites_urls_before_reading_entities() {
        let mut source = rewriting(64);
        assert_eq!(source.stage_names().collect::<Vec<_>>(), vec!["file", "rewrite"]);
        let entities = drain(&mut source);
        assert_eq!(entities.len(), expected().len());

        let home = entities
            .iter()
            .find(|e| e.get("option_name") == Some("home"))
            .unwrap();
        assert_eq!(home.get("option_value"), Some("https://playground.wordpress.net/new-path"));

        let post = entities.iter().find(|e| e.get("ID") == Some("10")).unwrap();
        let content = post.get("post_content").unwrap();
        assert!(content.contains(r#"<a href="https://playground.wordpress.net/new-path/one">One</a>"#));
        assert!(content.contains(r#"<a href="https://playground.internal/path-not-taken">"#));
    }

    #[test]
    fn resumes_a_rewriting_source_mid_document() {
        let all = drain(&mut rewriting(24));
        for taken in [1, 4, all.len() - 1] {
            let mut first = rewriting(24);
            for _ in 0..taken {
                first.next_entity().unwrap().unwrap();
            }
            let json = serde_json::to_string(&first.pause().unwrap()).unwrap();
            let cursor: WxrCursor = serde_json::from_str(&json).unwrap();
            assert!(cursor.chain.is_some());

            let mut resumed = rewriting(24);
            resumed.resume(&cursor).unwrap();
            assert_eq!(drain(&mut resumed), all[taken..].to_vec(), "after {taken} entities");
        }
    }

    #[test]
    fn cursor_must_match_the_rewrite_setting() {
        let mut plain = WxrEntitySource::open(fixture(), 32).unwrap();
        plain.next_entity().unwrap().unwrap();
        let cursor = plain.pause().unwrap();

        let err = rewriting(32).resume(&cursor).unwrap_err();
        assert!(matches!(err, DatalibError::Validation { .. }));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = WxrEntitySource::open("does/not/exist.xml", 16).err().unwrap();
        assert!(matches!(err, DatalibError::Io { .. }));
    }
}
