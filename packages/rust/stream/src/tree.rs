//! Depth-first directory walking and a stage that streams a whole tree.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use datalib_shared::{DatalibError, Result};

use crate::byte_stream::{ByteStream, ByteStreamState, StreamStatus};

// ---------------------------------------------------------------------------
// FileVisitor
// ---------------------------------------------------------------------------

/// A directory boundary reported by [`FileVisitor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisitorEvent {
    /// Entering `dir`; `files` are its regular files, sorted by name.
    Enter {
        dir: PathBuf,
        files: Vec<PathBuf>,
        depth: usize,
    },
    /// Leaving `dir` after all of its subdirectories.
    Exit { dir: PathBuf, depth: usize },
}

impl VisitorEvent {
    pub fn dir(&self) -> &Path {
        match self {
            Self::Enter { dir, .. } | Self::Exit { dir, .. } => dir,
        }
    }

    pub fn depth(&self) -> usize {
        match self {
            Self::Enter { depth, .. } | Self::Exit { depth, .. } => *depth,
        }
    }

    pub fn is_enter(&self) -> bool {
        matches!(self, Self::Enter { .. })
    }
}

enum Pending {
    Visit(PathBuf, usize),
    Leave(PathBuf, usize),
}

/// Pre-order directory walker with an explicit stack.
///
/// Entries are visited in lexicographic order so the walk is reproducible,
/// which resumable readers rely on.
pub struct FileVisitor {
    stack: Vec<Pending>,
}

impl FileVisitor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            stack: vec![Pending::Visit(root.into(), 0)],
        }
    }

    fn enter(&mut self, dir: PathBuf, depth: usize) -> Result<VisitorEvent> {
        let mut files = Vec::new();
        let mut subdirs = Vec::new();
        let entries = std::fs::read_dir(&dir).map_err(|e| DatalibError::io(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| DatalibError::io(&dir, e))?;
            let file_type = entry.file_type().map_err(|e| DatalibError::io(entry.path(), e))?;
            if file_type.is_dir() {
                subdirs.push(entry.path());
            } else if entry.path().is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        subdirs.sort();

        self.stack.push(Pending::Leave(dir.clone(), depth));
        for subdir in subdirs.into_iter().rev() {
            self.stack.push(Pending::Visit(subdir, depth + 1));
        }
        Ok(VisitorEvent::Enter { dir, files, depth })
    }
}

impl Iterator for FileVisitor {
    type Item = Result<VisitorEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.stack.pop()? {
            Pending::Visit(dir, depth) => Some(self.enter(dir, depth)),
            Pending::Leave(dir, depth) => Some(Ok(VisitorEvent::Exit { dir, depth })),
        }
    }
}

// ---------------------------------------------------------------------------
// FileTreeStream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TreePauseState {
    /// Index (in walk order) of the file to continue with.
    file_index: usize,
    /// Bytes of that file already produced.
    offset: u64,
}

struct OpenFile {
    relative: String,
    file: File,
    offset: u64,
}

/// Streams every file under a directory, one file after another.
///
/// Each chunk's `file_id` is the file's path relative to the root, with
/// `/` separators, so downstream stages can tell files apart and ask for
/// the rest of one to be skipped.
pub struct FileTreeStream {
    state: ByteStreamState,
    root: PathBuf,
    chunk_size: usize,
    extension: Option<String>,
    visitor: FileVisitor,
    queued: VecDeque<PathBuf>,
    current: Option<OpenFile>,
    files_started: usize,
}

impl FileTreeStream {
    pub fn new(root: impl Into<PathBuf>, chunk_size: usize) -> Self {
        let root = root.into();
        Self {
            state: ByteStreamState::source(),
            visitor: FileVisitor::new(root.clone()),
            root,
            chunk_size: chunk_size.max(1),
            extension: None,
            queued: VecDeque::new(),
            current: None,
            files_started: 0,
        }
    }

    /// Only stream files with this extension.
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    fn relative(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    fn wanted(&self, path: &Path) -> bool {
        match &self.extension {
            Some(ext) => path.extension().is_some_and(|e| e == ext.as_str()),
            None => true,
        }
    }

    /// Next file in walk order, or `None` once the tree is exhausted.
    fn next_path(&mut self) -> Result<Option<PathBuf>> {
        loop {
            if let Some(path) = self.queued.pop_front() {
                return Ok(Some(path));
            }
            match self.visitor.next() {
                Some(Ok(VisitorEvent::Enter { files, .. })) => {
                    let wanted: Vec<_> = files.into_iter().filter(|f| self.wanted(f)).collect();
                    self.queued.extend(wanted);
                }
                Some(Ok(VisitorEvent::Exit { .. })) => {}
                Some(Err(e)) => return Err(e),
                None => return Ok(None),
            }
        }
    }

    fn open_next(&mut self, offset: u64) -> Result<bool> {
        let Some(path) = self.next_path()? else {
            return Ok(false);
        };
        let mut file = File::open(&path).map_err(|e| DatalibError::io(&path, e))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| DatalibError::io(&path, e))?;
        }
        self.files_started += 1;
        self.current = Some(OpenFile {
            relative: self.relative(&path),
            file,
            offset,
        });
        Ok(true)
    }
}

impl ByteStream for FileTreeStream {
    fn state(&self) -> &ByteStreamState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ByteStreamState {
        &mut self.state
    }

    fn generate_next_chunk(&mut self) -> bool {
        loop {
            if self.current.is_none() {
                match self.open_next(0) {
                    Ok(true) => {}
                    Ok(false) => {
                        self.state.finish();
                        return false;
                    }
                    Err(e) => {
                        self.state.fail(e.to_string());
                        return false;
                    }
                }
            }
            let Some(current) = self.current.as_mut() else {
                continue;
            };

            if self.state.last_skipped_file.as_deref() == Some(current.relative.as_str()) {
                debug!(file = %current.relative, "skipping rest of file");
                self.current = None;
                continue;
            }

            let mut buf = vec![0u8; self.chunk_size];
            match current.file.read(&mut buf) {
                Ok(0) => self.current = None,
                Ok(n) => {
                    buf.truncate(n);
                    current.offset += n as u64;
                    self.state.output_bytes = buf;
                    self.state.file_id = current.relative.clone();
                    return true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.state.fail(format!("{}: {e}", current.relative));
                    return false;
                }
            }
        }
    }

    fn pause(&self) -> Result<Value> {
        let paused = match &self.current {
            Some(current) => TreePauseState {
                file_index: self.files_started - 1,
                offset: current.offset,
            },
            None => TreePauseState {
                file_index: self.files_started,
                offset: 0,
            },
        };
        serde_json::to_value(paused).map_err(|e| DatalibError::cursor(e.to_string()))
    }

    fn resume(&mut self, paused: &Value) -> Result<()> {
        let paused: TreePauseState = serde_json::from_value(paused.clone())
            .map_err(|e| DatalibError::cursor(format!("tree stage: {e}")))?;

        self.visitor = FileVisitor::new(self.root.clone());
        self.queued.clear();
        self.current = None;
        self.files_started = 0;
        self.state.reset_output();
        self.state.status = StreamStatus::Streaming;

        for _ in 0..paused.file_index {
            if self.next_path()?.is_none() {
                return Err(DatalibError::cursor(format!(
                    "tree under {} has fewer than {} files",
                    self.root.display(),
                    paused.file_index
                )));
            }
            self.files_started += 1;
        }
        if paused.offset > 0 {
            self.open_next(paused.offset)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn fixture_tree() -> PathBuf {
        let root = std::env::temp_dir().join(format!("datalib-tree-test-{}", Uuid::now_v7()));
        std::fs::create_dir_all(root.join("guides/advanced")).unwrap();
        std::fs::create_dir_all(root.join("reference")).unwrap();
        std::fs::write(root.join("intro.md"), "intro").unwrap();
        std::fs::write(root.join("guides/index.md"), "guides").unwrap();
        std::fs::write(root.join("guides/advanced/tuning.md"), "tuning").unwrap();
        std::fs::write(root.join("reference/api.md"), "api").unwrap();
        std::fs::write(root.join("reference/notes.txt"), "notes").unwrap();
        root
    }

    #[test]
    fn visitor_walks_depth_first_with_exits() {
        let root = fixture_tree();
        let events: Vec<_> = FileVisitor::new(&root).map(|e| e.unwrap()).collect();

        let trace: Vec<String> = events
            .iter()
            .map(|e| {
                let name = e.dir().strip_prefix(&root).unwrap().display().to_string();
                format!("{}{}", if e.is_enter() { "+" } else { "-" }, name)
            })
            .collect();
        assert_eq!(
            trace,
            vec!["+", "+guides", "+guides/advanced", "-guides/advanced", "-guides", "+reference", "-reference", "-"]
        );

        match &events[0] {
            VisitorEvent::Enter { files, depth, .. } => {
                assert_eq!(*depth, 0);
                assert_eq!(files.len(), 1);
            }
            other => panic!("unexpected first event: {other:?}"),
        }

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn tree_stream_frames_chunks_by_file() {
        let root = fixture_tree();
        let mut stream = FileTreeStream::new(&root, 4).with_extension("md");

        let mut seen: Vec<(String, Vec<u8>)> = Vec::new();
        while stream.next_bytes() {
            let id = stream.file_id().to_string();
            match seen.last_mut() {
                Some((last, bytes)) if *last == id => bytes.extend_from_slice(stream.bytes()),
                _ => seen.push((id, stream.bytes().to_vec())),
            }
        }

        let ids: Vec<&str> = seen.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["intro.md", "guides/index.md", "guides/advanced/tuning.md", "reference/api.md"]);
        assert_eq!(seen[2].1, b"tuning");
        assert!(stream.is_eof());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn tree_stream_skips_rest_of_file() {
        let root = fixture_tree();
        let mut stream = FileTreeStream::new(&root, 2).with_extension("md");

        assert!(stream.next_bytes());
        assert_eq!(stream.file_id(), "intro.md");
        assert_eq!(stream.bytes(), b"in");
        stream.skip_file();

        assert!(stream.next_bytes());
        assert_eq!(stream.file_id(), "guides/index.md");
        assert_eq!(stream.bytes(), b"gu");

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn tree_stream_resumes_mid_file() {
        let root = fixture_tree();
        let mut first = FileTreeStream::new(&root, 3).with_extension("md");
        // intro.md (3 bytes), intro.md (2 bytes), guides/index.md (3 bytes)
        for _ in 0..3 {
            assert!(first.next_bytes());
        }
        let paused = first.pause().unwrap();

        let mut second = FileTreeStream::new(&root, 3).with_extension("md");
        second.resume(&paused).unwrap();
        let mut rest = Vec::new();
        while second.next_bytes() {
            rest.extend_from_slice(second.bytes());
        }
        assert_eq!(rest, b"destuningapi");

        let _ = std::fs::remove_dir_all(&root);
    }
}
