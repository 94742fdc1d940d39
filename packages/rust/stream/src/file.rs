//! File-backed source stages: plain and gzip-compressed.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Instant;

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use datalib_shared::{DatalibError, Result};

use crate::byte_stream::{ByteStream, ByteStreamState, SeekableStream, StreamStatus};

/// Pause state shared by both file stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FilePauseState {
    path: PathBuf,
    chunk_size: usize,
    offset: u64,
}

fn open_file(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| DatalibError::io(path, e))
}

/// Read one chunk into `state.output_bytes`, finishing on end of file.
fn read_chunk(reader: &mut impl Read, state: &mut ByteStreamState, chunk_size: usize, path: &Path) -> Option<usize> {
    let mut buf = vec![0u8; chunk_size];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                state.finish();
                return None;
            }
            Ok(n) => {
                buf.truncate(n);
                state.output_bytes = buf;
                return Some(n);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                state.fail(format!("{}: {e}", path.display()));
                return None;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// FileByteStream
// ---------------------------------------------------------------------------

/// Streams a file in fixed-size chunks.
pub struct FileByteStream {
    state: ByteStreamState,
    path: PathBuf,
    chunk_size: usize,
    offset: u64,
    file: File,
}

impl FileByteStream {
    pub fn open(path: impl Into<PathBuf>, chunk_size: usize) -> Result<Self> {
        let path = path.into();
        let file = open_file(&path)?;
        Ok(Self {
            state: ByteStreamState::source(),
            path,
            chunk_size: chunk_size.max(1),
            offset: 0,
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteStream for FileByteStream {
    fn state(&self) -> &ByteStreamState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ByteStreamState {
        &mut self.state
    }

    fn generate_next_chunk(&mut self) -> bool {
        match read_chunk(&mut self.file, &mut self.state, self.chunk_size, &self.path) {
            Some(n) => {
                self.offset += n as u64;
                true
            }
            None => false,
        }
    }

    fn pause(&self) -> Result<Value> {
        serde_json::to_value(FilePauseState {
            path: self.path.clone(),
            chunk_size: self.chunk_size,
            offset: self.offset,
        })
        .map_err(|e| DatalibError::cursor(e.to_string()))
    }

    fn resume(&mut self, paused: &Value) -> Result<()> {
        let paused: FilePauseState = serde_json::from_value(paused.clone())
            .map_err(|e| DatalibError::cursor(format!("file stage: {e}")))?;
        self.chunk_size = paused.chunk_size.max(1);
        self.seek(paused.offset)
    }
}

impl SeekableStream for FileByteStream {
    fn seek(&mut self, offset: u64) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| DatalibError::io(&self.path, e))?;
        self.offset = offset;
        self.state.reset_output();
        self.state.status = StreamStatus::Streaming;
        Ok(())
    }

    fn tell(&self) -> u64 {
        self.offset
    }
}

// ---------------------------------------------------------------------------
// GzipFileStream
// ---------------------------------------------------------------------------

/// Streams the decompressed contents of a gzip file.
///
/// Offsets are in decompressed bytes. Deflate state cannot be serialized,
/// so seeking re-opens the file and discards output up to the offset.
pub struct GzipFileStream {
    state: ByteStreamState,
    path: PathBuf,
    chunk_size: usize,
    offset: u64,
    decoder: GzDecoder<BufReader<File>>,
}

impl GzipFileStream {
    pub fn open(path: impl Into<PathBuf>, chunk_size: usize) -> Result<Self> {
        let path = path.into();
        let decoder = GzDecoder::new(BufReader::new(open_file(&path)?));
        Ok(Self {
            state: ByteStreamState::source(),
            path,
            chunk_size: chunk_size.max(1),
            offset: 0,
            decoder,
        })
    }
}

impl ByteStream for GzipFileStream {
    fn state(&self) -> &ByteStreamState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ByteStreamState {
        &mut self.state
    }

    fn generate_next_chunk(&mut self) -> bool {
        match read_chunk(&mut self.decoder, &mut self.state, self.chunk_size, &self.path) {
            Some(n) => {
                self.offset += n as u64;
                true
            }
            None => false,
        }
    }

    fn pause(&self) -> Result<Value> {
        serde_json::to_value(FilePauseState {
            path: self.path.clone(),
            chunk_size: self.chunk_size,
            offset: self.offset,
        })
        .map_err(|e| DatalibError::cursor(e.to_string()))
    }

    fn resume(&mut self, paused: &Value) -> Result<()> {
        let paused: FilePauseState = serde_json::from_value(paused.clone())
            .map_err(|e| DatalibError::cursor(format!("gzip stage: {e}")))?;
        self.chunk_size = paused.chunk_size.max(1);
        self.seek(paused.offset)
    }
}

impl SeekableStream for GzipFileStream {
    fn seek(&mut self, offset: u64) -> Result<()> {
        let started = Instant::now();
        let mut decoder = GzDecoder::new(BufReader::new(open_file(&self.path)?));
        let skipped = std::io::copy(&mut (&mut decoder).take(offset), &mut std::io::sink())
            .map_err(|e| DatalibError::io(&self.path, e))?;
        if skipped < offset {
            return Err(DatalibError::cursor(format!(
                "{}: cannot seek to {offset}, stream ends at {skipped}",
                self.path.display()
            )));
        }
        debug!(
            path = %self.path.display(),
            skipped_bytes = skipped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "re-decompressed gzip stream up to resume offset"
        );
        self.decoder = decoder;
        self.offset = offset;
        self.state.reset_output();
        self.state.status = StreamStatus::Streaming;
        Ok(())
    }

    fn tell(&self) -> u64 {
        self.offset
    }
}
