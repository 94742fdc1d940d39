//! The pausable byte-producing stage every pipeline is built from.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use datalib_shared::Result;

/// File id reported by stages that do not frame their output into files.
pub const DEFAULT_FILE_ID: &str = "default";

/// Lifecycle of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Streaming,
    Finished,
}

/// What the most recent `next_bytes()` call left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    Bytes,
    Eof,
    Error,
}

// ---------------------------------------------------------------------------
// ChunkContext
// ---------------------------------------------------------------------------

/// One upstream stage's framing at the time a chunk was handed down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamChunk {
    pub stage: String,
    pub file_id: String,
}

/// The upstream stages holding buffered work when a chunk was produced,
/// nearest last.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkContext {
    pub upstream: Vec<UpstreamChunk>,
}

impl ChunkContext {
    /// File id reported by the named upstream stage.
    pub fn file_id_of(&self, stage: &str) -> Option<&str> {
        self.upstream
            .iter()
            .find(|chunk| chunk.stage == stage)
            .map(|chunk| chunk.file_id.as_str())
    }

    /// File id of the stage immediately upstream.
    pub fn nearest_file_id(&self) -> Option<&str> {
        self.upstream.last().map(|chunk| chunk.file_id.as_str())
    }
}

// ---------------------------------------------------------------------------
// ByteStreamState
// ---------------------------------------------------------------------------

/// The part of a [`ByteStreamState`] that outlives a single chunk: input a
/// stage has received but not yet consumed, and where it is in its
/// lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedState {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_bytes: Vec<u8>,
    #[serde(default)]
    pub input_eof: bool,
    pub status: StreamStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_skipped_file: Option<String>,
}

/// Buffers and flags shared by every stage implementation.
#[derive(Debug, Clone)]
pub struct ByteStreamState {
    pub input_bytes: Vec<u8>,
    pub input_eof: bool,
    pub input_context: ChunkContext,
    pub output_bytes: Vec<u8>,
    pub status: StreamStatus,
    pub last_error: Option<String>,
    pub file_id: String,
    pub last_skipped_file: Option<String>,
    /// Set by a stage that wants the stage above it to drop the rest of
    /// its current file. Cleared by the chain once honored.
    pub skip_upstream_file: bool,
}

impl Default for ByteStreamState {
    fn default() -> Self {
        Self {
            input_bytes: Vec::new(),
            input_eof: false,
            input_context: ChunkContext::default(),
            output_bytes: Vec::new(),
            status: StreamStatus::Streaming,
            last_error: None,
            file_id: DEFAULT_FILE_ID.to_string(),
            last_skipped_file: None,
            skip_upstream_file: false,
        }
    }
}

impl ByteStreamState {
    pub fn new() -> Self {
        Self::default()
    }

    /// State for a stage that pulls its own input (a file, a directory) and
    /// never accepts appended bytes.
    pub fn source() -> Self {
        Self {
            input_eof: true,
            ..Self::default()
        }
    }

    pub fn reset_output(&mut self) {
        self.output_bytes.clear();
        self.file_id = DEFAULT_FILE_ID.to_string();
    }

    pub fn take_input(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.input_bytes)
    }

    pub fn finish(&mut self) {
        self.status = StreamStatus::Finished;
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
    }

    pub fn is_finished(&self) -> bool {
        self.status == StreamStatus::Finished
    }

    pub fn buffered(&self) -> BufferedState {
        BufferedState {
            input_bytes: self.input_bytes.clone(),
            input_eof: self.input_eof,
            status: self.status,
            last_skipped_file: self.last_skipped_file.clone(),
        }
    }

    pub fn restore_buffered(&mut self, buffered: &BufferedState) {
        self.input_bytes = buffered.input_bytes.clone();
        self.input_eof = buffered.input_eof;
        self.status = buffered.status;
        self.last_skipped_file = buffered.last_skipped_file.clone();
    }
}

// ---------------------------------------------------------------------------
// ByteStream
// ---------------------------------------------------------------------------

/// A pull-based, pausable unit of byte production.
///
/// Implementors provide [`generate_next_chunk`](ByteStream::generate_next_chunk),
/// which fills `state.output_bytes` and returns `true`, or returns `false`
/// when it needs more input or has finished. Everything else is provided.
pub trait ByteStream: Send {
    fn state(&self) -> &ByteStreamState;

    fn state_mut(&mut self) -> &mut ByteStreamState;

    fn generate_next_chunk(&mut self) -> bool;

    /// Opaque checkpoint of this stage.
    fn pause(&self) -> Result<Value>;

    fn resume(&mut self, paused: &Value) -> Result<()>;

    fn append_bytes(&mut self, bytes: &[u8], context: ChunkContext) {
        let state = self.state_mut();
        state.input_bytes.extend_from_slice(bytes);
        state.input_context = context;
    }

    fn append_eof(&mut self) {
        self.state_mut().input_eof = true;
    }

    /// Produce the next output chunk. Returns `false` when more input is
    /// needed, the stage finished, or it failed; see [`chunk_type`](ByteStream::chunk_type).
    fn next_bytes(&mut self) -> bool {
        if self.state().last_error.is_some() {
            return false;
        }
        self.state_mut().reset_output();
        if self.state().is_finished() {
            return false;
        }

        while self.generate_next_chunk() {
            if !self.is_skipped_file() {
                return true;
            }
            self.state_mut().reset_output();
        }

        let state = self.state_mut();
        if state.last_error.is_none() && state.input_bytes.is_empty() && state.input_eof {
            state.finish();
        }
        false
    }

    fn bytes(&self) -> &[u8] {
        &self.state().output_bytes
    }

    fn is_eof(&self) -> bool {
        self.state().output_bytes.is_empty() && self.state().is_finished()
    }

    fn chunk_type(&self) -> ChunkType {
        if self.state().last_error.is_some() {
            ChunkType::Error
        } else if self.is_eof() {
            ChunkType::Eof
        } else {
            ChunkType::Bytes
        }
    }

    fn file_id(&self) -> &str {
        &self.state().file_id
    }

    /// Drop the remainder of the file the current chunk belongs to.
    fn skip_file(&mut self) {
        let state = self.state_mut();
        state.last_skipped_file = Some(state.file_id.clone());
    }

    fn is_skipped_file(&self) -> bool {
        let state = self.state();
        state.last_skipped_file.as_deref() == Some(state.file_id.as_str())
    }

    /// Ask the chain to skip the rest of the upstream stage's current file.
    fn request_upstream_skip(&mut self) {
        self.state_mut().skip_upstream_file = true;
    }

    fn last_error(&self) -> Option<&str> {
        self.state().last_error.as_deref()
    }
}

/// A source stage that can be repositioned to an absolute byte offset of
/// the stream it produces.
pub trait SeekableStream: ByteStream {
    fn seek(&mut self, offset: u64) -> Result<()>;

    /// Offset of the next byte this stage will produce.
    fn tell(&self) -> u64;
}
