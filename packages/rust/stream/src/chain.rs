//! Composes named stages into a single pausable pipeline.
//!
//! Each chunk is pushed through every downstream stage before the next one
//! is pulled, so memory stays bounded by one in-flight chunk per stage. The
//! execution stack records which stages still hold buffered input; new
//! input is only pulled from the first stage once every stage below it has
//! nothing left to give.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use datalib_shared::{DatalibError, Result};

use crate::byte_stream::{BufferedState, ByteStream, ByteStreamState, ChunkContext, UpstreamChunk};

struct Stage {
    name: String,
    stream: Box<dyn ByteStream>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChainPauseState {
    stages: serde_json::Map<String, Value>,
    /// Input each stage was handed but has not consumed yet.
    #[serde(default)]
    buffers: std::collections::BTreeMap<String, BufferedState>,
    execution_stack: Vec<String>,
}

/// An ordered list of named stages that behaves as one [`ByteStream`].
pub struct StreamChain {
    state: ByteStreamState,
    stages: Vec<Stage>,
    execution_stack: Vec<usize>,
    failed_stage: Option<String>,
    error_reported: bool,
}

impl Default for StreamChain {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamChain {
    pub fn new() -> Self {
        Self {
            state: ByteStreamState::new(),
            stages: Vec::new(),
            execution_stack: Vec::new(),
            failed_stage: None,
            error_reported: false,
        }
    }

    /// Append a stage. An empty name becomes `stream_<index>`; a duplicate
    /// name gets the index appended.
    pub fn with_stage(mut self, name: impl Into<String>, stream: impl ByteStream + 'static) -> Self {
        self.push_stage(name, Box::new(stream));
        self
    }

    pub fn push_stage(&mut self, name: impl Into<String>, stream: Box<dyn ByteStream>) {
        let index = self.stages.len();
        let mut name = name.into();
        if name.is_empty() {
            name = format!("stream_{index}");
        } else if self.stages.iter().any(|s| s.name == name) {
            name = format!("{name}_{index}");
        }
        self.stages.push(Stage { name, stream });
    }

    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|s| s.name.as_str())
    }

    pub fn stage(&self, name: &str) -> Option<&dyn ByteStream> {
        self.stages
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.stream.as_ref())
    }

    /// The failure that halted the chain, attributed to its stage.
    pub fn error(&self) -> Option<DatalibError> {
        let message = self.state.last_error.as_ref()?;
        let stage = self.failed_stage.clone().unwrap_or_else(|| "chain".into());
        Some(DatalibError::stream(stage, message.clone()))
    }

    /// Pull every chunk and return the concatenated output.
    pub fn run_to_completion(&mut self) -> Result<Vec<u8>> {
        let mut output = Vec::new();
        loop {
            if self.next_bytes() {
                output.extend_from_slice(self.bytes());
                continue;
            }
            if let Some(err) = self.error() {
                return Err(err);
            }
            if self.is_eof() {
                return Ok(output);
            }
            return Err(DatalibError::stream(
                "chain",
                "no stage can make progress before end of input",
            ));
        }
    }

    fn chunk_context(&self, below: usize) -> ChunkContext {
        ChunkContext {
            upstream: self
                .execution_stack
                .iter()
                .filter(|&&i| i < below)
                .map(|&i| UpstreamChunk {
                    stage: self.stages[i].name.clone(),
                    file_id: self.stages[i].stream.file_id().to_string(),
                })
                .collect(),
        }
    }

    /// Hand stage `index - 1`'s current chunk to stage `index`.
    fn feed(&mut self, index: usize) {
        let context = self.chunk_context(index);
        let (upstream, downstream) = self.stages.split_at_mut(index);
        let chunk = upstream[index - 1].stream.bytes();
        downstream[0].stream.append_bytes(chunk, context);
    }

    /// Ask one stage for a chunk, recording failures and honoring skip
    /// requests against the stage above it.
    fn advance_stage(&mut self, index: usize) -> bool {
        let produced = self.stages[index].stream.next_bytes();

        if let Some(err) = self.stages[index].stream.last_error() {
            let name = self.stages[index].name.clone();
            warn!(stage = %name, error = %err, "stream stage failed");
            self.state.last_error = Some(err.to_string());
            self.failed_stage = Some(name);
            return false;
        }

        if self.stages[index].stream.state().skip_upstream_file {
            self.stages[index].stream.state_mut().skip_upstream_file = false;
            if index > 0 {
                let upstream = &mut self.stages[index - 1];
                debug!(stage = %upstream.name, file_id = %upstream.stream.file_id(), "skipping upstream file");
                upstream.stream.skip_file();
            }
        }

        produced
    }

    /// Tell the next stage its input ended once `index` is exhausted, and
    /// schedule it so it can flush whatever it buffered.
    fn propagate_eof(&mut self, index: usize) {
        if !self.stages[index].stream.is_eof() {
            return;
        }
        if let Some(next) = self.stages.get_mut(index + 1) {
            if !next.stream.state().input_eof {
                next.stream.append_eof();
                self.execution_stack.push(index + 1);
            }
        }
    }
}

impl ByteStream for StreamChain {
    fn state(&self) -> &ByteStreamState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ByteStreamState {
        &mut self.state
    }

    fn generate_next_chunk(&mut self) -> bool {
        let Some(last) = self.stages.len().checked_sub(1) else {
            self.state.finish();
            return false;
        };
        if self.stages[last].stream.is_eof() {
            self.state.finish();
            return false;
        }

        let input = self.state.take_input();
        if !input.is_empty() {
            let context = self.state.input_context.clone();
            self.stages[0].stream.append_bytes(&input, context);
        }
        if self.state.input_eof && !self.stages[0].stream.state().input_eof {
            self.stages[0].stream.append_eof();
        }

        if self.execution_stack.is_empty() {
            self.execution_stack.push(0);
        }

        'pull: while let Some(index) = self.execution_stack.pop() {
            if !self.advance_stage(index) {
                if self.state.last_error.is_some() {
                    return false;
                }
                self.propagate_eof(index);
                continue;
            }
            self.execution_stack.push(index);

            for next in index + 1..=last {
                self.feed(next);
                if !self.advance_stage(next) {
                    if self.state.last_error.is_some() {
                        return false;
                    }
                    self.propagate_eof(next);
                    continue 'pull;
                }
                self.execution_stack.push(next);
            }

            let produced = &self.stages[last].stream;
            self.state.output_bytes = produced.bytes().to_vec();
            self.state.file_id = produced.file_id().to_string();
            return true;
        }

        if self.stages[last].stream.is_eof() {
            self.state.finish();
        }
        false
    }

    fn pause(&self) -> Result<Value> {
        let mut stages = serde_json::Map::new();
        let mut buffers = std::collections::BTreeMap::new();
        for stage in &self.stages {
            stages.insert(stage.name.clone(), stage.stream.pause()?);
            buffers.insert(stage.name.clone(), stage.stream.state().buffered());
        }
        let execution_stack = self
            .execution_stack
            .iter()
            .map(|&i| self.stages[i].name.clone())
            .collect();
        serde_json::to_value(ChainPauseState {
            stages,
            buffers,
            execution_stack,
        })
        .map_err(|e| DatalibError::cursor(e.to_string()))
    }

    fn resume(&mut self, paused: &Value) -> Result<()> {
        let paused: ChainPauseState = serde_json::from_value(paused.clone())
            .map_err(|e| DatalibError::cursor(format!("chain: {e}")))?;

        for stage in &mut self.stages {
            if let Some(state) = paused.stages.get(&stage.name) {
                stage.stream.resume(state)?;
            }
            if let Some(buffered) = paused.buffers.get(&stage.name) {
                stage.stream.state_mut().restore_buffered(buffered);
            }
        }

        let mut stack = Vec::with_capacity(paused.execution_stack.len());
        for name in &paused.execution_stack {
            let index = self
                .stages
                .iter()
                .position(|s| &s.name == name)
                .ok_or_else(|| DatalibError::cursor(format!("chain has no stage named `{name}`")))?;
            stack.push(index);
        }
        self.execution_stack = stack;
        Ok(())
    }
}

impl Iterator for StreamChain {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_bytes() {
            return Some(Ok(self.bytes().to_vec()));
        }
        if !self.error_reported {
            if let Some(err) = self.error() {
                self.error_reported = true;
                return Some(Err(err));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use uuid::Uuid;

    use super::*;
    use crate::callback::CallbackStream;
    use crate::file::FileByteStream;
    use crate::tree::FileTreeStream;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("datalib-chain-test-{}", Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Emits every input byte as its own chunk.
    fn splitter() -> CallbackStream {
        CallbackStream::new(|state| {
            if state.input_bytes.is_empty() {
                return false;
            }
            let byte = state.input_bytes.remove(0);
            state.output_bytes = vec![byte];
            true
        })
    }

    /// Buffers everything and emits it reversed once input ends.
    fn reverser() -> CallbackStream {
        let mut buffer: Vec<u8> = Vec::new();
        CallbackStream::new(move |state| {
            buffer.extend(state.take_input());
            if !state.input_eof || buffer.is_empty() {
                return false;
            }
            buffer.reverse();
            state.output_bytes = std::mem::take(&mut buffer);
            true
        })
    }

    #[test]
    fn chunks_flow_through_every_stage() {
        let dir = temp_dir();
        let path = dir.join("input.txt");
        std::fs::write(&path, "hello chain").unwrap();

        let mut chain = StreamChain::new()
            .with_stage("file", FileByteStream::open(&path, 4).unwrap())
            .with_stage("upper", CallbackStream::map(|b| b.to_ascii_uppercase()));

        assert_eq!(chain.run_to_completion().unwrap(), b"HELLO CHAIN");
        assert!(chain.is_eof());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn generator_stage_drains_before_pulling_more() {
        let dir = temp_dir();
        let path = dir.join("input.txt");
        std::fs::write(&path, "abcdef").unwrap();

        let chain = StreamChain::new()
            .with_stage("file", FileByteStream::open(&path, 3).unwrap())
            .with_stage("split", splitter());

        let chunks: Vec<Vec<u8>> = chain.map(|c| c.unwrap()).collect();
        assert_eq!(chunks.len(), 6);
        assert_eq!(chunks.concat(), b"abcdef");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn end_of_input_reaches_buffering_stages() {
        let dir = temp_dir();
        let path = dir.join("input.txt");
        std::fs::write(&path, "stressed").unwrap();

        let mut chain = StreamChain::new()
            .with_stage("file", FileByteStream::open(&path, 3).unwrap())
            .with_stage("reverse", reverser())
            .with_stage("upper", CallbackStream::map(|b| b.to_ascii_uppercase()));

        assert_eq!(chain.run_to_completion().unwrap(), b"DESSERTS");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn stage_error_halts_chain_with_stage_name() {
        let dir = temp_dir();
        let path = dir.join("input.txt");
        std::fs::write(&path, "abc").unwrap();

        let mut chain = StreamChain::new()
            .with_stage("file", FileByteStream::open(&path, 1).unwrap())
            .with_stage(
                "validator",
                CallbackStream::new(|state| {
                    let input = state.take_input();
                    if input.contains(&b'b') {
                        state.fail("unexpected byte 'b'");
                        return false;
                    }
                    state.output_bytes = input;
                    !state.output_bytes.is_empty()
                }),
            );

        let err = chain.run_to_completion().unwrap_err();
        assert_eq!(err.to_string(), "stage `validator` failed: unexpected byte 'b'");
        assert!(!chain.next_bytes());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn empty_names_get_positional_defaults() {
        let chain = StreamChain::new()
            .with_stage("", splitter())
            .with_stage("", splitter())
            .with_stage("split", splitter())
            .with_stage("split", splitter());
        let names: Vec<&str> = chain.stage_names().collect();
        assert_eq!(names, vec!["stream_0", "stream_1", "split", "split_3"]);
        assert!(chain.stage("split_3").is_some());
    }

    #[test]
    fn pause_and_resume_continue_output() {
        let dir = temp_dir();
        let path = dir.join("input.txt");
        std::fs::write(&path, "0123456789").unwrap();

        let build = || {
            StreamChain::new()
                .with_stage("file", FileByteStream::open(&path, 4).unwrap())
                .with_stage("split", splitter())
        };

        let mut first = build();
        let mut head = Vec::new();
        for _ in 0..4 {
            assert!(first.next_bytes());
            head.extend_from_slice(first.bytes());
        }
        let paused = first.pause().unwrap();
        assert_eq!(paused["execution_stack"], serde_json::json!(["file", "split"]));

        let mut second = build();
        second.resume(&paused).unwrap();
        let tail = second.run_to_completion().unwrap();

        assert_eq!(head, b"0123");
        assert_eq!(tail, b"456789");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn pause_keeps_input_a_stage_has_not_consumed() {
        let dir = temp_dir();
        let path = dir.join("input.txt");
        std::fs::write(&path, "0123456789").unwrap();

        let build = || {
            StreamChain::new()
                .with_stage("file", FileByteStream::open(&path, 4).unwrap())
                .with_stage("split", splitter())
        };

        let mut first = build();
        let mut head = Vec::new();
        for _ in 0..2 {
            assert!(first.next_bytes());
            head.extend_from_slice(first.bytes());
        }
        let paused = first.pause().unwrap();
        assert_eq!(paused["buffers"]["split"]["input_bytes"], serde_json::json!([b'2', b'3']));

        // Round-trip through text like a saved cursor would.
        let paused: Value = serde_json::from_str(&paused.to_string()).unwrap();
        let mut second = build();
        second.resume(&paused).unwrap();
        let tail = second.run_to_completion().unwrap();

        assert_eq!(head, b"01");
        assert_eq!(tail, b"23456789");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn downstream_stage_can_skip_upstream_file() {
        let root = temp_dir();
        std::fs::write(root.join("a.txt"), "keep-a").unwrap();
        std::fs::write(root.join("b.txt"), "SKIP this entire file").unwrap();
        std::fs::write(root.join("c.txt"), "keep-c").unwrap();

        let mut chain = StreamChain::new()
            .with_stage("tree", FileTreeStream::new(&root, 4))
            .with_stage(
                "filter",
                CallbackStream::new(|state| {
                    if state.input_bytes.is_empty() {
                        return false;
                    }
                    let input = state.take_input();
                    if input.starts_with(b"SKIP") {
                        state.skip_upstream_file = true;
                        return false;
                    }
                    state.output_bytes = input;
                    true
                }),
            );

        let output = chain.run_to_completion().unwrap();
        assert_eq!(String::from_utf8(output).unwrap(), "keep-akeep-c");

        let _ = std::fs::remove_dir_all(&root);
    }
}
