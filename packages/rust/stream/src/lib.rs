//! Resumable byte pipelines for datalib.
//!
//! A [`ByteStream`] produces bytes chunk by chunk and can checkpoint itself
//! with `pause()`. Stages compose into a [`StreamChain`], which is itself a
//! stream, so an import can stop between any two chunks and pick up later
//! from the saved state.

pub mod byte_stream;
pub mod callback;
pub mod chain;
pub mod file;
pub mod tree;

pub use byte_stream::{
    BufferedState, ByteStream, ByteStreamState, ChunkContext, ChunkType, DEFAULT_FILE_ID, SeekableStream,
    StreamStatus, UpstreamChunk,
};
pub use callback::CallbackStream;
pub use chain::StreamChain;
pub use file::{FileByteStream, GzipFileStream};
pub use tree::{FileTreeStream, FileVisitor, VisitorEvent};
