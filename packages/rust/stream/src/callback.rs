//! Closure-backed stages for small, stateless transforms.

use serde_json::Value;

use datalib_shared::Result;

use crate::byte_stream::{ByteStream, ByteStreamState};

type Generator = Box<dyn FnMut(&mut ByteStreamState) -> bool + Send>;

/// A stage whose chunk generation is a closure over its own state.
///
/// The closure follows the [`ByteStream::generate_next_chunk`] contract:
/// fill `output_bytes` and return `true`, or return `false` to wait for
/// more input. Input left in the state is checkpointed by the enclosing
/// [`StreamChain`](crate::StreamChain); anything the closure keeps in its
/// own captures is not.
pub struct CallbackStream {
    state: ByteStreamState,
    generator: Generator,
}

impl CallbackStream {
    pub fn new(generator: impl FnMut(&mut ByteStreamState) -> bool + Send + 'static) -> Self {
        Self {
            state: ByteStreamState::new(),
            generator: Box::new(generator),
        }
    }

    /// Transform every input chunk independently.
    pub fn map(mut transform: impl FnMut(&[u8]) -> Vec<u8> + Send + 'static) -> Self {
        Self::new(move |state| {
            if state.input_bytes.is_empty() {
                return false;
            }
            let input = state.take_input();
            state.output_bytes = transform(&input);
            true
        })
    }
}

impl ByteStream for CallbackStream {
    fn state(&self) -> &ByteStreamState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ByteStreamState {
        &mut self.state
    }

    fn generate_next_chunk(&mut self) -> bool {
        (self.generator)(&mut self.state)
    }

    fn pause(&self) -> Result<Value> {
        Ok(Value::Null)
    }

    fn resume(&mut self, _paused: &Value) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_stream::{ChunkContext, ChunkType};

    #[test]
    fn map_transforms_each_chunk() {
        let mut upper = CallbackStream::map(|bytes| bytes.to_ascii_uppercase());
        upper.append_bytes(b"hello", ChunkContext::default());
        assert!(upper.next_bytes());
        assert_eq!(upper.bytes(), b"HELLO");

        // Nothing buffered: waits for input rather than finishing.
        assert!(!upper.next_bytes());
        assert_eq!(upper.chunk_type(), ChunkType::Bytes);

        upper.append_eof();
        assert!(!upper.next_bytes());
        assert_eq!(upper.chunk_type(), ChunkType::Eof);
    }

    #[test]
    fn errors_are_sticky() {
        let mut failing = CallbackStream::new(|state| {
            state.fail("boom");
            false
        });
        failing.append_bytes(b"x", ChunkContext::default());
        assert!(!failing.next_bytes());
        assert_eq!(failing.chunk_type(), ChunkType::Error);
        assert_eq!(failing.last_error(), Some("boom"));
        assert!(!failing.next_bytes());
    }
}
