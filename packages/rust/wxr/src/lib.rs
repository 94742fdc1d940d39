//! WXR (WordPress eXtended RSS) support for datalib.
//!
//! - [`EntityReader`] streams entities out of a WXR document fed in chunks.
//! - [`WxrEntitySource`] reads a `.xml` or `.xml.gz` export from disk.
//! - [`WxrRewriteStream`] is a stream stage that migrates site URLs inside
//!   a WXR document without parsing it into entities.

pub mod reader;
pub mod rewrite;
pub mod schema;
pub mod source;
pub mod tokenizer;

pub use reader::{EntityReader, ReadError, ReaderCursor};
pub use rewrite::{CONTENT_NODES, WxrRewriteStream};
pub use schema::{EntitySchema, KNOWN_ENTITIES, canonical_tag, entity_schema};
pub use source::{WxrCursor, WxrEntitySource};
pub use tokenizer::{QuickXmlTokenizer, TokenizerCursor, XmlTokenKind, XmlTokenizer};
