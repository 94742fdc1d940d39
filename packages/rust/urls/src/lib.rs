//! URL discovery and rewriting for imported content.
//!
//! [`UrlProcessor`] walks block markup and reports URLs found in known
//! URL attributes, block-comment attributes and free text, then rewrites
//! them while keeping relative URLs relative and percent-encoding intact.

pub mod decode;
pub mod markup;
pub mod processor;
pub mod rewrite;
pub mod text;

pub use decode::{urldecode, urldecode_n};
pub use markup::{MarkupTokenKind, MarkupTokenizer};
pub use processor::{URL_ATTRIBUTES, UrlProcessor, UrlSource, UrlToken, url_attributes};
pub use rewrite::{rewrite_urls, url_matches};
pub use text::UrlInTextProcessor;
